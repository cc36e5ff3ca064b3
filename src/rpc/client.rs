//! Thin async gRPC client used by the CLI's `start`/`stop`/`status`/`tail`
//! subcommands. Each invocation opens its own mTLS channel; there is no
//! long-lived connection pool since the CLI is a one-shot process.

use std::path::Path;

use tonic::transport::{Channel, Endpoint};

use super::pb::jobs_service_client::JobsServiceClient;
use crate::core::Error;

/// Connect to `addr` (e.g. `https://host:port`) with client certs at
/// `cert_path`/`key_path`, trusting `ca_path`, verifying the server's name
/// against `server_domain`.
pub async fn connect(
    addr: &str,
    cert_path: &Path,
    key_path: &Path,
    ca_path: &Path,
    server_domain: &str,
) -> Result<JobsServiceClient<Channel>, Error> {
    let tls = super::tls::client_config(cert_path, key_path, ca_path, server_domain).await?;

    let channel = Endpoint::from_shared(addr.to_string())
        .map_err(|e| Error::internal(format!("invalid server address {addr}: {e}")))?
        .tls_config(tls)
        .map_err(|e| Error::internal(format!("tls config: {e}")))?
        .connect()
        .await
        .map_err(|e| Error::internal(format!("connect to {addr}: {e}")))?;

    Ok(JobsServiceClient::new(channel))
}
