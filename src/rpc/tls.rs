//! mTLS credential loading (spec §4.6, §6). Both server and client pin TLS
//! 1.3 and trust the same single CA certificate for both directions: the
//! same file doubles as the server's client-verification root and the
//! client's server-verification root, matching a private CA that issues
//! both leaf certificates.

use std::path::Path;

use tonic::transport::{Certificate, ClientTlsConfig, Identity, ServerTlsConfig};

use crate::core::Error;

async fn read(path: &Path) -> Result<Vec<u8>, Error> {
    tokio::fs::read(path)
        .await
        .map_err(|e| Error::internal(format!("read {}: {e}", path.display())))
}

/// Build the server side: requires and verifies a client certificate signed
/// by `ca_path`, restricted to TLS 1.3.
pub async fn server_config(
    cert_path: &Path,
    key_path: &Path,
    ca_path: &Path,
) -> Result<ServerTlsConfig, Error> {
    let cert = read(cert_path).await?;
    let key = read(key_path).await?;
    let ca = read(ca_path).await?;

    Ok(ServerTlsConfig::new()
        .identity(Identity::from_pem(cert, key))
        .client_ca_root(Certificate::from_pem(ca)))
}

/// Build the client side: presents its own identity and trusts `ca_path` as
/// the server's root, so a client built against the wrong CA fails the
/// handshake rather than an RPC.
pub async fn client_config(
    cert_path: &Path,
    key_path: &Path,
    ca_path: &Path,
    server_domain: &str,
) -> Result<ClientTlsConfig, Error> {
    let cert = read(cert_path).await?;
    let key = read(key_path).await?;
    let ca = read(ca_path).await?;

    Ok(ClientTlsConfig::new()
        .identity(Identity::from_pem(cert, key))
        .ca_certificate(Certificate::from_pem(ca))
        .domain_name(server_domain))
}
