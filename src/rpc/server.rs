//! The `JobsService` gRPC surface (spec §6), bridging wire requests onto
//! [`crate::core::JobSupervisor`] and [`crate::core::Authorizer`].

use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::core::{Authorizer, Error, JobSupervisor, Sink, StartOutcome};

use super::pb::jobs_service_server::JobsService;
use super::pb::{
    JobIdRequest, JobOutputResponse, JobStartRequest, JobStartResponse, JobStartStatus,
    JobStatus, JobStatusResponse, JobStopResponse,
};

pub struct Service {
    supervisor: Arc<JobSupervisor>,
    authorizer: Arc<Authorizer>,
}

impl Service {
    pub fn new(supervisor: Arc<JobSupervisor>, authorizer: Arc<Authorizer>) -> Self {
        Service { supervisor, authorizer }
    }

    /// The common name of the first certificate in the verified client
    /// chain. `tonic`/`rustls` have already validated the chain against our
    /// CA by the time a request reaches here; this only extracts the name.
    fn peer_identity<T>(request: &Request<T>) -> Result<String, Status> {
        let certs = request
            .peer_certs()
            .ok_or_else(|| Status::unauthenticated("no client certificate presented"))?;
        let leaf = certs
            .first()
            .ok_or_else(|| Status::unauthenticated("empty client certificate chain"))?;

        let (_, parsed) = x509_parser::parse_x509_certificate(leaf.as_ref())
            .map_err(|e| Status::unauthenticated(format!("malformed client certificate: {e}")))?;

        parsed
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_string)
            .ok_or_else(|| Status::unauthenticated("client certificate has no common name"))
    }
}

#[tonic::async_trait]
impl JobsService for Service {
    async fn start(
        &self,
        request: Request<JobStartRequest>,
    ) -> Result<Response<JobStartResponse>, Status> {
        let identity = Self::peer_identity(&request)?;
        let command = request.into_inner().command;

        if command.is_empty() {
            return Err(Error::InvalidArgument.into());
        }

        let wants = command.first().cloned().unwrap_or_default();
        if !self.authorizer.authorize_start(&identity, &wants) {
            return Err(Error::PermissionDenied { identity, command: wants }.into());
        }

        let supervisor = self.supervisor.clone();
        let outcome = tokio::task::spawn_blocking(move || supervisor.start(command))
            .await
            .map_err(|e| Status::internal(format!("start task panicked: {e}")))??;

        let (job_id, status) = match outcome {
            StartOutcome::Started { job_id, running: true } => (job_id, JobStartStatus::Running),
            StartOutcome::Started { job_id, running: false } => {
                (job_id, JobStartStatus::ExitedInstantly)
            }
            StartOutcome::CommandNotFound => (String::new(), JobStartStatus::CommandNotFound),
        };

        Ok(Response::new(JobStartResponse { job_id, status: status as i32 }))
    }

    async fn stop(
        &self,
        request: Request<JobIdRequest>,
    ) -> Result<Response<JobStopResponse>, Status> {
        let job_id = request.into_inner().job_id;
        let supervisor = self.supervisor.clone();
        let (exit_code, force_ended) =
            tokio::task::spawn_blocking(move || supervisor.stop(&job_id))
                .await
                .map_err(|e| Status::internal(format!("stop task panicked: {e}")))??;

        Ok(Response::new(JobStopResponse { exit_code, force_ended }))
    }

    async fn status(
        &self,
        request: Request<JobIdRequest>,
    ) -> Result<Response<JobStatusResponse>, Status> {
        let job_id = request.into_inner().job_id;
        let supervisor = self.supervisor.clone();
        let (_running, terminal) =
            tokio::task::spawn_blocking(move || supervisor.status(&job_id))
                .await
                .map_err(|e| Status::internal(format!("status task panicked: {e}")))??;

        let (exit_code, job_status) = match terminal {
            Some((code, forced)) => {
                (code, if forced { JobStatus::ForceEnded } else { JobStatus::Ended })
            }
            None => (-1, JobStatus::Running),
        };

        Ok(Response::new(JobStatusResponse { exit_code, job_status: job_status as i32 }))
    }

    type TailStream = tokio_stream::wrappers::ReceiverStream<Result<JobOutputResponse, Status>>;

    async fn tail(
        &self,
        request: Request<JobIdRequest>,
    ) -> Result<Response<Self::TailStream>, Status> {
        let job_id = request.into_inner().job_id;
        let (tx, rx) = tokio::sync::mpsc::channel(16);

        let supervisor = self.supervisor.clone();
        let sink: Box<dyn Sink> = Box::new(ChannelSink(tx));
        tokio::task::spawn_blocking(move || supervisor.tail(&job_id, sink))
            .await
            .map_err(|e| Status::internal(format!("tail task panicked: {e}")))??;

        Ok(Response::new(tokio_stream::wrappers::ReceiverStream::new(rx)))
    }
}

/// Adapts a bounded `tokio::sync::mpsc::Sender` to [`Sink`] so the
/// supervisor's synchronous `tail` can feed a streaming gRPC response.
/// `blocking_send` is correct here: this runs inside `spawn_blocking`, off
/// the async runtime's worker threads.
struct ChannelSink(tokio::sync::mpsc::Sender<Result<JobOutputResponse, Status>>);

impl Sink for ChannelSink {
    fn write(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        self.0
            .blocking_send(Ok(JobOutputResponse { message: chunk.to_vec() }))
            .map_err(|_| std::io::Error::other("tail receiver dropped"))
    }
}

impl From<Error> for Status {
    fn from(e: Error) -> Self {
        match e {
            Error::InvalidArgument => Status::invalid_argument(e.to_string()),
            Error::JobNotFound(_) => Status::not_found(e.to_string()),
            Error::PermissionDenied { .. } => Status::permission_denied(e.to_string()),
            Error::UnsupportedHost(_) => Status::internal(e.to_string()),
            Error::DuplicateIdentifier => Status::internal(e.to_string()),
            Error::Internal(_) => Status::internal(e.to_string()),
        }
    }
}
