//! Core error taxonomy (spec §7).
//!
//! Every fallible core operation returns [`Error`]. The RPC layer is the only
//! place that knows about wire codes; it maps each variant to a `tonic::Status`
//! via the `From` impl in `crate::rpc::server`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("command must not be empty")]
    InvalidArgument,

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("identity {identity:?} is not permitted to run {command:?}")]
    PermissionDenied { identity: String, command: String },

    #[error("host does not support the required cgroup v2 controllers: {0}")]
    UnsupportedHost(String),

    #[error("job id collided with an existing entry, retry")]
    DuplicateIdentifier,

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Internal(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
