//! The synchronous core: everything that does not know gRPC or TLS exist.
//! The RPC layer (`crate::rpc`) is a thin adapter on top of this module.

mod authorizer;
mod cgroup;
mod error;
mod ids;
mod job;
mod output_stream;
mod supervisor;

pub use authorizer::Authorizer;
pub use cgroup::{CGroupHandle, CGroupManager, PARENT_GROUP_NAME};
pub use error::{Error, Result};
pub use job::{Phase, RemoteJob, TerminalState};
pub use output_stream::{OutputStream, Sink};
pub use supervisor::{JobSupervisor, StartOutcome};
