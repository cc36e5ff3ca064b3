//! rje — mutually-authenticated remote job executor.
//!
//! `core` holds the synchronous job supervisor, cgroup manager, and output
//! streams; `rpc` adapts them to a TLS-wrapped gRPC service and client.
pub mod core;
pub mod rpc;
