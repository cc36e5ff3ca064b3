//! Adapts the synchronous core onto the network: generated protobuf types,
//! TLS credential loading, and the gRPC server/client built on top of them.

pub mod client;
pub mod server;
pub mod tls;

/// Generated message and service types for the `rje` package (see
/// `build.rs` / `proto/rje.proto`).
pub mod pb {
    tonic::include_proto!("rje");
}
