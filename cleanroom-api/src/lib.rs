//! Generated + hand-written `tonic` Control API surface
//! (`spec.md` §6 "Control API (framed RPC)").
//!
//! [`pb`] holds the `prost`/`tonic` codegen for `cleanroom.proto`;
//! [`sandbox_service`] and [`execution_service`] implement the generated
//! server traits against [`cleanroom_core::SandboxManager`] /
//! [`cleanroom_core::ExecutionTable`]; [`server`] wires both into one
//! `tonic::transport::Server`.

/// Generated protobuf/gRPC types and server traits for `cleanroom.v1`.
#[allow(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    missing_debug_implementations,
    missing_copy_implementations
)]
pub mod pb {
    tonic::include_proto!("cleanroom.v1");
}

mod convert;
mod execution_service;
mod sandbox_service;
mod server;

pub use execution_service::ExecutionServiceImpl;
pub use sandbox_service::SandboxServiceImpl;
pub use server::{default_socket_path, serve, ControlApi};
