//! Guest-agent wire protocol for Cleanroom host↔guest communication.
//!
//! One execution uses one dedicated connection (vsock, or the paired serial
//! device when vsock is unavailable): the host writes a single
//! [`ExecRequest`] frame, then concurrently writes [`ExecInputFrame`]s while
//! reading [`ExecStreamResponse`]s until a terminal `Exit` record. Messages
//! are serialized with [`postcard`] and framed with a 4-byte big-endian
//! length prefix, suitable for any reliable byte stream.

pub mod codec;
mod message;

pub use codec::{recv, send};
pub use message::{
    AGENT_PORT, ExecInputFrame, ExecRequest, ExecStreamResponse, PROTOCOL_VERSION, Signal,
};
