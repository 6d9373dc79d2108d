//! Binds `SandboxService` and `ExecutionService` onto one `tonic` server
//! over a unix control socket (`spec.md` §6 "Control API (framed RPC)"),
//! grounded on the prior art's CRI-socket server shape.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use cleanroom_core::SandboxManager;
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;

use crate::execution_service::ExecutionServiceImpl;
use crate::pb::execution_service_server::ExecutionServiceServer;
use crate::pb::sandbox_service_server::SandboxServiceServer;
use crate::sandbox_service::SandboxServiceImpl;

/// The Control API server: owns the shared [`SandboxManager`] and the two
/// generated service implementations bound to it.
#[derive(Debug, Clone)]
pub struct ControlApi {
    manager: Arc<SandboxManager>,
}

impl ControlApi {
    /// Wraps `manager` for serving.
    #[must_use]
    pub const fn new(manager: Arc<SandboxManager>) -> Self {
        Self { manager }
    }
}

/// Binds `socket_path` and serves the Control API until the listener
/// closes or `shutdown` resolves.
///
/// Removes any stale socket file at `socket_path` before binding, per the
/// prior art's own control-socket convention (`spec.md` §4.2's "remove any
/// stale socket at that path").
///
/// # Errors
///
/// Returns an error if `socket_path` cannot be bound, or if the gRPC
/// server returns a transport error.
pub async fn serve(
    api: ControlApi,
    socket_path: &Path,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    if socket_path.exists() {
        std::fs::remove_file(socket_path)?;
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(socket_path)?;
    tracing::info!(path = %socket_path.display(), "control API listening");

    let sandbox_service = SandboxServiceImpl::new(api.manager.clone());
    let execution_service = ExecutionServiceImpl::new(api.manager.clone());

    Server::builder()
        .add_service(SandboxServiceServer::new(sandbox_service))
        .add_service(ExecutionServiceServer::new(execution_service))
        .serve_with_incoming_shutdown(UnixListenerStream::new(listener), shutdown)
        .await?;
    Ok(())
}

/// Default control-socket path: `<runBase>/control.sock`
/// (`spec.md` §6 on-disk layout conventions).
#[must_use]
pub fn default_socket_path(run_base: &Path) -> PathBuf {
    run_base.join("control.sock")
}
