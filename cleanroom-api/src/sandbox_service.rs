//! `SandboxService` gRPC implementation (`spec.md` §6).

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use cleanroom_core::SandboxManager;
use tokio_stream::Stream;
use tonic::{Request, Response, Status};

use crate::convert::{compiled_policy_from_pb, sandbox_options_from_pb, status_from_core_error};
use crate::pb;
use crate::pb::sandbox_service_server::SandboxService;

/// How often `StreamSandboxEvents` polls for a status transition, absent
/// any event-bus in `cleanroom_core::SandboxManager` to subscribe to.
const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// [`SandboxService`] implementation delegating to a shared [`SandboxManager`].
#[derive(Debug, Clone)]
pub struct SandboxServiceImpl {
    manager: Arc<SandboxManager>,
}

impl SandboxServiceImpl {
    /// Builds a service wrapping `manager`.
    #[must_use]
    pub const fn new(manager: Arc<SandboxManager>) -> Self {
        Self { manager }
    }
}

#[tonic::async_trait]
impl SandboxService for SandboxServiceImpl {
    async fn create_sandbox(
        &self,
        request: Request<pb::CreateSandboxRequest>,
    ) -> Result<Response<pb::Sandbox>, Status> {
        let req = request.into_inner();
        let policy = req
            .policy
            .ok_or_else(|| Status::invalid_argument("policy.invalid: policy is required"))?;
        let policy = compiled_policy_from_pb(policy)?;
        let options = sandbox_options_from_pb(req.options, cleanroom_core::SandboxOptions::default());

        let info = self
            .manager
            .create(req.backend, options, policy)
            .await
            .map_err(|e| status_from_core_error(&e))?;
        Ok(Response::new(pb::Sandbox::from(&info)))
    }

    async fn get_sandbox(
        &self,
        request: Request<pb::GetSandboxRequest>,
    ) -> Result<Response<pb::Sandbox>, Status> {
        let sandbox_id = request.into_inner().sandbox_id;
        let info = self
            .manager
            .get(&sandbox_id)
            .map_err(|e| status_from_core_error(&e))?;
        Ok(Response::new(pb::Sandbox::from(&info)))
    }

    async fn list_sandboxes(
        &self,
        _request: Request<pb::ListSandboxesRequest>,
    ) -> Result<Response<pb::ListSandboxesResponse>, Status> {
        let sandboxes = self.manager.list().iter().map(pb::Sandbox::from).collect();
        Ok(Response::new(pb::ListSandboxesResponse { sandboxes }))
    }

    async fn terminate_sandbox(
        &self,
        request: Request<pb::TerminateSandboxRequest>,
    ) -> Result<Response<pb::TerminateSandboxResponse>, Status> {
        let sandbox_id = request.into_inner().sandbox_id;
        self.manager
            .terminate(&sandbox_id)
            .await
            .map_err(|e| status_from_core_error(&e))?;
        Ok(Response::new(pb::TerminateSandboxResponse {
            message: format!("sandbox {sandbox_id} terminated"),
        }))
    }

    /// Streaming type for [`Self::download_sandbox_file`].
    type DownloadSandboxFileStream =
        Pin<Box<dyn Stream<Item = Result<pb::DownloadSandboxFileChunk, Status>> + Send>>;

    async fn download_sandbox_file(
        &self,
        request: Request<pb::DownloadSandboxFileRequest>,
    ) -> Result<Response<Self::DownloadSandboxFileStream>, Status> {
        // `spec.md` §6 marks this an "optional capability"; no rootfs/guest
        // file-read path exists in `cleanroom_core` to ground it on, so this
        // reports unimplemented rather than fabricate guest file access.
        let _ = request;
        Err(Status::unimplemented(
            "gateway-free file download is not implemented by this build",
        ))
    }

    /// Streaming type for [`Self::stream_sandbox_events`].
    type StreamSandboxEventsStream =
        Pin<Box<dyn Stream<Item = Result<pb::SandboxEvent, Status>> + Send>>;

    async fn stream_sandbox_events(
        &self,
        request: Request<pb::StreamSandboxEventsRequest>,
    ) -> Result<Response<Self::StreamSandboxEventsStream>, Status> {
        let filter_id = request.into_inner().sandbox_id;
        let manager = self.manager.clone();

        let stream = async_stream::try_stream! {
            let mut last_status: std::collections::HashMap<String, String> =
                std::collections::HashMap::new();
            loop {
                let snapshot = if filter_id.is_empty() {
                    manager.list()
                } else {
                    match manager.get(&filter_id) {
                        Ok(info) => vec![info],
                        Err(_) => Vec::new(),
                    }
                };

                for info in &snapshot {
                    let status = pb::Sandbox::from(info).status;
                    let changed = last_status
                        .get(&info.sandbox_id)
                        .is_none_or(|prev| *prev != status);
                    if changed {
                        last_status.insert(info.sandbox_id.clone(), status.clone());
                        yield pb::SandboxEvent {
                            sandbox_id: info.sandbox_id.clone(),
                            status,
                            observed_at_unix_ms: unix_ms_now(),
                        };
                    }
                }

                if !filter_id.is_empty() && snapshot.is_empty() {
                    return;
                }
                tokio::time::sleep(EVENT_POLL_INTERVAL).await;
            }
        };

        Ok(Response::new(Box::pin(stream)))
    }
}

/// Current time in milliseconds since the epoch, saturating at `i64::MAX`.
fn unix_ms_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
