//! `ExecutionService` gRPC implementation (`spec.md` §6, §4.5).

use std::pin::Pin;
use std::sync::Arc;

use cleanroom_core::{CancelOutcome, SandboxManager};
use cleanroom_proto::{ExecInputFrame, ExecStreamResponse};
use tokio_stream::Stream;
use tonic::{Request, Response, Status, Streaming};

use crate::convert::status_from_core_error;
use crate::pb;
use crate::pb::execution_attach_frame::Kind as AttachKind;
use crate::pb::execution_service_server::ExecutionService;

/// Default execution launch deadline when a request omits `launch_seconds`.
const DEFAULT_LAUNCH_SECONDS: u32 = 30;

/// [`ExecutionService`] implementation delegating to a shared [`SandboxManager`].
#[derive(Debug, Clone)]
pub struct ExecutionServiceImpl {
    manager: Arc<SandboxManager>,
}

impl ExecutionServiceImpl {
    /// Builds a service wrapping `manager`.
    #[must_use]
    pub const fn new(manager: Arc<SandboxManager>) -> Self {
        Self { manager }
    }
}

#[tonic::async_trait]
impl ExecutionService for ExecutionServiceImpl {
    async fn create_execution(
        &self,
        request: Request<pb::CreateExecutionRequest>,
    ) -> Result<Response<pb::Execution>, Status> {
        let req = request.into_inner();
        let (tty, launch_seconds) = req.options.map_or((false, DEFAULT_LAUNCH_SECONDS), |o| {
            (
                o.tty,
                if o.launch_seconds == 0 {
                    DEFAULT_LAUNCH_SECONDS
                } else {
                    o.launch_seconds
                },
            )
        });

        let proxy_path = self
            .manager
            .proxy_socket_path(&req.sandbox_id)
            .map_err(|e| status_from_core_error(&e))?;
        let executions = self
            .manager
            .executions(&req.sandbox_id)
            .map_err(|e| status_from_core_error(&e))?;

        let info = executions
            .create_execution(&proxy_path, req.command, tty, launch_seconds, false)
            .await
            .map_err(|e| status_from_core_error(&e))?;
        Ok(Response::new(pb::Execution::from(&info)))
    }

    async fn get_execution(
        &self,
        request: Request<pb::GetExecutionRequest>,
    ) -> Result<Response<pb::Execution>, Status> {
        let req = request.into_inner();
        let executions = self
            .manager
            .executions(&req.sandbox_id)
            .map_err(|e| status_from_core_error(&e))?;
        let info = executions
            .get(&req.execution_id)
            .ok_or_else(|| Status::not_found(format!("execution.not_found: {}", req.execution_id)))?;
        Ok(Response::new(pb::Execution::from(&info)))
    }

    async fn cancel_execution(
        &self,
        request: Request<pb::CancelExecutionRequest>,
    ) -> Result<Response<pb::CancelExecutionResponse>, Status> {
        let req = request.into_inner();
        let executions = self
            .manager
            .executions(&req.sandbox_id)
            .map_err(|e| status_from_core_error(&e))?;

        let outcome = executions.cancel(&req.execution_id);
        let (accepted, status) = match outcome {
            CancelOutcome::SignalSent => (true, "running"),
            CancelOutcome::ChannelClosed => (true, "canceled"),
            CancelOutcome::AlreadyTerminal => (false, "terminal"),
        };
        Ok(Response::new(pb::CancelExecutionResponse {
            accepted,
            status: status.to_owned(),
        }))
    }

    /// Streaming type for [`Self::stream_execution`].
    type StreamExecutionStream =
        Pin<Box<dyn Stream<Item = Result<pb::ExecutionEvent, Status>> + Send>>;

    async fn stream_execution(
        &self,
        request: Request<pb::StreamExecutionRequest>,
    ) -> Result<Response<Self::StreamExecutionStream>, Status> {
        let req = request.into_inner();
        let executions = self
            .manager
            .executions(&req.sandbox_id)
            .map_err(|e| status_from_core_error(&e))?;
        let mut rx = executions.subscribe(&req.execution_id).ok_or_else(|| {
            Status::not_found(format!("execution.not_found: {}", req.execution_id))
        })?;

        let stream = async_stream::try_stream! {
            loop {
                match rx.recv().await {
                    Ok(frame) => {
                        let is_exit = matches!(frame, ExecStreamResponse::Exit { .. });
                        yield execution_event_from_frame(frame);
                        if is_exit {
                            return;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        };

        Ok(Response::new(Box::pin(stream)))
    }

    /// Streaming type for [`Self::attach_execution`].
    type AttachExecutionStream =
        Pin<Box<dyn Stream<Item = Result<pb::ExecutionAttachFrame, Status>> + Send>>;

    async fn attach_execution(
        &self,
        request: Request<Streaming<pb::ExecutionAttachFrame>>,
    ) -> Result<Response<Self::AttachExecutionStream>, Status> {
        let mut inbound = request.into_inner();
        let first = inbound
            .message()
            .await?
            .ok_or_else(|| Status::invalid_argument("attach stream closed before an open frame"))?;
        let Some(AttachKind::Open(open)) = first.kind else {
            return Err(Status::invalid_argument(
                "first attach frame must be `open`",
            ));
        };

        let launch_seconds = if open.launch_seconds == 0 {
            DEFAULT_LAUNCH_SECONDS
        } else {
            open.launch_seconds
        };
        let proxy_path = self
            .manager
            .proxy_socket_path(&open.sandbox_id)
            .map_err(|e| status_from_core_error(&e))?;
        let executions = self
            .manager
            .executions(&open.sandbox_id)
            .map_err(|e| status_from_core_error(&e))?;
        let info = executions
            .create_execution(&proxy_path, open.command, open.tty, launch_seconds, true)
            .await
            .map_err(|e| status_from_core_error(&e))?;
        let mut rx = executions
            .subscribe(&info.execution_id)
            .ok_or_else(|| Status::internal("execution disappeared immediately after creation"))?;

        let input_executions = executions.clone();
        let execution_id = info.execution_id.clone();
        tokio::spawn(async move {
            loop {
                match inbound.message().await {
                    Ok(Some(frame)) => match frame.kind {
                        Some(AttachKind::Stdin(data)) => {
                            input_executions.send_input(&execution_id, ExecInputFrame::Stdin(data));
                        }
                        Some(AttachKind::Resize(r)) => {
                            input_executions.send_input(
                                &execution_id,
                                ExecInputFrame::Resize {
                                    cols: u16::try_from(r.cols).unwrap_or(u16::MAX),
                                    rows: u16::try_from(r.rows).unwrap_or(u16::MAX),
                                },
                            );
                        }
                        Some(AttachKind::Signal(sig)) => {
                            input_executions.send_input(&execution_id, ExecInputFrame::Signal(sig));
                        }
                        _ => {}
                    },
                    Ok(None) => {
                        input_executions.send_input(&execution_id, ExecInputFrame::Eof);
                        return;
                    }
                    Err(_) => return,
                }
            }
        });

        let stream = async_stream::try_stream! {
            loop {
                match rx.recv().await {
                    Ok(frame) => {
                        let is_exit = matches!(frame, ExecStreamResponse::Exit { .. });
                        yield attach_frame_from_exec_stream(frame);
                        if is_exit {
                            return;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        };

        Ok(Response::new(Box::pin(stream)))
    }
}

/// Converts a guest output frame into a `StreamExecution` event.
fn execution_event_from_frame(frame: ExecStreamResponse) -> pb::ExecutionEvent {
    use pb::execution_event::Kind;
    let kind = match frame {
        ExecStreamResponse::Stdout(d) => Kind::Stdout(d),
        ExecStreamResponse::Stderr(d) => Kind::Stderr(d),
        ExecStreamResponse::Exit { exit_code, message } => {
            Kind::Exit(pb::ExitEvent { exit_code, message })
        }
    };
    pb::ExecutionEvent { kind: Some(kind) }
}

/// Converts a guest output frame into an `AttachExecution` core→host frame.
fn attach_frame_from_exec_stream(frame: ExecStreamResponse) -> pb::ExecutionAttachFrame {
    let kind = match frame {
        ExecStreamResponse::Stdout(d) => AttachKind::Stdout(d),
        ExecStreamResponse::Stderr(d) => AttachKind::Stderr(d),
        ExecStreamResponse::Exit { exit_code, message } => {
            AttachKind::Exit(pb::ExitEvent { exit_code, message })
        }
    };
    pb::ExecutionAttachFrame { kind: Some(kind) }
}
