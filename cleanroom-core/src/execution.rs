//! Execution engine: dials a sandbox's proxy socket, writes the initial
//! `ExecRequest`, then pumps input frames in and demultiplexes
//! stdout/stderr/exit frames out to subscribers (`spec.md` §4.5, §3
//! `Execution`).

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use cleanroom_proto::{codec, ExecInputFrame, ExecRequest, ExecStreamResponse, Signal};
use tokio::net::UnixStream;
use tokio::sync::{broadcast, mpsc};

use crate::capability::SignalSource;
use crate::error::{Error, Result};
use crate::registry::Registry;

/// Bound on the buffered stdout/stderr tail kept for late `GetExecution`
/// calls after a `StreamExecution` subscriber has disconnected.
const TAIL_BUFFER_BYTES: usize = 64 * 1024;

/// Capacity of the broadcast channel handed to each `StreamExecution`
/// subscriber; a slow subscriber that falls this far behind observes a
/// `RecvError::Lagged` rather than unbounded memory growth.
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 256;

/// How long `CreateExecution` waits between proxy-socket connect attempts.
const CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// How long a non-interactive (`tty == false`) execution started without an
/// attach waits before a synthetic `Eof` input frame is sent, so a guest
/// command that reads stdin (`cat`, `sh -c 'read x'`) doesn't block forever
/// waiting on input no caller will ever provide (`spec.md` §4.5 step 4).
const NON_TTY_EOF_GRACE: Duration = Duration::from_millis(150);

/// Execution lifecycle status (`spec.md` §3 `Execution.Status`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Status {
    /// Allocated, not yet dialed.
    Pending,
    /// Request written; output/input pumps active.
    Running,
    /// `exit(0)` observed.
    Succeeded,
    /// `exit(!=0)` observed.
    Failed,
    /// Canceled (second-cancel channel close, or sandbox teardown).
    Canceled,
    /// Exceeded its launch/run deadline.
    TimedOut,
}

/// Public snapshot of an execution's state, as returned by the Control API.
#[derive(Debug, Clone)]
pub struct ExecutionInfo {
    /// Opaque id, unique within the owning sandbox.
    pub execution_id: String,
    /// The argv this execution was created with.
    pub command: Vec<String>,
    /// Whether a PTY was requested.
    pub tty: bool,
    /// Current lifecycle status.
    pub status: Status,
    /// Valid iff `status` is `Succeeded` or `Failed` (signals surface as `128+signal`).
    pub exit_code: Option<i32>,
    /// Creation timestamp.
    pub created_at: SystemTime,
}

/// Result of a `CancelExecution` call (`spec.md` §4.5 step 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// First cancel: a `Signal(SIGINT)` input frame was queued; the
    /// execution stream is left to finish on its own.
    SignalSent,
    /// Second cancel: the guest channel was closed. The caller must now
    /// terminate the owning sandbox and surface exit code 130.
    ChannelClosed,
    /// The execution had already reached a terminal status.
    AlreadyTerminal,
}

struct Inner {
    status: Status,
    exit_code: Option<i32>,
    tail: VecDeque<u8>,
    cancel_count: u8,
}

impl Inner {
    fn push_tail(&mut self, chunk: &[u8]) {
        self.tail.extend(chunk.iter().copied());
        while self.tail.len() > TAIL_BUFFER_BYTES {
            self.tail.pop_front();
        }
    }
}

/// One execution's full state: immutable identity fields, the mutable
/// status/tail guarded by one lock, a broadcast channel fanning output
/// frames out to `StreamExecution`/`AttachExecution` subscribers, and the
/// input-frame sender the input pump reads from.
struct ExecutionEntry {
    execution_id: String,
    command: Vec<String>,
    tty: bool,
    created_at: SystemTime,
    inner: Mutex<Inner>,
    events: broadcast::Sender<ExecStreamResponse>,
    input_tx: Mutex<Option<mpsc::UnboundedSender<ExecInputFrame>>>,
}

impl SignalSource for ExecutionEntry {
    /// Queues `signal` on this execution's guest channel, a no-op if the
    /// channel has already been closed (second-cancel, or a terminal exit).
    fn send_signal(&self, signal: i32) -> cleanroom_oci::BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let guard = self.input_tx.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(tx) = guard.as_ref() {
                let _ = tx.send(ExecInputFrame::Signal(signal));
            }
            Ok(())
        })
    }
}

impl ExecutionEntry {
    fn snapshot(&self) -> ExecutionInfo {
        let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        ExecutionInfo {
            execution_id: self.execution_id.clone(),
            command: self.command.clone(),
            tty: self.tty,
            status: inner.status,
            exit_code: inner.exit_code,
            created_at: self.created_at,
        }
    }
}

static EXECUTION_SEQ: AtomicU64 = AtomicU64::new(1);

fn next_execution_id() -> String {
    let n = EXECUTION_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("ex-{n:012x}")
}

/// The set of executions belonging to one sandbox. Cheaply `Clone`
/// (an `Arc` handle), so both the sandbox entry and any RPC handler task
/// can hold one (`spec.md` §9's "single typed registry" consolidation).
#[derive(Clone)]
pub struct ExecutionTable {
    entries: Arc<Registry<String, Arc<ExecutionEntry>>>,
}

impl Default for ExecutionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Registry::new()),
        }
    }

    /// Dials `proxy_socket_path`, writes the `ExecRequest`, and spawns the
    /// output/input pump tasks, per `spec.md` §4.5's execution lifecycle.
    ///
    /// `will_attach` must be `true` only when the caller is about to start
    /// forwarding its own stream of input frames (the `AttachExecution`
    /// path); it suppresses the non-TTY auto-`Eof` timer described below,
    /// since that caller owns sending `Eof` itself when its stream closes.
    /// A plain `CreateExecution` call (no attach ever follows) passes
    /// `false`: per `spec.md` §4.5 step 4, when `tty` is `false` and no
    /// attach opens within [`NON_TTY_EOF_GRACE`], a single `Eof` frame is
    /// sent so the guest doesn't block forever reading stdin nobody will
    /// supply.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProxyConnectFailed`] if no connection succeeds
    /// within `launch_seconds`, or [`Error::WireExecRequestFailed`] if the
    /// initial frame cannot be written.
    pub async fn create_execution(
        &self,
        proxy_socket_path: &Path,
        command: Vec<String>,
        tty: bool,
        launch_seconds: u32,
        will_attach: bool,
    ) -> Result<ExecutionInfo> {
        let execution_id = next_execution_id();
        let entry = Arc::new(ExecutionEntry {
            execution_id: execution_id.clone(),
            command: command.clone(),
            tty,
            created_at: SystemTime::now(),
            inner: Mutex::new(Inner {
                status: Status::Pending,
                exit_code: None,
                tail: VecDeque::new(),
                cancel_count: 0,
            }),
            events: broadcast::channel(SUBSCRIBER_CHANNEL_CAPACITY).0,
            input_tx: Mutex::new(None),
        });
        self.entries.replace(execution_id.clone(), entry.clone());

        let deadline = Instant::now() + Duration::from_secs(u64::from(launch_seconds.max(1)));
        let stream = connect_with_deadline(proxy_socket_path, deadline).await?;

        let request = ExecRequest::new(command);
        let (mut read_half, mut write_half) = stream.into_split();
        codec::send(
            &mut write_half,
            &ExecRequest {
                tty,
                ..request
            },
        )
        .await
        .map_err(|e| Error::WireExecRequestFailed(e.to_string()))?;

        let (input_tx, mut input_rx) = mpsc::unbounded_channel::<ExecInputFrame>();
        if !tty && !will_attach {
            let eof_tx = input_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(NON_TTY_EOF_GRACE).await;
                let _ = eof_tx.send(ExecInputFrame::Eof);
            });
        }
        *entry.input_tx.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(input_tx);

        {
            let mut inner = entry.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            inner.status = Status::Running;
        }

        tokio::spawn(async move {
            while let Some(frame) = input_rx.recv().await {
                if codec::send(&mut write_half, &frame).await.is_err() {
                    break;
                }
            }
        });

        let pump_entry = entry.clone();
        tokio::spawn(async move {
            run_output_pump(pump_entry, &mut read_half).await;
        });

        Ok(entry.snapshot())
    }

    /// Returns a snapshot of `execution_id`'s current state, if present.
    #[must_use]
    pub fn get(&self, execution_id: &str) -> Option<ExecutionInfo> {
        self.entries.get(&execution_id.to_owned()).map(|e| e.snapshot())
    }

    /// Lists every execution currently tracked, most recently created first.
    #[must_use]
    pub fn list(&self) -> Vec<ExecutionInfo> {
        let mut infos: Vec<ExecutionInfo> = self.entries.list().iter().map(|e| e.snapshot()).collect();
        infos.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        infos
    }

    /// Subscribes to `execution_id`'s stdout/stderr/exit frame stream.
    #[must_use]
    pub fn subscribe(&self, execution_id: &str) -> Option<broadcast::Receiver<ExecStreamResponse>> {
        self.entries
            .get(&execution_id.to_owned())
            .map(|e| e.events.subscribe())
    }

    /// Queues a stdin/resize frame for delivery on `execution_id`'s guest
    /// channel. A no-op if the execution is unknown or already terminal.
    pub fn send_input(&self, execution_id: &str, frame: ExecInputFrame) {
        let Some(entry) = self.entries.get(&execution_id.to_owned()) else {
            return;
        };
        let guard = entry.input_tx.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(tx) = guard.as_ref() {
            let _ = tx.send(frame);
        }
    }

    /// Applies `spec.md` §4.5 step 5's first-cancel/second-cancel contract.
    pub fn cancel(&self, execution_id: &str) -> CancelOutcome {
        let Some(entry) = self.entries.get(&execution_id.to_owned()) else {
            return CancelOutcome::AlreadyTerminal;
        };

        let count = {
            let mut inner = entry.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if is_terminal(inner.status) {
                return CancelOutcome::AlreadyTerminal;
            }
            inner.cancel_count += 1;
            inner.cancel_count
        };

        if count == 1 {
            let source = entry.clone();
            tokio::spawn(async move {
                let _ = source.send_signal(Signal::SIGINT).await;
            });
            return CancelOutcome::SignalSent;
        }

        self.close_channel(&entry);
        {
            let mut inner = entry.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if !is_terminal(inner.status) {
                inner.status = Status::Canceled;
                inner.exit_code = Some(130);
            }
        }
        CancelOutcome::ChannelClosed
    }

    /// Forcefully closes every tracked execution's guest channel and marks
    /// it `Canceled`, used by sandbox teardown (`spec.md` §4.5's "close all
    /// open executions' guest channels" release step).
    pub fn cancel_all(&self) {
        for entry in self.entries.list() {
            self.close_channel(&entry);
            let mut inner = entry.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if !is_terminal(inner.status) {
                inner.status = Status::Canceled;
                inner.exit_code = Some(130);
            }
        }
    }

    fn close_channel(&self, entry: &Arc<ExecutionEntry>) {
        *entry.input_tx.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = None;
    }

    /// Returns the buffered stdout+stderr tail for `execution_id`, for a
    /// `GetExecution` call after its stream subscriber has disconnected.
    #[must_use]
    pub fn buffered_tail(&self, execution_id: &str) -> Vec<u8> {
        let Some(entry) = self.entries.get(&execution_id.to_owned()) else {
            return Vec::new();
        };
        let inner = entry.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.tail.iter().copied().collect()
    }
}

const fn is_terminal(status: Status) -> bool {
    matches!(
        status,
        Status::Succeeded | Status::Failed | Status::Canceled | Status::TimedOut
    )
}

async fn run_output_pump(entry: Arc<ExecutionEntry>, read_half: &mut tokio::net::unix::OwnedReadHalf) {
    loop {
        let frame: std::io::Result<ExecStreamResponse> = codec::recv(read_half).await;
        let Ok(frame) = frame else {
            let mut inner = entry.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if !is_terminal(inner.status) {
                inner.status = Status::Failed;
                inner.exit_code = None;
            }
            return;
        };

        match &frame {
            ExecStreamResponse::Stdout(chunk) | ExecStreamResponse::Stderr(chunk) => {
                let mut inner = entry.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                inner.push_tail(chunk);
            }
            ExecStreamResponse::Exit { exit_code, .. } => {
                let mut inner = entry.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                inner.exit_code = Some(*exit_code);
                inner.status = if inner.cancel_count >= 2 {
                    Status::Canceled
                } else if *exit_code == 0 {
                    Status::Succeeded
                } else {
                    Status::Failed
                };
            }
        }

        let is_exit = matches!(frame, ExecStreamResponse::Exit { .. });
        let _ = entry.events.send(frame);
        if is_exit {
            return;
        }
    }
}

async fn connect_with_deadline(path: &Path, deadline: Instant) -> Result<UnixStream> {
    loop {
        match UnixStream::connect(path).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                if Instant::now() >= deadline {
                    return Err(Error::ProxyConnectFailed(e.to_string()));
                }
                tokio::time::sleep(CONNECT_POLL_INTERVAL).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_execution_against_fake_guest() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("proxy.sock");
        let listener = tokio::net::UnixListener::bind(&socket_path).unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (mut read_half, mut write_half) = stream.into_split();
            let _req: ExecRequest = codec::recv(&mut read_half).await.unwrap();
            codec::send(&mut write_half, &ExecStreamResponse::Stdout(b"hello\n".to_vec()))
                .await
                .unwrap();
            codec::send(
                &mut write_half,
                &ExecStreamResponse::Exit {
                    exit_code: 0,
                    message: String::new(),
                },
            )
            .await
            .unwrap();
        });

        let table = ExecutionTable::new();
        let info = table
            .create_execution(&socket_path, vec!["echo".into(), "hello".into()], false, 5, false)
            .await
            .unwrap();
        assert_eq!(info.status, Status::Running);

        let mut rx = table.subscribe(&info.execution_id).unwrap();
        let first = rx.recv().await.unwrap();
        assert!(matches!(first, ExecStreamResponse::Stdout(d) if d == b"hello\n"));
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, ExecStreamResponse::Exit { exit_code: 0, .. }));

        tokio::time::sleep(Duration::from_millis(20)).await;
        let final_info = table.get(&info.execution_id).unwrap();
        assert_eq!(final_info.status, Status::Succeeded);
        assert_eq!(final_info.exit_code, Some(0));
    }

    #[tokio::test]
    async fn non_tty_execution_without_attach_gets_synthetic_eof() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("proxy.sock");
        let listener = tokio::net::UnixListener::bind(&socket_path).unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (mut read_half, mut write_half) = stream.into_split();
            let _req: ExecRequest = codec::recv(&mut read_half).await.unwrap();
            // A `cat`-like guest: blocks reading input frames until `Eof`,
            // then reports the exit it would see on closed stdin.
            loop {
                match codec::recv::<ExecInputFrame>(&mut read_half).await {
                    Ok(ExecInputFrame::Eof) => break,
                    Ok(_) => {}
                    Err(_) => return,
                }
            }
            codec::send(
                &mut write_half,
                &ExecStreamResponse::Exit {
                    exit_code: 0,
                    message: String::new(),
                },
            )
            .await
            .unwrap();
        });

        let table = ExecutionTable::new();
        let info = table
            .create_execution(&socket_path, vec!["cat".into()], false, 5, false)
            .await
            .unwrap();

        let mut rx = table.subscribe(&info.execution_id).unwrap();
        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("synthetic Eof should unblock the guest well within 1s")
            .unwrap();
        assert!(matches!(event, ExecStreamResponse::Exit { exit_code: 0, .. }));
    }

    #[tokio::test]
    async fn attached_execution_does_not_get_synthetic_eof() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("proxy.sock");
        let listener = tokio::net::UnixListener::bind(&socket_path).unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (mut read_half, mut write_half) = stream.into_split();
            let _req: ExecRequest = codec::recv(&mut read_half).await.unwrap();
            let frame: ExecInputFrame = codec::recv(&mut read_half).await.unwrap();
            assert!(matches!(frame, ExecInputFrame::Stdin(d) if d == b"hi"));
            codec::send(
                &mut write_half,
                &ExecStreamResponse::Exit {
                    exit_code: 0,
                    message: String::new(),
                },
            )
            .await
            .unwrap();
        });

        let table = ExecutionTable::new();
        let info = table
            .create_execution(&socket_path, vec!["cat".into()], false, 5, true)
            .await
            .unwrap();
        table.send_input(&info.execution_id, ExecInputFrame::Stdin(b"hi".to_vec()));

        let mut rx = table.subscribe(&info.execution_id).unwrap();
        let event = tokio::time::timeout(Duration::from_millis(400), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, ExecStreamResponse::Exit { exit_code: 0, .. }));
    }

    #[test]
    fn cancel_unknown_execution_is_already_terminal() {
        let table = ExecutionTable::new();
        assert_eq!(table.cancel("nope"), CancelOutcome::AlreadyTerminal);
    }

    #[test]
    fn buffered_tail_is_empty_for_unknown_execution() {
        let table = ExecutionTable::new();
        assert!(table.buffered_tail("nope").is_empty());
    }

    /// A fake `SignalSource`, mockable per `spec.md` §9's capability
    /// requirement: records signals instead of writing to a guest channel.
    struct RecordingSignalSource {
        received: std::sync::Mutex<Vec<i32>>,
    }

    impl SignalSource for RecordingSignalSource {
        fn send_signal(&self, signal: i32) -> cleanroom_oci::BoxFuture<'_, Result<()>> {
            Box::pin(async move {
                self.received
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .push(signal);
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn signal_source_is_mockable() {
        let fake = RecordingSignalSource {
            received: std::sync::Mutex::new(Vec::new()),
        };
        fake.send_signal(Signal::SIGINT).await.unwrap();
        assert_eq!(*fake.received.lock().unwrap(), vec![Signal::SIGINT]);
    }

    #[tokio::test]
    async fn first_cancel_delivers_sigint_through_signal_source() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("proxy.sock");
        let listener = tokio::net::UnixListener::bind(&socket_path).unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (mut read_half, mut write_half) = stream.into_split();
            let _req: ExecRequest = codec::recv(&mut read_half).await.unwrap();
            let frame: ExecInputFrame = codec::recv(&mut read_half).await.unwrap();
            assert!(matches!(frame, ExecInputFrame::Signal(2)));
            codec::send(
                &mut write_half,
                &ExecStreamResponse::Exit {
                    exit_code: 130,
                    message: String::new(),
                },
            )
            .await
            .unwrap();
        });

        let table = ExecutionTable::new();
        let info = table
            .create_execution(&socket_path, vec!["sleep".into(), "5".into()], false, 5, true)
            .await
            .unwrap();

        assert_eq!(table.cancel(&info.execution_id), CancelOutcome::SignalSent);

        let mut rx = table.subscribe(&info.execution_id).unwrap();
        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, ExecStreamResponse::Exit { exit_code: 130, .. }));
    }
}
