//! Client session for the sibling `cleanroom-helper` process (`spec.md` §4.2).
//!
//! Spawns the helper, poll-connects its control socket, then exchanges
//! newline-delimited JSON request/response objects one at a time. Mirrors
//! the teacher's [`crate::runtime::VmHandle`] shape (persistent connection,
//! `&self` methods via an internal mutex) but speaks the helper's line
//! protocol instead of the guest-agent frame protocol.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::capability::{HelperProcess, StartVmParams, StartVmResult};
use crate::error::{Error, Result};

/// Tick interval while poll-connecting the helper's control socket.
const CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Maximum length of a unix socket path (`sockaddr_un.sun_path`), per
/// `spec.md`'s "length ≤103 bytes" requirement.
const MAX_SOCKET_PATH_BYTES: usize = 103;

#[derive(Serialize)]
#[serde(tag = "op")]
enum HelperRequest<'a> {
    StartVM {
        kernel_path: &'a Path,
        rootfs_path: &'a Path,
        vcpus: u8,
        memory_mib: u32,
        guest_port: u32,
        launch_timeout_seconds: u32,
        run_directory: &'a Path,
        proxy_socket_path: &'a Path,
        console_log_path: &'a Path,
        boot_args: &'a str,
    },
    StopVM {
        vm_id: &'a str,
    },
    Ping,
}

#[derive(Deserialize)]
struct HelperResponse {
    ok: bool,
    error: Option<String>,
    vm_id: Option<String>,
    proxy_socket_path: Option<String>,
}

/// A live helper session: the spawned process plus its control socket.
#[derive(Debug)]
pub struct HelperSession {
    child: Mutex<Child>,
    stream: Mutex<BufReader<UnixStream>>,
    socket_path: PathBuf,
    interrupt_wait: Duration,
    kill_wait: Duration,
}

impl HelperSession {
    /// Spawns `helper_binary --socket <path>` under a freshly chosen short
    /// socket path in `run_directory`, then poll-connects it until ready,
    /// the helper exits, or `connect_timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HelperBinaryMissing`] if `helper_binary` does not
    /// exist, [`Error::HelperStartFailed`] if the process exits before the
    /// socket accepts a connection (its captured stderr is included), or an
    /// I/O error from spawning the process.
    pub async fn start(
        helper_binary: &Path,
        run_directory: &Path,
        connect_timeout: Duration,
    ) -> Result<Self> {
        if !helper_binary.exists() {
            return Err(Error::HelperBinaryMissing(
                helper_binary.display().to_string(),
            ));
        }

        let socket_path = short_socket_path(run_directory)?;
        let _ = std::fs::remove_file(&socket_path);

        let mut child = Command::new(helper_binary)
            .arg("--socket")
            .arg(&socket_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stream = poll_connect_or_exit(&mut child, &socket_path, connect_timeout).await?;

        Ok(Self {
            child: Mutex::new(child),
            stream: Mutex::new(BufReader::new(stream)),
            socket_path,
            interrupt_wait: crate::config::DEFAULT_HELPER_INTERRUPT_WAIT,
            kill_wait: crate::config::DEFAULT_HELPER_KILL_WAIT,
        })
    }

    /// Overrides the default interrupt/kill grace periods used by [`Self::close`].
    #[must_use]
    pub const fn with_shutdown_timing(
        mut self,
        interrupt_wait: Duration,
        kill_wait: Duration,
    ) -> Self {
        self.interrupt_wait = interrupt_wait;
        self.kill_wait = kill_wait;
        self
    }

    /// Sends one request line and reads one response line. Callers
    /// serialize through `self.stream`'s mutex, matching "one outstanding
    /// request at a time."
    async fn roundtrip(&self, request: &HelperRequest<'_>, deadline: Duration) -> Result<HelperResponse> {
        let mut line = serde_json::to_string(request)
            .map_err(|e| Error::HelperStartFailed(format!("encode request: {e}")))?;
        line.push('\n');

        tokio::time::timeout(deadline, async {
            let mut stream = self.stream.lock().await;
            stream.get_mut().write_all(line.as_bytes()).await?;
            stream.get_mut().flush().await?;

            let mut response_line = String::new();
            let n = stream.read_line(&mut response_line).await?;
            if n == 0 {
                return Err(Error::HelperStartFailed(
                    "helper closed its control socket".to_owned(),
                ));
            }
            let response: HelperResponse = serde_json::from_str(response_line.trim_end())
                .map_err(|e| Error::WireMalformed(format!("helper response: {e}")))?;
            Ok(response)
        })
        .await
        .map_err(|_| Error::HelperStartFailed("helper request timed out".to_owned()))?
    }

    fn check_ok(response: HelperResponse) -> Result<HelperResponse> {
        if response.ok {
            return Ok(response);
        }
        let message = response.error.clone().unwrap_or_default();
        if message.to_lowercase().contains("entitlement") {
            return Err(Error::with_entitlement_guidance(message));
        }
        Err(Error::VmStartFailed(message))
    }
}

impl HelperProcess for HelperSession {
    fn start_vm<'a>(
        &'a self,
        params: &'a StartVmParams,
    ) -> cleanroom_oci::BoxFuture<'a, Result<StartVmResult>> {
        Box::pin(async move {
            let request = HelperRequest::StartVM {
                kernel_path: &params.kernel_path,
                rootfs_path: &params.rootfs_path,
                vcpus: params.vcpus,
                memory_mib: params.memory_mib,
                guest_port: params.guest_port,
                launch_timeout_seconds: params.launch_timeout_seconds,
                run_directory: &params.run_directory,
                proxy_socket_path: &params.proxy_socket_path,
                console_log_path: &params.console_log_path,
                boot_args: &params.boot_args,
            };
            let deadline = Duration::from_secs(u64::from(params.launch_timeout_seconds));
            let response = Self::check_ok(self.roundtrip(&request, deadline).await?)?;

            let vm_id = response
                .vm_id
                .ok_or_else(|| Error::VmStartFailed("missing vm_id in response".to_owned()))?;
            let proxy_socket_path = response
                .proxy_socket_path
                .ok_or_else(|| Error::VmStartFailed("missing proxy_socket_path".to_owned()))?
                .into();

            Ok(StartVmResult {
                vm_id,
                proxy_socket_path,
            })
        })
    }

    fn stop_vm<'a>(&'a self, vm_id: &'a str) -> cleanroom_oci::BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let request = HelperRequest::StopVM { vm_id };
            Self::check_ok(self.roundtrip(&request, Duration::from_secs(10)).await?)?;
            Ok(())
        })
    }

    fn ping(&self) -> cleanroom_oci::BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            Self::check_ok(
                self.roundtrip(&HelperRequest::Ping, Duration::from_secs(5))
                    .await?,
            )?;
            Ok(())
        })
    }

    fn close(self: Box<Self>) -> cleanroom_oci::BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            drop(self.stream.lock().await);
            let mut child = self.child.into_inner();

            let already_exited = child.try_wait()?.is_some();
            if !already_exited {
                send_child_signal(&child, libc::SIGINT)?;
                if tokio::time::timeout(self.interrupt_wait, child.wait())
                    .await
                    .is_err()
                {
                    send_child_signal(&child, libc::SIGKILL)?;
                    if tokio::time::timeout(self.kill_wait, child.wait())
                        .await
                        .is_err()
                    {
                        let _ = std::fs::remove_file(&self.socket_path);
                        return Err(Error::HelperExitTimeout);
                    }
                }
            }

            let _ = std::fs::remove_file(&self.socket_path);
            Ok(())
        })
    }
}

/// Sends `signal` to `child`'s pid, treating "no such process" as success
/// (the process already exited between our check and the signal).
fn send_child_signal(child: &Child, signal: i32) -> Result<()> {
    let Some(pid) = child.id() else {
        return Ok(());
    };
    let ret = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if ret == 0 || std::io::Error::last_os_error().kind() == std::io::ErrorKind::NotFound {
        return Ok(());
    }
    Err(std::io::Error::last_os_error().into())
}

/// Builds a short absolute socket path under `run_directory`, using a
/// random suffix, and checks it stays within the `sockaddr_un` limit.
fn short_socket_path(run_directory: &Path) -> Result<PathBuf> {
    let suffix = hex::encode(random_bytes::<4>());
    let path = run_directory.join(format!("h{suffix}.sock"));
    let byte_len = path.as_os_str().as_encoded_bytes().len();
    if byte_len > MAX_SOCKET_PATH_BYTES {
        return Err(Error::HelperStartFailed(format!(
            "helper socket path {byte_len} bytes exceeds the {MAX_SOCKET_PATH_BYTES}-byte limit"
        )));
    }
    Ok(path)
}

/// Generates `N` pseudo-random bytes without pulling in a `rand` dependency
/// — seeded from the process id and current time, sufficient for a
/// collision-avoiding socket-name suffix (not a security boundary).
fn random_bytes<const N: usize>() -> [u8; N] {
    let mut seed = u64::from(std::process::id());
    seed ^= std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    let mut out = [0u8; N];
    for byte in &mut out {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        *byte = (seed & 0xff) as u8;
    }
    out
}

/// Polls `socket_path` every [`CONNECT_POLL_INTERVAL`] until it accepts a
/// connection, the helper process exits, or `timeout` elapses.
async fn poll_connect_or_exit(
    child: &mut Child,
    socket_path: &Path,
    timeout: Duration,
) -> Result<UnixStream> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Ok(stream) = UnixStream::connect(socket_path).await {
            return Ok(stream);
        }
        if let Some(status) = child.try_wait()? {
            let stderr = drain_stderr(child).await;
            return Err(Error::HelperStartFailed(format!(
                "helper exited with {status} before its socket was ready: {stderr}"
            )));
        }
        if Instant::now() >= deadline {
            let _ = child.start_kill();
            return Err(Error::HelperStartFailed(
                "timed out waiting for helper socket".to_owned(),
            ));
        }
        tokio::time::sleep(CONNECT_POLL_INTERVAL).await;
    }
}

/// Reads whatever stderr the helper produced, for inclusion in the error
/// surfaced to the caller.
async fn drain_stderr(child: &mut Child) -> String {
    let Some(mut stderr) = child.stderr.take() else {
        return String::new();
    };
    use tokio::io::AsyncReadExt;
    let mut buf = String::new();
    let _ = stderr.read_to_string(&mut buf).await;
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_socket_path_stays_within_limit() {
        let dir = Path::new("/tmp/short");
        let path = short_socket_path(dir).unwrap();
        assert!(path.as_os_str().as_encoded_bytes().len() <= MAX_SOCKET_PATH_BYTES);
    }

    #[test]
    fn short_socket_path_rejects_overlong_directory() {
        let long_dir = Path::new("/tmp").join("x".repeat(200));
        let err = short_socket_path(&long_dir).unwrap_err();
        assert!(matches!(err, Error::HelperStartFailed(_)));
    }
}
