//! Command execution with PTY support, per `spec.md` §4.1's wire contract.
//!
//! One connection carries one [`ExecRequest`]; this module spawns the
//! requested command, seeds guest entropy if asked, and pumps
//! [`ExecInputFrame`]s in while demultiplexing [`ExecStreamResponse`]s out
//! until the child exits and a terminal `Exit` record is sent.

mod pty;

use std::io;
use std::os::unix::process::ExitStatusExt;

use cleanroom_proto::{ExecInputFrame, ExecRequest, ExecStreamResponse, codec};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Reads the connection's single [`ExecRequest`] frame and drives it to
/// completion, per `spec.md` §4.1 ("exactly one, first frame").
pub async fn serve_connection(stream: impl AsyncRead + AsyncWrite + Unpin) -> io::Result<()> {
    let (mut read_half, mut write_half) = tokio::io::split(stream);
    let request: ExecRequest = codec::recv(&mut read_half).await?;
    seed_entropy(request.entropy_seed);
    handle(&mut read_half, &mut write_half, request).await
}

/// Spawns the requested command, in PTY or pipe mode.
async fn handle(
    r: &mut (impl AsyncRead + Unpin),
    w: &mut (impl AsyncWrite + Unpin),
    req: ExecRequest,
) -> io::Result<()> {
    if req.tty {
        handle_pty(r, w, req).await
    } else {
        handle_pipe(r, w, req).await
    }
}

/// Writes the 64 bytes of host-supplied entropy into the guest RNG, if any
/// was provided. Best-effort: a guest without `/dev/urandom` writable
/// (read-only rootfs, sandboxed test harness) simply runs on its own
/// entropy instead of failing the execution.
fn seed_entropy(seed: Option<[u8; 64]>) {
    let Some(seed) = seed else {
        return;
    };
    if let Ok(mut f) = std::fs::OpenOptions::new().write(true).open("/dev/urandom") {
        use std::io::Write as _;
        let _ = f.write_all(&seed);
    }
}

/// Pipe-mode execution: stdout and stderr are separate streams.
async fn handle_pipe(
    r: &mut (impl AsyncRead + Unpin),
    w: &mut (impl AsyncWrite + Unpin),
    req: ExecRequest,
) -> io::Result<()> {
    use std::process::Stdio;

    use tokio::process::Command;

    let Some((program, args)) = req.command.split_first() else {
        return send_exit_error(w, "empty command").await;
    };

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    apply_exec_options(&mut cmd, &req);

    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => return send_exit_error(w, &e.to_string()).await,
    };

    #[allow(clippy::cast_possible_wrap)]
    let pid = child.id().unwrap_or(0) as i32;

    let mut child_stdin = child.stdin.take();
    // SAFETY: stdout/stderr were set to Stdio::piped() above.
    let Some(mut stdout) = child.stdout.take() else {
        unreachable!()
    };
    let Some(mut stderr) = child.stderr.take() else {
        unreachable!()
    };
    let mut stdout_done = false;
    let mut stderr_done = false;
    let mut stdout_buf = [0u8; 4096];
    let mut stderr_buf = [0u8; 4096];

    loop {
        if stdout_done && stderr_done {
            break;
        }

        tokio::select! {
            host_msg = codec::recv::<ExecInputFrame>(r) => {
                match host_msg {
                    Ok(ExecInputFrame::Stdin(data)) => {
                        if let Some(ref mut stdin) = child_stdin {
                            let _ = stdin.write_all(&data).await;
                        }
                    }
                    Ok(ExecInputFrame::Eof) => {
                        child_stdin = None;
                    }
                    Ok(ExecInputFrame::Signal(sig)) => {
                        unsafe { libc::kill(pid, sig) };
                    }
                    Ok(ExecInputFrame::Resize { .. }) => {}
                    Err(_) => {
                        // Host disconnected — kill the child and collect its exit status.
                        unsafe { libc::kill(pid, libc::SIGKILL) };
                        break;
                    }
                }
            }
            n = stdout.read(&mut stdout_buf), if !stdout_done => {
                match n {
                    Ok(0) | Err(_) => stdout_done = true,
                    Ok(len) => {
                        codec::send(w, &ExecStreamResponse::Stdout(stdout_buf[..len].to_vec())).await?;
                    }
                }
            }
            n = stderr.read(&mut stderr_buf), if !stderr_done => {
                match n {
                    Ok(0) | Err(_) => stderr_done = true,
                    Ok(len) => {
                        codec::send(w, &ExecStreamResponse::Stderr(stderr_buf[..len].to_vec())).await?;
                    }
                }
            }
        }
    }

    drop(child_stdin);
    send_exit(w, &mut child).await
}

/// PTY-mode execution: stdout and stderr are merged into a single PTY stream.
async fn handle_pty(
    r: &mut (impl AsyncRead + Unpin),
    w: &mut (impl AsyncWrite + Unpin),
    req: ExecRequest,
) -> io::Result<()> {
    let mut pty_handle = match pty::spawn(&req) {
        Ok(h) => h,
        Err(e) => return send_exit_error(w, &e.to_string()).await,
    };

    let pid = pty_handle.pid;
    let mut pty_buf = [0u8; 4096];

    loop {
        tokio::select! {
            host_msg = codec::recv::<ExecInputFrame>(r) => {
                match host_msg {
                    Ok(ExecInputFrame::Stdin(data)) => {
                        let _ = pty_handle.master_write.write_all(&data).await;
                    }
                    Ok(ExecInputFrame::Eof) => {
                        // A PTY has no separate stdin-EOF concept.
                    }
                    Ok(ExecInputFrame::Signal(sig)) => {
                        unsafe { libc::kill(pid, sig) };
                    }
                    Ok(ExecInputFrame::Resize { cols, rows }) => {
                        pty_handle.resize(cols, rows);
                    }
                    Err(_) => {
                        unsafe { libc::kill(pid, libc::SIGKILL) };
                        break;
                    }
                }
            }
            n = pty_handle.master_read.read(&mut pty_buf) => {
                match n {
                    Ok(0) | Err(_) => break,
                    Ok(len) => {
                        codec::send(w, &ExecStreamResponse::Stdout(pty_buf[..len].to_vec())).await?;
                    }
                }
            }
        }
    }

    send_exit_by_pid(w, pid).await
}

/// Sends a terminal `Exit` record carrying a pre-spawn failure message.
async fn send_exit_error(w: &mut (impl AsyncWrite + Unpin), message: &str) -> io::Result<()> {
    codec::send(
        w,
        &ExecStreamResponse::Exit {
            exit_code: -1,
            message: message.to_owned(),
        },
    )
    .await
}

/// Waits for a `tokio::process::Child` and sends its terminal `Exit` record.
async fn send_exit(w: &mut (impl AsyncWrite + Unpin), child: &mut tokio::process::Child) -> io::Result<()> {
    let status = child.wait().await?;
    let exit_code = exit_code_of(status.code(), status.signal());
    codec::send(
        w,
        &ExecStreamResponse::Exit {
            exit_code,
            message: String::new(),
        },
    )
    .await
}

/// Waits for a process by PID (PTY mode, no `tokio::process::Child` handle)
/// and sends its terminal `Exit` record.
async fn send_exit_by_pid(w: &mut (impl AsyncWrite + Unpin), pid: i32) -> io::Result<()> {
    use nix::sys::wait::{WaitStatus, waitpid};
    use nix::unistd::Pid;

    let wait_result = tokio::task::spawn_blocking(move || waitpid(Pid::from_raw(pid), None))
        .await
        .map_err(io::Error::other)?;

    let exit_code = match wait_result {
        Ok(WaitStatus::Exited(_, code)) => code,
        Ok(WaitStatus::Signaled(_, sig, _)) => 128 + sig as i32,
        // ECHILD: already reaped (SIG_IGN on SIGCHLD).
        Err(nix::errno::Errno::ECHILD) => 0,
        Ok(_) | Err(_) => -1,
    };

    codec::send(
        w,
        &ExecStreamResponse::Exit {
            exit_code,
            message: String::new(),
        },
    )
    .await
}

/// Maps a waited `ExitStatus`'s (code, signal) pair to the wire exit code:
/// the raw exit code on a normal exit, or `128 + signal` on a signal death.
const fn exit_code_of(code: Option<i32>, signal: Option<i32>) -> i32 {
    match (code, signal) {
        (Some(code), _) => code,
        (None, Some(sig)) => 128 + sig,
        (None, None) => -1,
    }
}

/// Applies `cwd`/`env` from an [`ExecRequest`] to a command.
///
/// Works with both `std::process::Command` and `tokio::process::Command`
/// since they share the same method signatures for `current_dir`/`env`.
macro_rules! apply_exec_options_impl {
    ($cmd:expr, $req:expr) => {{
        if let Some(ref cwd) = $req.cwd {
            $cmd.current_dir(cwd);
        }
        if let Some(ref env) = $req.env {
            for pair in env {
                if let Some((k, v)) = pair.split_once('=') {
                    $cmd.env(k, v);
                }
            }
        }
    }};
}

fn apply_exec_options(cmd: &mut tokio::process::Command, req: &ExecRequest) {
    apply_exec_options_impl!(cmd, req);
}

pub(crate) use apply_exec_options_impl;
