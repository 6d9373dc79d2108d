//! PTY-based process spawning and window resize.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

use cleanroom_proto::ExecRequest;
use nix::pty::{OpenptyResult, Winsize, openpty};
use nix::unistd::dup;

/// Initial PTY size used until the host sends a `Resize` input frame.
/// `spec.md` §4.1's `ExecRequest` carries no initial terminal dimensions.
const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

/// Handle to a process spawned with a PTY.
pub struct PtyHandle {
    /// Child PID.
    pub pid: i32,
    /// Async reader for the PTY master (child's stdout+stderr merged).
    pub master_read: tokio::fs::File,
    /// Async writer for the PTY master (child's stdin).
    pub master_write: tokio::fs::File,
    /// Raw fd of the PTY master, kept alive for `TIOCSWINSZ`.
    master_fd: OwnedFd,
}

impl PtyHandle {
    /// Resizes the PTY window via `TIOCSWINSZ` ioctl in response to an
    /// `ExecInputFrame::Resize` frame.
    pub fn resize(&self, cols: u16, rows: u16) {
        let winsize = Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        unsafe {
            libc::ioctl(
                self.master_fd.as_raw_fd(),
                libc::TIOCSWINSZ,
                std::ptr::from_ref(&winsize),
            );
        }
    }
}

/// Spawns a process with a PTY.
///
/// The child gets a new session (`setsid`) and the PTY slave becomes its
/// controlling terminal (`TIOCSCTTY`). In PTY mode, stdout and stderr are
/// merged into a single stream through the PTY master.
pub fn spawn(req: &ExecRequest) -> io::Result<PtyHandle> {
    let winsize = Winsize {
        ws_row: DEFAULT_ROWS,
        ws_col: DEFAULT_COLS,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };

    let OpenptyResult { master, slave } =
        openpty(Some(&winsize), None).map_err(|e| io::Error::other(format!("openpty: {e}")))?;

    let slave_raw_fd = slave.as_raw_fd();

    // Duplicate slave fd for each stdio handle (Stdio::from_raw_fd takes ownership).
    let slave_stdin = dup_fd(&slave, "stdin")?;
    let slave_stdout = dup_fd(&slave, "stdout")?;
    let slave_stderr = dup_fd(&slave, "stderr")?;

    let Some((program, args)) = req.command.split_first() else {
        return Err(io::Error::other("empty command"));
    };
    let mut cmd = Command::new(program);
    cmd.args(args);
    super::apply_exec_options_impl!(&mut cmd, req);

    unsafe {
        cmd.stdin(Stdio::from_raw_fd(slave_stdin.into_raw_fd()));
        cmd.stdout(Stdio::from_raw_fd(slave_stdout.into_raw_fd()));
        cmd.stderr(Stdio::from_raw_fd(slave_stderr.into_raw_fd()));
    }

    // Create new session and set controlling terminal in the child.
    unsafe {
        cmd.pre_exec(move || {
            nix::unistd::setsid().map_err(io::Error::other)?;
            if libc::ioctl(slave_raw_fd, libc::TIOCSCTTY, 0) == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = cmd.spawn()?;

    #[allow(clippy::cast_possible_wrap)]
    let pid = child.id() as i32;

    // Close slave in parent — child has its own copies after fork.
    drop(slave);

    // Create separate read/write handles from the master fd.
    let read_fd = dup_fd(&master, "master_read")?;
    let write_fd = dup_fd(&master, "master_write")?;

    let master_read =
        tokio::fs::File::from_std(unsafe { std::fs::File::from_raw_fd(read_fd.into_raw_fd()) });
    let master_write =
        tokio::fs::File::from_std(unsafe { std::fs::File::from_raw_fd(write_fd.into_raw_fd()) });

    Ok(PtyHandle {
        pid,
        master_read,
        master_write,
        master_fd: master,
    })
}

/// Duplicates an `OwnedFd` with a descriptive error context.
fn dup_fd(fd: &OwnedFd, label: &str) -> io::Result<OwnedFd> {
    dup(fd).map_err(|e| io::Error::other(format!("dup {label}: {e}")))
}
