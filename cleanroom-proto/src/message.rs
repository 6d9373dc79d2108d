//! Frame types carried on a guest-agent connection.

use serde::{Deserialize, Serialize};

/// Wire protocol version. Bumped on every incompatible frame-shape change.
pub const PROTOCOL_VERSION: u32 = 1;

/// Default vsock port the guest agent listens on.
pub const AGENT_PORT: u32 = 10700;

/// Common POSIX signal numbers used by [`ExecInputFrame::Signal`].
pub mod signal {
    /// Interrupt (first cancel).
    pub const SIGINT: i32 = 2;
    /// Terminate.
    pub const SIGTERM: i32 = 15;
    /// Kill (second cancel / forced teardown).
    pub const SIGKILL: i32 = 9;
}
pub use signal as Signal;

/// Host → guest, exactly one, always the first frame on a connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecRequest {
    /// Argv, non-empty: `command[0]` is the executable.
    pub command: Vec<String>,
    /// Whether the guest should allocate a PTY for this execution.
    pub tty: bool,
    /// Optional 64 bytes of host-supplied entropy seeded into the guest's
    /// RNG before the command runs.
    pub entropy_seed: Option<[u8; 64]>,
    /// Environment variables in `KEY=VALUE` form. `None` inherits the
    /// guest-init default environment.
    pub env: Option<Vec<String>>,
    /// Working directory inside the guest. `None` uses the image default.
    pub cwd: Option<String>,
}

impl ExecRequest {
    /// Builds a minimal, non-interactive request for `command`.
    #[must_use]
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            tty: false,
            entropy_seed: None,
            env: None,
            cwd: None,
        }
    }
}

/// Host → guest, zero or more, concurrent with the output stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExecInputFrame {
    /// A chunk of stdin bytes.
    Stdin(Vec<u8>),
    /// Resize the PTY window. Ignored when the execution has no TTY.
    Resize {
        /// Terminal width in columns.
        cols: u16,
        /// Terminal height in rows.
        rows: u16,
    },
    /// Deliver a POSIX signal to the child process group.
    Signal(i32),
    /// No more stdin will be sent.
    Eof,
}

/// Guest → host, an ordered stream terminated by exactly one `Exit` record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExecStreamResponse {
    /// A chunk of stdout bytes, in guest-produced order.
    Stdout(Vec<u8>),
    /// A chunk of stderr bytes (absent in TTY mode — merged into stdout).
    Stderr(Vec<u8>),
    /// Terminal record. No further records follow on this connection.
    Exit {
        /// Process exit code, or 128+signal if killed by a signal.
        exit_code: i32,
        /// Diagnostic message; empty on a clean exit.
        message: String,
    },
}
