//! cleanroom-guest-agent — runs inside a Cleanroom micro-VM, typically
//! execed into by `/sbin/cleanroom-init` once basic mounts are in place.
//!
//! Listens on a vsock port and, for each accepted connection, speaks the
//! three-frame wire protocol of `cleanroom-proto`: read one [`ExecRequest`],
//! spawn it, pump [`ExecInputFrame`]s in and [`ExecStreamResponse`]s out
//! until the child exits.
#![allow(clippy::print_stderr)]

mod exec;

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("[cleanroom-guest-agent] only supported inside a Linux guest");
    std::process::exit(1);
}

#[cfg(target_os = "linux")]
#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> std::io::Result<()> {
    use cleanroom_proto::AGENT_PORT;
    use tokio_vsock::{VsockAddr, VsockListener};

    // PID 1 duty: auto-reap zombie children that outlive their session.
    #[allow(unsafe_code)]
    unsafe {
        libc::signal(libc::SIGCHLD, libc::SIG_IGN);
    }

    let addr = VsockAddr::new(libc::VMADDR_CID_ANY, AGENT_PORT);
    let listener = VsockListener::bind(addr)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::AddrInUse, e))?;
    eprintln!("[cleanroom-guest-agent] listening on vsock port {AGENT_PORT}");

    loop {
        let (stream, _addr) = listener.accept().await?;
        tokio::spawn(async move {
            if let Err(e) = exec::serve_connection(stream).await {
                eprintln!("[cleanroom-guest-agent] connection error: {e}");
            }
        });
    }
}
