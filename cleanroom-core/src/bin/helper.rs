//! cleanroom-helper — sibling control-socket service owning the hypervisor
//! handle (`spec.md` §4.3).
//!
//! Accepts one control connection on a unix socket and processes
//! `StartVM`/`StopVM`/`Ping` requests sequentially as newline-delimited
//! JSON, one outstanding request at a time. `StartVM` spawns a
//! `cleanroom-vm-worker` child that owns the libkrun context — krun's start
//! call never returns inside that process, so the VM's lifetime is a
//! process lifetime the helper supervises rather than an in-process task.
//! Only one VM is live per helper instance.

#![allow(clippy::print_stderr)]

use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::process::{Child, Command};

/// Tick interval while polling for the proxy socket to appear after
/// spawning the vm-worker child.
const START_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// `StopVM`'s graceful-stop budget before escalating to a hard kill.
const STOP_GRACEFUL_WAIT: Duration = Duration::from_secs(2);
/// `StopVM`'s hard-kill budget before giving up.
const STOP_HARD_WAIT: Duration = Duration::from_secs(5);

#[derive(Deserialize)]
#[serde(tag = "op")]
enum Request {
    StartVM {
        kernel_path: PathBuf,
        rootfs_path: PathBuf,
        vcpus: u8,
        memory_mib: u32,
        guest_port: u32,
        launch_timeout_seconds: u32,
        run_directory: PathBuf,
        proxy_socket_path: PathBuf,
        console_log_path: PathBuf,
        boot_args: String,
    },
    StopVM {
        vm_id: String,
    },
    Ping,
}

#[derive(Serialize, Default)]
struct Response {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    vm_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    proxy_socket_path: Option<String>,
}

impl Response {
    fn ok() -> Self {
        Self {
            ok: true,
            ..Self::default()
        }
    }

    fn err(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(message.into()),
            ..Self::default()
        }
    }
}

/// The single VM this helper instance currently owns, if any.
struct RunningVm {
    vm_id: String,
    worker: Child,
    proxy_socket_path: PathBuf,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let socket_path = match parse_socket_arg() {
        Some(path) => path,
        None => {
            eprintln!("[cleanroom-helper] usage: cleanroom-helper --socket <path>");
            std::process::exit(1);
        }
    };

    let _ = std::fs::remove_file(&socket_path);
    let listener = match UnixListener::bind(&socket_path) {
        Ok(l) => l,
        Err(e) => {
            eprintln!("[cleanroom-helper] failed to bind {}: {e}", socket_path.display());
            std::process::exit(1);
        }
    };

    let mut running: Option<RunningVm> = None;

    loop {
        let (stream, _) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                eprintln!("[cleanroom-helper] accept failed: {e}");
                continue;
            }
        };
        if !serve_connection(stream, &mut running).await {
            break;
        }
    }

    if let Some(mut vm) = running.take() {
        let _ = vm.worker.start_kill();
        let _ = vm.worker.wait().await;
    }
    let _ = std::fs::remove_file(&socket_path);
}

fn parse_socket_arg() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--socket" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}

/// Reads and answers requests off one connection until EOF or a transport
/// error. Returns `false` to tell the accept loop to shut the helper down
/// (currently always continues; kept as a hook for a future `Shutdown` op).
async fn serve_connection(stream: UnixStream, running: &mut Option<RunningVm>) -> bool {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    loop {
        line.clear();
        let n = match reader.read_line(&mut line).await {
            Ok(n) => n,
            Err(e) => {
                eprintln!("[cleanroom-helper] connection read error: {e}");
                return true;
            }
        };
        if n == 0 {
            return true; // client closed the connection; wait for a new one
        }

        let response = match serde_json::from_str::<Request>(line.trim_end()) {
            Ok(request) => handle_request(request, running).await,
            Err(e) => Response::err(format!("malformed request: {e}")),
        };

        let mut encoded = match serde_json::to_string(&response) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("[cleanroom-helper] failed to encode response: {e}");
                return true;
            }
        };
        encoded.push('\n');
        if write_half.write_all(encoded.as_bytes()).await.is_err() || write_half.flush().await.is_err() {
            return true;
        }
    }
}

async fn handle_request(request: Request, running: &mut Option<RunningVm>) -> Response {
    match request {
        Request::Ping => Response::ok(),
        Request::StartVM {
            kernel_path,
            rootfs_path,
            vcpus,
            memory_mib,
            guest_port,
            launch_timeout_seconds,
            run_directory,
            proxy_socket_path,
            console_log_path,
            boot_args,
        } => {
            if running.is_some() {
                return Response::err("vm.already_running");
            }
            match start_vm(
                &kernel_path,
                &rootfs_path,
                vcpus,
                memory_mib,
                guest_port,
                launch_timeout_seconds,
                &run_directory,
                &proxy_socket_path,
                &console_log_path,
                &boot_args,
            )
            .await
            {
                Ok(vm) => {
                    let response = Response {
                        ok: true,
                        error: None,
                        vm_id: Some(vm.vm_id.clone()),
                        proxy_socket_path: Some(vm.proxy_socket_path.display().to_string()),
                    };
                    *running = Some(vm);
                    response
                }
                Err(message) => Response::err(message),
            }
        }
        Request::StopVM { vm_id } => match running.take() {
            None => Response::err("vm.unknown_id"),
            Some(vm) if vm.vm_id != vm_id => {
                *running = Some(vm);
                Response::err("vm.unknown_id")
            }
            Some(vm) => {
                stop_vm(vm).await;
                Response::ok()
            }
        },
    }
}

#[allow(clippy::too_many_arguments)]
async fn start_vm(
    kernel_path: &std::path::Path,
    rootfs_path: &std::path::Path,
    vcpus: u8,
    memory_mib: u32,
    guest_port: u32,
    launch_timeout_seconds: u32,
    run_directory: &std::path::Path,
    proxy_socket_path: &std::path::Path,
    console_log_path: &std::path::Path,
    boot_args: &str,
) -> Result<RunningVm, String> {
    if !kernel_path.is_absolute() || !kernel_path.exists() {
        return Err(format!("kernel path {} is not an existing absolute path", kernel_path.display()));
    }
    if !rootfs_path.is_absolute() || !rootfs_path.exists() {
        return Err(format!("rootfs path {} is not an existing absolute path", rootfs_path.display()));
    }
    if let Some(parent) = proxy_socket_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
    }
    if let Some(parent) = console_log_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
    }
    let _ = std::fs::remove_file(proxy_socket_path);

    let spec = cleanroom_core::VmSpec {
        kernel_path: kernel_path.display().to_string(),
        boot_args: boot_args.to_owned(),
        vcpus,
        memory_mib,
        rootfs_path: rootfs_path.display().to_string(),
        console_log_path: console_log_path.display().to_string(),
        guest_port,
        vsock_host_path: proxy_socket_path.display().to_string(),
    };

    std::fs::create_dir_all(run_directory).map_err(|e| e.to_string())?;
    let spec_file = run_directory.join(format!("vm-spec-{}.json", std::process::id()));
    let spec_json = serde_json::to_string(&spec).map_err(|e| e.to_string())?;
    std::fs::write(&spec_file, spec_json).map_err(|e| e.to_string())?;

    let worker_binary = sibling_binary("cleanroom-vm-worker")?;
    let mut command = Command::new(worker_binary);
    command.arg(&spec_file).kill_on_drop(true);

    let keepalive_guard;
    if let Ok((helper_fd, keepalive)) = cleanroom_core::create_watchdog_pipe() {
        use std::os::fd::AsRawFd;
        command.env(cleanroom_core::ENV_WATCHDOG_FD, helper_fd.as_raw_fd().to_string());
        keepalive_guard = Some((helper_fd, keepalive));
    } else {
        keepalive_guard = None;
    }

    let mut worker = command.spawn().map_err(|e| format!("spawn cleanroom-vm-worker: {e}"))?;
    // The watchdog read end must stay open in this process until exec()
    // replaces the child's image; drop it only once the child is running.
    drop(keepalive_guard);

    let deadline = Instant::now() + Duration::from_secs(u64::from(launch_timeout_seconds.max(1)));
    loop {
        if proxy_socket_path.exists() {
            break;
        }
        if let Ok(Some(status)) = worker.try_wait() {
            return Err(format!("vm.start_failed: worker exited with {status} before proxy socket was ready"));
        }
        if Instant::now() >= deadline {
            let _ = worker.start_kill();
            return Err("vm.start_timeout".to_owned());
        }
        tokio::time::sleep(START_POLL_INTERVAL).await;
    }

    Ok(RunningVm {
        vm_id: format!("vm-{}", worker.id().unwrap_or_default()),
        worker,
        proxy_socket_path: proxy_socket_path.to_path_buf(),
    })
}

async fn stop_vm(mut vm: RunningVm) {
    let _ = std::fs::remove_file(&vm.proxy_socket_path);

    if matches!(vm.worker.try_wait(), Ok(Some(_))) {
        return;
    }

    send_signal(&vm.worker, libc::SIGTERM);
    if tokio::time::timeout(STOP_GRACEFUL_WAIT, vm.worker.wait()).await.is_ok() {
        return;
    }

    send_signal(&vm.worker, libc::SIGKILL);
    let _ = tokio::time::timeout(STOP_HARD_WAIT, vm.worker.wait()).await;
}

fn send_signal(child: &Child, signal: i32) {
    let Some(pid) = child.id() else {
        return;
    };
    #[allow(unsafe_code)]
    unsafe {
        libc::kill(pid as libc::pid_t, signal);
    }
}

/// Resolves `name` as a sibling of the currently running executable, the
/// same directory `cargo`/package managers install workspace binaries into.
fn sibling_binary(name: &str) -> Result<PathBuf, String> {
    let exe = std::env::current_exe().map_err(|e| e.to_string())?;
    let dir = exe.parent().ok_or_else(|| "executable has no parent directory".to_owned())?;
    Ok(dir.join(name))
}
