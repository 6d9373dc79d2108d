//! cleanroom-vm-worker — child process that boots one microVM.
//!
//! `cleanroom-helper` writes a JSON-serialized [`cleanroom_core::VmSpec`] to
//! a temp file and spawns this binary with the file path as its sole
//! argument. The worker reads the spec, deletes the temp file, builds the
//! VM, and calls [`cleanroom_core::MicroVm::start`], which takes over the
//! process via `krun_start_enter()` and never returns on success.
//!
//! Running the VM in its own process (rather than in-process inside
//! `cleanroom-helper`) keeps the control socket and proxy bridge alive
//! across the VM's lifetime despite libkrun's start call never returning.

// Standalone binary — stderr is the correct error channel.
#![allow(clippy::print_stderr)]

#[cfg(not(unix))]
fn main() {
    eprintln!("[cleanroom-vm-worker] only supported on Unix");
    std::process::exit(1);
}

#[cfg(unix)]
fn main() {
    let Some(spec_path) = std::env::args().nth(1) else {
        eprintln!("[cleanroom-vm-worker] usage: cleanroom-vm-worker <spec.json>");
        std::process::exit(1);
    };

    start_watchdog();

    let json = match std::fs::read_to_string(&spec_path) {
        Ok(j) => {
            let _ = std::fs::remove_file(&spec_path);
            j
        }
        Err(e) => {
            eprintln!("[cleanroom-vm-worker] failed to read spec {spec_path}: {e}");
            std::process::exit(1);
        }
    };

    let spec: cleanroom_core::VmSpec = match serde_json::from_str(&json) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("[cleanroom-vm-worker] invalid spec JSON: {e}");
            std::process::exit(1);
        }
    };

    match cleanroom_core::MicroVm::build(&spec).and_then(cleanroom_core::MicroVm::start) {
        // start() never returns on success — the process becomes the VM.
        Ok(()) => unreachable!(),
        Err(e) => {
            eprintln!("[cleanroom-vm-worker] VM start failed: {e}");
            std::process::exit(1);
        }
    }
}

/// Spawns a background thread that exits the process when the parent
/// `cleanroom-helper` dies, per [`cleanroom_core::create_watchdog_pipe`]'s contract.
#[cfg(unix)]
#[allow(unsafe_code)]
fn start_watchdog() {
    let Ok(fd_str) = std::env::var(cleanroom_core::ENV_WATCHDOG_FD) else {
        return;
    };
    let Ok(fd) = fd_str.parse::<i32>() else {
        eprintln!("[cleanroom-vm-worker] invalid {}: {fd_str}", cleanroom_core::ENV_WATCHDOG_FD);
        return;
    };

    if let Err(e) = std::thread::Builder::new().name("watchdog".into()).spawn(move || {
        // SAFETY: fd was validated by the parent and preserved across exec.
        unsafe { cleanroom_core::wait_for_parent_death(fd) };
        eprintln!("[cleanroom-vm-worker] parent process died, shutting down");
        std::process::exit(0);
    }) {
        eprintln!("[cleanroom-vm-worker] failed to spawn watchdog thread: {e}");
    }
}
