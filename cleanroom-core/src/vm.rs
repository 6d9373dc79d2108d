//! MicroVM builder and lifecycle, trimmed to the device set `spec.md` §4.3
//! requires: one Linux boot loader, one vcpu/memory config, two virtio
//! serial ports, one read/write rootfs block device, one NAT network
//! device, and one virtio socket device.
//!
//! Only this module touches `bux_krun` FFI; every wrapper mirrors the
//! teacher's `sys.rs` shape (one function per `krun_*` call, a `check`
//! helper turning negative return codes into [`Error::Krun`]).

#![allow(unsafe_code)]

use std::os::fd::RawFd;

use crate::error::{Error, Result};

/// Converts a libkrun return code into a [`Result`].
const fn check(op: &'static str, ret: i32) -> Result<()> {
    if ret < 0 {
        Err(Error::Krun { op, code: ret })
    } else {
        Ok(())
    }
}

mod sys {
    use std::ffi::CString;
    use std::os::fd::RawFd;

    use super::check;
    use crate::error::{Error, Result};

    pub fn create_ctx() -> Result<u32> {
        let ret = unsafe { bux_krun::krun_create_ctx() };
        if ret < 0 {
            return Err(Error::Krun {
                op: "create_ctx",
                code: ret,
            });
        }
        #[allow(clippy::cast_sign_loss)]
        Ok(ret as u32)
    }

    pub fn free_ctx(ctx: u32) -> Result<()> {
        check("free_ctx", unsafe { bux_krun::krun_free_ctx(ctx) })
    }

    pub fn set_vm_config(ctx: u32, vcpus: u8, ram_mib: u32) -> Result<()> {
        check("set_vm_config", unsafe {
            bux_krun::krun_set_vm_config(ctx, vcpus, ram_mib)
        })
    }

    pub fn set_kernel(ctx: u32, path: &str, cmdline: &str) -> Result<()> {
        let c_path = CString::new(path)?;
        let c_cmdline = CString::new(cmdline)?;
        check("set_kernel", unsafe {
            bux_krun::krun_set_kernel(
                ctx,
                c_path.as_ptr(),
                bux_krun::KRUN_KERNEL_FORMAT_RAW,
                std::ptr::null(),
                c_cmdline.as_ptr(),
            )
        })
    }

    pub fn add_disk(ctx: u32, block_id: &str, path: &str, read_only: bool) -> Result<()> {
        let c_id = CString::new(block_id)?;
        let c_path = CString::new(path)?;
        check("add_disk", unsafe {
            bux_krun::krun_add_disk(ctx, c_id.as_ptr(), c_path.as_ptr(), read_only)
        })
    }

    pub fn add_net_unixgram(ctx: u32, socket_path: &str, mac: &[u8; 6]) -> Result<()> {
        let c_path = CString::new(socket_path)?;
        check("add_net_unixgram", unsafe {
            bux_krun::krun_add_net_unixgram(ctx, c_path.as_ptr(), -1, mac.as_ptr(), 0, 0)
        })
    }

    pub fn add_vsock_port2(ctx: u32, port: u32, host_path: &str, listen: bool) -> Result<()> {
        let c_path = CString::new(host_path)?;
        check("add_vsock_port2", unsafe {
            bux_krun::krun_add_vsock_port2(ctx, port, c_path.as_ptr(), listen)
        })
    }

    pub fn set_console_output(ctx: u32, path: &str) -> Result<()> {
        let c_path = CString::new(path)?;
        check("set_console_output", unsafe {
            bux_krun::krun_set_console_output(ctx, c_path.as_ptr())
        })
    }

    /// Adds a virtio console port backed by a pair of host file descriptors
    /// (the agent channel's paired-pipe fallback, per `spec.md` §4.3 step 2).
    pub fn add_console_port_inout(
        ctx: u32,
        console_id: u32,
        name: &str,
        input_fd: RawFd,
        output_fd: RawFd,
    ) -> Result<()> {
        let c_name = CString::new(name)?;
        check("add_console_port_inout", unsafe {
            bux_krun::krun_add_console_port_inout(ctx, console_id, c_name.as_ptr(), input_fd, output_fd)
        })
    }

    pub fn add_virtio_console_multiport(ctx: u32) -> Result<u32> {
        let ret = unsafe { bux_krun::krun_add_virtio_console_multiport(ctx) };
        if ret < 0 {
            return Err(Error::Krun {
                op: "add_virtio_console_multiport",
                code: ret,
            });
        }
        #[allow(clippy::cast_sign_loss)]
        Ok(ret as u32)
    }

    pub fn start_enter(ctx: u32) -> Result<()> {
        check("start_enter", unsafe { bux_krun::krun_start_enter(ctx) })
    }
}

/// Configuration accepted by [`MicroVm::build`], matching the `StartVM`
/// parameters of [`crate::capability::StartVmParams`] one-to-one.
///
/// `Serialize`/`Deserialize` let `cleanroom-helper` hand this to its
/// `cleanroom-vm-worker` child as a temp-file JSON document, mirroring how
/// the teacher's shim received a serialized `VmConfig`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct VmSpec {
    /// Absolute path to the guest kernel image.
    pub kernel_path: String,
    /// Kernel command line.
    pub boot_args: String,
    /// Number of virtual CPUs.
    pub vcpus: u8,
    /// RAM size in MiB.
    pub memory_mib: u32,
    /// Absolute path to the ext4 rootfs image (read/write).
    pub rootfs_path: String,
    /// Absolute path for the console log file.
    pub console_log_path: String,
    /// Guest vsock port the agent listens on.
    pub guest_port: u32,
    /// Host unix socket path bridging the vsock agent channel.
    pub vsock_host_path: String,
}

/// A configured microVM, ready to start. The libkrun context is freed on
/// drop unless [`MicroVm::start`] has taken it (libkrun calls `exit()`
/// itself once started, so there is nothing left to free in that case).
#[derive(Debug)]
pub struct MicroVm {
    ctx: u32,
    /// Host ends of the paired-pipe console fallback channel, kept open for
    /// the lifetime of the VM.
    _agent_pipe_fds: (RawFd, RawFd),
}

impl MicroVm {
    /// Builds a libkrun context matching `spec.md` §4.3's device list:
    /// Linux boot loader, vcpu/memory config, two virtio serial ports
    /// (console log + paired-pipe agent fallback), one rw rootfs block
    /// device, one NAT network device, and one virtio socket device.
    ///
    /// Entropy and memory-balloon devices are libkrun's automatic defaults
    /// once a VM config is set and are not separately requested here.
    pub fn build(spec: &VmSpec) -> Result<Self> {
        let ctx = sys::create_ctx()?;

        sys::set_vm_config(ctx, spec.vcpus, spec.memory_mib)?;
        sys::set_kernel(ctx, &spec.kernel_path, &spec.boot_args)?;
        sys::add_disk(ctx, "rootfs", &spec.rootfs_path, false)?;
        sys::set_console_output(ctx, &spec.console_log_path)?;
        sys::add_vsock_port2(ctx, spec.guest_port, &spec.vsock_host_path, true)?;

        let mac = [0x52, 0x54, 0x00, 0x00, 0x00, 0x01];
        sys::add_net_unixgram(ctx, &spec.vsock_host_path, &mac)?;

        let console_id = sys::add_virtio_console_multiport(ctx)?;
        let (pipe_read, pipe_write) = open_pipe()?;
        sys::add_console_port_inout(ctx, console_id, "agent", pipe_read, pipe_write)?;

        Ok(Self {
            ctx,
            _agent_pipe_fds: (pipe_read, pipe_write),
        })
    }

    /// Starts the microVM, taking over the current process. On success this
    /// never returns; libkrun calls `exit()` itself once the VM shuts down.
    /// Only returns if a pre-start configuration error occurs.
    pub fn start(self) -> Result<()> {
        let ctx = self.ctx;
        std::mem::forget(self);
        sys::start_enter(ctx)
    }
}

impl Drop for MicroVm {
    fn drop(&mut self) {
        let _ = sys::free_ctx(self.ctx);
    }
}

/// Creates an OS pipe, returning `(read_fd, write_fd)`.
fn open_pipe() -> Result<(RawFd, RawFd)> {
    use std::os::fd::IntoRawFd;
    let (read, write) = nix::unistd::pipe()?;
    Ok((read.into_raw_fd(), write.into_raw_fd()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_maps_negative_codes_to_krun_error() {
        let err = check("op", -5).unwrap_err();
        assert!(matches!(err, Error::Krun { op: "op", code: -5 }));
    }

    #[test]
    fn check_accepts_nonnegative_codes() {
        assert!(check("op", 0).is_ok());
    }
}
