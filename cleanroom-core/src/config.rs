//! Embedder-supplied configuration for the sandbox manager and gateway.
//!
//! Config *sourcing* (YAML files, CLI flags, XDG paths) is an external
//! collaborator per `spec.md` §1; this struct, its defaults, and the
//! capability wiring it carries are the in-scope surface the core needs to
//! be constructible as a library.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default helper-process interrupt grace period before escalating to kill.
pub const DEFAULT_HELPER_INTERRUPT_WAIT: Duration = Duration::from_secs(2);
/// Default helper-process kill grace period before giving up.
pub const DEFAULT_HELPER_KILL_WAIT: Duration = Duration::from_secs(5);
/// Default bind address for the egress gateway (`spec.md` §4.6).
pub const DEFAULT_GATEWAY_ADDR: &str = "0.0.0.0:8170";

/// Sandbox-creation defaults, overridable per `CreateSandbox` call.
///
/// Mirrors `spec.md` §3 `SandboxOptions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxOptions {
    /// Guest-agent readiness timeout in seconds. Minimum 5, default 30.
    pub launch_seconds: u32,
    /// Number of virtual CPUs. Minimum 1, default 1.
    pub vcpus: u8,
    /// RAM size in MiB. Minimum 256, default 512.
    pub memory_mib: u32,
    /// vsock/serial port the guest agent listens on. Default 10700.
    pub guest_port: u32,
}

impl Default for SandboxOptions {
    fn default() -> Self {
        Self {
            launch_seconds: 30,
            vcpus: 1,
            memory_mib: 512,
            guest_port: cleanroom_proto::AGENT_PORT,
        }
    }
}

impl SandboxOptions {
    /// Clamps user-supplied options to the documented minimums.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.launch_seconds = self.launch_seconds.max(5);
        self.vcpus = self.vcpus.max(1);
        self.memory_mib = self.memory_mib.max(256);
        self
    }

    /// The helper-start and VM-start deadline derived from `launch_seconds`.
    #[must_use]
    pub const fn launch_deadline(&self) -> Duration {
        Duration::from_secs(self.launch_seconds as u64)
    }
}

/// Top-level configuration for a [`crate::sandbox::SandboxManager`].
///
/// Constructed by the embedder (daemon `main`, or a test harness); sourcing
/// these values from disk or environment is out of the core's scope.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Base directory for the image cache and prepared-rootfs cache
    /// (`<cacheBase>/images`, `<cacheBase>/darwin-vz/runtime-rootfs`).
    pub cache_base: PathBuf,
    /// Base directory for per-run state (`<runDir>` per sandbox).
    pub run_base: PathBuf,
    /// Path to the guest kernel image.
    pub kernel_path: PathBuf,
    /// Path to the `cleanroom-helper` binary.
    pub helper_binary: PathBuf,
    /// Path to the guest-agent binary injected into prepared rootfs images.
    pub guest_agent_binary: PathBuf,
    /// Guest-init shell script template, injected as `/sbin/cleanroom-init`.
    pub init_script: String,
    /// Default `SandboxOptions` applied when a request omits a field.
    pub default_options: SandboxOptions,
    /// Bind address for the egress gateway.
    pub gateway_addr: String,
    /// Environment variable names consulted by the default credential
    /// provider, keyed by lowercase host.
    pub credential_env_vars: Vec<(String, String)>,
    /// Grace period between `SIGINT` and `SIGKILL` when closing the helper.
    pub helper_interrupt_wait: Duration,
    /// Grace period after `SIGKILL` before giving up on the helper.
    pub helper_kill_wait: Duration,
}

impl CoreConfig {
    /// Returns a config rooted at the platform cache/state directories,
    /// with every other field left at its documented default. Callers
    /// typically still need to set `kernel_path`/`helper_binary` explicitly.
    #[must_use]
    pub fn with_base_dirs(cache_base: impl Into<PathBuf>, run_base: impl Into<PathBuf>) -> Self {
        Self {
            cache_base: cache_base.into(),
            run_base: run_base.into(),
            kernel_path: PathBuf::new(),
            helper_binary: PathBuf::new(),
            guest_agent_binary: PathBuf::new(),
            init_script: default_init_script().to_owned(),
            default_options: SandboxOptions::default(),
            gateway_addr: DEFAULT_GATEWAY_ADDR.to_owned(),
            credential_env_vars: vec![
                ("github.com".to_owned(), "CLEANROOM_GITHUB_TOKEN".to_owned()),
                ("gitlab.com".to_owned(), "CLEANROOM_GITLAB_TOKEN".to_owned()),
            ],
            helper_interrupt_wait: DEFAULT_HELPER_INTERRUPT_WAIT,
            helper_kill_wait: DEFAULT_HELPER_KILL_WAIT,
        }
    }

    /// Path to the on-disk image cache (`<cacheBase>/images`).
    #[must_use]
    pub fn image_cache_dir(&self) -> PathBuf {
        self.cache_base.join("images")
    }

    /// Path to the prepared-rootfs cache (`<cacheBase>/darwin-vz/runtime-rootfs`).
    #[must_use]
    pub fn prepared_rootfs_dir(&self) -> PathBuf {
        self.cache_base.join("darwin-vz").join("runtime-rootfs")
    }

    /// Path to the image-cache metadata database.
    #[must_use]
    pub fn image_cache_db_path(&self) -> PathBuf {
        self.image_cache_dir().join("cache.db")
    }

    /// Allocates a fresh run directory under `run_base` for `sandbox_id`.
    #[must_use]
    pub fn run_dir(&self, sandbox_id: &str) -> PathBuf {
        self.run_base.join(sandbox_id)
    }
}

/// Returns the platform-appropriate cache base directory
/// (`$XDG_CACHE_HOME/cleanroom` or the OS equivalent), falling back to a
/// relative `.cleanroom-cache` directory if the platform dirs are unknown.
#[must_use]
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|d| d.join("cleanroom"))
        .unwrap_or_else(|| Path::new(".cleanroom-cache").to_path_buf())
}

/// Returns the platform-appropriate run-state base directory
/// (`$XDG_STATE_HOME/cleanroom/run` or the OS equivalent).
#[must_use]
pub fn default_run_dir() -> PathBuf {
    dirs::state_dir()
        .or_else(dirs::cache_dir)
        .map(|d| d.join("cleanroom").join("run"))
        .unwrap_or_else(|| Path::new(".cleanroom-run").to_path_buf())
}

/// Minimal guest-init template injected as `/sbin/cleanroom-init`.
///
/// Its SHA-256 participates in [`crate::rootfs::PreparedRootFSKey`] so any
/// edit invalidates prepared-rootfs cache entries.
#[must_use]
pub const fn default_init_script() -> &'static str {
    "#!/bin/sh\n\
     set -e\n\
     mkdir -p /dev /proc /run /sys /tmp\n\
     mount -t devtmpfs devtmpfs /dev 2>/dev/null || true\n\
     mount -t proc proc /proc 2>/dev/null || true\n\
     mount -t sysfs sysfs /sys 2>/dev/null || true\n\
     mount -t tmpfs tmpfs /run 2>/dev/null || true\n\
     mount -t tmpfs tmpfs /tmp 2>/dev/null || true\n\
     exec /usr/local/bin/cleanroom-guest-agent\n"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_options_default_matches_spec() {
        let opts = SandboxOptions::default();
        assert_eq!(opts.launch_seconds, 30);
        assert_eq!(opts.vcpus, 1);
        assert_eq!(opts.memory_mib, 512);
        assert_eq!(opts.guest_port, 10700);
    }

    #[test]
    fn sandbox_options_clamps_below_minimums() {
        let opts = SandboxOptions {
            launch_seconds: 1,
            vcpus: 0,
            memory_mib: 64,
            guest_port: 1,
        }
        .normalized();
        assert_eq!(opts.launch_seconds, 5);
        assert_eq!(opts.vcpus, 1);
        assert_eq!(opts.memory_mib, 256);
    }

    #[test]
    fn config_derives_cache_subpaths() {
        let cfg = CoreConfig::with_base_dirs("/tmp/cache", "/tmp/run");
        assert_eq!(cfg.image_cache_dir(), Path::new("/tmp/cache/images"));
        assert_eq!(
            cfg.prepared_rootfs_dir(),
            Path::new("/tmp/cache/darwin-vz/runtime-rootfs")
        );
        assert_eq!(cfg.run_dir("abc123"), Path::new("/tmp/run/abc123"));
    }
}
