//! Injectable capability traits at the core's external seams.
//!
//! `spec.md` §9 flags the teacher's ad-hoc global-state and reflection
//! patterns for replacement with explicit traits at each collaboration
//! boundary; [`cleanroom_oci::ImageFetcher`] already covers the OCI pull
//! seam, so this module covers the rest: rootfs materialization, the
//! helper co-process, gateway credentials, signal delivery into a running
//! execution, and gateway scope registration.

use std::path::Path;

use crate::error::Result;

/// Materializes an extracted OCI layer tree into a sized ext4 image
/// (`spec.md` §4.4's materialization contract).
///
/// The production implementation shells out to `mkfs.ext4`; tests substitute
/// a fake that copies a fixed byte pattern so cache-path tests don't need a
/// real filesystem tool on `PATH`.
pub trait RootFSMaterializer: Send + Sync {
    /// Formats the directory tree rooted at `content_dir` into an ext4 image
    /// at `image_path`, sized per `spec.md`'s `max(512MiB, content*1.5+128MiB)`
    /// formula rounded to a 4 MiB multiple.
    fn materialize<'a>(
        &'a self,
        content_dir: &'a Path,
        image_path: &'a Path,
    ) -> cleanroom_oci::BoxFuture<'a, Result<()>>;

    /// Injects `data` as a file at `guest_path` (e.g.
    /// `/usr/local/bin/cleanroom-guest-agent`) inside an existing ext4
    /// image, with the given POSIX mode bits.
    fn inject_file<'a>(
        &'a self,
        image_path: &'a Path,
        guest_path: &'a str,
        data: &'a [u8],
        mode: u32,
    ) -> cleanroom_oci::BoxFuture<'a, Result<()>>;
}

/// A running `cleanroom-helper` control-socket session (`spec.md` §4.2).
///
/// One production implementation dials a real unix socket to a spawned
/// process; a fake implementation answers in-memory for sandbox-manager
/// tests that don't need a real hypervisor.
pub trait HelperProcess: Send + Sync {
    /// Sends `StartVM` and awaits its response.
    fn start_vm<'a>(
        &'a self,
        params: &'a StartVmParams,
    ) -> cleanroom_oci::BoxFuture<'a, Result<StartVmResult>>;

    /// Sends `StopVM` for `vm_id` and awaits its response.
    fn stop_vm<'a>(&'a self, vm_id: &'a str) -> cleanroom_oci::BoxFuture<'a, Result<()>>;

    /// Sends `Ping` and awaits its response.
    fn ping(&self) -> cleanroom_oci::BoxFuture<'_, Result<()>>;

    /// Closes the control socket and terminates the helper process per the
    /// graceful-then-forceful close contract.
    fn close(self: Box<Self>) -> cleanroom_oci::BoxFuture<'static, Result<()>>;
}

/// Parameters for a `StartVM` request (`spec.md` §4.3).
#[derive(Debug, Clone)]
pub struct StartVmParams {
    /// Absolute path to the guest kernel image.
    pub kernel_path: std::path::PathBuf,
    /// Absolute path to the ext4 rootfs image.
    pub rootfs_path: std::path::PathBuf,
    /// Number of virtual CPUs.
    pub vcpus: u8,
    /// RAM size in MiB.
    pub memory_mib: u32,
    /// Guest vsock port the agent listens on.
    pub guest_port: u32,
    /// Seconds to wait for VM start completion before `vm.start_timeout`.
    pub launch_timeout_seconds: u32,
    /// Per-sandbox run directory.
    pub run_directory: std::path::PathBuf,
    /// Path for the proxy unix socket the helper will listen on.
    pub proxy_socket_path: std::path::PathBuf,
    /// Path for the VM's console log file.
    pub console_log_path: std::path::PathBuf,
    /// Kernel command line arguments.
    pub boot_args: String,
}

/// Successful `StartVM` response fields.
#[derive(Debug, Clone)]
pub struct StartVmResult {
    /// Opaque id of the started VM, used by a later `StopVM`.
    pub vm_id: String,
    /// Path of the bound proxy socket the execution engine dials.
    pub proxy_socket_path: std::path::PathBuf,
}

/// Resolves upstream credentials for the gateway's git proxy
/// (`spec.md` §4.6 credential-provider contract).
pub trait CredentialProvider: Send + Sync {
    /// Returns a bearer token for `host`, or `None` if no credential is
    /// configured. Host comparison is case-insensitive.
    fn resolve(&self, host: &str) -> Option<String>;
}

/// Default [`CredentialProvider`] mapping known hosts to environment
/// variables, configured via [`crate::config::CoreConfig::credential_env_vars`].
#[derive(Debug, Clone)]
pub struct EnvCredentialProvider {
    /// (lowercase host, environment variable name) pairs.
    mappings: Vec<(String, String)>,
}

impl EnvCredentialProvider {
    /// Builds a provider from a list of (host, env var name) mappings.
    #[must_use]
    pub fn new(mappings: Vec<(String, String)>) -> Self {
        Self {
            mappings: mappings
                .into_iter()
                .map(|(host, var)| (host.to_lowercase(), var))
                .collect(),
        }
    }
}

impl CredentialProvider for EnvCredentialProvider {
    fn resolve(&self, host: &str) -> Option<String> {
        let host = host.to_lowercase();
        let var = self
            .mappings
            .iter()
            .find(|(mapped_host, _)| *mapped_host == host)
            .map(|(_, var)| var.as_str())?;
        std::env::var(var).ok().filter(|v| !v.is_empty())
    }
}

/// Delivers a POSIX signal to a running execution's guest process
/// (`spec.md` §4.5's first-cancel/second-cancel contract). Implemented by
/// `cleanroom_core::execution::ExecutionEntry`, which queues the signal as
/// an `ExecInputFrame` on the execution's input pump; exists as a trait so
/// cancellation logic can be unit-tested with a fake that records signals
/// instead of writing to a guest channel.
pub trait SignalSource: Send + Sync {
    /// Queues `signal` (a POSIX signal number, see [`cleanroom_proto::Signal`])
    /// for delivery as an `ExecInputFrame::Signal` on the execution's wire
    /// channel.
    fn send_signal(&self, signal: i32) -> cleanroom_oci::BoxFuture<'_, Result<()>>;
}

/// Identifies a gateway scope registration: either a guest's routable
/// source IP, or an opaque scope-token header value (`spec.md` §4.6).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ScopeKey {
    /// Scope identified by the guest's source IP address.
    SourceIp(std::net::IpAddr),
    /// Scope identified by an opaque token carried in a request header.
    Token(String),
}

/// Registry mapping a [`ScopeKey`] to the sandbox id and policy consulted
/// by every gateway request (`spec.md` §3 `GatewayScope`).
pub trait ScopeRegistry: Send + Sync {
    /// Registers `key` against `sandbox_id`/`policy`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::GatewayDuplicateScope`] if `key` is
    /// already registered.
    fn register(
        &self,
        key: ScopeKey,
        sandbox_id: String,
        policy: crate::policy::CompiledPolicy,
    ) -> Result<()>;

    /// Removes any registration for `key`. A no-op if none exists.
    fn release(&self, key: &ScopeKey);

    /// Looks up the (sandbox id, policy) pair registered for `key`.
    fn lookup(&self, key: &ScopeKey) -> Option<(String, crate::policy::CompiledPolicy)>;
}
