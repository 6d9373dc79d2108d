//! Shared error taxonomy for the Cleanroom core (`spec.md` §7).
//!
//! Every error kind `spec.md` §7 enumerates is a distinct variant so that
//! [`Error::code`] returns a stable, machine-readable dotted string (e.g.
//! `"policy.invalid"`) independent of the human-readable `Display` message.

use std::ffi::NulError;

/// Alias for `Result<T, cleanroom_core::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by sandbox lifecycle, execution, and policy operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// `CompiledPolicy` failed validation (bad version, ref, or allow-list).
    #[error("policy.invalid: {0}")]
    PolicyInvalid(String),

    /// The injected `ImageFetcher` failed to retrieve image layers.
    #[error("image.fetch_failed: {0}")]
    ImageFetchFailed(String),

    /// Materializing a fetched image into an ext4 artifact failed.
    #[error("image.materialize_failed: {0}")]
    ImageMaterializeFailed(String),

    /// A tar entry attempted to escape the extraction root.
    #[error("image.unsafe_tar_entry: {0}")]
    ImageUnsafeTarEntry(String),

    /// The `cleanroom-helper` binary could not be located.
    #[error("helper.binary_missing: {0}")]
    HelperBinaryMissing(String),

    /// The helper process failed to start or never opened its control socket.
    #[error("helper.start_failed: {0}")]
    HelperStartFailed(String),

    /// The helper process did not exit within the graceful/forceful budget.
    #[error("helper.exit_timeout")]
    HelperExitTimeout,

    /// The helper reported a missing virtualization entitlement.
    #[error("helper.entitlement_missing: {0}")]
    HelperEntitlementMissing(String),

    /// The VM did not report readiness within `LaunchSeconds`.
    #[error("vm.start_timeout")]
    VmStartTimeout,

    /// The VM helper failed to start the VM for another reason.
    #[error("vm.start_failed: {0}")]
    VmStartFailed(String),

    /// `StopVM` targeted a VM id the helper does not recognize.
    #[error("vm.unknown_id: {0}")]
    VmUnknownId(String),

    /// `StartVM` was called while the helper already owns a running VM.
    #[error("vm.already_running")]
    VmAlreadyRunning,

    /// The VM did not stop within its two-phase shutdown budget.
    #[error("vm.stop_failed: {0}")]
    VmStopFailed(String),

    /// Dialing the sandbox's proxy socket failed or timed out.
    #[error("proxy.connect_failed: {0}")]
    ProxyConnectFailed(String),

    /// A guest-agent frame was truncated, oversized, or had an unknown tag.
    #[error("wire.malformed: {0}")]
    WireMalformed(String),

    /// Writing the initial `ExecRequest` frame failed.
    #[error("wire.exec_request_failed: {0}")]
    WireExecRequestFailed(String),

    /// No sandbox exists with the given id.
    #[error("sandbox.not_found: {0}")]
    SandboxNotFound(String),

    /// The sandbox cannot accept the request in its current state.
    #[error("sandbox.busy: {0}")]
    SandboxBusy(String),

    /// No execution exists with the given id within the sandbox.
    #[error("execution.not_found: {0}")]
    ExecutionNotFound(String),

    /// The execution's output/input stream failed before `exit` was observed.
    #[error("execution.stream_failed: {0}")]
    ExecutionStreamFailed(String),

    /// The execution was canceled before completion.
    #[error("execution.canceled")]
    ExecutionCanceled,

    /// The execution exceeded its launch/run deadline.
    #[error("execution.timed_out")]
    ExecutionTimedOut,

    /// A scope (source IP or token) was registered twice.
    #[error("gateway.duplicate_scope: {0}")]
    GatewayDuplicateScope(String),

    /// A gateway lookup found no scope for the given key.
    #[error("gateway.unknown_scope: {0}")]
    GatewayUnknownScope(String),

    /// A string argument contained an interior NUL byte (libkrun FFI).
    #[error("interior NUL byte in string argument")]
    Nul(#[from] NulError),

    /// libkrun returned a negative error code.
    #[error("{op}: libkrun error code {code}")]
    Krun {
        /// The FFI operation that failed.
        op: &'static str,
        /// The negative error code returned by libkrun.
        code: i32,
    },

    /// An I/O error from runtime, helper, or filesystem operations.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns the stable, machine-readable dotted error code, e.g.
    /// `"policy.invalid"`. Clients should match on this rather than the
    /// formatted `Display` message, which may carry a human-readable detail.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::PolicyInvalid(_) => "policy.invalid",
            Self::ImageFetchFailed(_) => "image.fetch_failed",
            Self::ImageMaterializeFailed(_) => "image.materialize_failed",
            Self::ImageUnsafeTarEntry(_) => "image.unsafe_tar_entry",
            Self::HelperBinaryMissing(_) => "helper.binary_missing",
            Self::HelperStartFailed(_) => "helper.start_failed",
            Self::HelperExitTimeout => "helper.exit_timeout",
            Self::HelperEntitlementMissing(_) => "helper.entitlement_missing",
            Self::VmStartTimeout => "vm.start_timeout",
            Self::VmStartFailed(_) => "vm.start_failed",
            Self::VmUnknownId(_) => "vm.unknown_id",
            Self::VmAlreadyRunning => "vm.already_running",
            Self::VmStopFailed(_) => "vm.stop_failed",
            Self::ProxyConnectFailed(_) => "proxy.connect_failed",
            Self::WireMalformed(_) => "wire.malformed",
            Self::WireExecRequestFailed(_) => "wire.exec_request_failed",
            Self::SandboxNotFound(_) => "sandbox.not_found",
            Self::SandboxBusy(_) => "sandbox.busy",
            Self::ExecutionNotFound(_) => "execution.not_found",
            Self::ExecutionStreamFailed(_) => "execution.stream_failed",
            Self::ExecutionCanceled => "execution.canceled",
            Self::ExecutionTimedOut => "execution.timed_out",
            Self::GatewayDuplicateScope(_) => "gateway.duplicate_scope",
            Self::GatewayUnknownScope(_) => "gateway.unknown_scope",
            Self::Nul(_) => "io.nul_byte",
            Self::Krun { .. } => "vm.krun_error",
            Self::Io(_) => "io.error",
        }
    }

    /// Appends human guidance to a helper error that mentions the
    /// virtualization entitlement, per `spec.md` §4.2.
    #[must_use]
    pub fn with_entitlement_guidance(message: String) -> Self {
        Self::HelperEntitlementMissing(format!(
            "{message} (grant the com.apple.security.virtualization entitlement to the \
             cleanroom-helper binary and re-sign it)"
        ))
    }
}
