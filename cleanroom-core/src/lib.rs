//! Sandbox lifecycle and execution core for the Cleanroom VM control plane.
//!
//! Wraps [`libkrun`] behind the [`vm`] module's device layout to run short-
//! lived, policy-constrained microVMs: a [`policy`] compiles and hashes a
//! network/image policy, [`rootfs`] resolves it to a prepared ext4 artifact,
//! [`sandbox::SandboxManager`] provisions a VM through the sibling
//! `cleanroom-helper` co-process ([`helper`]), and [`execution`] dials the
//! VM's guest channel to run commands and stream their output.
//!
//! # Quick start
//!
//! ```no_run
//! use cleanroom_core::config::CoreConfig;
//! use cleanroom_core::policy::{AllowRule, CompiledPolicy};
//! use cleanroom_core::sandbox::SandboxManager;
//!
//! # async fn run(
//! #     manager: SandboxManager,
//! # ) -> cleanroom_core::Result<()> {
//! let policy = CompiledPolicy::compile(
//!     1,
//!     "ghcr.io/example/agent-base@sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
//!     "deny",
//!     vec![AllowRule::new("github.com", [443])?],
//! )?;
//! let sandbox = manager.create("darwin-vz", Default::default(), policy).await?;
//! let executions = manager.executions(&sandbox.sandbox_id)?;
//! let proxy = manager.proxy_socket_path(&sandbox.sandbox_id)?;
//! executions
//!     .create_execution(&proxy, vec!["echo".into(), "hello".into()], false, 30, false)
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! [`libkrun`]: https://github.com/containers/libkrun

pub mod capability;
pub mod config;
mod error;
pub mod execution;
pub mod helper;
pub mod policy;
pub mod registry;
pub mod rootfs;
pub mod sandbox;
mod vm;
mod watchdog;

pub use capability::{
    CredentialProvider, EnvCredentialProvider, HelperProcess, RootFSMaterializer, ScopeKey,
    ScopeRegistry, SignalSource, StartVmParams, StartVmResult,
};
pub use config::{CoreConfig, SandboxOptions};
pub use error::{Error, Result};
pub use execution::{CancelOutcome, ExecutionInfo, ExecutionTable, Status as ExecutionStatus};
pub use helper::HelperSession;
pub use policy::{AllowRule, CompiledPolicy};
pub use registry::Registry;
pub use rootfs::{ExtFsMaterializer, ImageCache, ImageCacheRecord, RootFSPreparer};
pub use sandbox::{SandboxInfo, SandboxManager, Status as SandboxStatus};
pub use vm::{MicroVm, VmSpec};
pub use watchdog::{create as create_watchdog_pipe, wait_for_parent_death, Keepalive, ENV_WATCHDOG_FD};
