//! Sandbox manager: owns the set of live sandboxes and their provisioning
//! / teardown state machine (`spec.md` §4.5, §3 `Sandbox`).

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::SystemTime;

use cleanroom_oci::ImageFetcher;

use crate::capability::{HelperProcess, RootFSMaterializer, ScopeKey, ScopeRegistry, StartVmParams};
use crate::config::{CoreConfig, SandboxOptions};
use crate::error::{Error, Result};
use crate::execution::ExecutionTable;
use crate::policy::CompiledPolicy;
use crate::registry::Registry;
use crate::rootfs::{ImageCache, RootFSPreparer};

/// Sandbox lifecycle status (`spec.md` §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Status {
    /// Resolving rootfs, starting the helper, waiting on `StartVM`.
    Provisioning,
    /// `StartVM` succeeded and the proxy socket exists; accepts executions.
    Ready,
    /// Terminate in progress; resources are being released.
    Stopping,
    /// Terminated cleanly; all owned resources released.
    Stopped,
    /// Provisioning failed before reaching Ready.
    Failed,
}

/// Public snapshot of a sandbox's state, as returned by the Control API.
#[derive(Debug, Clone)]
pub struct SandboxInfo {
    /// Opaque, process-unique sandbox identifier.
    pub sandbox_id: String,
    /// Backend name (e.g. `"darwin-vz"`, `"firecracker"`).
    pub backend: String,
    /// Current lifecycle status.
    pub status: Status,
    /// Creation timestamp.
    pub created_at: SystemTime,
    /// The failure cause, if `status == Failed`.
    pub failure: Option<String>,
}

/// A live sandbox's full internal state. Not `Clone`; held behind an `Arc`
/// in [`SandboxManager`]'s registry.
struct SandboxEntry {
    sandbox_id: String,
    backend: String,
    created_at: SystemTime,
    compiled_policy: CompiledPolicy,
    run_directory: PathBuf,
    scope_key: ScopeKey,
    inner: Mutex<Inner>,
    executions: ExecutionTable,
}

/// Fields that change over the sandbox's lifetime, guarded by one
/// per-sandbox lock (`spec.md` §5's shared-state discipline).
struct Inner {
    status: Status,
    vm_id: Option<String>,
    proxy_socket_path: Option<PathBuf>,
    ephemeral_rootfs_path: Option<PathBuf>,
    helper: Option<Box<dyn HelperProcess>>,
    failure: Option<String>,
}

/// Counter for generating process-unique sandbox ids.
static SANDBOX_SEQ: AtomicU64 = AtomicU64::new(1);

fn next_sandbox_id() -> String {
    let n = SANDBOX_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("sb-{n:012x}")
}

/// Owns the set of live sandboxes; maps sandbox id to VM handle, scope
/// token, and allocated resources (`spec.md` §2 "Sandbox manager").
pub struct SandboxManager {
    config: CoreConfig,
    image_cache: ImageCache,
    fetcher: Box<dyn ImageFetcher>,
    materializer: Box<dyn RootFSMaterializer>,
    scope_registry: Box<dyn ScopeRegistry>,
    sandboxes: Registry<String, std::sync::Arc<SandboxEntry>>,
}

impl std::fmt::Debug for SandboxManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxManager").finish_non_exhaustive()
    }
}

impl SandboxManager {
    /// Builds a manager over the given configuration and capabilities.
    pub fn new(
        config: CoreConfig,
        fetcher: Box<dyn ImageFetcher>,
        materializer: Box<dyn RootFSMaterializer>,
        scope_registry: Box<dyn ScopeRegistry>,
    ) -> Result<Self> {
        let image_cache = ImageCache::open(&config.image_cache_dir())?;
        Ok(Self {
            config,
            image_cache,
            fetcher,
            materializer,
            scope_registry,
            sandboxes: Registry::new(),
        })
    }

    /// Provisions a new sandbox: resolves rootfs, allocates a run
    /// directory, starts the helper, issues `StartVM`, registers the
    /// gateway scope, and transitions Provisioning → Ready.
    ///
    /// On any preparation error the sandbox is recorded `Failed` (if
    /// partially allocated) and every resource acquired so far is released
    /// before the error propagates; no partial sandbox is ever observable
    /// as `Ready` (`spec.md` §7 propagation policy, testable property 4).
    pub async fn create(
        &self,
        backend: impl Into<String>,
        options: SandboxOptions,
        policy: CompiledPolicy,
    ) -> Result<SandboxInfo> {
        let backend = backend.into();
        let options = options.normalized();
        let sandbox_id = next_sandbox_id();
        let run_directory = self.config.run_dir(&sandbox_id);
        let scope_key = ScopeKey::Token(generate_scope_token());

        let entry = std::sync::Arc::new(SandboxEntry {
            sandbox_id: sandbox_id.clone(),
            backend: backend.clone(),
            created_at: SystemTime::now(),
            compiled_policy: policy.clone(),
            run_directory: run_directory.clone(),
            scope_key: scope_key.clone(),
            inner: Mutex::new(Inner {
                status: Status::Provisioning,
                vm_id: None,
                proxy_socket_path: None,
                ephemeral_rootfs_path: None,
                helper: None,
                failure: None,
            }),
            executions: ExecutionTable::new(),
        });
        self.sandboxes.replace(sandbox_id.clone(), entry.clone());

        match self.provision(&entry, &options).await {
            Ok(()) => Ok(self.snapshot(&entry)),
            Err(e) => {
                self.mark_failed(&entry, &e).await;
                Err(e)
            }
        }
    }

    async fn provision(&self, entry: &SandboxEntry, options: &SandboxOptions) -> Result<()> {
        tokio::fs::create_dir_all(&entry.run_directory).await?;

        let preparer = RootFSPreparer::new(&self.config, &self.image_cache, self.fetcher.as_ref(), self.materializer.as_ref());
        let guest_agent_sha256 = sha256_of_file(&self.config.guest_agent_binary).await?;
        let ephemeral_rootfs_path = preparer
            .prepare_ephemeral(&entry.compiled_policy, &entry.run_directory, &guest_agent_sha256)
            .await?;

        let helper = crate::helper::HelperSession::start(
            &self.config.helper_binary,
            &entry.run_directory,
            options.launch_deadline(),
        )
        .await?;
        let helper = Box::new(
            helper.with_shutdown_timing(self.config.helper_interrupt_wait, self.config.helper_kill_wait),
        );

        let params = StartVmParams {
            kernel_path: self.config.kernel_path.clone(),
            rootfs_path: ephemeral_rootfs_path.clone(),
            vcpus: options.vcpus,
            memory_mib: options.memory_mib,
            guest_port: options.guest_port,
            launch_timeout_seconds: options.launch_seconds,
            run_directory: entry.run_directory.clone(),
            proxy_socket_path: entry.run_directory.join("vz-proxy.sock"),
            console_log_path: entry.run_directory.join("vm.console.log"),
            boot_args: "console=ttyS0 reboot=k panic=1".to_owned(),
        };
        let start_result = helper.start_vm(&params).await?;

        if !start_result.proxy_socket_path.exists() {
            return Err(Error::VmStartFailed(
                "helper reported success but the proxy socket does not exist".to_owned(),
            ));
        }

        self.scope_registry.register(
            entry.scope_key.clone(),
            entry.sandbox_id.clone(),
            entry.compiled_policy.clone(),
        )?;

        let mut inner = entry.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.vm_id = Some(start_result.vm_id);
        inner.proxy_socket_path = Some(start_result.proxy_socket_path);
        inner.ephemeral_rootfs_path = Some(ephemeral_rootfs_path);
        inner.helper = Some(helper);
        inner.status = Status::Ready;
        Ok(())
    }

    async fn mark_failed(&self, entry: &SandboxEntry, cause: &Error) {
        {
            let mut inner = entry.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            inner.status = Status::Failed;
            inner.failure = Some(cause.to_string());
        }
        self.release_resources(entry).await;
    }

    /// Looks up a sandbox's current snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SandboxNotFound`] if no sandbox with `sandbox_id` exists.
    pub fn get(&self, sandbox_id: &str) -> Result<SandboxInfo> {
        let entry = self
            .sandboxes
            .get(&sandbox_id.to_owned())
            .ok_or_else(|| Error::SandboxNotFound(sandbox_id.to_owned()))?;
        Ok(self.snapshot(&entry))
    }

    /// Lists all sandboxes, most recently created first.
    #[must_use]
    pub fn list(&self) -> Vec<SandboxInfo> {
        let mut infos: Vec<SandboxInfo> = self.sandboxes.list().iter().map(|e| self.snapshot(e)).collect();
        infos.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        infos
    }

    /// Returns the proxy socket path for a `Ready` sandbox, used by the
    /// execution engine to dial a fresh connection per execution.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SandboxNotFound`] if unknown, [`Error::SandboxBusy`]
    /// if not currently `Ready`.
    pub fn proxy_socket_path(&self, sandbox_id: &str) -> Result<PathBuf> {
        let entry = self
            .sandboxes
            .get(&sandbox_id.to_owned())
            .ok_or_else(|| Error::SandboxNotFound(sandbox_id.to_owned()))?;
        let inner = entry.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if inner.status != Status::Ready {
            return Err(Error::SandboxBusy(format!(
                "sandbox {sandbox_id} is not Ready"
            )));
        }
        inner
            .proxy_socket_path
            .clone()
            .ok_or_else(|| Error::SandboxBusy(format!("sandbox {sandbox_id} has no proxy socket")))
    }

    /// Returns the execution table belonging to `sandbox_id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SandboxNotFound`] if unknown.
    pub fn executions(&self, sandbox_id: &str) -> Result<ExecutionTable> {
        let entry = self
            .sandboxes
            .get(&sandbox_id.to_owned())
            .ok_or_else(|| Error::SandboxNotFound(sandbox_id.to_owned()))?;
        Ok(entry.executions.clone())
    }

    /// Terminates a sandbox: Ready/Provisioning → Stopping → Stopped,
    /// releasing every owned resource in reverse order of acquisition
    /// (`spec.md` §3 lifecycle, §5 "Terminate ... happens-before").
    ///
    /// # Errors
    ///
    /// Returns [`Error::SandboxNotFound`] if unknown.
    pub async fn terminate(&self, sandbox_id: &str) -> Result<()> {
        let entry = self
            .sandboxes
            .get(&sandbox_id.to_owned())
            .ok_or_else(|| Error::SandboxNotFound(sandbox_id.to_owned()))?;

        {
            let mut inner = entry.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if matches!(inner.status, Status::Stopped | Status::Failed) {
                return Ok(());
            }
            inner.status = Status::Stopping;
        }

        self.release_resources(&entry).await;

        let mut inner = entry.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.status = Status::Stopped;
        Ok(())
    }

    /// Releases every resource a sandbox may have acquired, in reverse
    /// order: executions' guest channels, scope token, `StopVM`, helper,
    /// proxy socket file, ephemeral rootfs, run directory. Idempotent and
    /// best-effort — individual release failures are logged, not
    /// propagated, so teardown always completes.
    async fn release_resources(&self, entry: &SandboxEntry) {
        entry.executions.cancel_all();

        self.scope_registry.release(&entry.scope_key);

        let (vm_id, proxy_path, helper, ephemeral_rootfs) = {
            let mut inner = entry.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            (
                inner.vm_id.take(),
                inner.proxy_socket_path.take(),
                inner.helper.take(),
                inner.ephemeral_rootfs_path.take(),
            )
        };

        if let Some(helper) = helper {
            if let Some(vm_id) = vm_id {
                if let Err(e) = helper.stop_vm(&vm_id).await {
                    tracing::warn!(sandbox_id = %entry.sandbox_id, error = %e, "StopVM failed during teardown");
                }
            }
            if let Err(e) = helper.close().await {
                tracing::warn!(sandbox_id = %entry.sandbox_id, error = %e, "helper close failed during teardown");
            }
        }

        if let Some(path) = proxy_path {
            let _ = tokio::fs::remove_file(&path).await;
        }
        if let Some(path) = ephemeral_rootfs {
            let _ = tokio::fs::remove_file(&path).await;
        }
        let _ = tokio::fs::remove_dir_all(&entry.run_directory).await;
    }

    fn snapshot(&self, entry: &SandboxEntry) -> SandboxInfo {
        let inner = entry.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        SandboxInfo {
            sandbox_id: entry.sandbox_id.clone(),
            backend: entry.backend.clone(),
            status: inner.status,
            created_at: entry.created_at,
            failure: inner.failure.clone(),
        }
    }
}

/// Generates an opaque printable scope token (`spec.md` §3 `ScopeToken`).
fn generate_scope_token() -> String {
    let mut seed = u64::from(std::process::id());
    seed ^= SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    seed ^= SANDBOX_SEQ.load(Ordering::Relaxed).wrapping_mul(0x9E37_79B9);
    let mut bytes = [0u8; 16];
    for byte in &mut bytes {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        *byte = (seed & 0xff) as u8;
    }
    hex::encode(bytes)
}

async fn sha256_of_file(path: &std::path::Path) -> Result<String> {
    use sha2::{Digest as _, Sha256};
    let data = tokio::fs::read(path).await.unwrap_or_default();
    Ok(hex::encode(Sha256::digest(&data)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CredentialProvider as _;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn scope_tokens_are_unique() {
        let a = generate_scope_token();
        let b = generate_scope_token();
        assert_ne!(a, b);
    }

    struct NoopCredentials;
    impl CredentialProvider for NoopCredentials {
        fn resolve(&self, _host: &str) -> Option<String> {
            None
        }
    }

    #[test]
    fn noop_credentials_compiles() {
        let _ = AtomicBool::new(false);
        assert!(NoopCredentials.resolve("x").is_none());
    }
}
