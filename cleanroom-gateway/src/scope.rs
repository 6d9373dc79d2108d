//! In-memory [`ScopeRegistry`] backing the gateway's scope lookups
//! (`spec.md` §3 `GatewayScope`, §9's "single typed registry" consolidation).

use cleanroom_core::capability::{ScopeKey, ScopeRegistry};
use cleanroom_core::{CompiledPolicy, Error, Registry, Result};

/// HTTP header carrying an opaque scope-token, the more portable of the two
/// scoping strategies (`spec.md` §9 Open Question: source-IP availability
/// depends on the backend's network mode; token scoping is the only one
/// required to pass the push/pull conformance scenario).
pub const SCOPE_TOKEN_HEADER: &str = "x-cleanroom-scope-token";

/// A [`ScopeRegistry`] backed by [`cleanroom_core::Registry`], reused as-is
/// by both source-IP and scope-token registration (`spec.md` §4.6).
#[derive(Debug, Default)]
pub struct InMemoryScopeRegistry {
    entries: Registry<ScopeKey, (String, CompiledPolicy)>,
}

impl InMemoryScopeRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ScopeRegistry for InMemoryScopeRegistry {
    fn register(&self, key: ScopeKey, sandbox_id: String, policy: CompiledPolicy) -> Result<()> {
        if self.entries.insert_unique(key.clone(), (sandbox_id, policy)) {
            Ok(())
        } else {
            Err(Error::GatewayDuplicateScope(format!("{key:?}")))
        }
    }

    fn release(&self, key: &ScopeKey) {
        self.entries.remove(key);
    }

    fn lookup(&self, key: &ScopeKey) -> Option<(String, CompiledPolicy)> {
        self.entries.get(key)
    }
}

/// Lets one `Arc<InMemoryScopeRegistry>` back both the sandbox manager's
/// `Box<dyn ScopeRegistry>` and the gateway's `Arc<dyn ScopeRegistry>`, so a
/// single embedder-owned registry instance serves both collaborators.
impl ScopeRegistry for std::sync::Arc<InMemoryScopeRegistry> {
    fn register(&self, key: ScopeKey, sandbox_id: String, policy: CompiledPolicy) -> Result<()> {
        (**self).register(key, sandbox_id, policy)
    }

    fn release(&self, key: &ScopeKey) {
        (**self).release(key);
    }

    fn lookup(&self, key: &ScopeKey) -> Option<(String, CompiledPolicy)> {
        (**self).lookup(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_policy() -> CompiledPolicy {
        let image_ref = format!("ghcr.io/x/y@sha256:{}", "a".repeat(64));
        CompiledPolicy::compile(1, image_ref, "deny", vec![]).unwrap()
    }

    #[test]
    fn register_then_lookup_round_trips() {
        let registry = InMemoryScopeRegistry::new();
        let key = ScopeKey::Token("tok-1".to_owned());
        registry
            .register(key.clone(), "sb-1".to_owned(), sample_policy())
            .unwrap();
        let (sandbox_id, _) = registry.lookup(&key).unwrap();
        assert_eq!(sandbox_id, "sb-1");
    }

    #[test]
    fn duplicate_registration_fails() {
        let registry = InMemoryScopeRegistry::new();
        let key = ScopeKey::Token("tok-1".to_owned());
        registry
            .register(key.clone(), "sb-1".to_owned(), sample_policy())
            .unwrap();
        let err = registry
            .register(key, "sb-2".to_owned(), sample_policy())
            .unwrap_err();
        assert_eq!(err.code(), "gateway.duplicate_scope");
    }

    #[test]
    fn release_then_lookup_misses() {
        let registry = InMemoryScopeRegistry::new();
        let key = ScopeKey::Token("tok-1".to_owned());
        registry
            .register(key.clone(), "sb-1".to_owned(), sample_policy())
            .unwrap();
        registry.release(&key);
        assert!(registry.lookup(&key).is_none());
    }
}
