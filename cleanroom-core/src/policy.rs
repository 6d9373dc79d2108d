//! Compiled network/image policy shared by every sandbox (`spec.md` §3).
//!
//! YAML sourcing of an uncompiled policy is an external collaborator; this
//! module owns only the compiled shape, its canonical-hash invariant, and
//! validation.

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::error::{Error, Result};

/// The only `Version` this build accepts.
pub const SUPPORTED_VERSION: u32 = 1;

/// The only `NetworkDefault` this build accepts.
pub const NETWORK_DEFAULT_DENY: &str = "deny";

/// One allow-list entry: a lowercase host and its allowed ports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowRule {
    /// Lowercase hostname (no scheme, no path).
    pub host: String,
    /// Sorted, deduplicated ports in `1..=65535`.
    pub ports: Vec<u16>,
}

impl AllowRule {
    /// Builds a rule, lowercasing the host and sorting/deduplicating ports.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PolicyInvalid`] if `ports` is empty or contains `0`.
    pub fn new(host: impl Into<String>, ports: impl IntoIterator<Item = u16>) -> Result<Self> {
        let host = host.into().to_lowercase();
        let mut ports: Vec<u16> = ports.into_iter().collect();
        if ports.iter().any(|&p| p == 0) {
            return Err(Error::PolicyInvalid(format!(
                "allow rule for {host} contains port 0"
            )));
        }
        ports.sort_unstable();
        ports.dedup();
        if ports.is_empty() {
            return Err(Error::PolicyInvalid(format!(
                "allow rule for {host} has no ports"
            )));
        }
        Ok(Self { host, ports })
    }

    /// Whether `port` is permitted by this rule.
    #[must_use]
    pub fn allows_port(&self, port: u16) -> bool {
        self.ports.binary_search(&port).is_ok()
    }
}

/// The fields that participate in [`CompiledPolicy::compute_hash`], in their
/// canonical JSON field order. Kept separate from `CompiledPolicy` so the
/// hash is computed over exactly these fields with `Hash` excluded.
#[derive(Serialize)]
struct Hashed<'a> {
    version: u32,
    image_ref: &'a str,
    image_digest: &'a str,
    network_default: &'a str,
    allow: &'a [AllowRule],
}

/// Immutable, validated, hash-addressed policy shared by a sandbox's
/// lifetime. Construct via [`CompiledPolicy::compile`]; the `Hash` field is
/// derived, never set directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledPolicy {
    /// Policy schema version; must equal [`SUPPORTED_VERSION`].
    pub version: u32,
    /// Digest-pinned OCI reference, `repo@sha256:<64-hex>`.
    pub image_ref: String,
    /// The digest component of `image_ref`, kept denormalized for transmission.
    pub image_digest: String,
    /// Network default posture; only `"deny"` is accepted.
    pub network_default: String,
    /// Allow-list rules, sorted by host.
    pub allow: Vec<AllowRule>,
    /// Hex SHA-256 of the canonical encoding of the other fields.
    pub hash: String,
}

impl CompiledPolicy {
    /// Validates and hashes a policy's fields into a [`CompiledPolicy`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::PolicyInvalid`] if `version` is unsupported,
    /// `image_ref` is not a digest-pinned `repo@sha256:<64-hex>` reference
    /// whose digest matches `image_digest`, `network_default` is not
    /// `"deny"`, or `allow` is not strictly sorted by host with no
    /// duplicate hosts.
    pub fn compile(
        version: u32,
        image_ref: impl Into<String>,
        network_default: impl Into<String>,
        mut allow: Vec<AllowRule>,
    ) -> Result<Self> {
        if version != SUPPORTED_VERSION {
            return Err(Error::PolicyInvalid(format!(
                "unsupported policy version {version}"
            )));
        }
        let image_ref = image_ref.into();
        let image_digest = digest_of_pinned_ref(&image_ref)?;

        let network_default = network_default.into();
        if network_default != NETWORK_DEFAULT_DENY {
            return Err(Error::PolicyInvalid(format!(
                "unsupported network default {network_default}"
            )));
        }

        allow.sort_by(|a, b| a.host.cmp(&b.host));
        for pair in allow.windows(2) {
            if pair[0].host == pair[1].host {
                return Err(Error::PolicyInvalid(format!(
                    "duplicate allow-list host {}",
                    pair[0].host
                )));
            }
        }

        let hash = compute_hash(&Hashed {
            version,
            image_ref: &image_ref,
            image_digest: &image_digest,
            network_default: &network_default,
            allow: &allow,
        })?;

        Ok(Self {
            version,
            image_ref,
            image_digest,
            network_default,
            allow,
            hash,
        })
    }

    /// Re-derives the hash from this policy's current fields and checks it
    /// against `self.hash`. Used to validate a policy deserialized from an
    /// untrusted source (e.g. a wire frame) before trusting its identity.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PolicyInvalid`] if the stored hash does not match.
    pub fn verify_hash(&self) -> Result<()> {
        let expected = compute_hash(&Hashed {
            version: self.version,
            image_ref: &self.image_ref,
            image_digest: &self.image_digest,
            network_default: &self.network_default,
            allow: &self.allow,
        })?;
        if expected != self.hash {
            return Err(Error::PolicyInvalid("hash mismatch".to_owned()));
        }
        Ok(())
    }

    /// Finds the allow-list rule for `host`, if any (case-insensitive).
    #[must_use]
    pub fn rule_for_host(&self, host: &str) -> Option<&AllowRule> {
        let host = host.to_lowercase();
        self.allow.binary_search_by(|r| r.host.cmp(&host)).ok().map(|i| &self.allow[i])
    }

    /// Whether `host:port` is permitted by this policy's allow-list.
    #[must_use]
    pub fn permits(&self, host: &str, port: u16) -> bool {
        self.rule_for_host(host).is_some_and(|r| r.allows_port(port))
    }
}

/// Computes the hex SHA-256 of `value`'s canonical (serde-ordered) JSON
/// encoding.
fn compute_hash(value: &Hashed<'_>) -> Result<String> {
    let bytes =
        serde_json::to_vec(value).map_err(|e| Error::PolicyInvalid(format!("hash encode: {e}")))?;
    Ok(hex::encode(Sha256::digest(bytes)))
}

/// Extracts and validates the `sha256:<64-hex>` digest suffix of a
/// `repo@sha256:<hex>` reference.
fn digest_of_pinned_ref(image_ref: &str) -> Result<String> {
    let (_, digest) = image_ref.rsplit_once('@').ok_or_else(|| {
        Error::PolicyInvalid(format!("image ref {image_ref} is not digest-pinned"))
    })?;
    let hex_part = digest.strip_prefix("sha256:").ok_or_else(|| {
        Error::PolicyInvalid(format!("image ref {image_ref} digest is not sha256"))
    })?;
    if hex_part.len() != 64 || !hex_part.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::PolicyInvalid(format!(
            "image ref {image_ref} digest is not 64 hex characters"
        )));
    }
    Ok(digest.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_digest() -> String {
        "sha256:".to_owned() + &"a".repeat(64)
    }

    #[test]
    fn compile_rejects_unpinned_ref() {
        let err = CompiledPolicy::compile(1, "ubuntu:latest", "deny", vec![]).unwrap_err();
        assert!(matches!(err, Error::PolicyInvalid(_)));
    }

    #[test]
    fn compile_rejects_unsupported_version() {
        let image_ref = format!("ghcr.io/x/y@{}", sample_digest());
        let err = CompiledPolicy::compile(2, image_ref, "deny", vec![]).unwrap_err();
        assert!(matches!(err, Error::PolicyInvalid(_)));
    }

    #[test]
    fn compile_rejects_duplicate_hosts() {
        let image_ref = format!("ghcr.io/x/y@{}", sample_digest());
        let allow = vec![
            AllowRule::new("github.com", [443]).unwrap(),
            AllowRule::new("github.com", [80]).unwrap(),
        ];
        let err = CompiledPolicy::compile(1, image_ref, "deny", allow).unwrap_err();
        assert!(matches!(err, Error::PolicyInvalid(_)));
    }

    #[test]
    fn identical_fields_produce_identical_hash() {
        let image_ref = format!("ghcr.io/x/y@{}", sample_digest());
        let allow = vec![AllowRule::new("github.com", [443, 443, 80]).unwrap()];
        let a = CompiledPolicy::compile(1, image_ref.clone(), "deny", allow.clone()).unwrap();
        let b = CompiledPolicy::compile(1, image_ref, "deny", allow).unwrap();
        assert_eq!(a.hash, b.hash);
        assert!(a.verify_hash().is_ok());
    }

    #[test]
    fn allow_rule_sorts_and_dedups_ports() {
        let rule = AllowRule::new("Example.com", [443, 80, 443]).unwrap();
        assert_eq!(rule.host, "example.com");
        assert_eq!(rule.ports, vec![80, 443]);
        assert!(rule.allows_port(80));
        assert!(!rule.allows_port(8080));
    }

    #[test]
    fn allow_rule_rejects_empty_ports() {
        assert!(AllowRule::new("example.com", []).is_err());
    }

    #[test]
    fn policy_permits_checks_host_and_port() {
        let image_ref = format!("ghcr.io/x/y@{}", sample_digest());
        let allow = vec![AllowRule::new("github.com", [443]).unwrap()];
        let policy = CompiledPolicy::compile(1, image_ref, "deny", allow).unwrap();
        assert!(policy.permits("github.com", 443));
        assert!(!policy.permits("github.com", 80));
        assert!(!policy.permits("evil.example", 443));
    }
}
