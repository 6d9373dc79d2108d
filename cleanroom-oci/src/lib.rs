//! Injectable OCI image-fetch capability for the Cleanroom rootfs preparer.
//!
//! `spec.md` treats the OCI pull client as an external injectable
//! capability, not core surface: this crate defines the [`ImageFetcher`]
//! trait the rootfs preparer depends on, a default registry-backed
//! implementation over [`oci_client`], and the reference-parsing helpers
//! needed to validate a digest-pinned `CompiledPolicy.ImageRef`.
//!
//! # Architecture
//!
//! ```text
//! ImageFetcher (capability trait)
//!  └── RegistryFetcher (default impl, oci_client::Client)
//! Reference (repo@sha256:<hex> parsing)
//! ```

#![allow(clippy::missing_docs_in_private_items)]

mod reference;

use std::future::Future;
use std::pin::Pin;

use oci_client::client::ClientConfig;
use oci_client::secrets::RegistryAuth;
pub use reference::{Identifier, Reference};

/// Boxed future returned by [`ImageFetcher::fetch`] — the trait must stay
/// object-safe so fakes can be substituted in tests without generics.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Result type for `cleanroom-oci` operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from image-fetch operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The image reference string could not be parsed.
    #[error("invalid image reference: {0}")]
    InvalidReference(String),

    /// `CompiledPolicy.ImageRef` was not digest-pinned.
    #[error("image reference is not digest-pinned: {0}")]
    NotDigestPinned(String),

    /// Registry communication failed.
    #[error("registry: {0}")]
    Registry(String),
}

/// Target platform for a fetched image, derived from host architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Platform {
    /// `linux/amd64`.
    LinuxAmd64,
    /// `linux/arm64` with the `v8` variant.
    LinuxArm64V8,
}

impl Platform {
    /// Returns the platform matching the current host's architecture.
    #[must_use]
    pub const fn host() -> Self {
        #[cfg(target_arch = "aarch64")]
        {
            Self::LinuxArm64V8
        }
        #[cfg(not(target_arch = "aarch64"))]
        {
            Self::LinuxAmd64
        }
    }

    /// OCI manifest-list architecture string (`amd64` / `arm64`).
    #[must_use]
    pub const fn arch(self) -> &'static str {
        match self {
            Self::LinuxAmd64 => "amd64",
            Self::LinuxArm64V8 => "arm64",
        }
    }
}

/// Subset of the OCI image configuration relevant to VM execution.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ImageConfig {
    /// Default command (`CMD`).
    #[serde(default, alias = "Cmd")]
    pub cmd: Option<Vec<String>>,
    /// Default entrypoint (`ENTRYPOINT`).
    #[serde(default, alias = "Entrypoint")]
    pub entrypoint: Option<Vec<String>>,
    /// Default environment variables.
    #[serde(default, alias = "Env")]
    pub env: Option<Vec<String>>,
    /// Default working directory.
    #[serde(default, alias = "WorkingDir")]
    pub working_dir: Option<String>,
    /// Default user (from `USER` directive).
    #[serde(default, alias = "User")]
    pub user: Option<String>,
}

impl ImageConfig {
    /// Returns the combined entrypoint + cmd as the final execution command.
    #[must_use]
    pub fn command(&self) -> Vec<String> {
        let mut parts = Vec::new();
        if let Some(ref ep) = self.entrypoint {
            parts.extend(ep.iter().cloned());
        }
        if let Some(ref cmd) = self.cmd {
            parts.extend(cmd.iter().cloned());
        }
        parts
    }
}

/// Result of a successful fetch: ordered gzip-compressed tar layers plus
/// the image's runtime config.
#[derive(Debug, Clone)]
pub struct FetchedImage {
    /// Manifest content digest (`sha256:<hex>`).
    pub digest: String,
    /// Gzip-compressed tar layers, in the order they must be applied.
    pub layers: Vec<Vec<u8>>,
    /// Runtime config (entrypoint, cmd, env, workdir, user).
    pub config: ImageConfig,
}

/// Injectable capability: fetch a digest-pinned image's layers and config.
///
/// The rootfs preparer depends on this trait, not on any concrete registry
/// client, so it can be driven in tests by a fake that counts invocations
/// (testable property §8.F — cache-hit should call the fetcher exactly once).
pub trait ImageFetcher: Send + Sync {
    /// Fetches `image_ref` (must be digest-pinned) for `platform`.
    fn fetch(&self, image_ref: &str, platform: Platform) -> BoxFuture<'_, Result<FetchedImage>>;
}

/// Accepted layer media types (OCI + Docker).
const ACCEPTED_MEDIA_TYPES: &[&str] = &[
    "application/vnd.oci.image.layer.v1.tar+gzip",
    "application/vnd.docker.image.rootfs.diff.tar.gzip",
];

/// Default [`ImageFetcher`] backed by [`oci_client`].
pub struct RegistryFetcher {
    client: oci_client::Client,
    auth: RegistryAuth,
}

impl std::fmt::Debug for RegistryFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryFetcher").finish_non_exhaustive()
    }
}

impl Default for RegistryFetcher {
    fn default() -> Self {
        Self {
            client: oci_client::Client::new(ClientConfig::default()),
            auth: RegistryAuth::Anonymous,
        }
    }
}

impl RegistryFetcher {
    /// Creates a fetcher authenticating with `auth` instead of anonymous pulls.
    #[must_use]
    pub fn with_auth(auth: RegistryAuth) -> Self {
        Self {
            client: oci_client::Client::new(ClientConfig::default()),
            auth,
        }
    }
}

impl ImageFetcher for RegistryFetcher {
    fn fetch(&self, image_ref: &str, platform: Platform) -> BoxFuture<'_, Result<FetchedImage>> {
        let image_ref = image_ref.to_owned();
        Box::pin(async move {
            let reference = parse_pinned(&image_ref)?;
            let _ = platform; // oci_client resolves the manifest list itself from the reference.
            let image_data = self
                .client
                .pull(&reference, &self.auth, ACCEPTED_MEDIA_TYPES.to_vec())
                .await
                .map_err(|e| Error::Registry(e.to_string()))?;

            let digest = image_data.digest.clone().unwrap_or_default();
            let layers = image_data.layers.into_iter().map(|l| l.data).collect();
            let config = parse_image_config(&image_data.config.data).unwrap_or_default();

            Ok(FetchedImage {
                digest,
                layers,
                config,
            })
        })
    }
}

/// Parses and validates that `image_ref` is digest-pinned, per
/// `CompiledPolicy.ImageRef`'s invariant.
fn parse_pinned(image_ref: &str) -> Result<oci_client::Reference> {
    let parsed = Reference::parse(image_ref).map_err(|e| Error::InvalidReference(e.to_string()))?;
    if !parsed.is_digest_pinned() {
        return Err(Error::NotDigestPinned(image_ref.to_owned()));
    }
    image_ref
        .parse()
        .map_err(|e: oci_client::ParseError| Error::InvalidReference(e.to_string()))
}

/// Deserializes the raw OCI config JSON blob, unwrapping the `"config"` key.
fn parse_image_config(data: &[u8]) -> Option<ImageConfig> {
    #[derive(serde::Deserialize)]
    struct TopLevel {
        config: Option<ImageConfig>,
    }
    serde_json::from_slice::<TopLevel>(data).ok()?.config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_arch_strings() {
        assert_eq!(Platform::LinuxAmd64.arch(), "amd64");
        assert_eq!(Platform::LinuxArm64V8.arch(), "arm64");
    }

    #[test]
    fn rejects_tag_reference_as_unpinned() {
        let err = parse_pinned("ubuntu:latest").unwrap_err();
        assert!(matches!(err, Error::NotDigestPinned(_)));
    }

    #[test]
    fn accepts_digest_pinned_reference() {
        let digest = "sha256:".to_owned() + &"a".repeat(64);
        let image_ref = format!("ghcr.io/x/y@{digest}");
        assert!(parse_pinned(&image_ref).is_ok());
    }

    #[test]
    fn image_config_combines_entrypoint_and_cmd() {
        let cfg = ImageConfig {
            entrypoint: Some(vec!["/bin/sh".into(), "-c".into()]),
            cmd: Some(vec!["echo hi".into()]),
            ..ImageConfig::default()
        };
        assert_eq!(cfg.command(), vec!["/bin/sh", "-c", "echo hi"]);
    }
}
