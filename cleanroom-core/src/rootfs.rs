//! RootFS preparer and image cache (`spec.md` §4.4).
//!
//! Resolves a `CompiledPolicy`'s digest-pinned `ImageRef` to an absolute
//! ext4 artifact path: a content-addressed image cache (miss → fetch +
//! materialize via the injected capabilities), a prepared-rootfs cache
//! keyed by [`PreparedRootFSKey`] (guest-agent + init injected), and
//! finally a per-run ephemeral copy the sandbox owns and deletes on
//! teardown.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use cleanroom_oci::{FetchedImage, ImageConfig, ImageFetcher, Platform};
use sha2::{Digest as _, Sha256};
use tokio::io::AsyncWriteExt;

use crate::capability::RootFSMaterializer;
use crate::config::CoreConfig;
use crate::error::{Error, Result};
use crate::policy::CompiledPolicy;

/// Where a cached image record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ImageSource {
    /// Pulled from an OCI registry via [`ImageFetcher`].
    Registry,
    /// Imported from a pre-existing local artifact.
    Import,
}

/// A cached, content-addressed ext4 artifact for one image digest
/// (`spec.md` §3 `ImageCacheRecord`).
#[derive(Debug, Clone)]
pub struct ImageCacheRecord {
    /// `sha256:<hex>` manifest digest.
    pub digest: String,
    /// The reference this record was fetched under.
    pub image_ref: String,
    /// Absolute path to the cached ext4 artifact.
    pub rootfs_path: PathBuf,
    /// Size of the artifact in bytes.
    pub size_bytes: u64,
    /// When this record was first created.
    pub created_at: SystemTime,
    /// When this record was last returned by a cache hit.
    pub last_used_at: SystemTime,
    /// Registry vs. import provenance.
    pub source: ImageSource,
    /// OCI runtime config captured at fetch time.
    pub oci_config: ImageConfig,
}

/// Content-addressed cache of prepared ext4 images, keyed by manifest
/// digest, backed by a small embedded SQL database (`spec.md` §6).
pub struct ImageCache {
    conn: std::sync::Mutex<rusqlite::Connection>,
    dir: PathBuf,
}

impl std::fmt::Debug for ImageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageCache").field("dir", &self.dir).finish()
    }
}

impl ImageCache {
    /// Opens (creating if absent) the image cache at `dir`, with its
    /// metadata database at `<dir>/cache.db`.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let conn = rusqlite::Connection::open(dir.join("cache.db"))
            .map_err(|e| Error::ImageMaterializeFailed(format!("open cache db: {e}")))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS images (
                digest TEXT PRIMARY KEY,
                image_ref TEXT NOT NULL,
                rootfs_path TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                last_used_at INTEGER NOT NULL,
                source TEXT NOT NULL,
                oci_config TEXT NOT NULL
            );",
        )
        .map_err(|e| Error::ImageMaterializeFailed(format!("init cache schema: {e}")))?;
        Ok(Self {
            conn: std::sync::Mutex::new(conn),
            dir: dir.to_path_buf(),
        })
    }

    /// Looks up `digest`, returning the record only if its `rootfs_path`
    /// still exists on disk, bumping `last_used_at` on a hit.
    fn lookup(&self, digest: &str) -> Result<Option<ImageCacheRecord>> {
        let conn = self.conn.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let record: Option<ImageCacheRecord> = conn
            .query_row(
                "SELECT image_ref, rootfs_path, size_bytes, created_at, last_used_at, source, oci_config \
                 FROM images WHERE digest = ?1",
                [digest],
                |row| {
                    let config_json: String = row.get(6)?;
                    let config: ImageConfig = serde_json::from_str(&config_json).unwrap_or_default();
                    let source: String = row.get(5)?;
                    Ok(ImageCacheRecord {
                        digest: digest.to_owned(),
                        image_ref: row.get(0)?,
                        rootfs_path: PathBuf::from(row.get::<_, String>(1)?),
                        size_bytes: row.get::<_, i64>(2)? as u64,
                        created_at: epoch_to_time(row.get(3)?),
                        last_used_at: epoch_to_time(row.get(4)?),
                        source: if source == "import" {
                            ImageSource::Import
                        } else {
                            ImageSource::Registry
                        },
                        oci_config: config,
                    })
                },
            )
            .ok();

        let Some(record) = record else {
            return Ok(None);
        };
        if !record.rootfs_path.exists() {
            return Ok(None);
        }
        let now = time_to_epoch(SystemTime::now());
        conn.execute(
            "UPDATE images SET last_used_at = ?1 WHERE digest = ?2",
            rusqlite::params![now, digest],
        )
        .map_err(|e| Error::ImageMaterializeFailed(format!("touch cache record: {e}")))?;
        Ok(Some(record))
    }

    fn insert(&self, record: &ImageCacheRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let config_json = serde_json::to_string(&record.oci_config).unwrap_or_default();
        conn.execute(
            "INSERT OR REPLACE INTO images \
             (digest, image_ref, rootfs_path, size_bytes, created_at, last_used_at, source, oci_config) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                record.digest,
                record.image_ref,
                record.rootfs_path.display().to_string(),
                record.size_bytes as i64,
                time_to_epoch(record.created_at),
                time_to_epoch(record.last_used_at),
                match record.source {
                    ImageSource::Registry => "registry",
                    ImageSource::Import => "import",
                },
                config_json,
            ],
        )
        .map_err(|e| Error::ImageMaterializeFailed(format!("insert cache record: {e}")))?;
        Ok(())
    }

    /// Resolves `image_ref` to a cached ext4 artifact, fetching and
    /// materializing on a miss (`spec.md` §4.4 resolution step 2).
    pub async fn ensure(
        &self,
        image_ref: &str,
        fetcher: &dyn ImageFetcher,
        materializer: &dyn RootFSMaterializer,
    ) -> Result<ImageCacheRecord> {
        let digest = image_ref
            .rsplit_once('@')
            .map(|(_, d)| d.to_owned())
            .ok_or_else(|| Error::PolicyInvalid(format!("{image_ref} is not digest-pinned")))?;

        if let Some(hit) = self.lookup(&digest)? {
            return Ok(hit);
        }

        let fetched = fetcher
            .fetch(image_ref, Platform::host())
            .await
            .map_err(|e| Error::ImageFetchFailed(e.to_string()))?;

        let record = self.materialize_and_insert(image_ref, &digest, fetched, materializer).await?;
        Ok(record)
    }

    async fn materialize_and_insert(
        &self,
        image_ref: &str,
        digest: &str,
        fetched: FetchedImage,
        materializer: &dyn RootFSMaterializer,
    ) -> Result<ImageCacheRecord> {
        let scratch = tempfile::tempdir()?;
        let content_dir = scratch.path().join("content");
        std::fs::create_dir_all(&content_dir)?;

        extract_layers(&fetched.layers, &content_dir)?;
        ensure_standard_dirs(&content_dir)?;

        let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
        let final_path = self.dir.join(format!("{hex}.ext4"));
        let tmp_path = self.dir.join(format!("{hex}.tmp-ext4"));

        materializer.materialize(&content_dir, &tmp_path).await?;
        tokio::fs::rename(&tmp_path, &final_path).await?;

        let size_bytes = tokio::fs::metadata(&final_path).await?.len();
        let now = SystemTime::now();
        let record = ImageCacheRecord {
            digest: digest.to_owned(),
            image_ref: image_ref.to_owned(),
            rootfs_path: final_path,
            size_bytes,
            created_at: now,
            last_used_at: now,
            source: ImageSource::Registry,
            oci_config: fetched.config,
        };
        self.insert(&record)?;
        Ok(record)
    }
}

fn time_to_epoch(t: SystemTime) -> i64 {
    t.duration_since(SystemTime::UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

fn epoch_to_time(secs: i64) -> SystemTime {
    SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(secs.max(0) as u64)
}

/// Extracts gzip-compressed tar layers into `dest`, honoring OCI whiteouts
/// and rejecting unsafe entries per `spec.md` §4.4's materialization
/// contract: no absolute paths, no `..` components, no writing through an
/// existing symlink path component, no symlink target escaping `dest`.
fn extract_layers(layers: &[Vec<u8>], dest: &Path) -> Result<()> {
    for layer in layers {
        extract_layer(layer, dest)?;
    }
    Ok(())
}

fn extract_layer(gz_data: &[u8], dest: &Path) -> Result<()> {
    use flate2::read::GzDecoder;

    let decoder = GzDecoder::new(gz_data);
    let mut archive = tar::Archive::new(decoder);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);

    for raw_entry in archive
        .entries()
        .map_err(|e| Error::ImageMaterializeFailed(e.to_string()))?
    {
        let mut entry = raw_entry.map_err(|e| Error::ImageMaterializeFailed(e.to_string()))?;
        let rel = entry
            .path()
            .map_err(|e| Error::ImageMaterializeFailed(e.to_string()))?
            .into_owned();

        let file_name = rel.file_name().and_then(|n| n.to_str()).map(str::to_owned);

        if file_name.as_deref() == Some(".wh..wh..opq") {
            if let Some(parent) = rel.parent() {
                let target = dest.join(parent);
                if target.exists() {
                    clear_directory(&target)?;
                }
            }
            continue;
        }
        if let Some(name) = file_name.as_deref().and_then(|n| n.strip_prefix(".wh.")) {
            if let Some(parent) = rel.parent() {
                let target = dest.join(parent).join(name);
                if target.is_dir() {
                    let _ = std::fs::remove_dir_all(&target);
                } else {
                    let _ = std::fs::remove_file(&target);
                }
            }
            continue;
        }

        validate_safe_entry(&rel, dest)?;

        if entry.header().entry_type().is_symlink() {
            if let Ok(Some(link)) = entry.link_name() {
                validate_symlink_target(&link, &rel, dest)?;
            }
        }

        entry
            .unpack_in(dest)
            .map_err(|e| Error::ImageMaterializeFailed(e.to_string()))?;
    }
    Ok(())
}

/// Rejects absolute paths, `..` components, and paths that write through
/// an already-existing symlink component.
fn validate_safe_entry(rel: &Path, dest: &Path) -> Result<()> {
    use std::path::Component;

    if rel.is_absolute() {
        return Err(Error::ImageUnsafeTarEntry(format!(
            "{} is an absolute path",
            rel.display()
        )));
    }
    if rel.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(Error::ImageUnsafeTarEntry(format!(
            "{} contains a `..` component",
            rel.display()
        )));
    }

    let mut walked = dest.to_path_buf();
    let mut components = rel.components().peekable();
    while let Some(component) = components.next() {
        walked.push(component);
        // Only intermediate (non-final) components may not be symlinks.
        if components.peek().is_some() && walked.symlink_metadata().is_ok_and(|m| m.file_type().is_symlink()) {
            return Err(Error::ImageUnsafeTarEntry(format!(
                "{} writes through an existing symlink at {}",
                rel.display(),
                walked.display()
            )));
        }
    }
    Ok(())
}

/// Rejects a symlink entry whose target resolves outside `dest`. Absolute
/// targets are rooted at `dest` per `spec.md`'s extraction-root rule.
fn validate_symlink_target(link: &Path, rel: &Path, dest: &Path) -> Result<()> {
    let target = if link.is_absolute() {
        dest.join(link.strip_prefix("/").unwrap_or(link))
    } else {
        dest.join(rel.parent().unwrap_or(Path::new(""))).join(link)
    };
    let normalized = normalize_lexically(&target);
    if !normalized.starts_with(dest) {
        return Err(Error::ImageUnsafeTarEntry(format!(
            "symlink {} targets {} outside the extraction root",
            rel.display(),
            link.display()
        )));
    }
    Ok(())
}

/// Lexically normalizes `..`/`.` components without touching the
/// filesystem (the target may not exist yet).
fn normalize_lexically(path: &Path) -> PathBuf {
    use std::path::Component;

    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}

fn clear_directory(dir: &Path) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Creates `dev`, `proc`, `run`, `sys`, `tmp` at the root of `dir` if absent.
fn ensure_standard_dirs(dir: &Path) -> Result<()> {
    for name in ["dev", "proc", "run", "sys", "tmp"] {
        let path = dir.join(name);
        if !path.exists() {
            std::fs::create_dir_all(&path)?;
        }
    }
    Ok(())
}

/// Computes the ext4 image size per `spec.md` §4.4:
/// `max(512 MiB, content + content/2 + 128 MiB)` rounded up to 4 MiB.
#[must_use]
pub fn ext4_image_size(content_bytes: u64) -> u64 {
    const MIB: u64 = 1024 * 1024;
    let min = 512 * MIB;
    let grown = content_bytes + content_bytes / 2 + 128 * MIB;
    let size = min.max(grown);
    size.div_ceil(4 * MIB) * 4 * MIB
}

/// Default [`RootFSMaterializer`] shelling out to `mkfs.ext4`/`debugfs`
/// per `spec.md` §4.4's literal wording.
#[derive(Debug, Default)]
pub struct ExtFsMaterializer;

impl RootFSMaterializer for ExtFsMaterializer {
    fn materialize<'a>(
        &'a self,
        content_dir: &'a Path,
        image_path: &'a Path,
    ) -> cleanroom_oci::BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let content_bytes = dir_size(content_dir).await?;
            let size = ext4_image_size(content_bytes);

            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(image_path)
                .await?;
            file.set_len(size).await?;
            drop(file);

            let output = tokio::process::Command::new("mkfs.ext4")
                .arg("-F")
                .arg("-d")
                .arg(content_dir)
                .arg(image_path)
                .output()
                .await?;
            if !output.status.success() {
                return Err(Error::ImageMaterializeFailed(format!(
                    "mkfs.ext4 failed: {}",
                    String::from_utf8_lossy(&output.stderr)
                )));
            }
            Ok(())
        })
    }

    fn inject_file<'a>(
        &'a self,
        image_path: &'a Path,
        guest_path: &'a str,
        data: &'a [u8],
        mode: u32,
    ) -> cleanroom_oci::BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut staged = tempfile::NamedTempFile::new()?;
            {
                let file = staged.as_file_mut();
                let mut async_file = tokio::fs::File::from_std(file.try_clone()?);
                async_file.write_all(data).await?;
                async_file.flush().await?;
            }
            let staged_path = staged.path().to_path_buf();

            let output = tokio::process::Command::new("debugfs")
                .arg("-w")
                .arg("-R")
                .arg(format!(
                    "write {} {}",
                    staged_path.display(),
                    guest_path.trim_start_matches('/')
                ))
                .arg(image_path)
                .output()
                .await?;
            if !output.status.success() {
                return Err(Error::ImageMaterializeFailed(format!(
                    "debugfs write failed: {}",
                    String::from_utf8_lossy(&output.stderr)
                )));
            }

            let chmod = tokio::process::Command::new("debugfs")
                .arg("-w")
                .arg("-R")
                .arg(format!("sif {} mode 0{mode:o}", guest_path.trim_start_matches('/')))
                .arg(image_path)
                .output()
                .await?;
            if !chmod.status.success() {
                return Err(Error::ImageMaterializeFailed(format!(
                    "debugfs chmod failed: {}",
                    String::from_utf8_lossy(&chmod.stderr)
                )));
            }
            Ok(())
        })
    }
}

async fn dir_size(dir: &Path) -> Result<u64> {
    let mut total = 0u64;
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if metadata.is_dir() {
                stack.push(entry.path());
            } else {
                total += metadata.len();
            }
        }
    }
    Ok(total)
}

/// Composite key addressing a prepared (guest-agent + init injected) ext4
/// artifact, per `spec.md` §3 `PreparedRootFSKey`.
#[must_use]
pub fn prepared_rootfs_key(
    image_digest: &str,
    guest_agent_sha256: &str,
    host_arch: &str,
    version_tag: &str,
    init_script_text: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(image_digest.as_bytes());
    hasher.update(b"|");
    hasher.update(guest_agent_sha256.as_bytes());
    hasher.update(b"|");
    hasher.update(host_arch.as_bytes());
    hasher.update(b"|");
    hasher.update(version_tag.as_bytes());
    hasher.update(b"|");
    hasher.update(init_script_text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Resolves a `CompiledPolicy` to an absolute ext4 rootfs path ready to be
/// handed to the VM helper as `StartVM`'s `rootfs_path`, preparing (cache
/// miss) or reusing (cache hit) a shared base artifact, then copying it
/// into a per-run ephemeral file the caller owns.
pub struct RootFSPreparer<'a> {
    config: &'a CoreConfig,
    cache: &'a ImageCache,
    fetcher: &'a dyn ImageFetcher,
    materializer: &'a dyn RootFSMaterializer,
}

impl<'a> RootFSPreparer<'a> {
    /// Builds a preparer over the given config and capabilities.
    #[must_use]
    pub const fn new(
        config: &'a CoreConfig,
        cache: &'a ImageCache,
        fetcher: &'a dyn ImageFetcher,
        materializer: &'a dyn RootFSMaterializer,
    ) -> Self {
        Self {
            config,
            cache,
            fetcher,
            materializer,
        }
    }

    /// Produces an ephemeral rootfs copy under `run_directory` for one
    /// sandbox run, per `spec.md` §4.4's resolution order and per-run
    /// preparation steps.
    pub async fn prepare_ephemeral(
        &self,
        policy: &CompiledPolicy,
        run_directory: &Path,
        guest_agent_sha256: &str,
    ) -> Result<PathBuf> {
        let cached = self
            .cache
            .ensure(&policy.image_ref, self.fetcher, self.materializer)
            .await?;

        let key = prepared_rootfs_key(
            &policy.image_digest,
            guest_agent_sha256,
            std::env::consts::ARCH,
            env!("CARGO_PKG_VERSION"),
            &self.config.init_script,
        );
        let prepared_dir = self.config.prepared_rootfs_dir();
        tokio::fs::create_dir_all(&prepared_dir).await?;
        let prepared_path = prepared_dir.join(format!("{key}.ext4"));

        if !prepared_path.exists() {
            let tmp_path = prepared_dir.join(format!("{key}.tmp-ext4"));
            tokio::fs::copy(&cached.rootfs_path, &tmp_path).await?;
            self.materializer
                .inject_file(
                    &tmp_path,
                    "/usr/local/bin/cleanroom-guest-agent",
                    &tokio::fs::read(&self.config.guest_agent_binary).await?,
                    0o755,
                )
                .await?;
            self.materializer
                .inject_file(&tmp_path, "/sbin/cleanroom-init", self.config.init_script.as_bytes(), 0o755)
                .await?;
            tokio::fs::rename(&tmp_path, &prepared_path).await?;
        }

        tokio::fs::create_dir_all(run_directory).await?;
        let ephemeral_path = run_directory.join("rootfs-ephemeral.ext4");
        tokio::fs::copy(&prepared_path, &ephemeral_path).await?;
        Ok(ephemeral_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ext4_image_size_respects_minimum() {
        assert_eq!(ext4_image_size(0), 512 * 1024 * 1024);
    }

    #[test]
    fn ext4_image_size_rounds_up_to_4mib() {
        let size = ext4_image_size(1024 * 1024 * 1024);
        assert_eq!(size % (4 * 1024 * 1024), 0);
        assert!(size >= 1024 * 1024 * 1024 + 1024 * 1024 * 1024 / 2 + 128 * 1024 * 1024);
    }

    #[test]
    fn prepared_rootfs_key_is_deterministic() {
        let a = prepared_rootfs_key("sha256:abc", "agentsha", "aarch64", "0.1.0", "script");
        let b = prepared_rootfs_key("sha256:abc", "agentsha", "aarch64", "0.1.0", "script");
        assert_eq!(a, b);
        let c = prepared_rootfs_key("sha256:def", "agentsha", "aarch64", "0.1.0", "script");
        assert_ne!(a, c);
    }

    #[test]
    fn validate_safe_entry_rejects_absolute_path() {
        let dest = Path::new("/tmp/extract-root");
        let err = validate_safe_entry(Path::new("/etc/passwd"), dest).unwrap_err();
        assert!(matches!(err, Error::ImageUnsafeTarEntry(_)));
    }

    #[test]
    fn validate_safe_entry_rejects_dotdot() {
        let dest = Path::new("/tmp/extract-root");
        let err = validate_safe_entry(Path::new("../escape"), dest).unwrap_err();
        assert!(matches!(err, Error::ImageUnsafeTarEntry(_)));
    }

    #[test]
    fn validate_safe_entry_accepts_normal_path() {
        let dest = Path::new("/tmp/extract-root");
        assert!(validate_safe_entry(Path::new("usr/bin/sh"), dest).is_ok());
    }

    #[test]
    fn validate_symlink_target_rejects_escape() {
        let dest = Path::new("/tmp/extract-root");
        let err =
            validate_symlink_target(Path::new("/../../etc/shadow"), Path::new("usr/link"), dest)
                .unwrap_err();
        assert!(matches!(err, Error::ImageUnsafeTarEntry(_)));
    }

    #[test]
    fn validate_symlink_target_accepts_rooted_absolute() {
        let dest = Path::new("/tmp/extract-root");
        assert!(validate_symlink_target(Path::new("/usr/bin/sh"), Path::new("bin/sh"), dest).is_ok());
    }
}
