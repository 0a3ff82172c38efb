//! Image storage: the transient per-capture store and the durable bucket.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use tracing::{debug, info};

/// Durable-storage address for a confirmed capture.
///
/// The timestamp prefix keeps the bucket browsable by date; the id makes
/// the key unique even for captures taken within the same second.
pub fn storage_key(captured_at: DateTime<Local>, id: &str) -> String {
    format!("raw/{}_{}.jpg", captured_at.format("%Y_%m_%d_%H_%M_%S"), id)
}

/// Reject ids that could escape the storage directory.
fn check_id(id: &str) -> Result<()> {
    if id.is_empty() || id.contains('/') || id.contains('\\') || id.contains("..") {
        anyhow::bail!("Invalid capture id: {id:?}");
    }
    Ok(())
}

// ── transient store ──────────────────────────────────────────────────────

/// One file per pending capture, named by capture id.
pub struct TransientStore {
    dir: PathBuf,
}

impl TransientStore {
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Cannot create transient dir {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn path(&self, id: &str) -> Result<PathBuf> {
        check_id(id)?;
        Ok(self.dir.join(id))
    }

    pub fn put(&self, id: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path(id)?;
        std::fs::write(&path, bytes)
            .with_context(|| format!("Cannot write {}", path.display()))?;
        debug!("Stored {} bytes for {id} in {}", bytes.len(), path.display());
        Ok(())
    }

    /// `Ok(None)` when nothing is stored under `id`.
    pub fn read(&self, id: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path(id)?;
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Cannot read {}", path.display())),
        }
    }

    /// Returns whether a file was removed.
    pub fn remove(&self, id: &str) -> Result<bool> {
        let path = self.path(id)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Cannot remove {}", path.display())),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.path(id).map(|p| p.exists()).unwrap_or(false)
    }
}

// ── durable store ────────────────────────────────────────────────────────

/// Where confirmed captures end up.
pub trait DurableStore {
    fn upload(&mut self, key: &str, bytes: &[u8], content_type: &str) -> Result<()>;
}

/// A bucket rooted in a local directory: objects live at
/// `<root>/<bucket>/<key>`.
pub struct BucketStore {
    bucket_dir: PathBuf,
}

impl BucketStore {
    pub fn new(root: &Path, bucket: &str) -> Result<Self> {
        check_id(bucket).context("Invalid bucket name")?;
        let bucket_dir = root.join(bucket);
        std::fs::create_dir_all(&bucket_dir)
            .with_context(|| format!("Cannot create bucket {}", bucket_dir.display()))?;
        Ok(Self { bucket_dir })
    }
}

impl DurableStore for BucketStore {
    fn upload(&mut self, key: &str, bytes: &[u8], content_type: &str) -> Result<()> {
        if key.split('/').any(|part| part.is_empty() || part == "..") {
            anyhow::bail!("Invalid object key: {key:?}");
        }
        let dest = self.bucket_dir.join(key);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Cannot create {}", parent.display()))?;
        }

        // Write then rename so readers never see a partial object.
        let tmp = dest.with_extension("part");
        std::fs::write(&tmp, bytes).with_context(|| format!("Cannot write {}", tmp.display()))?;
        std::fs::rename(&tmp, &dest)
            .with_context(|| format!("Cannot move object into {}", dest.display()))?;

        info!(
            "Uploaded {key} ({} bytes, {content_type}) → {}",
            bytes.len(),
            dest.display()
        );
        Ok(())
    }
}
