//! Snapshot persistence so violation state survives restarts.
//!
//! State holders implement [`Persistable`]; the [`SnapshotManager`]
//! writes lz4-compressed snapshots with a JSON sidecar describing what
//! was written, and restores the latest snapshot on boot.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{VigilError, VigilResult};

/// State that can be checkpointed and restored.
pub trait Persistable: Send + Sync {
    /// Unique name; doubles as the snapshot file stem.
    fn persist_name(&self) -> &str;
    /// Serialize current state to JSON bytes.
    fn snapshot(&self) -> VigilResult<Vec<u8>>;
    /// Replace current state from JSON bytes.
    fn restore(&self, data: &[u8]) -> VigilResult<()>;
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SnapshotMeta {
    pub name: String,
    pub taken_at: i64,
    pub size_bytes: usize,
    pub compressed: bool,
}

pub struct SnapshotManager {
    base_dir: PathBuf,
    compress: bool,
}

impl SnapshotManager {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            compress: true,
        }
    }

    pub fn without_compression(mut self) -> Self {
        self.compress = false;
        self
    }

    pub fn init(&self) -> VigilResult<()> {
        std::fs::create_dir_all(&self.base_dir)?;
        Ok(())
    }

    pub fn save(&self, target: &dyn Persistable) -> VigilResult<SnapshotMeta> {
        let data = target.snapshot()?;
        let payload = if self.compress {
            lz4_flex::compress_prepend_size(&data)
        } else {
            data
        };

        let name = target.persist_name();
        std::fs::write(self.snapshot_path(name), &payload)?;

        let meta = SnapshotMeta {
            name: name.to_string(),
            taken_at: chrono::Utc::now().timestamp(),
            size_bytes: payload.len(),
            compressed: self.compress,
        };
        std::fs::write(self.meta_path(name), serde_json::to_vec(&meta)?)?;

        info!(name, size = meta.size_bytes, compressed = meta.compressed, "Snapshot saved");
        Ok(meta)
    }

    /// Restore from the latest snapshot. `Ok(false)` when none exists.
    pub fn load(&self, target: &dyn Persistable) -> VigilResult<bool> {
        let name = target.persist_name();
        let path = self.snapshot_path(name);
        if !path.exists() {
            return Ok(false);
        }

        let raw = std::fs::read(&path)?;
        let compressed = self
            .meta(name)?
            .map(|m| m.compressed)
            .unwrap_or(self.compress);
        let data = if compressed {
            lz4_flex::decompress_size_prepended(&raw)
                .map_err(|e| VigilError::StoreUnavailable(format!("snapshot decompress: {e}")))?
        } else {
            raw
        };

        target.restore(&data)?;
        info!(name, bytes = data.len(), "State restored from snapshot");
        Ok(true)
    }

    pub fn meta(&self, name: &str) -> VigilResult<Option<SnapshotMeta>> {
        let path = self.meta_path(name);
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read(&path)?;
        match serde_json::from_slice(&raw) {
            Ok(meta) => Ok(Some(meta)),
            Err(e) => {
                warn!(name, error = %e, "Unreadable snapshot metadata, ignoring");
                Ok(None)
            }
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn snapshot_path(&self, name: &str) -> PathBuf {
        self.base_dir.join(format!("{name}.snapshot"))
    }

    fn meta_path(&self, name: &str) -> PathBuf {
        self.base_dir.join(format!("{name}.meta"))
    }
}
