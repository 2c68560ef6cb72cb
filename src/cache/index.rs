//! Persisted cache index
//!
//! One TOML record per entry. Writes are atomic: the index is written to a
//! sibling temp file, synced, then renamed over the old one.

use crate::error::{CacheError, CacheResult};
use crate::models::{Checksum, ModelKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// A cached, installed artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Path relative to the cache root
    pub relative_path: PathBuf,
    /// Absolute path, derived from the root when the index is loaded
    #[serde(skip)]
    pub path: PathBuf,
    pub size_bytes: u64,
    pub checksum: Checksum,
    pub last_access: DateTime<Utc>,
    /// Logical clock value of the last access; lower is older
    pub access_seq: u64,
    /// Logical clock value at install; breaks recency ties
    pub inserted_seq: u64,
    pub verified: bool,
    pub pin_count: u32,
    /// Kept last so it serializes as a trailing `[entries.key]` table
    pub key: ModelKey,
}

impl CacheEntry {
    pub fn is_pinned(&self) -> bool {
        self.pin_count > 0
    }

    /// LRU ordering key: least recently used first, then earliest inserted
    pub(crate) fn recency(&self) -> (u64, u64) {
        (self.access_seq, self.inserted_seq)
    }
}

/// Serialized form of the whole index
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct IndexFile {
    pub last_updated: DateTime<Utc>,
    /// Next logical clock value
    pub next_seq: u64,
    #[serde(default)]
    pub entries: Vec<CacheEntry>,
}

/// Identity of the index file on disk, used to notice writes by other processes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexStamp {
    modified: SystemTime,
    len: u64,
}

/// Reads and writes `index.toml`
#[derive(Debug, Clone)]
pub struct IndexStore {
    path: PathBuf,
}

impl IndexStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current stamp of the index file, `None` if it does not exist
    pub fn stamp(&self) -> Option<IndexStamp> {
        let meta = std::fs::metadata(&self.path).ok()?;
        Some(IndexStamp {
            modified: meta.modified().ok()?,
            len: meta.len(),
        })
    }

    /// Load the index; a missing file is an empty index
    ///
    /// A corrupted index fails hard rather than silently dropping entries.
    pub async fn load(&self) -> CacheResult<IndexFile> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(IndexFile::default());
            }
            Err(e) => {
                return Err(CacheError::io(
                    format!("failed to read index {:?}", self.path),
                    e,
                ));
            }
        };

        toml::from_str(&content).map_err(|e| {
            CacheError::Io(format!(
                "failed to parse index {:?}: {}. File may be corrupted; delete it and run `gc` to rebuild",
                self.path, e
            ))
        })
    }

    /// Save atomically
    pub async fn save(&self, index: &IndexFile) -> CacheResult<()> {
        let content = toml::to_string_pretty(index)
            .map_err(|e| CacheError::Io(format!("failed to serialize index: {}", e)))?;

        let temp_file = self.path.with_extension("toml.tmp");

        let mut file = fs::File::create(&temp_file)
            .await
            .map_err(|e| CacheError::io("failed to create temp index file", e))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| CacheError::io("failed to write index file", e))?;
        file.sync_all()
            .await
            .map_err(|e| CacheError::io("failed to sync index file", e))?;

        fs::rename(&temp_file, &self.path)
            .await
            .map_err(|e| CacheError::io("failed to rename temp index file", e))?;

        tracing::trace!(path = ?self.path, entries = index.entries.len(), "Index saved");

        Ok(())
    }
}
