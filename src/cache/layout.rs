//! On-disk layout of the cache root
//!
//! ```text
//! {root}/
//! ├── index.toml                          metadata index
//! ├── index.lock                          cross-process lock for index updates
//! ├── locks/
//! │   └── models--org--name--fp16.lock    per-key single-flight lock
//! ├── models/
//! │   └── models--org--name/
//! │       └── fp16/
//! │           └── model.safetensors
//! └── tmp/
//!     └── models--org--name--fp16.partial in-progress download
//! ```

use crate::error::{CacheError, CacheResult};
use crate::models::ModelKey;
use std::path::{Path, PathBuf};

/// Reserved suffix for in-progress downloads
pub const PARTIAL_SUFFIX: &str = ".partial";

#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: PathBuf,
}

impl CacheLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the directory skeleton
    pub fn ensure_dirs(&self) -> CacheResult<()> {
        for dir in [self.root.clone(), self.locks_dir(), self.models_dir(), self.tmp_dir()] {
            std::fs::create_dir_all(&dir)
                .map_err(|e| CacheError::io(format!("cannot create {:?}", dir), e))?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn index_path(&self) -> PathBuf {
        self.root.join("index.toml")
    }

    pub fn index_lock_path(&self) -> PathBuf {
        self.root.join("index.lock")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    pub fn models_dir(&self) -> PathBuf {
        self.root.join("models")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    /// Lock file guarding the download of one key
    pub fn key_lock_path(&self, key: &ModelKey) -> PathBuf {
        self.locks_dir().join(format!("{}.lock", key.file_stem()))
    }

    /// Scratch file a download of `key` streams into
    pub fn temp_path(&self, key: &ModelKey) -> PathBuf {
        self.tmp_dir()
            .join(format!("{}{}", key.file_stem(), PARTIAL_SUFFIX))
    }

    /// Key lock guarding a scratch file, derived from the scratch file's name
    pub fn lock_path_for_partial(&self, partial: &Path) -> Option<PathBuf> {
        let stem = partial.file_name()?.to_str()?.strip_suffix(PARTIAL_SUFFIX)?;
        Some(self.locks_dir().join(format!("{}.lock", stem)))
    }

    /// Entry path relative to the root, as stored in the index
    pub fn relative_entry_path(&self, key: &ModelKey, file_name: &str) -> PathBuf {
        Path::new("models")
            .join(key.cache_stem())
            .join(&key.variant)
            .join(file_name)
    }

    pub fn absolute(&self, relative: &Path) -> PathBuf {
        self.root.join(relative)
    }
}

/// Whether a file name follows the scratch naming convention
pub fn is_partial(name: &str) -> bool {
    name.ends_with(PARTIAL_SUFFIX)
}
