//! Local model cache: index, size budget, LRU eviction and crash recovery
//!
//! All index mutations run under an in-process mutex plus the cross-process
//! `index.lock`, and always start by re-reading the index from disk, so several
//! processes can share one cache root. The lock is only held for metadata work
//! and the local rename/unlink it implies, never across network I/O.

pub mod index;
pub mod layout;
pub mod lock;

pub use index::{CacheEntry, IndexFile, IndexStore};
pub use layout::CacheLayout;
pub use lock::FileLock;

use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};
use crate::models::{Checksum, ModelKey};
use chrono::Utc;
use index::IndexStamp;
use layout::is_partial;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::sync::{Mutex, RwLock};

/// Settings the cache manager is constructed with
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub root: PathBuf,
    pub budget_bytes: u64,
    /// Scratch files younger than this survive a recovery pass
    pub orphan_grace: Duration,
    pub lock_poll: Duration,
}

impl CacheSettings {
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            root: config.cache_root.clone(),
            budget_bytes: config.budget_bytes,
            orphan_grace: config.orphan_grace(),
            lock_poll: config.download.lock_poll(),
        }
    }
}

/// What a recovery pass cleaned up
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Scratch files from interrupted downloads
    pub purged_temp_files: usize,
    /// Index entries whose file was missing or had the wrong size
    pub dropped_entries: Vec<ModelKey>,
    /// Files under `models/` the index did not reference
    pub orphaned_files: usize,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.purged_temp_files == 0 && self.dropped_entries.is_empty() && self.orphaned_files == 0
    }
}

/// In-memory view of the index
struct IndexState {
    entries: HashMap<ModelKey, CacheEntry>,
    next_seq: u64,
    stamp: Option<IndexStamp>,
    /// Force a reload on next access (set after a failed save)
    stale: bool,
}

impl IndexState {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_seq: 0,
            stamp: None,
            stale: true,
        }
    }

    /// Advance the logical clock
    fn tick(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn total_size(&self) -> u64 {
        self.entries.values().map(|e| e.size_bytes).sum()
    }

    fn get_mut(&mut self, key: &ModelKey) -> CacheResult<&mut CacheEntry> {
        self.entries
            .get_mut(key)
            .ok_or_else(|| CacheError::not_found(key.to_string(), "not present in the cache"))
    }
}

/// Owns the cache directory and its index
pub struct CacheManager {
    settings: CacheSettings,
    layout: CacheLayout,
    store: IndexStore,
    state: RwLock<IndexState>,
    /// Serializes writers within this process before the file lock is taken
    writer: Mutex<()>,
}

impl CacheManager {
    /// Open (creating if needed) a cache root and load its index
    pub async fn open(settings: CacheSettings) -> CacheResult<Self> {
        let layout = CacheLayout::new(settings.root.clone());
        layout.ensure_dirs()?;
        let store = IndexStore::new(layout.index_path());

        let manager = Self {
            settings,
            layout,
            store,
            state: RwLock::new(IndexState::new()),
            writer: Mutex::new(()),
        };
        manager.refresh_if_changed().await?;

        let state = manager.state.read().await;
        tracing::info!(
            root = ?manager.settings.root,
            entries = state.entries.len(),
            used_bytes = state.total_size(),
            budget_bytes = manager.settings.budget_bytes,
            "Cache opened"
        );
        drop(state);

        Ok(manager)
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    pub fn budget(&self) -> u64 {
        self.settings.budget_bytes
    }

    pub fn lock_poll(&self) -> Duration {
        self.settings.lock_poll
    }

    /// Entry for `key`, if installed and its file is intact
    ///
    /// Only reads metadata: the index is re-read only when another writer
    /// changed it, and the entry file is stat'ed, not hashed.
    pub async fn lookup(&self, key: &ModelKey) -> CacheResult<Option<CacheEntry>> {
        self.refresh_if_changed().await?;

        let entry = self.state.read().await.entries.get(key).cloned();
        let Some(entry) = entry else {
            return Ok(None);
        };

        match tokio::fs::metadata(&entry.path).await {
            Ok(meta) if meta.is_file() && meta.len() == entry.size_bytes => Ok(Some(entry)),
            _ => {
                tracing::warn!(
                    model = %key,
                    path = ?entry.path,
                    "Cache entry file missing or resized, treating as absent"
                );
                Ok(None)
            }
        }
    }

    /// Mark `key` as just used
    pub async fn touch(&self, key: &ModelKey) -> CacheResult<CacheEntry> {
        self.mutate(|state, _| {
            let seq = state.tick();
            let entry = state.get_mut(key)?;
            entry.access_seq = seq;
            entry.last_access = Utc::now();
            Ok(entry.clone())
        })
        .await
    }

    /// Move a verified temp file into the cache, evicting LRU entries as needed
    ///
    /// Fails with `InsufficientSpace`, evicting nothing, when the entry cannot
    /// fit even after every unpinned entry is gone.
    pub async fn install(
        &self,
        key: &ModelKey,
        temp_path: &Path,
        file_name: &str,
        size_bytes: u64,
        checksum: Checksum,
    ) -> CacheResult<CacheEntry> {
        let budget = self.settings.budget_bytes;
        if size_bytes > budget {
            return Err(CacheError::InsufficientSpace {
                model: key.to_string(),
                needed: size_bytes,
                budget,
                available: budget,
            });
        }

        let entry = self
            .mutate(|state, layout| {
                let victims = plan_eviction(state, key, size_bytes, budget)?;

                // Index entries are dropped only once their file is gone
                for victim in victims {
                    let path = state.entries[&victim].path.clone();
                    remove_file_if_exists(&path)?;
                    if let Some(evicted) = state.entries.remove(&victim) {
                        tracing::info!(
                            model = %victim,
                            size_bytes = evicted.size_bytes,
                            for_model = %key,
                            "Evicted cache entry"
                        );
                        crate::metrics::record_eviction(&victim.to_string());
                    }
                }

                let relative = layout.relative_entry_path(key, file_name);
                let final_path = layout.absolute(&relative);
                if let Some(parent) = final_path.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| CacheError::io(format!("cannot create {:?}", parent), e))?;
                }
                std::fs::rename(temp_path, &final_path).map_err(|e| {
                    CacheError::io(
                        format!("cannot move {:?} into the cache at {:?}", temp_path, final_path),
                        e,
                    )
                })?;

                let replaced = state.entries.remove(key);
                if let Some(old) = &replaced
                    && old.path != final_path
                {
                    remove_file_if_exists(&old.path)?;
                }

                let seq = state.tick();
                let entry = CacheEntry {
                    key: key.clone(),
                    relative_path: relative,
                    path: final_path,
                    size_bytes,
                    checksum,
                    last_access: Utc::now(),
                    access_seq: seq,
                    inserted_seq: seq,
                    verified: true,
                    pin_count: replaced.map(|old| old.pin_count).unwrap_or(0),
                };
                state.entries.insert(key.clone(), entry.clone());
                Ok(entry)
            })
            .await?;

        tracing::info!(
            model = %key,
            path = ?entry.path,
            size_bytes,
            "Installed cache entry"
        );
        Ok(entry)
    }

    /// Take a reference that protects `key` from eviction
    pub async fn pin(&self, key: &ModelKey) -> CacheResult<CacheEntry> {
        self.mutate(|state, _| {
            let entry = state.get_mut(key)?;
            entry.pin_count += 1;
            Ok(entry.clone())
        })
        .await
    }

    /// Release a reference taken with [`pin`](Self::pin)
    pub async fn unpin(&self, key: &ModelKey) -> CacheResult<CacheEntry> {
        self.mutate(|state, _| {
            let entry = state.get_mut(key)?;
            if entry.pin_count == 0 {
                tracing::warn!(model = %key, "Unpin of an entry that is not pinned");
            }
            entry.pin_count = entry.pin_count.saturating_sub(1);
            Ok(entry.clone())
        })
        .await
    }

    /// Delete an entry; refused while it is pinned
    pub async fn remove(&self, key: &ModelKey) -> CacheResult<()> {
        self.mutate(|state, _| {
            let entry = state.get_mut(key)?;
            if entry.is_pinned() {
                return Err(CacheError::Config(format!(
                    "'{}' is pinned ({} references) and cannot be removed",
                    key, entry.pin_count
                )));
            }
            let path = entry.path.clone();
            remove_file_if_exists(&path)?;
            state.entries.remove(key);
            tracing::info!(model = %key, "Removed cache entry");
            Ok(())
        })
        .await
    }

    /// All entries, sorted by key
    pub async fn list(&self) -> CacheResult<Vec<CacheEntry>> {
        self.refresh_if_changed().await?;
        let mut entries: Vec<_> = self.state.read().await.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    /// Bytes currently accounted against the budget
    pub async fn total_size(&self) -> CacheResult<u64> {
        self.refresh_if_changed().await?;
        Ok(self.state.read().await.total_size())
    }

    /// Reconcile the index with the files on disk
    ///
    /// Purges scratch files older than the grace period, drops entries whose
    /// file is missing or resized, and deletes unreferenced model files.
    pub async fn recover(&self) -> CacheResult<RecoveryReport> {
        let grace = self.settings.orphan_grace;
        let report = self
            .mutate(|state, layout| {
                let mut report = RecoveryReport::default();

                for path in list_files(&layout.tmp_dir())? {
                    let is_scratch = path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(is_partial);
                    if !is_scratch || file_age(&path) < grace {
                        continue;
                    }
                    // A held key lock means a download is still writing this file
                    let _guard = match layout.lock_path_for_partial(&path) {
                        Some(lock_path) => match FileLock::try_acquire(&lock_path)? {
                            Some(guard) => Some(guard),
                            None => {
                                tracing::debug!(path = ?path, "Skipping scratch file of a running download");
                                continue;
                            }
                        },
                        None => None,
                    };
                    remove_file_if_exists(&path)?;
                    tracing::info!(path = ?path, "Purged orphaned download");
                    report.purged_temp_files += 1;
                }

                let mut broken: Vec<ModelKey> = state
                    .entries
                    .values()
                    .filter(|e| {
                        !matches!(std::fs::metadata(&e.path), Ok(m) if m.is_file() && m.len() == e.size_bytes)
                    })
                    .map(|e| e.key.clone())
                    .collect();
                broken.sort();
                for key in broken {
                    if let Some(entry) = state.entries.remove(&key) {
                        tracing::warn!(model = %key, path = ?entry.path, "Dropping cache entry with missing or resized file");
                        remove_file_if_exists(&entry.path)?;
                    }
                    report.dropped_entries.push(key);
                }

                let referenced: HashSet<&Path> =
                    state.entries.values().map(|e| e.path.as_path()).collect();
                for path in list_files_recursive(&layout.models_dir())? {
                    if !referenced.contains(path.as_path()) {
                        remove_file_if_exists(&path)?;
                        tracing::info!(path = ?path, "Removed unreferenced model file");
                        report.orphaned_files += 1;
                    }
                }

                Ok(report)
            })
            .await?;

        if !report.is_clean() {
            tracing::info!(
                purged_temp_files = report.purged_temp_files,
                dropped_entries = report.dropped_entries.len(),
                orphaned_files = report.orphaned_files,
                "Cache recovery completed"
            );
        }
        Ok(report)
    }

    /// Re-hash an entry's file and record whether it still matches
    pub async fn reverify(&self, key: &ModelKey) -> CacheResult<CacheEntry> {
        let entry = self
            .lookup(key)
            .await?
            .ok_or_else(|| CacheError::not_found(key.to_string(), "not present in the cache"))?;

        let path = entry.path.clone();
        let actual = tokio::task::spawn_blocking(move || hash_file(&path))
            .await
            .map_err(|e| CacheError::Io(format!("hashing task failed: {}", e)))?
            .map_err(|e| CacheError::io(format!("cannot hash {:?}", entry.path), e))?;

        let verified = actual == entry.checksum;
        if !verified {
            tracing::warn!(
                model = %key,
                expected = %entry.checksum,
                actual = %actual,
                "Cached file no longer matches its checksum"
            );
        }

        self.mutate(|state, _| {
            let entry = state.get_mut(key)?;
            entry.verified = verified;
            Ok(entry.clone())
        })
        .await
    }

    /// Reload the index if another writer changed it
    async fn refresh_if_changed(&self) -> CacheResult<()> {
        let current = self.store.stamp();
        {
            let state = self.state.read().await;
            if !state.stale && state.stamp == current {
                return Ok(());
            }
        }
        let mut state = self.state.write().await;
        self.reload(&mut *state).await
    }

    async fn reload(&self, state: &mut IndexState) -> CacheResult<()> {
        let stamp = self.store.stamp();
        let index = self.store.load().await?;
        state.entries = index
            .entries
            .into_iter()
            .map(|mut entry| {
                entry.path = self.layout.absolute(&entry.relative_path);
                (entry.key.clone(), entry)
            })
            .collect();
        state.next_seq = index.next_seq;
        state.stamp = stamp;
        state.stale = false;
        Ok(())
    }

    /// Run one index mutation under both locks
    ///
    /// The index is saved even when `op` fails part way, since `op` only drops
    /// entries whose files are already gone.
    async fn mutate<T>(
        &self,
        op: impl FnOnce(&mut IndexState, &CacheLayout) -> CacheResult<T>,
    ) -> CacheResult<T> {
        let _writer = self.writer.lock().await;
        let _lock = FileLock::acquire(&self.layout.index_lock_path(), self.settings.lock_poll).await?;

        let mut state = self.state.write().await;
        self.reload(&mut *state).await?;

        let result = op(&mut *state, &self.layout);

        if let Err(e) = self.persist(&mut *state).await {
            state.stale = true;
            return Err(e);
        }
        result
    }

    async fn persist(&self, state: &mut IndexState) -> CacheResult<()> {
        let mut entries: Vec<CacheEntry> = state.entries.values().cloned().collect();
        entries.sort_by_key(|e| e.inserted_seq);
        self.store
            .save(&IndexFile {
                last_updated: Utc::now(),
                next_seq: state.next_seq,
                entries,
            })
            .await?;
        state.stamp = self.store.stamp();
        crate::metrics::update_cache_size(state.total_size());
        Ok(())
    }
}

/// Choose LRU victims so `size_bytes` fits for `key`
///
/// The entry being replaced (same key) does not count as used space.
fn plan_eviction(
    state: &IndexState,
    key: &ModelKey,
    size_bytes: u64,
    budget: u64,
) -> CacheResult<Vec<ModelKey>> {
    let others = move || state.entries.values().filter(move |e| &e.key != key);

    let mut used: u64 = others().map(|e| e.size_bytes).sum();
    let mut candidates: Vec<&CacheEntry> = others().filter(|e| !e.is_pinned()).collect();
    candidates.sort_by_key(|e| e.recency());

    let mut victims = Vec::new();
    for candidate in candidates {
        if used + size_bytes <= budget {
            break;
        }
        used -= candidate.size_bytes;
        victims.push(candidate.key.clone());
    }

    if used + size_bytes > budget {
        let pinned: u64 = others()
            .filter(|e| e.is_pinned())
            .map(|e| e.size_bytes)
            .sum();
        return Err(CacheError::InsufficientSpace {
            model: key.to_string(),
            needed: size_bytes,
            budget,
            available: budget.saturating_sub(pinned),
        });
    }
    Ok(victims)
}

/// SHA-256 of a file's contents
pub fn hash_file(path: &Path) -> std::io::Result<Checksum> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(Checksum::from_digest(&hasher.finalize()))
}

fn remove_file_if_exists(path: &Path) -> CacheResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CacheError::io(format!("cannot remove {:?}", path), e)),
    }
}

fn file_age(path: &Path) -> Duration {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .unwrap_or_default()
}

fn list_files(dir: &Path) -> CacheResult<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(CacheError::io(format!("cannot read {:?}", dir), e)),
    };
    Ok(entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect())
}

/// Recursively collect files
fn list_files_recursive(dir: &Path) -> CacheResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
        Err(e) => return Err(CacheError::io(format!("cannot read {:?}", dir), e)),
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            files.extend(list_files_recursive(&path)?);
        } else {
            files.push(path);
        }
    }
    Ok(files)
}
