//! Model downloader
//!
//! `ensure` returns the local path of a verified artifact, fetching it first if
//! needed. Concurrent callers for the same key share one download job (a flight);
//! across processes the per-key lock file gives the same guarantee. Each job
//! streams into a scratch file, hashing as it goes, resumes from the last written
//! byte after transient failures, and installs only after the digest matches.

use crate::cache::{CacheManager, FileLock};
use crate::config::DownloadConfig;
use crate::error::{CacheError, CacheResult};
use crate::models::{Checksum, ModelDescriptor, ModelKey, ModelRegistry, SourceUri};
use crate::storage::{ByteRange, StorageBackend, StorageRouter};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Observable state of a download job
#[derive(Debug, Clone, PartialEq)]
pub enum JobState {
    Pending,
    Fetching,
    Verifying,
    Installed(PathBuf),
    Failed(CacheError),
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Installed(_) | Self::Failed(_))
    }
}

/// One in-process download job and the callers waiting on it
struct Flight {
    state: watch::Sender<JobState>,
    waiters: AtomicUsize,
    cancel: CancellationToken,
}

impl Flight {
    fn new() -> Self {
        let (state, _) = watch::channel(JobState::Pending);
        Self {
            state,
            waiters: AtomicUsize::new(0),
            cancel: CancellationToken::new(),
        }
    }
}

/// A caller's hold on a flight
///
/// Dropping the last attachment of a running flight cancels the job.
struct Attachment {
    downloader: Arc<Downloader>,
    key: ModelKey,
    flight: Arc<Flight>,
}

impl Drop for Attachment {
    fn drop(&mut self) {
        // Decrement under the map entry lock so `attach` cannot join a flight
        // that is being torn down
        if let Entry::Occupied(entry) = self.downloader.flights.entry(self.key.clone())
            && Arc::ptr_eq(entry.get(), &self.flight)
        {
            if self.flight.waiters.fetch_sub(1, Ordering::SeqCst) == 1 {
                entry.remove();
                tracing::info!(model = %self.key, "Last waiter left, cancelling download");
                self.flight.cancel.cancel();
            }
            return;
        }
        // Job already finished and left the table
        self.flight.waiters.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Scratch file being filled, with the running digest of its contents
struct Partial {
    file: File,
    hasher: Sha256,
    written: u64,
}

impl Partial {
    /// Open the scratch file, picking up bytes left by an earlier attempt
    async fn open(path: &Path, expected: u64) -> CacheResult<Self> {
        let existing = tokio::fs::metadata(path)
            .await
            .ok()
            .map(|m| m.len())
            .filter(|&len| len > 0 && len <= expected);

        let Some(len) = existing else {
            let file = File::create(path)
                .await
                .map_err(|e| CacheError::io(format!("cannot create {:?}", path), e))?;
            return Ok(Self {
                file,
                hasher: Sha256::new(),
                written: 0,
            });
        };

        let owned = path.to_path_buf();
        let hasher = tokio::task::spawn_blocking(move || -> std::io::Result<Sha256> {
            let mut hasher = Sha256::new();
            let mut file = std::fs::File::open(&owned)?;
            std::io::copy(&mut file, &mut hasher)?;
            Ok(hasher)
        })
        .await
        .map_err(|e| CacheError::Io(format!("hashing task failed: {}", e)))?
        .map_err(|e| CacheError::io(format!("cannot read {:?}", path), e))?;

        let file = OpenOptions::new()
            .append(true)
            .open(path)
            .await
            .map_err(|e| CacheError::io(format!("cannot open {:?}", path), e))?;

        tracing::info!(path = ?path, resumed_bytes = len, "Resuming partial download");
        Ok(Self {
            file,
            hasher,
            written: len,
        })
    }

    async fn append(&mut self, chunk: &[u8]) -> CacheResult<()> {
        self.file
            .write_all(chunk)
            .await
            .map_err(|e| CacheError::io("cannot write download scratch file", e))?;
        self.hasher.update(chunk);
        self.written += chunk.len() as u64;
        Ok(())
    }

    /// Flush to disk and return the digest
    async fn finish(mut self) -> CacheResult<Checksum> {
        self.file
            .flush()
            .await
            .map_err(|e| CacheError::io("cannot flush download scratch file", e))?;
        self.file
            .sync_all()
            .await
            .map_err(|e| CacheError::io("cannot sync download scratch file", e))?;
        Ok(Checksum::from_digest(&self.hasher.finalize()))
    }
}

/// Fetches models into the cache, one job per key
pub struct Downloader {
    registry: Arc<ModelRegistry>,
    storage: StorageRouter,
    cache: Arc<CacheManager>,
    settings: DownloadConfig,
    flights: DashMap<ModelKey, Arc<Flight>>,
}

impl Downloader {
    pub fn new(
        registry: Arc<ModelRegistry>,
        storage: StorageRouter,
        cache: Arc<CacheManager>,
        settings: DownloadConfig,
    ) -> Self {
        Self {
            registry,
            storage,
            cache,
            settings,
            flights: DashMap::new(),
        }
    }

    /// Path of a verified cached copy, downloading it first if needed
    pub async fn ensure(
        self: &Arc<Self>,
        model_id: &str,
        variant: Option<&str>,
    ) -> CacheResult<PathBuf> {
        self.ensure_with_cancel(model_id, variant, &CancellationToken::new())
            .await
    }

    /// Like [`ensure`](Self::ensure), returning `Aborted` once `cancel` fires
    ///
    /// The shared job keeps running while any other caller still waits on it.
    pub async fn ensure_with_cancel(
        self: &Arc<Self>,
        model_id: &str,
        variant: Option<&str>,
        cancel: &CancellationToken,
    ) -> CacheResult<PathBuf> {
        let key = self.registry.key_for(model_id, variant);

        if let Some(path) = self.cached_path(&key).await? {
            tracing::debug!(model = %key, path = ?path, "Cache hit");
            crate::metrics::record_cache_hit(&key.to_string());
            return Ok(path);
        }
        crate::metrics::record_cache_miss(&key.to_string());

        let attachment = self.attach(&key);
        let mut state = attachment.flight.state.subscribe();

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(CacheError::Aborted { model: key.to_string() }),
            result = wait_terminal(&mut state) => result,
        };
        drop(attachment);
        result
    }

    /// State of the in-flight job for `key`, if one is running in this process
    pub fn subscribe(&self, key: &ModelKey) -> Option<watch::Receiver<JobState>> {
        self.flights.get(key).map(|f| f.state.subscribe())
    }

    /// Number of jobs currently running in this process
    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }

    async fn cached_path(&self, key: &ModelKey) -> CacheResult<Option<PathBuf>> {
        match self.cache.lookup(key).await? {
            Some(entry) if entry.verified => match self.cache.touch(key).await {
                Ok(entry) => Ok(Some(entry.path)),
                // Evicted between lookup and touch
                Err(CacheError::NotFound { .. }) => Ok(None),
                Err(e) => Err(e),
            },
            _ => Ok(None),
        }
    }

    /// Join the running flight for `key` or start a new one
    fn attach(self: &Arc<Self>, key: &ModelKey) -> Attachment {
        let (flight, leader) = match self.flights.entry(key.clone()) {
            Entry::Occupied(entry) => {
                let flight = Arc::clone(entry.get());
                flight.waiters.fetch_add(1, Ordering::SeqCst);
                (flight, false)
            }
            Entry::Vacant(entry) => {
                let flight = Arc::new(Flight::new());
                flight.waiters.store(1, Ordering::SeqCst);
                entry.insert(Arc::clone(&flight));
                (flight, true)
            }
        };

        if leader {
            let this = Arc::clone(self);
            let job_key = key.clone();
            let job_flight = Arc::clone(&flight);
            tokio::spawn(async move { this.run_job(job_key, job_flight).await });
        } else {
            tracing::debug!(model = %key, "Joining in-flight download");
        }

        Attachment {
            downloader: Arc::clone(self),
            key: key.clone(),
            flight,
        }
    }

    async fn run_job(self: Arc<Self>, key: ModelKey, flight: Arc<Flight>) {
        let started = Instant::now();
        let result = self.execute(&key, &flight).await;

        // Leave the table before publishing so a new caller either sees the
        // installed entry or starts a fresh job
        self.flights
            .remove_if(&key, |_, current| Arc::ptr_eq(current, &flight));

        let terminal = match result {
            Ok(path) => {
                tracing::info!(
                    model = %key,
                    path = ?path,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Model ready"
                );
                JobState::Installed(path)
            }
            Err(e) => {
                tracing::warn!(model = %key, error = %e, kind = %e.kind(), "Download failed");
                JobState::Failed(e)
            }
        };
        flight.state.send_replace(terminal);
    }

    async fn execute(&self, key: &ModelKey, flight: &Flight) -> CacheResult<PathBuf> {
        let cancel = &flight.cancel;
        let _key_lock = FileLock::acquire_cancellable(
            &self.cache.layout().key_lock_path(key),
            self.cache.lock_poll(),
            cancel,
            &key.to_string(),
        )
        .await?;

        // Another process may have installed it while we waited for the lock
        if let Some(entry) = self.cache.lookup(key).await?
            && entry.verified
        {
            tracing::debug!(model = %key, "Installed by another process");
            return Ok(self.cache.touch(key).await?.path);
        }

        let descriptor = self.registry.resolve(&key.model_id, &key.variant)?;
        let budget = self.cache.budget();
        if descriptor.size_bytes > budget {
            return Err(CacheError::InsufficientSpace {
                model: key.to_string(),
                needed: descriptor.size_bytes,
                budget,
                available: budget,
            });
        }

        let temp = self.cache.layout().temp_path(key);
        let outcome = self.fetch_and_install(&descriptor, &temp, flight).await;

        // Keep a partial after transient failures so the next attempt resumes
        if let Err(e) = &outcome
            && !e.is_retryable()
        {
            discard(&temp).await;
        }
        outcome
    }

    async fn fetch_and_install(
        &self,
        descriptor: &ModelDescriptor,
        temp: &Path,
        flight: &Flight,
    ) -> CacheResult<PathBuf> {
        let key = &descriptor.key;
        tracing::info!(
            model = %key,
            size_bytes = descriptor.size_bytes,
            sources = descriptor.sources.len(),
            "Starting download"
        );
        flight.state.send_replace(JobState::Fetching);

        let mut partial = Partial::open(temp, descriptor.size_bytes).await?;
        self.fetch_any(descriptor, &mut partial, &flight.cancel)
            .await?;

        flight.state.send_replace(JobState::Verifying);
        let actual = partial.finish().await?;
        if actual != descriptor.checksum {
            crate::metrics::record_checksum_failure(&key.to_string());
            return Err(CacheError::ChecksumMismatch {
                model: key.to_string(),
                expected: descriptor.checksum.to_string(),
                actual: actual.to_string(),
            });
        }

        let entry = self
            .cache
            .install(
                key,
                temp,
                &descriptor.file_name,
                descriptor.size_bytes,
                actual,
            )
            .await?;
        Ok(entry.path)
    }

    /// Fill `partial` from the first candidate that can serve it
    async fn fetch_any(
        &self,
        descriptor: &ModelDescriptor,
        partial: &mut Partial,
        cancel: &CancellationToken,
    ) -> CacheResult<()> {
        let mut last_unavailable: Option<CacheError> = None;

        for source in &descriptor.sources {
            let backend = match self.storage.backend_for(source) {
                Ok(backend) => backend,
                Err(e) => {
                    tracing::warn!(model = %descriptor.key, source = %source, error = %e, "Skipping source");
                    last_unavailable = Some(CacheError::unavailable(source.to_string(), e));
                    continue;
                }
            };

            match self
                .fetch_from(backend.as_ref(), source, descriptor, partial, cancel)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e @ CacheError::NotFound { .. }) => {
                    tracing::info!(
                        model = %descriptor.key,
                        source = %source,
                        error = %e,
                        "Not found at source, trying next"
                    );
                }
                Err(e @ CacheError::SourceUnavailable { .. }) => {
                    tracing::warn!(
                        model = %descriptor.key,
                        source = %source,
                        error = %e,
                        "Source unavailable after retries, trying next"
                    );
                    last_unavailable = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_unavailable.unwrap_or_else(|| {
            CacheError::not_found(
                descriptor.key.to_string(),
                format!("absent from all {} sources", descriptor.sources.len()),
            )
        }))
    }

    /// Stream one source into `partial`, resuming after transient failures
    async fn fetch_from(
        &self,
        backend: &dyn StorageBackend,
        source: &SourceUri,
        descriptor: &ModelDescriptor,
        partial: &mut Partial,
        cancel: &CancellationToken,
    ) -> CacheResult<()> {
        let backend_name = backend.kind().to_string();
        let mut attempt = 0u32;

        loop {
            let offset = partial.written;
            match self
                .stream_once(backend, source, descriptor, partial, cancel)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) => {
                    // Progress earns a fresh retry allowance
                    if partial.written > offset {
                        attempt = 0;
                    }
                    if !e.is_retryable() || attempt >= self.settings.max_retries {
                        return Err(e);
                    }
                    attempt += 1;
                    let delay = self.settings.backoff(attempt);
                    tracing::warn!(
                        model = %descriptor.key,
                        source = %source,
                        attempt,
                        resume_at = partial.written,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient fetch failure, retrying"
                    );
                    crate::metrics::record_fetch_retry(&backend_name);
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(CacheError::Aborted { model: descriptor.key.to_string() });
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// One request: `Ok` only once all expected bytes are written
    async fn stream_once(
        &self,
        backend: &dyn StorageBackend,
        source: &SourceUri,
        descriptor: &ModelDescriptor,
        partial: &mut Partial,
        cancel: &CancellationToken,
    ) -> CacheResult<()> {
        let expected = descriptor.size_bytes;
        if partial.written >= expected {
            return Ok(());
        }

        let start = partial.written;
        let mut stream = backend.fetch(source, ByteRange::from(start)).await?;

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(CacheError::Aborted { model: descriptor.key.to_string() });
                }
                next = stream.next() => next,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk?;

            if partial.written + chunk.len() as u64 > expected {
                crate::metrics::record_checksum_failure(&descriptor.key.to_string());
                return Err(CacheError::ChecksumMismatch {
                    model: descriptor.key.to_string(),
                    expected: descriptor.checksum.to_string(),
                    actual: format!(
                        "unknown (source sent more than the expected {} bytes)",
                        expected
                    ),
                });
            }
            partial.append(&chunk).await?;
            crate::metrics::record_downloaded_bytes(&backend.kind().to_string(), chunk.len() as u64);
        }

        tracing::debug!(
            model = %descriptor.key,
            source = %source,
            bytes = partial.written - start,
            total = partial.written,
            "Stream ended"
        );

        if partial.written < expected {
            return Err(CacheError::unavailable(
                source.to_string(),
                format!(
                    "stream ended after {} of {} bytes",
                    partial.written, expected
                ),
            ));
        }
        Ok(())
    }
}

/// Wait for the job behind `state` to finish
async fn wait_terminal(state: &mut watch::Receiver<JobState>) -> CacheResult<PathBuf> {
    loop {
        let current = state.borrow_and_update().clone();
        match current {
            JobState::Installed(path) => return Ok(path),
            JobState::Failed(e) => return Err(e),
            _ => {}
        }
        if state.changed().await.is_err() {
            return Err(CacheError::Io(
                "download job ended without publishing a result".to_string(),
            ));
        }
    }
}

async fn discard(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::debug!(path = ?path, "Removed download scratch file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = ?path, error = %e, "Failed to remove download scratch file"),
    }
}
