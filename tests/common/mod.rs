//! Shared helpers for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use model_cache::config::{CacheConfig, DownloadConfig, ModelConfig};
use model_cache::models::BackendKind;
use model_cache::storage::{ByteRange, ByteStream, StorageBackend, StorageRouter};
use model_cache::{CacheError, CacheResult, ModelService, SourceUri};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Injected misbehaviour for the next fetch
#[derive(Debug, Clone, Copy)]
pub enum Fault {
    /// Send this many bytes, then fail the stream
    CutAfter(usize),
    /// Fail the request outright
    Unavailable,
    /// Send this many bytes, then hang
    StallAfter(usize),
}

/// In-memory source keyed by URI string
pub struct MemoryBackend {
    objects: Mutex<HashMap<String, Bytes>>,
    faults: Mutex<VecDeque<Fault>>,
    ranges: Mutex<Vec<ByteRange>>,
    fetches: AtomicUsize,
    delay: Duration,
    chunk_size: usize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    /// Each fetch waits `delay` before streaming
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            faults: Mutex::new(VecDeque::new()),
            ranges: Mutex::new(Vec::new()),
            fetches: AtomicUsize::new(0),
            delay,
            chunk_size: 4,
        }
    }

    pub fn put(&self, uri: &str, data: impl Into<Bytes>) {
        self.objects
            .lock()
            .unwrap()
            .insert(uri.to_string(), data.into());
    }

    pub fn push_fault(&self, fault: Fault) {
        self.faults.lock().unwrap().push_back(fault);
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn ranges(&self) -> Vec<ByteRange> {
        self.ranges.lock().unwrap().clone()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Http
    }

    async fn fetch(&self, uri: &SourceUri, range: ByteRange) -> CacheResult<ByteStream> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.ranges.lock().unwrap().push(range);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let data = self
            .objects
            .lock()
            .unwrap()
            .get(&uri.to_string())
            .cloned()
            .ok_or_else(|| CacheError::NotFound {
                model: uri.to_string(),
                reason: "no such object".to_string(),
            })?;
        let start = (range.start as usize).min(data.len());
        let end = range.end.map_or(data.len(), |e| (e as usize).min(data.len()));
        let body = data.slice(start..end);

        let chunks: Vec<CacheResult<Bytes>> = body
            .chunks(self.chunk_size)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();

        let fault = self.faults.lock().unwrap().pop_front();
        let unavailable = || CacheError::SourceUnavailable {
            uri: uri.to_string(),
            reason: "injected fault".to_string(),
        };
        let stream: ByteStream = match fault {
            None => Box::pin(futures::stream::iter(chunks)),
            Some(Fault::Unavailable) => return Err(unavailable()),
            Some(Fault::CutAfter(n)) => {
                let head = body.slice(..n.min(body.len()));
                Box::pin(futures::stream::iter(vec![Ok(head), Err(unavailable())]))
            }
            Some(Fault::StallAfter(n)) => {
                let head = body.slice(..n.min(body.len()));
                Box::pin(
                    futures::stream::iter(vec![Ok(head)]).chain(futures::stream::pending()),
                )
            }
        };
        Ok(stream)
    }

    async fn exists(&self, uri: &SourceUri) -> CacheResult<bool> {
        Ok(self.objects.lock().unwrap().contains_key(&uri.to_string()))
    }

    async fn size(&self, uri: &SourceUri) -> CacheResult<u64> {
        self.objects
            .lock()
            .unwrap()
            .get(&uri.to_string())
            .map(|d| d.len() as u64)
            .ok_or_else(|| CacheError::NotFound {
                model: uri.to_string(),
                reason: "no such object".to_string(),
            })
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// URI the registry entry for `id` points at
pub fn source_for(id: &str) -> String {
    format!("https://models.test/{}/model.bin", id)
}

/// Registry entry for `data` served from [`source_for`]
pub fn model(id: &str, data: &[u8]) -> ModelConfig {
    ModelConfig {
        id: id.to_string(),
        variant: "fp16".to_string(),
        size: data.len() as u64,
        sha256: sha256_hex(data),
        sources: vec![source_for(id)],
        file_name: None,
    }
}

pub fn config(root: &Path, budget_bytes: u64, models: Vec<ModelConfig>) -> CacheConfig {
    CacheConfig {
        cache_root: root.to_path_buf(),
        budget_bytes,
        orphan_grace_secs: 3600,
        download: DownloadConfig {
            max_retries: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            lock_poll_ms: 5,
        },
        models,
        ..Default::default()
    }
}

pub async fn service(config: &CacheConfig, backend: &Arc<MemoryBackend>) -> ModelService {
    let router = StorageRouter::new().with_backend(backend.clone());
    ModelService::with_storage(config, router)
        .await
        .expect("service should build")
}
