//! Source storage backends
//!
//! Every backend serves byte ranges of an artifact addressed by a [`SourceUri`].
//! The [`StorageRouter`] picks the backend configured for a URI's kind.

use crate::config::StorageConfig;
use crate::error::{CacheError, CacheResult};
use crate::models::{BackendKind, SourceUri};
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use futures::StreamExt;
use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

pub mod http;
pub mod local;
pub mod object_store;
pub mod sigv4;

pub use http::HttpStorage;
pub use local::LocalStorage;
pub use object_store::{CredentialsRef, ObjectStoreStorage};

/// Stream of artifact bytes
pub type ByteStream = Pin<Box<dyn Stream<Item = CacheResult<Bytes>> + Send>>;

/// Half-open byte range `[start, end)`; `end = None` reads to the end
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    /// The whole object
    pub fn full() -> Self {
        Self::default()
    }

    /// Everything from `start` on, used to resume
    pub fn from(start: u64) -> Self {
        Self { start, end: None }
    }

    pub fn is_full(&self) -> bool {
        self.start == 0 && self.end.is_none()
    }

    /// HTTP `Range` header value (`bytes=start-` or `bytes=start-last`)
    pub fn header_value(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end.saturating_sub(1)),
            None => format!("bytes={}-", self.start),
        }
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            Some(end) => write!(f, "{}..{}", self.start, end),
            None => write!(f, "{}..", self.start),
        }
    }
}

/// Uniform read access to a source location
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Backend family, for logs and routing
    fn kind(&self) -> BackendKind;

    /// Stream the requested byte range
    async fn fetch(&self, uri: &SourceUri, range: ByteRange) -> CacheResult<ByteStream>;

    /// Check whether the object exists
    async fn exists(&self, uri: &SourceUri) -> CacheResult<bool>;

    /// Object size in bytes
    async fn size(&self, uri: &SourceUri) -> CacheResult<u64>;
}

/// Dispatches source URIs to the backend configured for their kind
#[derive(Default, Clone)]
pub struct StorageRouter {
    backends: HashMap<BackendKind, Arc<dyn StorageBackend>>,
}

impl StorageRouter {
    /// Create a router with no backends
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the backends named in configuration
    ///
    /// The HTTP backend is always available; it only needs configuration for
    /// authenticated sources.
    pub fn from_config(config: &StorageConfig) -> CacheResult<Self> {
        let mut router = Self::new();

        if let Some(local) = &config.local {
            router = router.with_backend(Arc::new(LocalStorage::new(local.root.clone())));
        }
        if let Some(store) = &config.object_store {
            router = router.with_backend(Arc::new(ObjectStoreStorage::from_config(store)?));
        }
        let bearer_env = config
            .http
            .as_ref()
            .and_then(|h| h.bearer_token_env.clone());
        router = router.with_backend(Arc::new(HttpStorage::new(bearer_env)?));

        Ok(router)
    }

    /// Register (or replace) the backend for its kind
    pub fn with_backend(mut self, backend: Arc<dyn StorageBackend>) -> Self {
        self.backends.insert(backend.kind(), backend);
        self
    }

    /// Backend serving `uri`
    pub fn backend_for(&self, uri: &SourceUri) -> CacheResult<Arc<dyn StorageBackend>> {
        self.backends.get(&uri.kind()).cloned().ok_or_else(|| {
            CacheError::Config(format!(
                "no {} storage backend configured for '{}'",
                uri.kind(),
                uri
            ))
        })
    }

    pub async fn fetch(&self, uri: &SourceUri, range: ByteRange) -> CacheResult<ByteStream> {
        self.backend_for(uri)?.fetch(uri, range).await
    }

    pub async fn exists(&self, uri: &SourceUri) -> CacheResult<bool> {
        self.backend_for(uri)?.exists(uri).await
    }

    pub async fn size(&self, uri: &SourceUri) -> CacheResult<u64> {
        self.backend_for(uri)?.size(uri).await
    }
}

/// Drop the first `skip` bytes of a stream
///
/// Used when a server answers a range request with the full body.
pub(crate) fn skip_prefix(stream: ByteStream, skip: u64) -> ByteStream {
    if skip == 0 {
        return stream;
    }
    let mut remaining = skip;
    Box::pin(stream.filter_map(move |chunk| {
        let out = match chunk {
            Ok(mut bytes) if remaining > 0 => {
                let n = remaining.min(bytes.len() as u64);
                remaining -= n;
                let _ = bytes.split_to(n as usize);
                (!bytes.is_empty()).then_some(Ok(bytes))
            }
            other => Some(other),
        };
        futures::future::ready(out)
    }))
}
