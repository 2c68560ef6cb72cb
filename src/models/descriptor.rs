//! Model keys, checksums, source URIs and resolved descriptors

use crate::error::{CacheError, CacheResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Variant used when a caller does not name one
pub const DEFAULT_VARIANT: &str = "default";

/// Identifier + format/variant tag of a single artifact
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModelKey {
    /// Model identifier (e.g., "BAAI/bge-small-en-v1.5")
    pub model_id: String,
    /// Format/precision tag (e.g., "fp16", "q4_k_m.gguf")
    pub variant: String,
}

impl ModelKey {
    pub fn new(model_id: impl Into<String>, variant: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            variant: variant.into(),
        }
    }

    /// Filesystem-safe stem shared by cache paths, lock files and temp files
    ///
    /// Uses the HuggingFace `models--{org}--{name}` convention for the identifier.
    pub fn cache_stem(&self) -> String {
        model_id_to_cache_name(&self.model_id)
    }

    /// Name used for per-key lock and scratch files
    pub fn file_stem(&self) -> String {
        format!("{}--{}", self.cache_stem(), self.variant)
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.model_id, self.variant)
    }
}

impl FromStr for ModelKey {
    type Err = CacheError;

    /// Parse `model_id[:variant]`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (model_id, variant) = match s.rsplit_once(':') {
            Some((id, variant)) => (id, variant),
            None => (s, DEFAULT_VARIANT),
        };
        if model_id.is_empty() || variant.is_empty() {
            return Err(CacheError::Config(format!("invalid model key '{}'", s)));
        }
        Ok(Self::new(model_id, variant))
    }
}

/// Convert model ID to cache directory name
///
/// e.g., "BAAI/bge-small-en-v1.5" -> "models--BAAI--bge-small-en-v1.5"
pub(crate) fn model_id_to_cache_name(model_id: &str) -> String {
    format!("models--{}", model_id.replace('/', "--"))
}

/// Expected content hash (SHA-256)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Checksum(String);

impl Checksum {
    /// Accepts `sha256:<hex>` or bare 64-character hex
    pub fn parse(raw: &str) -> CacheResult<Self> {
        let hex = raw.trim().strip_prefix("sha256:").unwrap_or(raw.trim());
        if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(CacheError::Config(format!(
                "invalid sha256 checksum '{}'",
                raw
            )));
        }
        Ok(Self(hex.to_ascii_lowercase()))
    }

    pub fn from_digest(digest: &[u8]) -> Self {
        Self(hex::encode(digest))
    }

    pub fn as_hex(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha256:{}", self.0)
    }
}

impl TryFrom<String> for Checksum {
    type Error = CacheError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Checksum> for String {
    fn from(value: Checksum) -> Self {
        value.to_string()
    }
}

/// Backend family a source URI is served by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Local,
    ObjectStore,
    Http,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::ObjectStore => write!(f, "object_store"),
            Self::Http => write!(f, "http"),
        }
    }
}

/// A candidate location an artifact can be fetched from
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SourceUri {
    /// Path relative to the local storage root
    Local { path: String },
    /// `s3://bucket/key`
    ObjectStore { bucket: String, key: String },
    /// Plain `http(s)://` URL
    Http { url: String },
}

impl SourceUri {
    pub fn parse(raw: &str) -> CacheResult<Self> {
        let raw = raw.trim();
        if let Some(rest) = raw.strip_prefix("s3://") {
            let (bucket, key) = rest
                .split_once('/')
                .filter(|(b, k)| !b.is_empty() && !k.is_empty())
                .ok_or_else(|| {
                    CacheError::Config(format!("object store URI '{}' needs bucket and key", raw))
                })?;
            return Ok(Self::ObjectStore {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }
        if raw.starts_with("http://") || raw.starts_with("https://") {
            return Ok(Self::Http {
                url: raw.to_string(),
            });
        }
        let path = raw.strip_prefix("file://").unwrap_or(raw);
        if path.is_empty() || path.contains("://") {
            return Err(CacheError::Config(format!("unsupported source URI '{}'", raw)));
        }
        Ok(Self::Local {
            path: path.to_string(),
        })
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Local { .. } => BackendKind::Local,
            Self::ObjectStore { .. } => BackendKind::ObjectStore,
            Self::Http { .. } => BackendKind::Http,
        }
    }

    /// Last path segment, used as the cached file name
    pub fn file_name(&self) -> Option<&str> {
        let path = match self {
            Self::Local { path } => path.as_str(),
            Self::ObjectStore { key, .. } => key.as_str(),
            Self::Http { url } => url.split(['?', '#']).next().unwrap_or(url),
        };
        path.rsplit('/').next().filter(|name| !name.is_empty())
    }
}

impl fmt::Display for SourceUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local { path } => write!(f, "file://{}", path),
            Self::ObjectStore { bucket, key } => write!(f, "s3://{}/{}", bucket, key),
            Self::Http { url } => f.write_str(url),
        }
    }
}

/// Fully resolved model: where to get it and what it must hash to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelDescriptor {
    pub key: ModelKey,
    pub size_bytes: u64,
    pub checksum: Checksum,
    /// Candidate sources in preference order
    pub sources: Vec<SourceUri>,
    /// File name inside the cache entry directory
    pub file_name: String,
}
