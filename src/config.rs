//! Configuration structures and loading logic

use crate::models::{DEFAULT_VARIANT, ModelKey, ModelRegistry};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main cache configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory holding the index, cached models, locks and scratch files
    pub cache_root: PathBuf,
    /// Upper bound on the total size of cached entries
    pub budget_bytes: u64,
    /// Models that must be present and verified for the health check to pass
    /// (`model_id` or `model_id:variant`)
    pub required_models: Vec<String>,
    /// Scratch files older than this are purged by the recovery pass
    pub orphan_grace_secs: u64,
    pub download: DownloadConfig,
    pub storage: StorageConfig,
    pub models: Vec<ModelConfig>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_root: default_cache_root(),
            budget_bytes: default_budget_bytes(),
            required_models: Vec::new(),
            orphan_grace_secs: default_orphan_grace_secs(),
            download: DownloadConfig::default(),
            storage: StorageConfig::default(),
            models: Vec::new(),
        }
    }
}

impl CacheConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content).context("Failed to parse TOML config")?
        } else {
            Self::default()
        };

        config.apply_env_overrides()?;

        Ok(config)
    }

    /// Apply `MODEL_CACHE_*` environment overrides
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(root) = std::env::var("MODEL_CACHE_ROOT") {
            self.cache_root = PathBuf::from(root);
        }
        if let Ok(budget) = std::env::var("MODEL_CACHE_BUDGET_BYTES") {
            self.budget_bytes = budget
                .trim()
                .parse()
                .context("Invalid MODEL_CACHE_BUDGET_BYTES value")?;
        }
        if let Ok(required) = std::env::var("MODEL_CACHE_REQUIRED_MODELS") {
            self.required_models = required
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Ok(grace) = std::env::var("MODEL_CACHE_ORPHAN_GRACE_SECS") {
            self.orphan_grace_secs = grace
                .trim()
                .parse()
                .context("Invalid MODEL_CACHE_ORPHAN_GRACE_SECS value")?;
        }
        if let Ok(retries) = std::env::var("MODEL_CACHE_MAX_RETRIES") {
            self.download.max_retries = retries
                .trim()
                .parse()
                .context("Invalid MODEL_CACHE_MAX_RETRIES value")?;
        }
        if let Ok(root) = std::env::var("MODEL_CACHE_LOCAL_ROOT") {
            self.storage.local = Some(LocalStorageConfig {
                root: PathBuf::from(root),
            });
        }
        if let Ok(endpoint) = std::env::var("MODEL_CACHE_S3_ENDPOINT") {
            let store = self
                .storage
                .object_store
                .get_or_insert_with(ObjectStoreConfig::default);
            store.endpoint = endpoint;
        }
        if let Ok(region) = std::env::var("MODEL_CACHE_S3_REGION") {
            let store = self
                .storage
                .object_store
                .get_or_insert_with(ObjectStoreConfig::default);
            store.region = region;
        }
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.budget_bytes == 0 {
            anyhow::bail!("budget_bytes must be greater than zero");
        }
        if self.cache_root.as_os_str().is_empty() {
            anyhow::bail!("cache_root cannot be empty");
        }

        if let Some(store) = &self.storage.object_store
            && !(store.endpoint.starts_with("http://") || store.endpoint.starts_with("https://"))
        {
            anyhow::bail!(
                "object store endpoint must be an http(s) URL (got '{}')",
                store.endpoint
            );
        }

        // Registry rules (duplicates, checksums, URIs) live in one place
        ModelRegistry::from_config(&self.models).context("Invalid [[models]] entry")?;

        self.required_keys()?;

        for model in &self.models {
            if model.size > self.budget_bytes {
                tracing::warn!(
                    model = %model.id,
                    variant = %model.variant,
                    size = model.size,
                    budget = self.budget_bytes,
                    "Model is larger than the cache budget and can never be installed"
                );
            }
        }

        Ok(())
    }

    /// Parsed `required_models`
    pub fn required_keys(&self) -> Result<Vec<ModelKey>> {
        self.required_models
            .iter()
            .map(|raw| {
                raw.parse::<ModelKey>()
                    .with_context(|| format!("Invalid required model '{}'", raw))
            })
            .collect()
    }

    pub fn orphan_grace(&self) -> Duration {
        Duration::from_secs(self.orphan_grace_secs)
    }
}

/// Retry, backoff and lock polling for downloads
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct DownloadConfig {
    /// Retries per source after the first attempt
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// How often a waiter re-checks a lock held by another process
    pub lock_poll_ms: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            lock_poll_ms: default_lock_poll_ms(),
        }
    }
}

impl DownloadConfig {
    /// Exponential backoff before retry `attempt` (1-based), capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(20);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }

    pub fn lock_poll(&self) -> Duration {
        Duration::from_millis(self.lock_poll_ms.max(1))
    }
}

/// Source storage locations
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local: Option<LocalStorageConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_store: Option<ObjectStoreConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpStorageConfig>,
}

/// Filesystem source root (e.g., a mounted NFS share)
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct LocalStorageConfig {
    pub root: PathBuf,
}

/// S3-compatible object store
///
/// Credentials are never stored here, only the names of the environment
/// variables they are read from at request time.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ObjectStoreConfig {
    pub endpoint: String,
    pub region: String,
    pub access_key_env: String,
    pub secret_key_env: String,
    pub session_token_env: String,
    /// Skip signing (public buckets)
    pub anonymous: bool,
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://s3.amazonaws.com".to_string(),
            region: default_region(),
            access_key_env: "AWS_ACCESS_KEY_ID".to_string(),
            secret_key_env: "AWS_SECRET_ACCESS_KEY".to_string(),
            session_token_env: "AWS_SESSION_TOKEN".to_string(),
            anonymous: false,
        }
    }
}

/// Plain HTTP(S) sources
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct HttpStorageConfig {
    /// Environment variable holding a bearer token (e.g., "HF_TOKEN")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bearer_token_env: Option<String>,
}

/// One `[[models]]` registry entry
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ModelConfig {
    pub id: String,

    #[serde(default = "default_variant")]
    pub variant: String,

    /// Expected size in bytes
    pub size: u64,

    /// Expected SHA-256 (`sha256:<hex>` or bare hex)
    pub sha256: String,

    /// Candidate sources in preference order
    pub sources: Vec<String>,

    /// Cached file name, defaults to the first source's last path segment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

// Default functions
fn default_cache_root() -> PathBuf {
    dirs::cache_dir()
        .map(|d| d.join("model-cache"))
        .unwrap_or_else(|| PathBuf::from("/var/cache/model-cache"))
}
fn default_budget_bytes() -> u64 {
    100 * 1024 * 1024 * 1024
}
fn default_orphan_grace_secs() -> u64 {
    3600
}
fn default_max_retries() -> u32 {
    5
}
fn default_initial_backoff_ms() -> u64 {
    500
}
fn default_max_backoff_ms() -> u64 {
    30_000
}
fn default_lock_poll_ms() -> u64 {
    200
}
fn default_region() -> String {
    "us-east-1".to_string()
}
fn default_variant() -> String {
    DEFAULT_VARIANT.to_string()
}
