//! Wiring of the cache components from configuration

use crate::cache::{CacheManager, CacheSettings, RecoveryReport};
use crate::config::CacheConfig;
use crate::download::Downloader;
use crate::error::CacheResult;
use crate::health::{HealthChecker, HealthReport};
use crate::models::{ModelKey, ModelRegistry};
use crate::storage::StorageRouter;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Registry, cache, downloader and health checker sharing one cache root
///
/// Constructed explicitly and passed around; there is no global instance.
pub struct ModelService {
    registry: Arc<ModelRegistry>,
    cache: Arc<CacheManager>,
    downloader: Arc<Downloader>,
    health: HealthChecker,
    required: Vec<ModelKey>,
}

impl ModelService {
    /// Build every component from configuration
    pub async fn from_config(config: &CacheConfig) -> CacheResult<Self> {
        let storage = StorageRouter::from_config(&config.storage)?;
        Self::with_storage(config, storage).await
    }

    /// Build with a caller-supplied storage router
    ///
    /// Runs a recovery pass on the cache before returning.
    pub async fn with_storage(config: &CacheConfig, storage: StorageRouter) -> CacheResult<Self> {
        let registry = Arc::new(ModelRegistry::from_config(&config.models)?);
        // Bare identifiers resolve to the same variant a bare `ensure` would fetch
        let required = config
            .required_models
            .iter()
            .map(|raw| registry.parse_key(raw))
            .collect::<CacheResult<Vec<_>>>()?;

        let cache = Arc::new(CacheManager::open(CacheSettings::from_config(config)).await?);
        cache.recover().await?;

        let downloader = Arc::new(Downloader::new(
            Arc::clone(&registry),
            storage,
            Arc::clone(&cache),
            config.download.clone(),
        ));
        let health = HealthChecker::new(Arc::clone(&cache));

        tracing::info!(
            models = registry.count(),
            required = required.len(),
            "Model service ready"
        );

        Ok(Self {
            registry,
            cache,
            downloader,
            health,
            required,
        })
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    pub fn downloader(&self) -> &Arc<Downloader> {
        &self.downloader
    }

    pub fn required(&self) -> &[ModelKey] {
        &self.required
    }

    pub async fn ensure(&self, model_id: &str, variant: Option<&str>) -> CacheResult<PathBuf> {
        self.downloader.ensure(model_id, variant).await
    }

    pub async fn ensure_with_cancel(
        &self,
        model_id: &str,
        variant: Option<&str>,
        cancel: &CancellationToken,
    ) -> CacheResult<PathBuf> {
        self.downloader
            .ensure_with_cancel(model_id, variant, cancel)
            .await
    }

    /// Check the configured required models
    pub async fn health(&self) -> CacheResult<HealthReport> {
        self.health.check(&self.required).await
    }

    pub async fn recover(&self) -> CacheResult<RecoveryReport> {
        self.cache.recover().await
    }

    /// Key for a CLI-style identifier and optional variant
    pub fn key_for(&self, model_id: &str, variant: Option<&str>) -> ModelKey {
        self.registry.key_for(model_id, variant)
    }
}
