//! Model registry: maps (identifier, variant) to candidate sources and expected content

use super::descriptor::{Checksum, DEFAULT_VARIANT, ModelDescriptor, ModelKey, SourceUri};
use crate::config::ModelConfig;
use crate::error::{CacheError, CacheResult};
use std::collections::BTreeMap;

/// Immutable registry built once from configuration
///
/// Candidate order is the order sources were configured in.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    models: BTreeMap<ModelKey, ModelDescriptor>,
}

impl ModelRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Build and validate a registry from `[[models]]` config entries
    pub fn from_config(models: &[ModelConfig]) -> CacheResult<Self> {
        let mut registry = Self::new();
        for model in models {
            registry.insert(descriptor_from_config(model)?)?;
        }
        tracing::debug!(models = registry.count(), "Model registry built");
        Ok(registry)
    }

    /// Add a descriptor, rejecting duplicate or unaddressable keys
    pub fn insert(&mut self, descriptor: ModelDescriptor) -> CacheResult<()> {
        validate_key(&descriptor.key)?;
        if self.models.contains_key(&descriptor.key) {
            return Err(CacheError::Config(format!(
                "duplicate registry entry for '{}'",
                descriptor.key
            )));
        }
        self.models.insert(descriptor.key.clone(), descriptor);
        Ok(())
    }

    /// Resolve an identifier/variant pair
    pub fn resolve(&self, model_id: &str, variant: &str) -> CacheResult<ModelDescriptor> {
        let key = ModelKey::new(model_id, variant);
        self.models.get(&key).cloned().ok_or_else(|| {
            let known = self.variants(model_id);
            let reason = if known.is_empty() {
                "identifier is not configured in the registry".to_string()
            } else {
                format!("variant not configured (known: {})", known.join(", "))
            };
            CacheError::not_found(key.to_string(), reason)
        })
    }

    /// Resolve without an explicit variant
    ///
    /// Picks the only configured variant when there is exactly one, otherwise
    /// falls back to the default variant name.
    pub fn resolve_default(&self, model_id: &str) -> CacheResult<ModelDescriptor> {
        let variants = self.variants(model_id);
        match variants.as_slice() {
            [only] => self.resolve(model_id, only),
            _ => self.resolve(model_id, DEFAULT_VARIANT),
        }
    }

    /// Key a caller means when it gives an optional variant
    pub fn key_for(&self, model_id: &str, variant: Option<&str>) -> ModelKey {
        match variant {
            Some(v) => ModelKey::new(model_id, v),
            None => match self.variants(model_id).as_slice() {
                [only] => ModelKey::new(model_id, only.as_str()),
                _ => ModelKey::new(model_id, DEFAULT_VARIANT),
            },
        }
    }

    /// Parse `model_id[:variant]`, filling a missing variant the way [`Self::key_for`] does
    pub fn parse_key(&self, raw: &str) -> CacheResult<ModelKey> {
        let key: ModelKey = raw.parse()?;
        if raw.contains(':') {
            Ok(key)
        } else {
            Ok(self.key_for(&key.model_id, None))
        }
    }

    /// Configured variants of an identifier, sorted
    pub fn variants(&self, model_id: &str) -> Vec<String> {
        self.models
            .keys()
            .filter(|k| k.model_id == model_id)
            .map(|k| k.variant.clone())
            .collect()
    }

    /// All descriptors, sorted by key
    pub fn list(&self) -> Vec<&ModelDescriptor> {
        self.models.values().collect()
    }

    pub fn contains(&self, key: &ModelKey) -> bool {
        self.models.contains_key(key)
    }

    pub fn count(&self) -> usize {
        self.models.len()
    }
}

/// Keys must map to distinct cache stems and survive `id:variant` parsing
///
/// The stem joins id segments and the variant with `--`, so no component may
/// contain `--`, be empty, or begin or end with `-`.
fn validate_key(key: &ModelKey) -> CacheResult<()> {
    let invalid = |what: &str| -> CacheResult<()> {
        Err(CacheError::Config(format!(
            "'{}:{}': {}",
            key.model_id, key.variant, what
        )))
    };

    if key.model_id.is_empty() {
        return invalid("model id cannot be empty");
    }
    if key.model_id.contains("..") || key.model_id.starts_with('/') {
        return invalid("model id cannot contain '..' or start with '/'");
    }
    if key.model_id.contains([':', '\\']) {
        return invalid("model id cannot contain ':' or '\\'");
    }
    if key.variant.is_empty() || key.variant.contains(['/', '\\', ':']) || key.variant == ".." {
        return invalid("variant must be a non-empty name without separators");
    }

    let ambiguous = |part: &str| {
        part.is_empty() || part.contains("--") || part.starts_with('-') || part.ends_with('-')
    };
    if key.model_id.split('/').any(ambiguous) {
        return invalid("model id segments cannot be empty, contain '--', or begin or end with '-'");
    }
    if ambiguous(key.variant.as_str()) {
        return invalid("variant cannot contain '--' or begin or end with '-'");
    }
    Ok(())
}

fn descriptor_from_config(model: &ModelConfig) -> CacheResult<ModelDescriptor> {
    let key = ModelKey::new(model.id.trim(), model.variant.trim());

    if model.sources.is_empty() {
        return Err(CacheError::Config(format!("'{}' has no sources", key)));
    }

    let sources = model
        .sources
        .iter()
        .map(|s| SourceUri::parse(s))
        .collect::<CacheResult<Vec<_>>>()?;

    let checksum = Checksum::parse(&model.sha256)
        .map_err(|e| CacheError::Config(format!("'{}': {}", key, e)))?;

    let file_name = match &model.file_name {
        Some(name) => name.clone(),
        None => sources[0]
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| {
                CacheError::Config(format!(
                    "'{}': cannot derive a file name from '{}', set file_name",
                    key, sources[0]
                ))
            })?,
    };
    if file_name.contains(['/', '\\']) || file_name.starts_with('.') {
        return Err(CacheError::Config(format!(
            "'{}': invalid file name '{}'",
            key, file_name
        )));
    }

    Ok(ModelDescriptor {
        key,
        size_bytes: model.size,
        checksum,
        sources,
        file_name,
    })
}
