//! model-cache - Local cache for large model artifacts
//!
//! Resolves model identifiers to source locations, downloads each artifact at
//! most once even under concurrent demand, verifies its checksum, and keeps the
//! cache under a size budget with LRU eviction.

pub mod cache;
pub mod config;
pub mod download;
pub mod error;
pub mod health;
pub mod metrics;
pub mod models;
pub mod service;
pub mod storage;

pub use cache::{CacheEntry, CacheManager, CacheSettings, RecoveryReport};
pub use config::{CacheConfig, DownloadConfig, ModelConfig, StorageConfig};
pub use download::{Downloader, JobState};
pub use error::{CacheError, CacheResult, ErrorKind};
pub use health::{HealthChecker, HealthReport, HealthStatus, MissingModel, MissingReason};
pub use models::{Checksum, ModelDescriptor, ModelKey, ModelRegistry, SourceUri};
pub use service::ModelService;
pub use storage::{ByteRange, ByteStream, StorageBackend, StorageRouter};
