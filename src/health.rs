//! Startup health gate for required models
//!
//! Lookup only: a check never downloads and never hashes. Corruption is found by
//! `verify`, which records an unverified entry that the next check reports.

use crate::cache::CacheManager;
use crate::error::CacheResult;
use crate::models::ModelKey;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Why a required model fails the check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingReason {
    /// No cache entry, or its file is gone
    Missing,
    /// Entry present but its last verification failed
    Unverified,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MissingModel {
    pub key: ModelKey,
    pub reason: MissingReason,
}

impl fmt::Display for MissingModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason {
            MissingReason::Missing => write!(f, "{}: missing", self.key),
            MissingReason::Unverified => write!(f, "{}: present but unverified", self.key),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "missing", rename_all = "snake_case")]
pub enum HealthStatus {
    Ok,
    Degraded(Vec<MissingModel>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    #[serde(flatten)]
    pub status: HealthStatus,
    /// Number of required models checked
    pub checked: usize,
}

impl HealthReport {
    pub fn is_ok(&self) -> bool {
        matches!(self.status, HealthStatus::Ok)
    }

    pub fn missing(&self) -> &[MissingModel] {
        match &self.status {
            HealthStatus::Ok => &[],
            HealthStatus::Degraded(missing) => missing,
        }
    }
}

/// Checks that required models are cached and verified
pub struct HealthChecker {
    cache: Arc<CacheManager>,
}

impl HealthChecker {
    pub fn new(cache: Arc<CacheManager>) -> Self {
        Self { cache }
    }

    pub async fn check(&self, required: &[ModelKey]) -> CacheResult<HealthReport> {
        let mut missing = Vec::new();

        for key in required {
            let reason = match self.cache.lookup(key).await? {
                Some(entry) if entry.verified => continue,
                Some(_) => MissingReason::Unverified,
                None => MissingReason::Missing,
            };
            tracing::warn!(model = %key, reason = ?reason, "Required model not ready");
            missing.push(MissingModel {
                key: key.clone(),
                reason,
            });
        }

        let status = if missing.is_empty() {
            tracing::info!(checked = required.len(), "All required models present");
            HealthStatus::Ok
        } else {
            HealthStatus::Degraded(missing)
        };

        Ok(HealthReport {
            status,
            checked: required.len(),
        })
    }
}
