//! Session configuration.

use serde::{Deserialize, Serialize};

use crate::error::RuntimeError;

/// Merge engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Accept records for a validated entity without writing anything.
    pub honor_entity_validation: bool,
    /// Number of striped locks serializing read-merge-save per entity.
    pub lock_stripes: usize,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            honor_entity_validation: true,
            lock_stripes: 64,
        }
    }
}

/// Pipeline configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Number of merge workers.
    pub workers: usize,
    /// Maximum records in flight (queued, suspended or merging).
    pub queue_capacity: usize,
    /// Age after which `Session::expire_stale` gives up on a pending
    /// identifier. `None` disables expiry.
    pub pending_timeout_ms: Option<u64>,
    pub merge: MergeConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 4096,
            pending_timeout_ms: None,
            merge: MergeConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Parses and validates a JSON configuration document. Missing keys keep
    /// their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, RuntimeError> {
        let config: Self = serde_json::from_str(json).map_err(|e| RuntimeError::InvalidConfig {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects zero-sized pools.
    pub fn validate(&self) -> Result<(), RuntimeError> {
        let invalid = |reason: &str| {
            Err(RuntimeError::InvalidConfig {
                reason: reason.to_string(),
            })
        };
        if self.workers == 0 {
            return invalid("workers must be at least 1");
        }
        if self.queue_capacity == 0 {
            return invalid("queue_capacity must be at least 1");
        }
        if self.merge.lock_stripes == 0 {
            return invalid("merge.lock_stripes must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.merge.honor_entity_validation);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = PipelineConfig::from_json_str(r#"{"workers": 2, "merge": {"lock_stripes": 8}}"#).unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.queue_capacity, 4096);
        assert_eq!(config.merge.lock_stripes, 8);
        assert!(config.merge.honor_entity_validation);
    }

    #[test]
    fn zero_workers_rejected() {
        let err = PipelineConfig::from_json_str(r#"{"workers": 0}"#).unwrap_err();
        assert!(err.to_string().contains("workers"));
        assert!(PipelineConfig::from_json_str("not json").is_err());
    }
}
