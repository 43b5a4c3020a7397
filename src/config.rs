//! Configuration for the inspector services.
//!
//! Every section has working defaults; a JSON document only needs to name the
//! fields it overrides.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{InspectorResult, ValidationError};

/// Worker pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Upper bound on live worker threads.
    pub max_workers: usize,
    /// Maximum queued jobs waiting for a worker.
    pub queue_capacity: usize,
    /// How long an idle worker waits for work before exiting.
    pub keep_alive_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 512,
            queue_capacity: 1024,
            keep_alive_ms: 30_000,
        }
    }
}

impl PoolConfig {
    /// Workers one rule evaluation holds for its lifetime: the evaluation
    /// itself, its virtual-time pump and its trailing-window tracker.
    pub const MIN_WORKERS: usize = 3;

    /// Idle keep-alive as a `Duration`.
    #[must_use]
    pub const fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms)
    }

    /// Checks the configuration.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_workers < Self::MIN_WORKERS {
            return Err(ValidationError::PoolTooSmall {
                min: Self::MIN_WORKERS,
                actual: self.max_workers,
            });
        }
        non_zero("pool.queue_capacity", self.queue_capacity)
    }
}

/// Rule evaluation configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    /// How many trailing messages are kept for a finished evaluation.
    pub trailing_window: usize,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self { trailing_window: 10 }
    }
}

impl EvaluationConfig {
    /// Checks the configuration.
    pub fn validate(&self) -> Result<(), ValidationError> {
        non_zero("evaluation.trailing_window", self.trailing_window)
    }
}

/// Windowed message cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowedCacheConfig {
    /// Messages per page buffer.
    pub page_size: usize,
    /// Number of page buffers.
    pub page_count: usize,
    /// Distance from a page edge at which the neighbouring page is prefetched.
    pub prefetch_tolerance: usize,
    /// Capacity of the circular buffer holding the newest messages.
    pub live_capacity: usize,
    /// Maximum messages per growth notification.
    pub max_update_batch: usize,
    /// Maximum time a growth notification is held back.
    pub max_update_wait_ms: u64,
}

impl Default for WindowedCacheConfig {
    fn default() -> Self {
        Self {
            page_size: 2048,
            page_count: 3,
            prefetch_tolerance: 512,
            live_capacity: 2048,
            max_update_batch: 256,
            max_update_wait_ms: 100,
        }
    }
}

impl WindowedCacheConfig {
    /// Fewest page buffers that keep the current, leading and trailing page resident.
    pub const MIN_PAGES: usize = 3;

    /// Maximum notification delay as a `Duration`.
    #[must_use]
    pub const fn max_update_wait(&self) -> Duration {
        Duration::from_millis(self.max_update_wait_ms)
    }

    /// Checks the configuration.
    pub fn validate(&self) -> Result<(), ValidationError> {
        non_zero("paging.page_size", self.page_size)?;
        non_zero("paging.live_capacity", self.live_capacity)?;
        non_zero("paging.max_update_batch", self.max_update_batch)?;
        if self.page_count < Self::MIN_PAGES {
            return Err(ValidationError::TooFewPages {
                min: Self::MIN_PAGES,
                actual: self.page_count,
            });
        }
        if self.prefetch_tolerance * 2 >= self.page_size {
            return Err(ValidationError::ToleranceTooLarge {
                tolerance: self.prefetch_tolerance,
                page_size: self.page_size,
            });
        }
        Ok(())
    }
}

/// Aggregate configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InspectorConfig {
    #[allow(missing_docs)]
    pub pool: PoolConfig,
    #[allow(missing_docs)]
    pub evaluation: EvaluationConfig,
    #[allow(missing_docs)]
    pub paging: WindowedCacheConfig,
}

impl InspectorConfig {
    /// Parses and validates a JSON configuration document.
    pub fn from_json_str(json: &str) -> InspectorResult<Self> {
        let cfg: Self = serde_json::from_str(json).map_err(|e| ValidationError::InvalidConfig {
            reason: e.to_string(),
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Checks every section.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.pool.validate()?;
        self.evaluation.validate()?;
        self.paging.validate()
    }
}

fn non_zero(field: &str, value: usize) -> Result<(), ValidationError> {
    if value == 0 {
        return Err(ValidationError::ZeroSize {
            field: field.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        InspectorConfig::default().validate().unwrap();
        assert_eq!(WindowedCacheConfig::default().page_size, 2048);
        assert_eq!(EvaluationConfig::default().trailing_window, 10);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg = InspectorConfig::from_json_str(r#"{"paging": {"page_size": 64, "prefetch_tolerance": 16}}"#).unwrap();
        assert_eq!(cfg.paging.page_size, 64);
        assert_eq!(cfg.paging.prefetch_tolerance, 16);
        assert_eq!(cfg.paging.page_count, 3);
        assert_eq!(cfg.pool, PoolConfig::default());
    }

    #[test]
    fn tolerance_must_stay_below_half_page() {
        let cfg = WindowedCacheConfig {
            page_size: 100,
            prefetch_tolerance: 50,
            ..WindowedCacheConfig::default()
        };
        assert_eq!(
            cfg.validate().unwrap_err(),
            ValidationError::ToleranceTooLarge {
                tolerance: 50,
                page_size: 100
            }
        );
    }

    #[test]
    fn too_few_pages_rejected() {
        let cfg = WindowedCacheConfig {
            page_count: 2,
            ..WindowedCacheConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ValidationError::TooFewPages { min: 3, actual: 2 })));
    }

    #[test]
    fn pool_smaller_than_one_evaluation_rejected() {
        for max_workers in [0, 1, 2] {
            let cfg = PoolConfig {
                max_workers,
                ..PoolConfig::default()
            };
            assert_eq!(cfg.validate().unwrap_err(), ValidationError::PoolTooSmall { min: 3, actual: max_workers });
        }
        PoolConfig {
            max_workers: 3,
            ..PoolConfig::default()
        }
        .validate()
        .unwrap();
    }

    #[test]
    fn malformed_json_is_a_validation_error() {
        let err = InspectorConfig::from_json_str("{not json").unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn zero_trailing_window_rejected() {
        let err = InspectorConfig::from_json_str(r#"{"evaluation": {"trailing_window": 0}}"#).unwrap_err();
        assert!(err.is_validation());
    }
}
