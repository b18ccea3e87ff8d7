//! Server configuration.
//!
//! The values are opaque inputs supplied by the bootstrap layer. They can be
//! deserialized from JSON; every field has a default.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::subscription::SamplingRateBand;

/// Configuration consumed by the dispatcher, the managers and the sampling
/// engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// URI of the server namespace (index 1).
    pub server_uri: String,
    /// Upper bound for a monitored item's revised queue size.
    pub max_queue_size: u32,
    /// Ordered quantization ladder for sampling intervals.
    pub sampling_rates: Vec<SamplingRateBand>,
    /// Floor for every revised sampling interval, in milliseconds.
    pub min_sampling_interval: f64,
    /// Continuation points a single browse call may allocate.
    pub max_continuation_points_per_browse: usize,
    /// Continuation points a session may hold at once.
    pub max_browse_continuation_points: usize,
    /// Page size used when a browse asks for no limit.
    pub max_references_per_node: usize,
    /// Items accepted in one service call.
    pub max_nodes_per_operation: usize,
    /// Capacity of the deferred reference cleanup queue.
    pub cleanup_queue_capacity: usize,
    /// Raw history values kept per historizing variable.
    pub max_history_values_per_node: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_uri: "urn:uacore:server".to_string(),
            max_queue_size: 1000,
            sampling_rates: vec![
                SamplingRateBand::new(5.0, 5.0, 20),
                SamplingRateBand::new(100.0, 100.0, 4),
                SamplingRateBand::new(500.0, 250.0, 2),
                SamplingRateBand::new(1000.0, 500.0, 20),
            ],
            min_sampling_interval: 0.0,
            max_continuation_points_per_browse: 10,
            max_browse_continuation_points: 10,
            max_references_per_node: 1000,
            max_nodes_per_operation: 10_000,
            cleanup_queue_capacity: 1024,
            max_history_values_per_node: 1000,
        }
    }
}

impl ServerConfig {
    /// Parses and validates a JSON document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_str(json)?;
        cfg.validate()
    }

    /// Checks the limits and the sampling ladder.
    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.server_uri.trim().is_empty() {
            return Err(ConfigError::InvalidLimit {
                field: "server_uri",
                reason: "must not be empty".to_string(),
            });
        }
        for (field, value) in [
            ("max_queue_size", self.max_queue_size as usize),
            ("max_continuation_points_per_browse", self.max_continuation_points_per_browse),
            ("max_browse_continuation_points", self.max_browse_continuation_points),
            ("max_references_per_node", self.max_references_per_node),
            ("max_nodes_per_operation", self.max_nodes_per_operation),
            ("cleanup_queue_capacity", self.cleanup_queue_capacity),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidLimit {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if !self.min_sampling_interval.is_finite() || self.min_sampling_interval < 0.0 {
            return Err(ConfigError::InvalidLimit {
                field: "min_sampling_interval",
                reason: format!("must be a non-negative number (got {})", self.min_sampling_interval),
            });
        }
        for band in &self.sampling_rates {
            band.validate()?;
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = ServerConfig::default().validate().unwrap();
        assert_eq!(cfg.sampling_rates.len(), 4);
        assert_eq!(cfg.max_queue_size, 1000);
    }

    #[test]
    fn partial_json_uses_defaults() {
        let cfg = ServerConfig::from_json(
            r#"{"max_queue_size": 10, "sampling_rates": [{"start": 100.0, "increment": 100.0, "count": 4}]}"#,
        )
        .unwrap();
        assert_eq!(cfg.max_queue_size, 10);
        assert_eq!(cfg.sampling_rates, vec![SamplingRateBand::new(100.0, 100.0, 4)]);
        assert_eq!(cfg.max_continuation_points_per_browse, 10);
    }

    #[test]
    fn zero_limits_are_rejected() {
        let cfg = ServerConfig {
            max_nodes_per_operation: 0,
            ..ServerConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(format!("{err}").contains("max_nodes_per_operation"));
    }

    #[test]
    fn bad_band_is_rejected() {
        let cfg = ServerConfig {
            sampling_rates: vec![SamplingRateBand::new(100.0, 0.0, 4)],
            ..ServerConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidSamplingRate { .. })));
        assert!(ServerConfig::from_json("{not json").is_err());
    }
}
