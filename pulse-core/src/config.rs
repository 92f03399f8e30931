//! Bus configuration.
//!
//! Plain data, loadable from JSON. Every field has a default, so a partial
//! document (or `{}`) is a valid configuration.

use serde::{Deserialize, Serialize};

use crate::bus::SignalBusSubscriptionOptions;
use crate::error::Result;

/// Default number of failures kept for [`crate::bus::SignalBus::recent_errors`].
pub const DEFAULT_ERROR_HISTORY: usize = 100;

/// Settings applied when a [`crate::bus::SignalBus`] is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalBusConfig {
    /// Options used by `subscribe` and `subscribe_async`.
    pub default_options: SignalBusSubscriptionOptions,

    /// How many recent failures the bus keeps. Zero keeps none; the
    /// counters in the statistics are unaffected.
    pub error_history: usize,

    /// Give every publish a UUID correlation ID when the caller supplies none.
    pub generate_correlation_ids: bool,
}

impl Default for SignalBusConfig {
    fn default() -> Self {
        Self {
            default_options: SignalBusSubscriptionOptions::default(),
            error_history: DEFAULT_ERROR_HISTORY,
            generate_correlation_ids: true,
        }
    }
}

impl SignalBusConfig {
    /// Parse a configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BusError;
    use std::time::Duration;

    #[test]
    fn empty_document_uses_defaults() {
        let config = SignalBusConfig::from_json("{}").unwrap();
        assert_eq!(config.error_history, DEFAULT_ERROR_HISTORY);
        assert!(config.generate_correlation_ids);
        assert_eq!(config.default_options.priority, 0);
    }

    #[test]
    fn nested_options_are_parsed() {
        let config = SignalBusConfig::from_json(
            r#"{
                "error_history": 5,
                "generate_correlation_ids": false,
                "default_options": { "max_retries": 2, "retry_delay": 10, "run_in_background": true }
            }"#,
        )
        .unwrap();

        assert_eq!(config.error_history, 5);
        assert!(!config.generate_correlation_ids);
        assert_eq!(config.default_options.max_retries, 2);
        assert_eq!(config.default_options.retry_delay, Duration::from_millis(10));
        assert!(config.default_options.run_in_background);
    }

    #[test]
    fn malformed_document_is_an_error() {
        let err = SignalBusConfig::from_json("{\"error_history\": \"lots\"}").unwrap_err();
        assert!(matches!(err, BusError::Config(_)));
    }

    #[test]
    fn round_trips_through_json() {
        let config = SignalBusConfig {
            error_history: 7,
            ..SignalBusConfig::default()
        };
        let parsed = SignalBusConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(parsed.error_history, 7);
    }
}
