use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::TraceError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct WeaverConfig {
    pub record_timeout_ms: u64,
    pub queue_capacity: usize,
    pub correlator_workers: usize,
    pub replay_deadline_ms: Option<u64>,
}

impl Default for WeaverConfig {
    fn default() -> Self {
        Self {
            record_timeout_ms: 250,
            queue_capacity: 1_024,
            correlator_workers: 4,
            replay_deadline_ms: None,
        }
    }
}

impl WeaverConfig {
    /// Validates numeric bounds.
    ///
    /// # Errors
    /// Returns [`TraceError::Configuration`] when a field is outside its allowed range.
    pub fn validate(&self) -> Result<(), TraceError> {
        if self.record_timeout_ms == 0 {
            return Err(TraceError::Configuration(
                "record_timeout_ms MUST be >= 1".to_string(),
            ));
        }

        if self.queue_capacity == 0 {
            return Err(TraceError::Configuration(
                "queue_capacity MUST be >= 1".to_string(),
            ));
        }

        if !(1..=64).contains(&self.correlator_workers) {
            return Err(TraceError::Configuration(
                "correlator_workers MUST be in [1, 64]".to_string(),
            ));
        }

        if self.replay_deadline_ms == Some(0) {
            return Err(TraceError::Configuration(
                "replay_deadline_ms MUST be >= 1 when set".to_string(),
            ));
        }

        Ok(())
    }

    /// Decodes and validates a config from JSON.
    ///
    /// # Errors
    /// Returns [`TraceError::Configuration`] when decoding or validation fails.
    pub fn from_json(value: &Value) -> Result<Self, TraceError> {
        let config: Self = serde_json::from_value(value.clone())
            .map_err(|err| TraceError::Configuration(format!("invalid config JSON: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a JSON config file.
    ///
    /// # Errors
    /// Returns [`TraceError::Configuration`] when the file cannot be read or is invalid.
    pub fn load(path: &Path) -> Result<Self, TraceError> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            TraceError::Configuration(format!("failed to read {}: {err}", path.display()))
        })?;
        let value: Value = serde_json::from_str(&raw)
            .map_err(|err| TraceError::Configuration(format!("invalid config JSON: {err}")))?;
        Self::from_json(&value)
    }

    #[must_use]
    pub fn record_timeout(&self) -> Duration {
        Duration::from_millis(self.record_timeout_ms)
    }

    #[must_use]
    pub fn replay_deadline(&self) -> Option<Duration> {
        self.replay_deadline_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_are_valid() {
        assert!(WeaverConfig::default().validate().is_ok());
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config = match WeaverConfig::from_json(&json!({ "correlator_workers": 2 })) {
            Ok(value) => value,
            Err(err) => panic!("unexpected config error: {err}"),
        };
        assert_eq!(config.correlator_workers, 2);
        assert_eq!(config.queue_capacity, WeaverConfig::default().queue_capacity);
    }

    #[test]
    fn invalid_values_are_reported_clearly() {
        let err = match WeaverConfig::from_json(&json!({ "correlator_workers": 0 })) {
            Ok(_) => panic!("expected configuration error"),
            Err(err) => err,
        };
        assert_eq!(
            err,
            TraceError::Configuration("correlator_workers MUST be in [1, 64]".to_string())
        );

        assert!(matches!(
            WeaverConfig::from_json(&json!({ "unknown_knob": true })),
            Err(TraceError::Configuration(_))
        ));
    }
}
