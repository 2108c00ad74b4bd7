//! Settings types.
//!
//! All structs use `#[serde(rename_all = "camelCase", default)]` so a partial
//! JSON file fills the gaps from compiled defaults.

mod dispatch;
mod routing;

pub use dispatch::{BrokerSettings, ProcessorSettings};
pub use routing::{RoutingRule, RoutingSettings};

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    /// Queue entity settings (delivery budget, lock duration).
    pub broker: BrokerSettings,
    /// Session processor settings (concurrency, settlement mode).
    pub processor: ProcessorSettings,
    /// Session routing rules.
    pub routing: RoutingSettings,
}

impl RelaySettings {
    /// Reject values that would make the dispatch core unable to make progress.
    pub fn validate(&self) -> Result<()> {
        if self.broker.max_delivery_count == 0 {
            return Err(invalid("broker.maxDeliveryCount must be > 0"));
        }
        if self.broker.lease_duration_ms == 0 {
            return Err(invalid("broker.leaseDurationMs must be > 0"));
        }
        if self.processor.max_concurrent_sessions == 0 {
            return Err(invalid("processor.maxConcurrentSessions must be > 0"));
        }
        if self.processor.max_concurrent_calls_per_session == 0 {
            return Err(invalid(
                "processor.maxConcurrentCallsPerSession must be > 0",
            ));
        }
        if self.routing.default_session.is_empty() {
            return Err(invalid("routing.defaultSession must not be empty"));
        }
        if let Some(rule) = self.routing.rules.iter().find(|r| r.contains.is_empty()) {
            return Err(invalid(&format!(
                "routing rule for {} has an empty pattern",
                rule.session
            )));
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> SettingsError {
    SettingsError::InvalidValue(msg.to_string())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn default_settings_serde_roundtrip() {
        let defaults = RelaySettings::default();
        let json = serde_json::to_string(&defaults).unwrap();
        let back: RelaySettings = serde_json::from_str(&json).unwrap();
        assert_eq!(back.broker.entity_path, defaults.broker.entity_path);
        assert_eq!(
            back.processor.max_concurrent_sessions,
            defaults.processor.max_concurrent_sessions
        );
    }

    #[test]
    fn json_field_names_are_camel_case() {
        let json = serde_json::to_value(RelaySettings::default()).unwrap();
        let processor = json.get("processor").unwrap();
        assert!(processor.get("autoCompleteMessages").is_some());
        assert!(processor.get("maxConcurrentCallsPerSession").is_some());
        let broker = json.get("broker").unwrap();
        assert!(broker.get("maxDeliveryCount").is_some());
        assert!(json["routing"].get("defaultSession").is_some());
    }

    #[test]
    fn empty_json_produces_defaults() {
        let settings: RelaySettings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.broker.max_delivery_count, 10);
        assert_eq!(settings.routing.rules.len(), 4);
    }

    #[test]
    fn validate_rejects_zero_sessions() {
        let mut settings = RelaySettings::default();
        settings.processor.max_concurrent_sessions = 0;
        assert_matches!(settings.validate(), Err(SettingsError::InvalidValue(msg)) if msg.contains("maxConcurrentSessions"));
    }

    #[test]
    fn validate_rejects_zero_calls() {
        let mut settings = RelaySettings::default();
        settings.processor.max_concurrent_calls_per_session = 0;
        assert_matches!(settings.validate(), Err(SettingsError::InvalidValue(_)));
    }

    #[test]
    fn validate_rejects_zero_delivery_count() {
        let mut settings = RelaySettings::default();
        settings.broker.max_delivery_count = 0;
        assert_matches!(settings.validate(), Err(SettingsError::InvalidValue(_)));
    }

    #[test]
    fn validate_rejects_empty_pattern() {
        let mut settings = RelaySettings::default();
        settings.routing.rules.push(RoutingRule {
            contains: String::new(),
            session: "session-1".into(),
        });
        assert_matches!(settings.validate(), Err(SettingsError::InvalidValue(msg)) if msg.contains("session-1"));
    }
}
