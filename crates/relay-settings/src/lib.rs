//! # relay-settings
//!
//! Configuration for the relay broker, session processor and router.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`RelaySettings::default()`]
//! 2. **User file**: `~/.relay/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `RELAY_*` overrides (highest priority)
//!
//! Loaded settings are validated before being returned: zero concurrency
//! ceilings or a zero delivery budget are rejected.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn re_exports_work() {
        let _settings = RelaySettings::default();
        let _path = settings_path();
    }

    #[test]
    fn default_settings_are_valid() {
        let settings = RelaySettings::default();
        settings.validate().unwrap();
        assert_eq!(settings.broker.max_delivery_count, 10);
        assert_eq!(settings.broker.lease_duration_ms, 30_000);
        assert!(settings.processor.auto_complete_messages);
        assert_eq!(settings.processor.max_concurrent_sessions, 8);
        assert_eq!(settings.processor.max_concurrent_calls_per_session, 1);
        assert!(settings.processor.session_ids.is_empty());
        assert_eq!(settings.routing.default_session, "session-4");
        assert_eq!(settings.routing.rules.len(), 4);
    }
}
