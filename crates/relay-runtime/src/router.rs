//! Session routing: payload to session key.

use relay_core::SessionKey;
use relay_settings::RoutingSettings;

/// Maps a payload to a session key. Must be pure and total.
pub trait SessionRouter: Send + Sync {
    /// Session key for this payload.
    fn route(&self, payload: &[u8]) -> SessionKey;
}

/// Ordered substring rules; first match wins, otherwise the default key.
///
/// Payloads are matched on their lossy UTF-8 rendering.
#[derive(Clone, Debug)]
pub struct RuleRouter {
    rules: Vec<(String, SessionKey)>,
    default_session: SessionKey,
}

impl RuleRouter {
    /// Router with no rules that sends everything to `default_session`.
    pub fn new(default_session: impl Into<SessionKey>) -> Self {
        Self {
            rules: Vec::new(),
            default_session: default_session.into(),
        }
    }

    /// Append a rule. Rules are evaluated in insertion order.
    #[must_use]
    pub fn rule(mut self, contains: impl Into<String>, session: impl Into<SessionKey>) -> Self {
        self.rules.push((contains.into(), session.into()));
        self
    }

    /// Build a router from routing settings.
    pub fn from_settings(settings: &RoutingSettings) -> Self {
        settings.rules.iter().fold(
            Self::new(settings.default_session.as_str()),
            |router, rule| router.rule(rule.contains.as_str(), rule.session.as_str()),
        )
    }

    /// Key used when nothing matches.
    pub fn default_session(&self) -> &SessionKey {
        &self.default_session
    }
}

impl SessionRouter for RuleRouter {
    fn route(&self, payload: &[u8]) -> SessionKey {
        let text = String::from_utf8_lossy(payload);
        self.rules
            .iter()
            .find(|(pattern, _)| text.contains(pattern.as_str()))
            .map_or_else(|| self.default_session.clone(), |(_, key)| key.clone())
    }
}
