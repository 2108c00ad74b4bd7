//! Session routing settings.

use serde::{Deserialize, Serialize};

/// One substring routing rule.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingRule {
    /// Substring that must appear in the payload text.
    pub contains: String,
    /// Session key assigned on match.
    pub session: String,
}

/// Routing rules evaluated in order; first match wins.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RoutingSettings {
    /// Ordered rules.
    pub rules: Vec<RoutingRule>,
    /// Session key used when no rule matches.
    pub default_session: String,
}

impl Default for RoutingSettings {
    /// Customer routing: `CUSTOMER A` to `CUSTOMER D` map onto `session-1`
    /// to `session-4`; anything else lands on `session-4`.
    fn default() -> Self {
        let rules = [
            ("CUSTOMER A", "session-1"),
            ("CUSTOMER B", "session-2"),
            ("CUSTOMER C", "session-3"),
            ("CUSTOMER D", "session-4"),
        ]
        .into_iter()
        .map(|(contains, session)| RoutingRule {
            contains: contains.to_string(),
            session: session.to_string(),
        })
        .collect();
        Self {
            rules,
            default_session: "session-4".to_string(),
        }
    }
}
