//! Failover policy model.
//!
//! A [`FailoverPolicy`] is a declarative rule mapping (intent type, failure
//! category, context) to an ordered recovery strategy. Policies are evaluated
//! in registration order; the first match wins and its first action becomes
//! the recommendation.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::intent::IntentType;
use crate::triage::{FailureCategory, SuggestedAction};

// ============================================================================
// Actions
// ============================================================================

/// One recovery action inside a policy, tried in declaration order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverAction {
    #[serde(rename = "type")]
    pub kind: SuggestedAction,
    /// Template rendered for the user when this action surfaces; `{token}`
    /// placeholders are substituted from `params`.
    pub message_template: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay_ms: Option<u64>,
    /// Template variables and alternative-parameter suggestions.
    #[serde(default)]
    pub params: HashMap<String, serde_json::Value>,
}

/// Inclusive bounds on an intent's `party_size` parameter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PartySizeRange {
    pub min: u64,
    pub max: u64,
}

impl PartySizeRange {
    pub fn contains(&self, size: u64) -> bool {
        size >= self.min && size <= self.max
    }
}

// ============================================================================
// Policy
// ============================================================================

/// A declarative failover rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverPolicy {
    pub name: String,
    pub intent_type: IntentType,
    /// Failure categories this policy covers.
    pub failure_reasons: Vec<FailureCategory>,
    /// Intents below this confidence do not match.
    pub min_confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub party_size_range: Option<PartySizeRange>,
    /// Ordered recovery strategy; must be non-empty.
    pub actions: Vec<FailoverAction>,
}

/// One expanded suggestion item, deterministic given identical inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailoverSuggestion {
    #[serde(rename = "type")]
    pub kind: SuggestedAction,
    pub value: serde_json::Value,
    pub message: String,
    pub confidence: f64,
}

/// Substitute `{token}` placeholders in a template from a params map.
/// Unknown tokens are left in place.
pub fn render_template(template: &str, params: &HashMap<String, serde_json::Value>) -> String {
    let mut rendered = template.to_string();
    for (key, value) in params {
        let token = format!("{{{key}}}");
        if rendered.contains(&token) {
            let text = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            rendered = rendered.replace(&token, &text);
        }
    }
    rendered
}
