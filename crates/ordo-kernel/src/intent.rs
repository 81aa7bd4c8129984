//! Canonical intent model.
//!
//! A raw LLM interpretation of a user utterance arrives as a
//! [`CandidateIntent`]; the normalizer turns it into a canonical, typed
//! [`Intent`] with deterministic confidence rules. The ambiguity resolver
//! reduces a ranked set of candidates to [`IntentHypotheses`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

// ============================================================================
// IntentType
// ============================================================================

/// The closed set of canonical intent categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntentType {
    Schedule,
    Search,
    Action,
    Query,
    Planning,
    Analysis,
    Unknown,
    ClarificationNeeded,
    Refused,
}

impl IntentType {
    /// `true` for types that never proceed to planning.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Unknown | Self::ClarificationNeeded | Self::Refused)
    }
}

// ============================================================================
// Intent
// ============================================================================

/// Provenance attached to every normalized intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentMetadata {
    /// Data-model version of the intent record.
    pub version: u32,
    /// ISO-8601 creation timestamp.
    pub timestamp: String,
    /// Where the intent came from (`"llm"`, `"system_fallback"`, ...).
    pub source: String,
    /// Identifier of the model that produced the candidate.
    pub model_id: String,
}

/// Canonical interpretation of a user utterance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    pub id: Uuid,
    /// Set when this intent refines or follows up on an earlier one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_intent_id: Option<Uuid>,
    #[serde(rename = "type")]
    pub intent_type: IntentType,
    /// Confidence in `[0, 1]`, deterministic given (type, parameters, ontology).
    pub confidence: f64,
    pub parameters: HashMap<String, serde_json::Value>,
    pub raw_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    pub metadata: IntentMetadata,
}

impl Intent {
    /// Clamp a confidence value into `[0, 1]`.
    pub fn clamp_confidence(value: f64) -> f64 {
        value.clamp(0.0, 1.0)
    }

    /// Read a string parameter by key.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(|v| v.as_str())
    }

    /// Read a numeric parameter by key.
    pub fn param_u64(&self, key: &str) -> Option<u64> {
        self.parameters.get(key).and_then(|v| v.as_u64())
    }
}

// ============================================================================
// CandidateIntent — pre-normalization LLM output
// ============================================================================

/// What the structured generator emits before normalization.
///
/// `intent_type` is a free string at this stage; anything outside the closed
/// enum collapses to [`IntentType::Unknown`] during normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateIntent {
    #[serde(rename = "type")]
    pub intent_type: String,
    pub confidence: f64,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

impl CandidateIntent {
    /// Parse the free-form type string into the closed enum, if it matches.
    pub fn parsed_type(&self) -> Option<IntentType> {
        serde_json::from_value(serde_json::Value::String(
            self.intent_type.trim().to_uppercase(),
        ))
        .ok()
    }
}

// ============================================================================
// IntentHypotheses
// ============================================================================

/// Output of the ambiguity resolver over 1–3 normalized candidates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentHypotheses {
    /// The intent execution should proceed with. When `is_ambiguous` is set
    /// this is a `CLARIFICATION_NEEDED` intent.
    pub primary: Intent,
    pub is_ambiguous: bool,
    /// The remaining candidates, best first.
    pub alternatives: Vec<Intent>,
}
