//! Failure triage types.
//!
//! A tool failure is classified into a closed [`FailureCategory`] with a
//! recoverability verdict and a [`SuggestedAction`]. The triage service in
//! the runtime produces these; the failover engine consumes them.

use serde::{Deserialize, Serialize};

/// Closed set of failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    Timeout,
    RateLimit,
    Network,
    Auth,
    InvalidInput,
    NotFound,
    ResourceExhausted,
    Conflict,
    Internal,
    Unknown,
}

/// What the orchestrator should do about a triaged failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SuggestedAction {
    RetryWithModifiedParams,
    RetryWithBackoff,
    EscalateToHuman,
    SkipStep,
    TriggerCompensation,
}

/// Structured classification of one tool failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageResult {
    pub category: FailureCategory,
    pub is_recoverable: bool,
    /// Classifier confidence in `[0, 1]`. Heuristic rules report fixed
    /// confidences; the semantic classifier reports its own.
    pub confidence: f64,
    pub explanation: String,
    pub suggested_action: SuggestedAction,
}

impl TriageResult {
    /// The contract-mandated fallback: triage never throws, it degrades to
    /// this when classification itself fails.
    pub fn unknown() -> Self {
        Self {
            category: FailureCategory::Unknown,
            is_recoverable: false,
            confidence: 0.0,
            explanation: "classification unavailable".into(),
            suggested_action: SuggestedAction::EscalateToHuman,
        }
    }
}
