//! Failure triage — classify tool failures into recovery categories.
//!
//! Two modes: a semantic classifier behind the structured generator, and an
//! always-available heuristic rule list over the lowercased error text and
//! numeric code. Rules are matched top-down, first match wins. The service
//! never returns an error: when classification itself fails it degrades to
//! `{Unknown, recoverable: false, confidence: 0}`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use ordo_kernel::capabilities::{GenerationRequest, StructuredGenerator};
use ordo_kernel::tool::ToolError;
use ordo_kernel::triage::{FailureCategory, SuggestedAction, TriageResult};

// ============================================================================
// Rules
// ============================================================================

/// One heuristic rule: any substring or code match assigns the category.
#[derive(Debug, Clone)]
pub struct TriageRule {
    pub category: FailureCategory,
    pub substrings: Vec<&'static str>,
    pub codes: Vec<i64>,
}

impl TriageRule {
    fn matches(&self, lowered: &str, code: Option<i64>) -> bool {
        if let Some(c) = code {
            if self.codes.contains(&c) {
                return true;
            }
        }
        self.substrings.iter().any(|s| lowered.contains(s))
    }
}

fn default_rules() -> Vec<TriageRule> {
    vec![
        TriageRule {
            category: FailureCategory::Timeout,
            substrings: vec!["timed out", "timeout", "deadline exceeded"],
            codes: vec![408],
        },
        TriageRule {
            category: FailureCategory::RateLimit,
            substrings: vec!["rate limit", "too many requests", "quota exceeded"],
            codes: vec![429],
        },
        TriageRule {
            category: FailureCategory::Network,
            substrings: vec!["connection", "unreachable", "network", "refused", "dns"],
            codes: vec![502, 503, 504],
        },
        TriageRule {
            category: FailureCategory::Auth,
            substrings: vec!["unauthorized", "forbidden", "api key", "authentication"],
            codes: vec![401, 403],
        },
        TriageRule {
            category: FailureCategory::InvalidInput,
            substrings: vec!["invalid", "validation", "schema", "bad request", "missing required"],
            codes: vec![400, 422],
        },
        TriageRule {
            category: FailureCategory::NotFound,
            substrings: vec!["not found", "no such"],
            codes: vec![404],
        },
        TriageRule {
            category: FailureCategory::ResourceExhausted,
            substrings: vec!["capacity", "exhausted", "out of memory", "insufficient"],
            codes: vec![507],
        },
        TriageRule {
            category: FailureCategory::Conflict,
            substrings: vec!["conflict", "already exists"],
            codes: vec![409],
        },
        TriageRule {
            category: FailureCategory::Internal,
            substrings: vec!["internal error", "internal server"],
            codes: vec![500],
        },
    ]
}

fn default_recoverable() -> HashSet<FailureCategory> {
    HashSet::from([
        FailureCategory::Timeout,
        FailureCategory::RateLimit,
        FailureCategory::Network,
        FailureCategory::ResourceExhausted,
        FailureCategory::Conflict,
    ])
}

fn default_actions() -> HashMap<FailureCategory, SuggestedAction> {
    HashMap::from([
        (FailureCategory::Timeout, SuggestedAction::RetryWithBackoff),
        (FailureCategory::RateLimit, SuggestedAction::RetryWithBackoff),
        (FailureCategory::Network, SuggestedAction::RetryWithBackoff),
        (FailureCategory::ResourceExhausted, SuggestedAction::RetryWithBackoff),
        (FailureCategory::Conflict, SuggestedAction::RetryWithBackoff),
        (FailureCategory::InvalidInput, SuggestedAction::RetryWithModifiedParams),
        (FailureCategory::NotFound, SuggestedAction::SkipStep),
        (FailureCategory::Auth, SuggestedAction::EscalateToHuman),
        (FailureCategory::Internal, SuggestedAction::EscalateToHuman),
        (FailureCategory::Unknown, SuggestedAction::EscalateToHuman),
    ])
}

// ============================================================================
// TriageService
// ============================================================================

/// Classification mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriageMode {
    Heuristic,
    /// Semantic first, heuristic as fallback.
    Semantic,
}

pub struct TriageService {
    mode: TriageMode,
    generator: Option<Arc<dyn StructuredGenerator>>,
    rules: Vec<TriageRule>,
    recoverable: HashSet<FailureCategory>,
    actions: HashMap<FailureCategory, SuggestedAction>,
}

impl TriageService {
    /// Heuristic-only service.
    pub fn heuristic() -> Self {
        Self {
            mode: TriageMode::Heuristic,
            generator: None,
            rules: default_rules(),
            recoverable: default_recoverable(),
            actions: default_actions(),
        }
    }

    /// Semantic service with heuristic fallback.
    pub fn semantic(generator: Arc<dyn StructuredGenerator>) -> Self {
        Self {
            mode: TriageMode::Semantic,
            generator: Some(generator),
            rules: default_rules(),
            recoverable: default_recoverable(),
            actions: default_actions(),
        }
    }

    /// Classify one failure. Never returns `Err`.
    pub async fn triage(&self, tool_name: &str, error: &ToolError) -> TriageResult {
        if self.mode == TriageMode::Semantic {
            if let Some(result) = self.triage_semantic(tool_name, error).await {
                return result;
            }
            debug!(tool = tool_name, "semantic triage unavailable, using heuristics");
        }
        self.triage_heuristic(error)
    }

    fn triage_heuristic(&self, error: &ToolError) -> TriageResult {
        let lowered = error.message.to_lowercase();
        let category = self
            .rules
            .iter()
            .find(|rule| rule.matches(&lowered, error.code))
            .map(|rule| rule.category)
            .unwrap_or(FailureCategory::Unknown);

        if category == FailureCategory::Unknown {
            return TriageResult::unknown();
        }

        TriageResult {
            category,
            is_recoverable: self.recoverable.contains(&category),
            confidence: 0.7,
            explanation: format!("heuristic match on '{}'", error.message),
            suggested_action: self
                .actions
                .get(&category)
                .copied()
                .unwrap_or(SuggestedAction::EscalateToHuman),
        }
    }

    async fn triage_semantic(&self, tool_name: &str, error: &ToolError) -> Option<TriageResult> {
        let generator = self.generator.as_ref()?;
        let request = GenerationRequest {
            prompt: format!(
                "Tool: {tool_name}\nError message: {}\nNumeric code: {}",
                error.message,
                error.code.map(|c| c.to_string()).unwrap_or_else(|| "none".into()),
            ),
            system: TRIAGE_SYSTEM_PROMPT.to_string(),
            schema: triage_schema(),
            temperature: 0.0,
            timeout_ms: 10_000,
        };

        match generator.generate(request).await {
            Ok(output) => match serde_json::from_value::<TriageResult>(output.data) {
                Ok(mut result) => {
                    result.confidence = result.confidence.clamp(0.0, 1.0);
                    Some(result)
                }
                Err(e) => {
                    warn!(tool = tool_name, error = %e, "semantic triage output malformed");
                    None
                }
            },
            Err(e) => {
                warn!(tool = tool_name, error = %e, "semantic triage call failed");
                None
            }
        }
    }
}

const TRIAGE_SYSTEM_PROMPT: &str = "Classify the tool failure. Categories: \
timeout, rate_limit, network, auth, invalid_input, not_found, \
resource_exhausted, conflict, internal, unknown. Recoverable means a retry \
may succeed without compensating side effects. Suggested actions: \
RETRY_WITH_MODIFIED_PARAMS, RETRY_WITH_BACKOFF, ESCALATE_TO_HUMAN, SKIP_STEP, \
TRIGGER_COMPENSATION. Respond with JSON matching the schema.";

fn triage_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "category": {"type": "string"},
            "is_recoverable": {"type": "boolean"},
            "confidence": {"type": "number"},
            "explanation": {"type": "string"},
            "suggested_action": {"type": "string"}
        },
        "required": ["category", "is_recoverable", "confidence", "explanation", "suggested_action"]
    })
}
