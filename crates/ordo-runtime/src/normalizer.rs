//! Intent normalization.
//!
//! Turns a raw [`CandidateIntent`] from the structured generator into a
//! canonical [`Intent`] under deterministic confidence rules: schema failures
//! collapse to a system fallback, each missing ontology-required field costs
//! 0.2 confidence, semantic validators apply further penalties, and anything
//! that lands below 0.6 is forced to `CLARIFICATION_NEEDED`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use ordo_kernel::clock::Clock;
use ordo_kernel::error::{OrdoError, OrdoResult};
use ordo_kernel::intent::{CandidateIntent, Intent, IntentMetadata, IntentType};
use ordo_kernel::trace::{TraceEntry, TracePhase, TraceSink};
use ordo_kernel::tool::validate_against_schema;

use crate::memory::ExecutionMemory;
use crate::registry::ToolRegistry;

/// Confidence penalty per missing required field.
const MISSING_FIELD_PENALTY: f64 = 0.2;
/// Confidence penalty for a SCHEDULE whose temporal expression is in the past.
const PAST_DATE_PENALTY: f64 = 0.15;
/// Below this, the intent becomes `CLARIFICATION_NEEDED`.
const CLARIFICATION_THRESHOLD: f64 = 0.6;

// ============================================================================
// Ontology
// ============================================================================

/// Which parameters each intent type must carry.
#[derive(Debug, Clone)]
pub struct Ontology {
    required_fields: HashMap<IntentType, Vec<String>>,
}

impl Default for Ontology {
    fn default() -> Self {
        let mut required_fields = HashMap::new();
        required_fields.insert(
            IntentType::Schedule,
            vec!["action".to_string(), "temporal_expression".to_string()],
        );
        required_fields.insert(IntentType::Search, vec!["query".to_string()]);
        required_fields.insert(IntentType::Action, vec!["capability".to_string()]);
        required_fields.insert(IntentType::Query, vec!["subject".to_string()]);
        required_fields.insert(IntentType::Analysis, vec!["subject".to_string()]);
        Self { required_fields }
    }
}

impl Ontology {
    pub fn required_fields(&self, intent_type: IntentType) -> &[String] {
        self.required_fields
            .get(&intent_type)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }
}

// ============================================================================
// Normalizer
// ============================================================================

pub struct Normalizer {
    ontology: Ontology,
    registry: Arc<ToolRegistry>,
    clock: Arc<dyn Clock>,
    trace: Arc<dyn TraceSink>,
    /// When set, tool-parameter mismatches are recorded asynchronously for
    /// schema-evolution analysis.
    evolution_log: Option<Arc<ExecutionMemory>>,
}

impl Normalizer {
    pub fn new(
        ontology: Ontology,
        registry: Arc<ToolRegistry>,
        clock: Arc<dyn Clock>,
        trace: Arc<dyn TraceSink>,
    ) -> Self {
        Self {
            ontology,
            registry,
            clock,
            trace,
            evolution_log: None,
        }
    }

    pub fn with_evolution_log(mut self, memory: Arc<ExecutionMemory>) -> Self {
        self.evolution_log = Some(memory);
        self
    }

    /// Normalize one candidate into a canonical intent.
    pub fn normalize(
        &self,
        candidate: &CandidateIntent,
        raw_text: &str,
        model_id: &str,
    ) -> Intent {
        let Some(intent_type) = self.validate_candidate(candidate) else {
            warn!(raw_type = %candidate.intent_type, "candidate failed schema validation");
            self.trace.record(TraceEntry::event(
                TracePhase::Normalization,
                "candidate_rejected",
                self.clock.now_iso(),
            ));
            return self.fallback_intent(raw_text, model_id);
        };

        let mut confidence = Intent::clamp_confidence(candidate.confidence);
        let mut explanation_parts: Vec<String> =
            candidate.explanation.iter().cloned().collect();
        let mut parameters = candidate.parameters.clone();

        // Ontology: each missing required field costs a fixed penalty.
        for field in self.ontology.required_fields(intent_type) {
            if !parameters.contains_key(field) {
                confidence = Intent::clamp_confidence(confidence - MISSING_FIELD_PENALTY);
                explanation_parts.push(format!("missing required field '{field}'"));
            }
        }

        // Semantic validators.
        if intent_type == IntentType::Schedule {
            if let Some(expr) = parameters.get("temporal_expression").and_then(|v| v.as_str()) {
                if self.is_past_instant(expr) {
                    confidence = Intent::clamp_confidence(confidence - PAST_DATE_PENALTY);
                    explanation_parts.push("past date".to_string());
                }
            }
        }

        // Canonicalization.
        if intent_type == IntentType::Schedule {
            if let Some(action) = parameters.get("action").and_then(|v| v.as_str()) {
                let upper = action.to_uppercase();
                parameters.insert("action".into(), serde_json::Value::String(upper));
            }
        }

        let final_type = if confidence < CLARIFICATION_THRESHOLD {
            IntentType::ClarificationNeeded
        } else {
            intent_type
        };

        debug!(
            ?final_type,
            confidence,
            raw_type = %candidate.intent_type,
            "candidate normalized"
        );

        Intent {
            id: Uuid::new_v4(),
            parent_intent_id: None,
            intent_type: final_type,
            confidence,
            parameters,
            raw_text: raw_text.to_string(),
            explanation: (!explanation_parts.is_empty()).then(|| explanation_parts.join("; ")),
            metadata: IntentMetadata {
                version: 1,
                timestamp: self.clock.now_iso(),
                source: "llm".into(),
                model_id: model_id.to_string(),
            },
        }
    }

    /// Validate tool parameters against the registry's input schema.
    ///
    /// When an evolution log is configured, any mismatch is recorded on a
    /// detached task — observation must never slow down or fail the caller.
    pub fn validate_tool_parameters(
        &self,
        tool_name: &str,
        params: &serde_json::Value,
    ) -> OrdoResult<()> {
        let definition = self
            .registry
            .definition(tool_name, None)
            .map_err(|_| OrdoError::UnknownTool(tool_name.to_string()))?;

        let errors = validate_against_schema(&definition.input_schema, params);
        if errors.is_empty() {
            return Ok(());
        }

        if let Some(memory) = &self.evolution_log {
            let expected: Vec<String> = definition
                .input_schema
                .get("properties")
                .and_then(|p| p.as_object())
                .map(|p| p.keys().cloned().collect())
                .unwrap_or_default();
            let expected_set: HashSet<&String> = expected.iter().collect();
            let supplied: Vec<String> = params
                .as_object()
                .map(|o| o.keys().cloned().collect())
                .unwrap_or_default();
            let unexpected: Vec<String> = supplied
                .iter()
                .filter(|k| !expected_set.contains(k))
                .cloned()
                .collect();
            let missing: Vec<String> = errors
                .iter()
                .filter(|e| e.code == "required")
                .map(|e| e.path.trim_start_matches("$.").to_string())
                .collect();

            let memory = memory.clone();
            let tool = tool_name.to_string();
            tokio::spawn(async move {
                if let Err(e) = memory
                    .record_schema_mismatch(&tool, &expected, &unexpected, &missing)
                    .await
                {
                    warn!(tool, error = %e, "failed to record schema mismatch");
                }
            });
        }

        Err(OrdoError::SchemaValidationFailed(
            errors
                .iter()
                .map(|e| format!("{} [{}]: {}", e.path, e.code, e.message))
                .collect::<Vec<_>>()
                .join("; "),
        ))
    }

    fn validate_candidate(&self, candidate: &CandidateIntent) -> Option<IntentType> {
        if !(0.0..=1.0).contains(&candidate.confidence) {
            return None;
        }
        candidate.parsed_type()
    }

    fn fallback_intent(&self, raw_text: &str, model_id: &str) -> Intent {
        Intent {
            id: Uuid::new_v4(),
            parent_intent_id: None,
            intent_type: IntentType::Unknown,
            confidence: 0.0,
            parameters: HashMap::new(),
            raw_text: raw_text.to_string(),
            explanation: Some("candidate failed schema validation".into()),
            metadata: IntentMetadata {
                version: 1,
                timestamp: self.clock.now_iso(),
                source: "system_fallback".into(),
                model_id: model_id.to_string(),
            },
        }
    }

    /// Parse an ISO date or datetime and compare it against the clock.
    fn is_past_instant(&self, expr: &str) -> bool {
        let now_ms = self.clock.now_millis() as i64;
        if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(expr) {
            return dt.timestamp_millis() < now_ms;
        }
        if let Ok(date) = chrono::NaiveDate::parse_from_str(expr, "%Y-%m-%d") {
            let end_of_day = date.and_hms_opt(23, 59, 59).map(|dt| dt.and_utc());
            if let Some(dt) = end_of_day {
                return dt.timestamp_millis() < now_ms;
            }
        }
        false
    }
}
