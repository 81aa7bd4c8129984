//! Plan construction — raw generator output to validated DAG.
//!
//! The conversion pipeline: fan-out expansion (a scalar-schema parameter
//! supplied as an array splits its step into one per element), dependency
//! rewrite through the old→new step-number map, UUID assignment, DAG
//! validation, and constraint enforcement. Capability lookups happen first so
//! an unknown tool rejects the plan before any state is persisted.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use ordo_kernel::capabilities::{GenerationRequest, StructuredGenerator};
use ordo_kernel::clock::Clock;
use ordo_kernel::error::{OrdoError, OrdoResult};
use ordo_kernel::intent::Intent;
use ordo_kernel::plan::{Plan, PlanConstraints, PlanMetadata, PlanStep, RawPlan, RawPlanStep};
use ordo_kernel::trace::{TraceEntry, TracePhase, TraceSink};

use crate::registry::ToolRegistry;

// ============================================================================
// PlanBuilder
// ============================================================================

pub struct PlanBuilder {
    registry: Arc<ToolRegistry>,
    clock: Arc<dyn Clock>,
}

impl PlanBuilder {
    pub fn new(registry: Arc<ToolRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self { registry, clock }
    }

    /// Convert a [`RawPlan`] into a validated [`Plan`].
    pub fn build(
        &self,
        raw: RawPlan,
        intent: &Intent,
        constraints: PlanConstraints,
        planning_model_id: &str,
    ) -> OrdoResult<Plan> {
        if raw.steps.is_empty() {
            return Err(OrdoError::PlanGenerationFailed("plan has no steps".into()));
        }

        let mut raw_steps = raw.steps;
        raw_steps.sort_by_key(|s| s.step_number);

        // Capability check before anything else; also catches duplicate raw
        // step numbers which would corrupt the dependency rewrite.
        let mut seen_numbers = std::collections::HashSet::new();
        for step in &raw_steps {
            if !seen_numbers.insert(step.step_number) {
                return Err(OrdoError::PlanValidationFailed(format!(
                    "duplicate raw step number {}",
                    step.step_number
                )));
            }
            if !self.registry.contains(&step.tool_name) {
                return Err(OrdoError::PlanValidationFailed(format!(
                    "unknown capability '{}'",
                    step.tool_name
                )));
            }
        }

        // Fan-out expansion, building original → expanded number map.
        let mut expanded: Vec<(RawPlanStep, u32)> = Vec::new(); // (step, original_number)
        let mut number_map: HashMap<u32, Vec<u32>> = HashMap::new();
        for raw_step in raw_steps {
            let original_number = raw_step.step_number;
            let pieces = self.fan_out(raw_step)?;
            let mut new_numbers = Vec::with_capacity(pieces.len());
            for piece in pieces {
                let new_number = expanded.len() as u32;
                new_numbers.push(new_number);
                expanded.push((piece, original_number));
            }
            number_map.insert(original_number, new_numbers);
        }

        // Dependency rewrite: each raw dependency maps to the union of its
        // expansion, de-duplicated.
        let mut rewritten: Vec<RawPlanStep> = Vec::with_capacity(expanded.len());
        for (i, (mut step, _)) in expanded.into_iter().enumerate() {
            let mut deps: Vec<u32> = Vec::new();
            for dep in &step.dependencies {
                let mapped = number_map.get(dep).ok_or_else(|| {
                    OrdoError::PlanValidationFailed(format!(
                        "step {} depends on unknown step number {dep}",
                        step.step_number
                    ))
                })?;
                deps.extend(mapped.iter().copied());
            }
            deps.sort_unstable();
            deps.dedup();
            step.step_number = i as u32;
            step.dependencies = deps;
            rewritten.push(step);
        }

        // UUID assignment and dependency translation.
        let ids: Vec<Uuid> = rewritten.iter().map(|_| Uuid::new_v4()).collect();
        let mut steps = Vec::with_capacity(rewritten.len());
        for (i, raw_step) in rewritten.into_iter().enumerate() {
            let definition = self.registry.definition(&raw_step.tool_name, None)?;
            let dependencies = raw_step
                .dependencies
                .iter()
                .map(|&n| ids[n as usize])
                .collect();
            steps.push(PlanStep {
                id: ids[i],
                step_number: i as u32,
                tool_name: raw_step.tool_name,
                tool_version: Some(definition.version.clone()),
                parameters: raw_step.parameters,
                dependencies,
                description: raw_step.description,
                requires_confirmation: raw_step.requires_confirmation
                    || definition.requires_confirmation,
                estimated_tokens: raw_step.estimated_tokens,
                timeout_ms: raw_step.timeout_ms.unwrap_or(definition.default_timeout_ms),
            });
        }

        let estimated_total_tokens: u64 = steps.iter().filter_map(|s| s.estimated_tokens).sum();
        let estimated_latency_ms: u64 = steps.iter().map(|s| s.timeout_ms).max().unwrap_or(0);

        let plan = Plan {
            id: Uuid::new_v4(),
            intent_id: intent.id,
            steps,
            constraints,
            metadata: PlanMetadata {
                version: 1,
                created_at: self.clock.now_iso(),
                planning_model_id: planning_model_id.to_string(),
                estimated_total_tokens,
                estimated_latency_ms,
            },
            summary: raw.summary,
        };

        plan.validate()?;
        plan.topological_order()?;
        debug!(plan_id = %plan.id, steps = plan.steps.len(), "plan built");
        Ok(plan)
    }

    /// Split a raw step whose first eligible scalar parameter holds an array
    /// into one step per element. Only the first eligible parameter fans out;
    /// all other parameters are preserved verbatim.
    fn fan_out(&self, step: RawPlanStep) -> OrdoResult<Vec<RawPlanStep>> {
        let definition = self.registry.definition(&step.tool_name, None)?;

        let target = definition.scalar_parameters().into_iter().find(|name| {
            matches!(step.parameters.get(name), Some(serde_json::Value::Array(_)))
        });
        let Some(param_name) = target else {
            return Ok(vec![step]);
        };

        let Some(serde_json::Value::Array(elements)) = step.parameters.get(&param_name).cloned()
        else {
            return Ok(vec![step]);
        };
        if elements.is_empty() {
            return Err(OrdoError::PlanValidationFailed(format!(
                "fan-out parameter '{param_name}' of '{}' is an empty array",
                step.tool_name
            )));
        }

        debug!(
            tool = %step.tool_name,
            param = %param_name,
            count = elements.len(),
            "fan-out expansion"
        );

        Ok(elements
            .into_iter()
            .map(|element| {
                let mut piece = step.clone();
                let label = match &element {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                piece.parameters.insert(param_name.clone(), element);
                piece.description = format!("{} ({label})", step.description);
                piece
            })
            .collect())
    }
}

// ============================================================================
// PlanGenerator — structured generation front-end
// ============================================================================

const PLANNING_SYSTEM_PROMPT: &str = "You are a planning engine. Decompose the \
intent into tool invocation steps. Dependencies reference earlier step numbers. \
Use only the tools listed. Respond with JSON matching the given schema.";

pub struct PlanGenerator {
    generator: Arc<dyn StructuredGenerator>,
    builder: PlanBuilder,
    trace: Arc<dyn TraceSink>,
    clock: Arc<dyn Clock>,
    timeout_ms: u64,
}

impl PlanGenerator {
    pub fn new(
        generator: Arc<dyn StructuredGenerator>,
        registry: Arc<ToolRegistry>,
        clock: Arc<dyn Clock>,
        trace: Arc<dyn TraceSink>,
    ) -> Self {
        Self {
            generator,
            builder: PlanBuilder::new(registry, clock.clone()),
            trace,
            clock,
            timeout_ms: 30_000,
        }
    }

    /// Produce a validated plan for an intent via the structured generator.
    pub async fn generate(
        &self,
        intent: &Intent,
        constraints: PlanConstraints,
    ) -> OrdoResult<Plan> {
        let prompt = format!(
            "Intent type: {:?}\nParameters: {}\nUtterance: {}",
            intent.intent_type,
            serde_json::to_string(&intent.parameters)?,
            intent.raw_text,
        );
        let request = GenerationRequest {
            prompt,
            system: PLANNING_SYSTEM_PROMPT.to_string(),
            schema: raw_plan_schema(),
            temperature: 0.0,
            timeout_ms: self.timeout_ms,
        };

        let output = self
            .generator
            .generate(request)
            .await
            .map_err(|e| OrdoError::PlanGenerationFailed(e.to_string()))?;

        let raw: RawPlan = serde_json::from_value(output.data.clone())
            .map_err(|e| OrdoError::PlanGenerationFailed(format!("malformed plan: {e}")))?;

        let plan = self
            .builder
            .build(raw, intent, constraints, &output.model_id)?;

        let mut entry = TraceEntry::event(TracePhase::Planning, "plan_generated", self.clock.now_iso())
            .with_io(None, Some(serde_json::json!({"plan_id": plan.id, "steps": plan.steps.len()})));
        entry.model_id = Some(output.model_id);
        entry.token_usage = Some(output.token_usage);
        self.trace.record(entry);

        Ok(plan)
    }
}

/// JSON schema handed to the generator for [`RawPlan`] output.
fn raw_plan_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "summary": {"type": "string"},
            "steps": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "step_number": {"type": "integer"},
                        "tool_name": {"type": "string"},
                        "parameters": {"type": "object"},
                        "dependencies": {"type": "array", "items": {"type": "integer"}},
                        "description": {"type": "string"},
                        "requires_confirmation": {"type": "boolean"},
                        "estimated_tokens": {"type": "integer"},
                        "timeout_ms": {"type": "integer"}
                    },
                    "required": ["step_number", "tool_name", "description"]
                }
            }
        },
        "required": ["steps"]
    })
}
