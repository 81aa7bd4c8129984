//! Plan safety verification.
//!
//! Rejects plans that contain a forbidden tool sequence along any dependency
//! chain, exceed a per-tool numeric parameter cap, or carry string parameters
//! matching a blocked pattern. Runs after DAG validation and before any
//! execution state is persisted.

use regex::Regex;
use std::collections::HashMap;
use tracing::warn;
use uuid::Uuid;

use ordo_kernel::error::{OrdoError, OrdoResult};
use ordo_kernel::plan::Plan;

// ============================================================================
// SafetyPolicy
// ============================================================================

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct SafetyPolicy {
    /// Ordered tool-name tuples that must not appear contiguously along a
    /// dependency chain.
    pub forbidden_sequences: Vec<Vec<String>>,
    /// Per-tool numeric caps: tool name → parameter name → maximum value.
    pub parameter_limits: HashMap<String, HashMap<String, f64>>,
    /// Regex sources matched against every string parameter value.
    pub blocked_patterns: Vec<String>,
}

// ============================================================================
// SafetyVerifier
// ============================================================================

pub struct SafetyVerifier {
    policy: SafetyPolicy,
    compiled_patterns: Vec<Regex>,
}

impl SafetyVerifier {
    /// Compile the policy. Invalid regexes are a construction error.
    pub fn new(policy: SafetyPolicy) -> OrdoResult<Self> {
        let compiled_patterns = policy
            .blocked_patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| {
                    OrdoError::Internal(format!("invalid blocked pattern '{p}': {e}"))
                })
            })
            .collect::<OrdoResult<Vec<_>>>()?;
        Ok(Self {
            policy,
            compiled_patterns,
        })
    }

    /// Check a validated plan against the policy.
    pub fn verify(&self, plan: &Plan) -> OrdoResult<()> {
        self.check_parameter_limits(plan)?;
        self.check_blocked_patterns(plan)?;
        self.check_forbidden_sequences(plan)?;
        Ok(())
    }

    fn check_parameter_limits(&self, plan: &Plan) -> OrdoResult<()> {
        for step in &plan.steps {
            let Some(limits) = self.policy.parameter_limits.get(&step.tool_name) else {
                continue;
            };
            for (param, cap) in limits {
                if let Some(value) = step.parameters.get(param).and_then(|v| v.as_f64()) {
                    if value > *cap {
                        warn!(
                            tool = %step.tool_name,
                            param,
                            value,
                            cap,
                            "parameter exceeds safety cap"
                        );
                        return Err(OrdoError::PlanValidationFailed(format!(
                            "step {}: '{param}' = {value} exceeds cap {cap} for '{}'",
                            step.step_number, step.tool_name
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn check_blocked_patterns(&self, plan: &Plan) -> OrdoResult<()> {
        for step in &plan.steps {
            for (name, value) in &step.parameters {
                let Some(text) = value.as_str() else { continue };
                for pattern in &self.compiled_patterns {
                    if pattern.is_match(text) {
                        return Err(OrdoError::PlanValidationFailed(format!(
                            "step {}: parameter '{name}' matches blocked pattern",
                            step.step_number
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// A forbidden sequence `[t0, t1, ..]` matches when some chain of direct
    /// dependency edges carries exactly those tools in order.
    fn check_forbidden_sequences(&self, plan: &Plan) -> OrdoResult<()> {
        if self.policy.forbidden_sequences.is_empty() {
            return Ok(());
        }

        // Direct-dependents adjacency: edge dep → step.
        let mut children: HashMap<Uuid, Vec<&ordo_kernel::plan::PlanStep>> = HashMap::new();
        for step in &plan.steps {
            for dep in &step.dependencies {
                children.entry(*dep).or_default().push(step);
            }
        }

        for sequence in &self.policy.forbidden_sequences {
            if sequence.is_empty() {
                continue;
            }
            for start in plan.steps.iter().filter(|s| s.tool_name == sequence[0]) {
                if Self::chain_matches(start, &sequence[1..], &children) {
                    return Err(OrdoError::PlanValidationFailed(format!(
                        "forbidden sequence [{}] found in dependency chain",
                        sequence.join(" -> ")
                    )));
                }
            }
        }
        Ok(())
    }

    fn chain_matches(
        at: &ordo_kernel::plan::PlanStep,
        rest: &[String],
        children: &HashMap<Uuid, Vec<&ordo_kernel::plan::PlanStep>>,
    ) -> bool {
        let Some(next_tool) = rest.first() else {
            return true;
        };
        children
            .get(&at.id)
            .map(|next_steps| {
                next_steps
                    .iter()
                    .filter(|s| s.tool_name == *next_tool)
                    .any(|s| Self::chain_matches(s, &rest[1..], children))
            })
            .unwrap_or(false)
    }
}
