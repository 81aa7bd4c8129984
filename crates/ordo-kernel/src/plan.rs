//! Plan model — an immutable DAG of tool invocations.
//!
//! Plans arrive from the structured generator as a [`RawPlan`], with
//! dependencies expressed as integer step numbers. The planner converts that
//! into a canonical [`Plan`] whose steps carry UUIDs, then validates the DAG
//! and enforces the plan constraints. Execution order is the topological
//! partial order of the dependency graph.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::error::{OrdoError, OrdoResult};

// ============================================================================
// Constraints & metadata
// ============================================================================

/// Hard limits a plan must satisfy before it is accepted for execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanConstraints {
    pub max_steps: usize,
    pub max_total_tokens: u64,
    pub max_execution_time_ms: u64,
}

impl Default for PlanConstraints {
    fn default() -> Self {
        Self {
            max_steps: 20,
            max_total_tokens: 100_000,
            max_execution_time_ms: 300_000,
        }
    }
}

/// Provenance and cost estimates attached at plan creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanMetadata {
    pub version: u32,
    pub created_at: String,
    pub planning_model_id: String,
    pub estimated_total_tokens: u64,
    pub estimated_latency_ms: u64,
}

// ============================================================================
// PlanStep
// ============================================================================

/// A single executable step within a plan.
///
/// Steps form a DAG via `dependencies` edges; `step_number` is the dense,
/// zero-based position in the canonical ordering and every dependency must
/// refer to an earlier step number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: Uuid,
    pub step_number: u32,
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_version: Option<String>,
    pub parameters: HashMap<String, serde_json::Value>,
    /// IDs of steps that must complete before this step can start.
    #[serde(default)]
    pub dependencies: Vec<Uuid>,
    pub description: String,
    #[serde(default)]
    pub requires_confirmation: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_tokens: Option<u64>,
    pub timeout_ms: u64,
}

impl PlanStep {
    /// Returns `true` if all listed dependencies are in `completed_ids`.
    pub fn dependencies_met(&self, completed_ids: &HashSet<Uuid>) -> bool {
        self.dependencies.iter().all(|dep| completed_ids.contains(dep))
    }
}

// ============================================================================
// Plan
// ============================================================================

/// A validated, immutable execution plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub intent_id: Uuid,
    /// Steps in canonical order (`step_number` ascending). The DAG expressed
    /// by `dependencies` is authoritative for execution ordering.
    pub steps: Vec<PlanStep>,
    pub constraints: PlanConstraints,
    pub metadata: PlanMetadata,
    pub summary: String,
}

impl Plan {
    /// Look up a step by its ID.
    pub fn get_step(&self, id: Uuid) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Return the steps that are ready given the set of completed step IDs,
    /// ordered by `step_number` ascending.
    pub fn ready_steps(&self, completed: &HashSet<Uuid>) -> Vec<&PlanStep> {
        self.steps
            .iter()
            .filter(|s| !completed.contains(&s.id) && s.dependencies_met(completed))
            .collect()
    }

    /// Σ of `estimated_tokens` over all steps.
    pub fn estimated_total_tokens(&self) -> u64 {
        self.steps.iter().filter_map(|s| s.estimated_tokens).sum()
    }

    // -----------------------------------------------------------------------
    // DAG validation
    // -----------------------------------------------------------------------

    /// Validate the plan structure.
    ///
    /// Checks, in order:
    /// 1. `step_number`s are dense and zero-based
    /// 2. no duplicate step IDs
    /// 3. every dependency refers to an existing, *earlier* step
    /// 4. the graph is acyclic (DFS back-edge check)
    /// 5. constraint caps (`max_steps`, `max_total_tokens`)
    pub fn validate(&self) -> OrdoResult<()> {
        for (i, step) in self.steps.iter().enumerate() {
            if step.step_number as usize != i {
                return Err(OrdoError::PlanValidationFailed(format!(
                    "step numbers must be dense and zero-based; position {} holds step_number {}",
                    i, step.step_number
                )));
            }
        }

        let mut by_id: HashMap<Uuid, u32> = HashMap::with_capacity(self.steps.len());
        for step in &self.steps {
            if by_id.insert(step.id, step.step_number).is_some() {
                return Err(OrdoError::PlanValidationFailed(format!(
                    "duplicate step id {}",
                    step.id
                )));
            }
        }

        for step in &self.steps {
            for dep in &step.dependencies {
                match by_id.get(dep) {
                    None => {
                        return Err(OrdoError::PlanValidationFailed(format!(
                            "step {} depends on non-existent step {}",
                            step.step_number, dep
                        )));
                    }
                    Some(&dep_number) if dep_number >= step.step_number => {
                        return Err(OrdoError::PlanValidationFailed(format!(
                            "step {} depends on step {} which does not precede it",
                            step.step_number, dep_number
                        )));
                    }
                    Some(_) => {}
                }
            }
        }

        self.detect_cycles()?;

        if self.steps.len() > self.constraints.max_steps {
            return Err(OrdoError::PlanValidationFailed(format!(
                "plan has {} steps, limit is {}",
                self.steps.len(),
                self.constraints.max_steps
            )));
        }
        let tokens = self.estimated_total_tokens();
        if tokens > self.constraints.max_total_tokens {
            return Err(OrdoError::PlanValidationFailed(format!(
                "plan estimates {} tokens, limit is {}",
                tokens, self.constraints.max_total_tokens
            )));
        }

        Ok(())
    }

    /// DFS back-edge cycle check over the dependency graph.
    fn detect_cycles(&self) -> OrdoResult<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            White,
            Grey,
            Black,
        }

        let index: HashMap<Uuid, usize> =
            self.steps.iter().enumerate().map(|(i, s)| (s.id, i)).collect();
        let mut marks = vec![Mark::White; self.steps.len()];

        fn visit(
            at: usize,
            steps: &[PlanStep],
            index: &HashMap<Uuid, usize>,
            marks: &mut [Mark],
        ) -> OrdoResult<()> {
            marks[at] = Mark::Grey;
            for dep in &steps[at].dependencies {
                if let Some(&next) = index.get(dep) {
                    match marks[next] {
                        Mark::Grey => {
                            return Err(OrdoError::PlanCircularDependency(format!(
                                "back-edge from step {} to step {}",
                                steps[at].step_number, steps[next].step_number
                            )));
                        }
                        Mark::White => visit(next, steps, index, marks)?,
                        Mark::Black => {}
                    }
                }
            }
            marks[at] = Mark::Black;
            Ok(())
        }

        for i in 0..self.steps.len() {
            if marks[i] == Mark::White {
                visit(i, &self.steps, &index, &mut marks)?;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Topological order
    // -----------------------------------------------------------------------

    /// Produce a topological ordering of step IDs via Kahn's algorithm.
    ///
    /// Ties are broken by `step_number` ascending so the ordering is
    /// deterministic. Any non-zero residual in-degree means a cycle.
    pub fn topological_order(&self) -> OrdoResult<Vec<Uuid>> {
        let index: HashMap<Uuid, usize> =
            self.steps.iter().enumerate().map(|(i, s)| (s.id, i)).collect();

        let mut in_degree = vec![0usize; self.steps.len()];
        let mut children: Vec<Vec<usize>> = vec![Vec::new(); self.steps.len()];
        for (i, step) in self.steps.iter().enumerate() {
            for dep in &step.dependencies {
                if let Some(&d) = index.get(dep) {
                    children[d].push(i);
                    in_degree[i] += 1;
                }
            }
        }

        // Queue holds plan indices; kept sorted so pop_front order is the
        // step_number order (steps are stored in that order).
        let mut queue: Vec<usize> = (0..self.steps.len()).filter(|&i| in_degree[i] == 0).collect();
        queue.sort_unstable();

        let mut order = Vec::with_capacity(self.steps.len());
        let mut head = 0;
        while head < queue.len() {
            let at = queue[head];
            head += 1;
            order.push(self.steps[at].id);
            let mut released: Vec<usize> = Vec::new();
            for &child in &children[at] {
                in_degree[child] -= 1;
                if in_degree[child] == 0 {
                    released.push(child);
                }
            }
            released.sort_unstable();
            queue.extend(released);
        }

        if order.len() != self.steps.len() {
            return Err(OrdoError::PlanCircularDependency(
                "residual in-degree after Kahn's algorithm".into(),
            ));
        }
        Ok(order)
    }

    /// Reconstruct the dependency edge set `(from, to)` pairs — used to check
    /// that ordering round-trips preserve the DAG.
    pub fn dependency_edges(&self) -> HashSet<(Uuid, Uuid)> {
        self.steps
            .iter()
            .flat_map(|s| s.dependencies.iter().map(move |d| (*d, s.id)))
            .collect()
    }
}

// ============================================================================
// RawPlan — generator output before canonicalization
// ============================================================================

/// A step as emitted by the plan generator: dependencies are integer step
/// numbers, IDs are not yet assigned, and array-valued scalar parameters may
/// still need fan-out expansion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawPlanStep {
    pub step_number: u32,
    pub tool_name: String,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub dependencies: Vec<u32>,
    pub description: String,
    #[serde(default)]
    pub requires_confirmation: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// The generator's whole-plan output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawPlan {
    pub steps: Vec<RawPlanStep>,
    #[serde(default)]
    pub summary: String,
}
