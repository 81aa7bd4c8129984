//! Execution state — the mutable record the orchestrator owns.
//!
//! An [`ExecutionState`] is created when a plan is accepted and mutated only
//! by the lock-holding orchestrator loop. Status changes go through the state
//! machine in [`ExecutionStatus::can_transition_to`]; anything else is
//! rejected with `STATE_TRANSITION_INVALID`. The `version` field is assigned
//! by the persistence layer: each successful optimistic write stores
//! `version + 1`, so the sequence of persisted versions is strictly monotonic
//! and contiguous.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{ErrorCode, OrdoError, OrdoResult};
use crate::plan::Plan;

// ============================================================================
// ExecutionStatus
// ============================================================================

/// Lifecycle status of an execution.
///
/// ```text
/// PENDING → EXECUTING → {COMPLETED, FAILED, AWAITING_CONFIRMATION,
///                        CANCELLED, COMPENSATING}
/// AWAITING_CONFIRMATION → {EXECUTING, CANCELLED, FAILED}
/// FAILED → COMPENSATING → {COMPENSATED, FAILED}
/// COMPLETED, CANCELLED, COMPENSATED are terminal.
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Executing,
    AwaitingConfirmation,
    Completed,
    Failed,
    Cancelled,
    Compensating,
    Compensated,
}

impl ExecutionStatus {
    /// Terminal statuses are sinks: no transition leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Compensated)
    }

    /// Whether the state machine permits `self → to`.
    pub fn can_transition_to(&self, to: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, to),
            (Pending, Executing)
                | (Pending, Cancelled)
                | (Executing, Completed)
                | (Executing, Failed)
                | (Executing, AwaitingConfirmation)
                | (Executing, Cancelled)
                | (Executing, Compensating)
                | (AwaitingConfirmation, Executing)
                | (AwaitingConfirmation, Cancelled)
                | (AwaitingConfirmation, Failed)
                | (Failed, Compensating)
                | (Compensating, Compensated)
                | (Compensating, Failed)
        )
    }
}

// ============================================================================
// StepState
// ============================================================================

/// Per-step lifecycle status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// Error recorded on a failed step or on the execution itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<Uuid>,
}

/// Mutable runtime record for one plan step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepState {
    pub step_id: Uuid,
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default)]
    pub attempts: u32,
}

impl StepState {
    pub fn new(step_id: Uuid) -> Self {
        Self {
            step_id,
            status: StepStatus::Pending,
            input: None,
            output: None,
            error: None,
            started_at: None,
            completed_at: None,
            latency_ms: None,
            attempts: 0,
        }
    }
}

// ============================================================================
// StateTransition — append-only audit log
// ============================================================================

/// One entry in the execution's append-only transition log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: ExecutionStatus,
    pub to: ExecutionStatus,
    pub timestamp: String,
    pub reason: String,
}

// ============================================================================
// ExecutionState
// ============================================================================

/// The mutable execution record, owned by the orchestrator for its lifetime
/// and destroyed by TTL after reaching a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionState {
    pub execution_id: Uuid,
    pub plan: Plan,
    pub status: ExecutionStatus,
    pub current_step_index: usize,
    pub step_states: Vec<StepState>,
    /// Append-only; never truncated or rewritten.
    pub transitions: Vec<StateTransition>,
    /// Scratch space shared across steps: resolved outputs land here under
    /// `step_result:{index}` keys, confirmations and correlation ids too.
    pub context: HashMap<String, serde_json::Value>,
    /// Persisted-record version. Assigned by the memory adapter on each
    /// successful optimistic write; in-memory mutations never touch it.
    pub version: u64,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
}

impl ExecutionState {
    /// Create a fresh `PENDING` record for an accepted plan.
    pub fn new(plan: Plan, now_iso: String) -> Self {
        let step_states = plan.steps.iter().map(|s| StepState::new(s.id)).collect();
        Self {
            execution_id: Uuid::new_v4(),
            plan,
            status: ExecutionStatus::Pending,
            current_step_index: 0,
            step_states,
            transitions: Vec::new(),
            context: HashMap::new(),
            version: 0,
            created_at: now_iso.clone(),
            updated_at: now_iso,
            completed_at: None,
            error: None,
        }
    }

    /// Apply a status transition, appending to the audit log.
    ///
    /// Fails with [`OrdoError::InvalidTransition`] when the state machine
    /// does not permit the move.
    pub fn transition(
        &mut self,
        to: ExecutionStatus,
        reason: impl Into<String>,
        now_iso: String,
    ) -> OrdoResult<()> {
        if !self.status.can_transition_to(to) {
            return Err(OrdoError::invalid_transition(self.status, to));
        }
        self.transitions.push(StateTransition {
            from: self.status,
            to,
            timestamp: now_iso.clone(),
            reason: reason.into(),
        });
        self.status = to;
        self.updated_at = now_iso.clone();
        if to.is_terminal() || to == ExecutionStatus::Failed {
            self.completed_at = Some(now_iso);
        }
        Ok(())
    }

    /// Mutable step state by step id.
    pub fn step_state_mut(&mut self, step_id: Uuid) -> Option<&mut StepState> {
        self.step_states.iter_mut().find(|s| s.step_id == step_id)
    }

    /// Step state by step id.
    pub fn step_state(&self, step_id: Uuid) -> Option<&StepState> {
        self.step_states.iter().find(|s| s.step_id == step_id)
    }

    /// IDs of steps whose status is `completed`.
    pub fn completed_step_ids(&self) -> std::collections::HashSet<Uuid> {
        self.step_states
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .map(|s| s.step_id)
            .collect()
    }

    /// IDs of steps that have reached any terminal status.
    pub fn settled_step_ids(&self) -> std::collections::HashSet<Uuid> {
        self.step_states
            .iter()
            .filter(|s| s.status.is_terminal())
            .map(|s| s.step_id)
            .collect()
    }

    /// `true` when every step has reached a terminal status.
    pub fn all_steps_settled(&self) -> bool {
        self.step_states.iter().all(|s| s.status.is_terminal())
    }

    /// Completed steps in completion order (earliest first), from their
    /// recorded `completed_at` timestamps. Used for reverse-order
    /// compensation.
    pub fn completion_order(&self) -> Vec<Uuid> {
        let mut done: Vec<&StepState> = self
            .step_states
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .collect();
        done.sort_by(|a, b| a.completed_at.cmp(&b.completed_at));
        done.iter().map(|s| s.step_id).collect()
    }
}
