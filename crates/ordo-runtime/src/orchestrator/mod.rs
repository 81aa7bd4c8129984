//! The durable execution orchestrator.
//!
//! One orchestrator loop owns an execution at a time, serialized by the
//! execution's distributed lock; distinct executions run in parallel. The
//! loop is cooperative: it suspends at tool invocations, state persistence,
//! confirmation gates, and scheduled backoff, writing a checkpoint before
//! every return of control so a different process can pick the execution up.
//!
//! Every state mutation goes through the optimistic writer in
//! [`ExecutionMemory`], so concurrent updates from retries and user
//! follow-ups rebase instead of clobbering each other.

mod params;
mod resume;

pub use params::{ResolvedParams, resolve_parameters};
pub use resume::{DriftReport, ResumeWorker, WorkerConfig};

use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use ordo_kernel::capabilities::ToolExecutor;
use ordo_kernel::checkpoint::{Checkpoint, CheckpointReason, CodeIdentity};
use ordo_kernel::clock::Clock;
use ordo_kernel::error::{ErrorCode, OrdoError, OrdoResult};
use ordo_kernel::execution::{
    ExecutionError, ExecutionState, ExecutionStatus, StepStatus,
};
use ordo_kernel::failover::render_template;
use ordo_kernel::intent::Intent;
use ordo_kernel::plan::{Plan, PlanStep};
use ordo_kernel::tool::{ToolError, ToolOutcome};
use ordo_kernel::trace::{TraceEntry, TracePhase, TraceSink};
use ordo_kernel::triage::{FailureCategory, SuggestedAction, TriageResult};

use crate::failover::FailoverEngine;
use crate::idempotency::{IdempotencyClaim, IdempotencyGuard};
use crate::lock::QuorumLock;
use crate::memory::ExecutionMemory;
use crate::queue::TaskQueue;
use crate::registry::ToolRegistry;
use crate::retry::RetryPolicy;
use crate::triage::TriageService;

// Context keys shared across the engine.
pub(crate) const CTX_INTENT: &str = "intent";
pub(crate) const CTX_USER_ID: &str = "user_id";
pub(crate) const CTX_CORRELATION_ID: &str = "correlation_id";
pub(crate) const CTX_IDEMPOTENCY_KEY: &str = "idempotency_key";
pub(crate) const CTX_DEADLINE_MS: &str = "deadline_at_ms";
pub(crate) const CTX_AWAITING_STEP: &str = "awaiting_confirmation_step";
pub(crate) const CTX_ESCALATION_MESSAGE: &str = "escalation_message";

// ============================================================================
// Configuration & request
// ============================================================================

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Total attempts per step, first try included.
    pub max_step_attempts: u32,
    /// Cap on immediate modified-parameter retries per step.
    pub max_modified_param_retries: u32,
    /// Steps dispatched before the loop checkpoints and requeues itself.
    pub steps_per_slice: usize,
    /// Backoff shape for `RETRY_WITH_BACKOFF` scheduling.
    pub retry_backoff: RetryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_step_attempts: 3,
            max_modified_param_retries: 2,
            steps_per_slice: 32,
            retry_backoff: RetryPolicy::ExponentialBackoff {
                base_ms: 1_000,
                max_ms: 30_000,
                jitter: true,
            },
        }
    }
}

/// Everything needed to accept a plan for execution. The boundary headers
/// (`x-correlation-id`, `x-idempotency-key`) land here; absent values are
/// generated.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub intent: Intent,
    pub plan: Plan,
    pub user_id: Option<String>,
    pub correlation_id: Option<String>,
    pub idempotency_key: Option<String>,
}

/// What a dispatch round decided.
enum StepFlow {
    /// Keep looping.
    Continue,
    /// Control returned to the caller; a checkpoint has been written.
    Suspended,
    /// The execution reached a terminal or failed status.
    Done,
}

// ============================================================================
// Orchestrator
// ============================================================================

pub struct Orchestrator {
    memory: Arc<ExecutionMemory>,
    executor: Arc<dyn ToolExecutor>,
    registry: Arc<ToolRegistry>,
    triage: Arc<TriageService>,
    failover: Arc<FailoverEngine>,
    queue: Arc<TaskQueue>,
    idempotency: Arc<IdempotencyGuard>,
    lock: Arc<QuorumLock>,
    trace: Arc<dyn TraceSink>,
    clock: Arc<dyn Clock>,
    identity: CodeIdentity,
    config: OrchestratorConfig,
    cancel_flags: DashMap<Uuid, Arc<AtomicBool>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        memory: Arc<ExecutionMemory>,
        executor: Arc<dyn ToolExecutor>,
        registry: Arc<ToolRegistry>,
        triage: Arc<TriageService>,
        failover: Arc<FailoverEngine>,
        queue: Arc<TaskQueue>,
        idempotency: Arc<IdempotencyGuard>,
        lock: Arc<QuorumLock>,
        trace: Arc<dyn TraceSink>,
        clock: Arc<dyn Clock>,
        identity: CodeIdentity,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            memory,
            executor,
            registry,
            triage,
            failover,
            queue,
            idempotency,
            lock,
            trace,
            clock,
            identity,
            config,
            cancel_flags: DashMap::new(),
        }
    }

    // ------------------------------------------------------------------
    // Public API
    // ------------------------------------------------------------------

    /// Accept a plan: persist a fresh `PENDING` execution record.
    pub async fn start(&self, request: ExecutionRequest) -> OrdoResult<ExecutionState> {
        request.plan.validate()?;

        let mut state = ExecutionState::new(request.plan, self.clock.now_iso());
        state.context.insert(
            CTX_INTENT.into(),
            serde_json::to_value(&request.intent)?,
        );
        state.context.insert(
            CTX_USER_ID.into(),
            serde_json::Value::String(request.user_id.unwrap_or_else(|| "anonymous".into())),
        );
        state.context.insert(
            CTX_CORRELATION_ID.into(),
            serde_json::Value::String(
                request
                    .correlation_id
                    .unwrap_or_else(|| Uuid::new_v4().to_string()),
            ),
        );
        state.context.insert(
            CTX_IDEMPOTENCY_KEY.into(),
            serde_json::Value::String(
                request
                    .idempotency_key
                    .unwrap_or_else(|| Uuid::new_v4().to_string()),
            ),
        );

        let state = self.memory.create(state).await?;
        info!(execution_id = %state.execution_id, steps = state.plan.steps.len(), "execution accepted");
        self.trace.record(
            TraceEntry::event(TracePhase::Execution, "execution_accepted", self.clock.now_iso())
                .with_io(
                    Some(serde_json::json!({"execution_id": state.execution_id})),
                    None,
                ),
        );
        Ok(state)
    }

    /// Accept and immediately drive the execution.
    pub async fn execute(&self, request: ExecutionRequest) -> OrdoResult<ExecutionState> {
        let state = self.start(request).await?;
        self.run(state.execution_id).await
    }

    /// Drive an execution until it completes, fails, or suspends. The
    /// execution's distributed lock is held for the duration.
    pub async fn run(&self, execution_id: Uuid) -> OrdoResult<ExecutionState> {
        let handle = self.lock.acquire(&format!("exec:{execution_id}")).await?;
        let result = self.run_locked(execution_id).await;
        self.lock.release(&handle).await;
        result
    }

    /// Approve or reject a pending confirmation gate.
    pub async fn confirm(&self, execution_id: Uuid, approved: bool) -> OrdoResult<ExecutionState> {
        let handle = self.lock.acquire(&format!("exec:{execution_id}")).await?;
        let outcome = self.apply_confirmation(execution_id, approved).await;
        self.lock.release(&handle).await;
        outcome?;

        if approved {
            self.run(execution_id).await
        } else {
            self.memory.load_required(execution_id).await
        }
    }

    /// Request cooperative cancellation. A loop currently holding the lock
    /// observes the flag at its next suspension point and discards any tool
    /// result that arrives afterwards; an idle execution is cancelled
    /// directly.
    pub async fn cancel(&self, execution_id: Uuid, reason: &str) -> OrdoResult<()> {
        self.cancel_flag(execution_id).store(true, Ordering::SeqCst);

        // Best effort direct transition when nobody holds the lock.
        if let Ok(handle) = self.lock.acquire(&format!("exec:{execution_id}")).await {
            let result = self
                .memory
                .save_with_occ(execution_id, |state| {
                    if !state.status.is_terminal()
                        && state.status.can_transition_to(ExecutionStatus::Cancelled)
                    {
                        state.transition(
                            ExecutionStatus::Cancelled,
                            format!("cancel requested: {reason}"),
                            self.clock.now_iso(),
                        )?;
                    }
                    Ok(())
                })
                .await;
            self.lock.release(&handle).await;
            let state = result?;
            if state.status.is_terminal() {
                self.cancel_flags.remove(&execution_id);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Main loop
    // ------------------------------------------------------------------

    async fn run_locked(&self, execution_id: Uuid) -> OrdoResult<ExecutionState> {
        let mut state = self.memory.load_required(execution_id).await?;
        if state.status.is_terminal() {
            return Ok(state);
        }

        if state.status == ExecutionStatus::Pending {
            let deadline = self.clock.now_millis() + state.plan.constraints.max_execution_time_ms;
            state = self
                .memory
                .save_with_occ(execution_id, |s| {
                    if s.status == ExecutionStatus::Pending {
                        s.context
                            .insert(CTX_DEADLINE_MS.into(), serde_json::json!(deadline));
                        s.transition(
                            ExecutionStatus::Executing,
                            "dispatch started",
                            self.clock.now_iso(),
                        )?;
                    }
                    Ok(())
                })
                .await?;
        }

        if state.status != ExecutionStatus::Executing {
            // Awaiting confirmation, compensating restart, or a race put us
            // elsewhere; nothing to drive here.
            return Ok(state);
        }

        let mut steps_this_slice = 0usize;
        loop {
            state = self.memory.load_required(execution_id).await?;
            if state.status != ExecutionStatus::Executing {
                return Ok(state);
            }

            if self.cancel_requested(execution_id) {
                return self.finish_cancelled(execution_id).await;
            }

            if let Some(deadline) = state.context.get(CTX_DEADLINE_MS).and_then(|v| v.as_u64()) {
                if self.clock.now_millis() >= deadline {
                    return self.finish_deadline_exceeded(execution_id, &state).await;
                }
            }

            if state.all_steps_settled() {
                return self.finish_completed(execution_id).await;
            }

            let settled = state.settled_step_ids();
            let next = state
                .plan
                .steps
                .iter()
                .filter(|step| {
                    state
                        .step_state(step.id)
                        .map(|s| s.status == StepStatus::Pending)
                        .unwrap_or(false)
                })
                .find(|step| {
                    // A skipped dependency unblocks its dependents; its
                    // output references degrade to literals with warnings.
                    step.dependencies.iter().all(|d| settled.contains(d))
                });

            let Some(step) = next.cloned() else {
                return self.finish_deadlocked(execution_id).await;
            };

            if steps_this_slice >= self.config.steps_per_slice {
                let state = self
                    .suspend(execution_id, CheckpointReason::TimeSliceExhausted, Duration::ZERO)
                    .await?;
                return Ok(state);
            }

            match self.dispatch_step(execution_id, &step).await? {
                StepFlow::Continue => {
                    steps_this_slice += 1;
                }
                StepFlow::Suspended | StepFlow::Done => {
                    return self.memory.load_required(execution_id).await;
                }
            }
        }
    }

    /// Dispatch one ready step: confirmation gate, parameter resolution,
    /// idempotency, execution, and success/failure bookkeeping.
    async fn dispatch_step(&self, execution_id: Uuid, step: &PlanStep) -> OrdoResult<StepFlow> {
        let state = self.memory.load_required(execution_id).await?;

        // Confirmation gate.
        let confirmed = state
            .context
            .get(&format!("confirmation:{}", step.id))
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if step.requires_confirmation && !confirmed {
            let step_id = step.id;
            self.memory
                .save_with_occ(execution_id, |s| {
                    if s.status == ExecutionStatus::Executing {
                        s.context.insert(
                            CTX_AWAITING_STEP.into(),
                            serde_json::json!(step_id.to_string()),
                        );
                        s.transition(
                            ExecutionStatus::AwaitingConfirmation,
                            format!("step {} requires confirmation", step_id),
                            self.clock.now_iso(),
                        )?;
                    }
                    Ok(())
                })
                .await?;
            self.write_checkpoint(execution_id, CheckpointReason::AwaitingConfirmation)
                .await?;
            self.trace.record(
                TraceEntry::event(TracePhase::Execution, "awaiting_confirmation", self.clock.now_iso())
                    .with_step(step.id),
            );
            return Ok(StepFlow::Suspended);
        }

        // Parameter resolution.
        let resolved = resolve_parameters(&state, step);
        for warning in &resolved.warnings {
            warn!(step_id = %step.id, warning = %warning, "parameter resolution warning");
            self.trace.record(
                TraceEntry::event(TracePhase::Execution, "unresolved_reference", self.clock.now_iso())
                    .with_step(step.id)
                    .with_error(warning.clone()),
            );
        }
        let resolved_params = resolved.value;

        // Idempotency gate.
        let user_id = state
            .context
            .get(CTX_USER_ID)
            .and_then(|v| v.as_str())
            .unwrap_or("anonymous")
            .to_string();
        let claim = self
            .idempotency
            .claim(&user_id, &step.tool_name, &resolved_params)
            .await?;
        if let IdempotencyClaim::Duplicate { cached_output } = claim {
            debug!(step_id = %step.id, "idempotency collision, side effect suppressed");
            let step_id = step.id;
            let step_number = step.step_number;
            let now = self.clock.now_iso();
            self.memory
                .save_with_occ(execution_id, |s| {
                    if let Some(record) = s.step_state_mut(step_id) {
                        match &cached_output {
                            Some(output) => {
                                record.status = StepStatus::Completed;
                                record.output = Some(output.clone());
                            }
                            None => record.status = StepStatus::Skipped,
                        }
                        record.completed_at = Some(now.clone());
                    }
                    if let Some(output) = &cached_output {
                        s.context
                            .insert(format!("step_result:{step_number}"), output.clone());
                    }
                    Ok(())
                })
                .await?;
            self.trace.record(
                TraceEntry::event(TracePhase::Execution, "idempotent_duplicate", self.clock.now_iso())
                    .with_step(step.id),
            );
            return Ok(StepFlow::Continue);
        }

        // Mark in-progress.
        let step_id = step.id;
        let input_snapshot = resolved_params.clone();
        let now = self.clock.now_iso();
        self.memory
            .save_with_occ(execution_id, |s| {
                s.current_step_index = step.step_number as usize;
                if let Some(record) = s.step_state_mut(step_id) {
                    record.status = StepStatus::InProgress;
                    record.attempts += 1;
                    record.input = Some(input_snapshot.clone());
                    record.started_at = Some(now.clone());
                }
                Ok(())
            })
            .await?;
        self.trace.record(
            TraceEntry::event(TracePhase::Execution, "step_started", self.clock.now_iso())
                .with_step(step.id)
                .with_io(Some(resolved_params.clone()), None),
        );

        // Execute under the per-step timeout.
        let tool_ref = match &step.tool_version {
            Some(version) => format!("{}@{version}", step.tool_name),
            None => step.tool_name.clone(),
        };
        let outcome = match self
            .executor
            .execute(&tool_ref, &resolved_params, step.timeout_ms)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => ToolOutcome::err(e.to_string(), None, 0),
        };

        // Results arriving after a cancellation request are discarded.
        if self.cancel_requested(execution_id) {
            self.finish_cancelled(execution_id).await?;
            return Ok(StepFlow::Done);
        }

        if outcome.success {
            self.record_step_success(execution_id, step, &user_id, &resolved_params, &outcome)
                .await?;
            Ok(StepFlow::Continue)
        } else {
            // Release the dedup claim so a retry may re-invoke the effect.
            self.idempotency
                .release(&user_id, &step.tool_name, &resolved_params)
                .await?;
            let error = outcome.error.clone().unwrap_or(ToolError {
                message: "tool reported failure without detail".into(),
                code: None,
            });
            let triage = self.triage.triage(&step.tool_name, &error).await;
            self.trace.record(
                TraceEntry::event(TracePhase::Execution, "step_failed", self.clock.now_iso())
                    .with_step(step.id)
                    .with_error(error.message.clone())
                    .with_latency(outcome.latency_ms),
            );
            self.handle_step_failure(execution_id, step, error, triage).await
        }
    }

    async fn record_step_success(
        &self,
        execution_id: Uuid,
        step: &PlanStep,
        user_id: &str,
        params: &serde_json::Value,
        outcome: &ToolOutcome,
    ) -> OrdoResult<()> {
        let output = outcome.output.clone().unwrap_or(serde_json::Value::Null);
        self.idempotency
            .record_output(user_id, &step.tool_name, params, &output)
            .await?;

        let step_id = step.id;
        let step_number = step.step_number;
        let latency_ms = outcome.latency_ms;
        let now = self.clock.now_iso();
        self.memory
            .save_with_occ(execution_id, |s| {
                if let Some(record) = s.step_state_mut(step_id) {
                    record.status = StepStatus::Completed;
                    record.output = Some(output.clone());
                    record.completed_at = Some(now.clone());
                    record.latency_ms = Some(latency_ms);
                    record.error = None;
                }
                s.context
                    .insert(format!("step_result:{step_number}"), output.clone());
                Ok(())
            })
            .await?;

        self.trace.record(
            TraceEntry::event(TracePhase::Execution, "step_completed", self.clock.now_iso())
                .with_step(step.id)
                .with_io(None, outcome.output.clone())
                .with_latency(outcome.latency_ms),
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Failure policy
    // ------------------------------------------------------------------

    async fn handle_step_failure(
        &self,
        execution_id: Uuid,
        step: &PlanStep,
        error: ToolError,
        triage: TriageResult,
    ) -> OrdoResult<StepFlow> {
        let state = self.memory.load_required(execution_id).await?;
        let intent: Option<Intent> = state
            .context
            .get(CTX_INTENT)
            .and_then(|v| serde_json::from_value(v.clone()).ok());

        let matched = intent
            .as_ref()
            .and_then(|i| self.failover.evaluate(i, &triage));
        let (action_kind, action) = match &matched {
            Some(m) => (m.recommended_action.kind, Some(&m.recommended_action)),
            None => (triage.suggested_action, None),
        };
        let attempts = state
            .step_state(step.id)
            .map(|s| s.attempts)
            .unwrap_or(1);

        debug!(
            step_id = %step.id,
            category = ?triage.category,
            ?action_kind,
            attempts,
            "triaged step failure"
        );

        match action_kind {
            SuggestedAction::RetryWithBackoff => {
                let cap = action
                    .and_then(|a| a.max_retries)
                    .unwrap_or(self.config.max_step_attempts);
                if attempts < cap {
                    self.reset_step_to_pending(execution_id, step.id).await?;
                    let base = action.and_then(|a| a.retry_delay_ms);
                    let delay = self.backoff_delay(base, attempts);
                    let state = self
                        .suspend(execution_id, CheckpointReason::ScheduledRetry, delay)
                        .await?;
                    debug!(execution_id = %state.execution_id, ?delay, "retry scheduled");
                    return Ok(StepFlow::Suspended);
                }
                self.fail_execution(execution_id, step, &error, &triage, None)
                    .await?;
                Ok(StepFlow::Done)
            }
            SuggestedAction::RetryWithModifiedParams => {
                let retries_key = format!("modified_retries:{}", step.id);
                let used = state
                    .context
                    .get(&retries_key)
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0) as u32;
                let overrides = action
                    .and_then(|a| a.params.get("param_overrides"))
                    .cloned();
                if used < self.config.max_modified_param_retries && overrides.is_some() {
                    let step_id = step.id;
                    self.memory
                        .save_with_occ(execution_id, |s| {
                            s.context
                                .insert(retries_key.clone(), serde_json::json!(used + 1));
                            if let Some(o) = &overrides {
                                s.context
                                    .insert(format!("param_overrides:{step_id}"), o.clone());
                            }
                            if let Some(record) = s.step_state_mut(step_id) {
                                record.status = StepStatus::Pending;
                            }
                            Ok(())
                        })
                        .await?;
                    self.trace.record(
                        TraceEntry::event(TracePhase::Execution, "retry_modified_params", self.clock.now_iso())
                            .with_step(step.id),
                    );
                    return Ok(StepFlow::Continue);
                }
                self.fail_execution(execution_id, step, &error, &triage, None)
                    .await?;
                Ok(StepFlow::Done)
            }
            SuggestedAction::SkipStep => {
                let step_id = step.id;
                let now = self.clock.now_iso();
                let step_error = ExecutionError {
                    code: Self::step_error_code(&triage),
                    message: error.message.clone(),
                    step_id: Some(step_id),
                };
                self.memory
                    .save_with_occ(execution_id, |s| {
                        if let Some(record) = s.step_state_mut(step_id) {
                            record.status = StepStatus::Skipped;
                            record.error = Some(step_error.clone());
                            record.completed_at = Some(now.clone());
                        }
                        Ok(())
                    })
                    .await?;
                self.trace.record(
                    TraceEntry::event(TracePhase::Execution, "step_skipped", self.clock.now_iso())
                        .with_step(step.id),
                );
                Ok(StepFlow::Continue)
            }
            SuggestedAction::TriggerCompensation => {
                self.record_step_failed(execution_id, step, &error, &triage).await?;
                self.memory
                    .save_with_occ(execution_id, |s| {
                        if s.status == ExecutionStatus::Executing {
                            s.transition(
                                ExecutionStatus::Compensating,
                                "triage requested compensation",
                                self.clock.now_iso(),
                            )?;
                        }
                        Ok(())
                    })
                    .await?;
                self.run_compensations(execution_id).await?;
                Ok(StepFlow::Done)
            }
            SuggestedAction::EscalateToHuman => {
                let message = action.map(|a| {
                    render_template(&a.message_template, &a.params)
                });
                self.fail_execution(execution_id, step, &error, &triage, message)
                    .await?;
                Ok(StepFlow::Done)
            }
        }
    }

    /// Run compensations for completed steps in reverse completion order.
    async fn run_compensations(&self, execution_id: Uuid) -> OrdoResult<()> {
        let state = self.memory.load_required(execution_id).await?;
        self.trace.record(TraceEntry::event(
            TracePhase::Execution,
            "compensation_started",
            self.clock.now_iso(),
        ));

        let mut order = state.completion_order();
        order.reverse();

        for step_id in order {
            let Some(plan_step) = state.plan.get_step(step_id) else {
                continue;
            };
            let Ok(definition) = self
                .registry
                .definition(&plan_step.tool_name, plan_step.tool_version.as_deref())
            else {
                continue;
            };
            let Some(compensation_tool) = definition.compensation_tool else {
                continue;
            };

            let record = state.step_state(step_id);
            let payload = serde_json::json!({
                "original_parameters": record.and_then(|r| r.input.clone()),
                "original_output": record.and_then(|r| r.output.clone()),
            });
            let timeout_ms = self
                .registry
                .definition(&compensation_tool, None)
                .map(|d| d.default_timeout_ms)
                .unwrap_or(30_000);

            let outcome = self
                .executor
                .execute(&compensation_tool, &payload, timeout_ms)
                .await;
            let failed = !matches!(&outcome, Ok(o) if o.success);
            if failed {
                warn!(step_id = %step_id, tool = %compensation_tool, "compensation failed");
                self.memory
                    .save_with_occ(execution_id, |s| {
                        if s.status == ExecutionStatus::Compensating {
                            s.transition(
                                ExecutionStatus::Failed,
                                format!("compensation via '{compensation_tool}' failed"),
                                self.clock.now_iso(),
                            )?;
                        }
                        Ok(())
                    })
                    .await?;
                return Ok(());
            }
            self.trace.record(
                TraceEntry::event(TracePhase::Execution, "step_compensated", self.clock.now_iso())
                    .with_step(step_id),
            );
        }

        self.memory
            .save_with_occ(execution_id, |s| {
                if s.status == ExecutionStatus::Compensating {
                    s.transition(
                        ExecutionStatus::Compensated,
                        "all compensations applied",
                        self.clock.now_iso(),
                    )?;
                }
                Ok(())
            })
            .await?;
        self.trace.record(TraceEntry::event(
            TracePhase::Execution,
            "compensation_completed",
            self.clock.now_iso(),
        ));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Terminal & suspension helpers
    // ------------------------------------------------------------------

    async fn finish_completed(&self, execution_id: Uuid) -> OrdoResult<ExecutionState> {
        let state = self
            .memory
            .save_with_occ(execution_id, |s| {
                if s.status == ExecutionStatus::Executing {
                    s.transition(
                        ExecutionStatus::Completed,
                        "all steps settled",
                        self.clock.now_iso(),
                    )?;
                }
                Ok(())
            })
            .await?;
        info!(execution_id = %execution_id, version = state.version, "execution completed");
        self.trace.record(TraceEntry::event(
            TracePhase::Execution,
            "execution_completed",
            self.clock.now_iso(),
        ));
        Ok(state)
    }

    async fn finish_cancelled(&self, execution_id: Uuid) -> OrdoResult<ExecutionState> {
        let state = self
            .memory
            .save_with_occ(execution_id, |s| {
                if s.status.can_transition_to(ExecutionStatus::Cancelled) {
                    s.transition(
                        ExecutionStatus::Cancelled,
                        "cancellation observed",
                        self.clock.now_iso(),
                    )?;
                }
                Ok(())
            })
            .await?;
        self.cancel_flags.remove(&execution_id);
        self.trace.record(TraceEntry::event(
            TracePhase::Execution,
            "execution_cancelled",
            self.clock.now_iso(),
        ));
        Ok(state)
    }

    async fn finish_deadline_exceeded(
        &self,
        execution_id: Uuid,
        state: &ExecutionState,
    ) -> OrdoResult<ExecutionState> {
        let deadline_ms = state.plan.constraints.max_execution_time_ms;
        let state = self
            .memory
            .save_with_occ(execution_id, |s| {
                if s.status == ExecutionStatus::Executing {
                    s.error = Some(ExecutionError {
                        code: ErrorCode::ExecutionTimeout,
                        message: format!("execution exceeded {deadline_ms}ms"),
                        step_id: None,
                    });
                    s.transition(
                        ExecutionStatus::Failed,
                        "execution deadline exceeded",
                        self.clock.now_iso(),
                    )?;
                }
                Ok(())
            })
            .await?;
        self.trace.record(
            TraceEntry::event(TracePhase::Execution, "execution_failed", self.clock.now_iso())
                .with_error("EXECUTION_TIMEOUT"),
        );
        Ok(state)
    }

    async fn finish_deadlocked(&self, execution_id: Uuid) -> OrdoResult<ExecutionState> {
        warn!(execution_id = %execution_id, "no ready step but unsettled steps remain");
        let state = self
            .memory
            .save_with_occ(execution_id, |s| {
                if s.status == ExecutionStatus::Executing {
                    s.error = Some(ExecutionError {
                        code: ErrorCode::PlanCircularDependency,
                        message: "no dispatchable step but unsettled steps remain".into(),
                        step_id: None,
                    });
                    s.transition(
                        ExecutionStatus::Failed,
                        "dispatch dead-lock",
                        self.clock.now_iso(),
                    )?;
                }
                Ok(())
            })
            .await?;
        self.trace.record(
            TraceEntry::event(TracePhase::Execution, "execution_failed", self.clock.now_iso())
                .with_error("PLAN_CIRCULAR_DEPENDENCY"),
        );
        Ok(state)
    }

    async fn fail_execution(
        &self,
        execution_id: Uuid,
        step: &PlanStep,
        error: &ToolError,
        triage: &TriageResult,
        escalation_message: Option<String>,
    ) -> OrdoResult<ExecutionState> {
        self.record_step_failed(execution_id, step, error, triage).await?;
        let code = Self::step_error_code(triage);
        let message = error.message.clone();
        let step_id = step.id;
        let state = self
            .memory
            .save_with_occ(execution_id, |s| {
                s.error = Some(ExecutionError {
                    code,
                    message: message.clone(),
                    step_id: Some(step_id),
                });
                if let Some(rendered) = &escalation_message {
                    s.context.insert(
                        CTX_ESCALATION_MESSAGE.into(),
                        serde_json::Value::String(rendered.clone()),
                    );
                }
                if s.status.can_transition_to(ExecutionStatus::Failed) {
                    s.transition(
                        ExecutionStatus::Failed,
                        "unrecoverable step failure",
                        self.clock.now_iso(),
                    )?;
                }
                Ok(())
            })
            .await?;
        self.trace.record(
            TraceEntry::event(TracePhase::Execution, "execution_failed", self.clock.now_iso())
                .with_step(step_id)
                .with_error(state.error.as_ref().map(|e| e.message.clone()).unwrap_or_default()),
        );
        Ok(state)
    }

    async fn record_step_failed(
        &self,
        execution_id: Uuid,
        step: &PlanStep,
        error: &ToolError,
        triage: &TriageResult,
    ) -> OrdoResult<()> {
        let step_id = step.id;
        let now = self.clock.now_iso();
        let step_error = ExecutionError {
            code: Self::step_error_code(triage),
            message: error.message.clone(),
            step_id: Some(step_id),
        };
        self.memory
            .save_with_occ(execution_id, |s| {
                if let Some(record) = s.step_state_mut(step_id) {
                    record.status = StepStatus::Failed;
                    record.error = Some(step_error.clone());
                    record.completed_at = Some(now.clone());
                }
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn reset_step_to_pending(&self, execution_id: Uuid, step_id: Uuid) -> OrdoResult<()> {
        self.memory
            .save_with_occ(execution_id, |s| {
                if let Some(record) = s.step_state_mut(step_id) {
                    record.status = StepStatus::Pending;
                    record.started_at = None;
                }
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Checkpoint, queue a resume, and leave the execution dispatchable.
    async fn suspend(
        &self,
        execution_id: Uuid,
        reason: CheckpointReason,
        delay: Duration,
    ) -> OrdoResult<ExecutionState> {
        self.write_checkpoint(execution_id, reason).await?;
        self.queue
            .schedule_resume(
                execution_id,
                delay,
                format!("{reason:?}"),
                serde_json::Value::Null,
            )
            .await?;
        self.memory.load_required(execution_id).await
    }

    pub(crate) async fn write_checkpoint(
        &self,
        execution_id: Uuid,
        reason: CheckpointReason,
    ) -> OrdoResult<()> {
        let state = self.memory.load_required(execution_id).await?;
        let segment_number = self
            .memory
            .load_checkpoint(execution_id)
            .await?
            .map(|c| c.segment_number + 1)
            .unwrap_or(1);
        let checkpoint = Checkpoint {
            execution_id,
            checkpoint_at: self.clock.now_iso(),
            git_sha: self.identity.git_sha.clone(),
            logic_version: self.identity.logic_version.clone(),
            tool_versions: self.identity.tool_versions.clone(),
            next_step_index: state.current_step_index,
            segment_number,
            reason,
            version: state.version,
            state_snapshot: state,
        };
        self.memory.save_checkpoint(&checkpoint).await?;
        debug!(execution_id = %execution_id, segment_number, ?reason, "checkpoint written");
        Ok(())
    }

    async fn apply_confirmation(&self, execution_id: Uuid, approved: bool) -> OrdoResult<()> {
        self.memory
            .save_with_occ(execution_id, |s| {
                if s.status != ExecutionStatus::AwaitingConfirmation {
                    return Err(OrdoError::invalid_transition(
                        s.status,
                        if approved {
                            ExecutionStatus::Executing
                        } else {
                            ExecutionStatus::Cancelled
                        },
                    ));
                }
                if approved {
                    if let Some(step_ref) = s
                        .context
                        .get(CTX_AWAITING_STEP)
                        .and_then(|v| v.as_str())
                        .map(|v| v.to_string())
                    {
                        s.context
                            .insert(format!("confirmation:{step_ref}"), serde_json::json!(true));
                    }
                    s.context.remove(CTX_AWAITING_STEP);
                    s.transition(
                        ExecutionStatus::Executing,
                        "confirmation approved",
                        self.clock.now_iso(),
                    )?;
                } else {
                    s.transition(
                        ExecutionStatus::Cancelled,
                        "confirmation rejected",
                        self.clock.now_iso(),
                    )?;
                }
                Ok(())
            })
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Small helpers
    // ------------------------------------------------------------------

    fn backoff_delay(&self, base_override_ms: Option<u64>, attempt: u32) -> Duration {
        let policy = match base_override_ms {
            Some(base_ms) => RetryPolicy::ExponentialBackoff {
                base_ms,
                max_ms: 30_000,
                jitter: true,
            },
            None => self.config.retry_backoff.clone(),
        };
        policy.delay_for(attempt.saturating_sub(1) as usize)
    }

    fn step_error_code(triage: &TriageResult) -> ErrorCode {
        match triage.category {
            FailureCategory::Timeout => ErrorCode::StepTimeout,
            _ => ErrorCode::ToolExecutionFailed,
        }
    }

    fn cancel_flag(&self, execution_id: Uuid) -> Arc<AtomicBool> {
        self.cancel_flags
            .entry(execution_id)
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone()
    }

    fn cancel_requested(&self, execution_id: Uuid) -> bool {
        self.cancel_flags
            .get(&execution_id)
            .map(|f| f.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    pub(crate) fn memory(&self) -> &Arc<ExecutionMemory> {
        &self.memory
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub(crate) fn identity(&self) -> &CodeIdentity {
        &self.identity
    }

    pub(crate) fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub(crate) fn trace(&self) -> &Arc<dyn TraceSink> {
        &self.trace
    }

    pub(crate) fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }
}
