//! Checkpoint resume, logic-drift handling, and the resume worker.
//!
//! Resume loads the execution's checkpoint and compares the pinned code
//! identity against the running process. Matching identity resumes directly.
//! A commit change within the same logic major triggers a shadow dry-run:
//! the remaining steps are replayed against a no-op executor to prove the
//! plan still dispatches cleanly under the new code before real execution
//! continues. A major-version change parks the execution for a human.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use ordo_kernel::checkpoint::{CodeIdentity, DriftRecommendation, drift_recommendation};
use ordo_kernel::error::{OrdoError, OrdoResult};
use ordo_kernel::execution::{ExecutionState, ExecutionStatus, StepStatus};
use ordo_kernel::trace::{TraceEntry, TracePhase};

use super::{CTX_AWAITING_STEP, Orchestrator, resolve_parameters};

// ============================================================================
// Shadow dry-run
// ============================================================================

/// Outcome of replaying the remaining steps against a no-op executor.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DriftReport {
    pub recommendation: DriftRecommendation,
    /// Steps the dry-run walked, in dispatch order.
    pub checked_steps: usize,
    /// Non-fatal observations (unresolved references, shape differences).
    pub warnings: Vec<String>,
}

impl Orchestrator {
    /// Resume a checkpointed execution, honoring logic drift.
    pub async fn resume(&self, execution_id: Uuid) -> OrdoResult<ExecutionState> {
        let Some(checkpoint) = self.memory().load_checkpoint(execution_id).await? else {
            // No checkpoint — the state record alone decides.
            return self.run(execution_id).await;
        };

        let pinned = CodeIdentity {
            git_sha: checkpoint.git_sha.clone(),
            logic_version: checkpoint.logic_version.clone(),
            tool_versions: checkpoint.tool_versions.clone(),
        };
        let recommendation = drift_recommendation(&pinned, self.identity());

        match recommendation {
            DriftRecommendation::Proceed => self.run(execution_id).await,
            DriftRecommendation::ShadowDryRun => {
                info!(execution_id = %execution_id, "logic drift within major, running shadow dry-run");
                let report = self.shadow_dry_run(execution_id).await?;
                self.trace().record(
                    TraceEntry::event(TracePhase::Execution, "shadow_dry_run", self.clock().now_iso())
                        .with_io(None, serde_json::to_value(&report).ok()),
                );
                self.run(execution_id).await
            }
            DriftRecommendation::ManualReview => {
                warn!(
                    execution_id = %execution_id,
                    pinned = %checkpoint.logic_version,
                    current = %self.identity().logic_version,
                    "logic major changed, parking execution for review"
                );
                let state = self
                    .memory()
                    .save_with_occ(execution_id, |s| {
                        if s.status.can_transition_to(ExecutionStatus::AwaitingConfirmation) {
                            s.context.remove(CTX_AWAITING_STEP);
                            s.transition(
                                ExecutionStatus::AwaitingConfirmation,
                                "LOGIC_DRIFT",
                                self.clock().now_iso(),
                            )?;
                        }
                        Ok(())
                    })
                    .await?;
                self.trace().record(
                    TraceEntry::event(TracePhase::Execution, "logic_drift_review", self.clock().now_iso())
                        .with_error("LOGIC_DRIFT"),
                );
                Ok(state)
            }
        }
    }

    /// Replay the remaining steps against a no-op executor: walk the DAG in
    /// dispatch order, resolve parameters as execution would, and check each
    /// step still resolves to a registered tool whose input shape accepts
    /// the resolved parameters.
    pub async fn shadow_dry_run(&self, execution_id: Uuid) -> OrdoResult<DriftReport> {
        let state = self.memory().load_required(execution_id).await?;
        let mut shadow: ExecutionState = state.clone();
        let mut warnings = Vec::new();
        let mut checked_steps = 0usize;

        let mut settled: HashSet<Uuid> = shadow.settled_step_ids();
        loop {
            let next = shadow
                .plan
                .steps
                .iter()
                .filter(|step| !settled.contains(&step.id))
                .find(|step| step.dependencies.iter().all(|d| settled.contains(d)))
                .cloned();
            let Some(step) = next else {
                let remaining = shadow.plan.steps.len() - settled.len();
                if remaining > 0 {
                    return Err(OrdoError::PlanCircularDependency(format!(
                        "shadow dry-run stalled with {remaining} steps remaining"
                    )));
                }
                break;
            };

            let definition = self
                .registry()
                .definition(&step.tool_name, step.tool_version.as_deref())?;

            let resolved = resolve_parameters(&shadow, &step);
            warnings.extend(resolved.warnings.iter().cloned());

            // Shape comparison against the logged input, when this step ran
            // under the previous code identity.
            if let Some(logged) = state.step_state(step.id).and_then(|s| s.input.as_ref()) {
                let logged_keys: HashSet<&str> = logged
                    .as_object()
                    .map(|o| o.keys().map(String::as_str).collect())
                    .unwrap_or_default();
                let replay_keys: HashSet<&str> = resolved
                    .value
                    .as_object()
                    .map(|o| o.keys().map(String::as_str).collect())
                    .unwrap_or_default();
                if logged_keys != replay_keys {
                    warnings.push(format!(
                        "step {} input shape changed across code versions",
                        step.step_number
                    ));
                }
            }

            let input_errors =
                ordo_kernel::tool::validate_against_schema(&definition.input_schema, &resolved.value);
            for error in input_errors {
                warnings.push(format!(
                    "step {}: {} {}",
                    step.step_number, error.path, error.message
                ));
            }

            // No-op execution: pretend the step completed with an empty
            // object so downstream references resolve structurally.
            if let Some(record) = shadow.step_state_mut(step.id) {
                record.status = StepStatus::Completed;
                record.output = Some(serde_json::json!({}));
            }
            settled.insert(step.id);
            checked_steps += 1;
        }

        debug!(execution_id = %execution_id, checked_steps, warnings = warnings.len(), "shadow dry-run finished");
        Ok(DriftReport {
            recommendation: DriftRecommendation::ShadowDryRun,
            checked_steps,
            warnings,
        })
    }
}

// ============================================================================
// ResumeWorker
// ============================================================================

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    /// Due tasks pulled per poll.
    pub batch_size: usize,
    /// Executions resumed concurrently.
    pub max_parallelism: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            batch_size: 16,
            max_parallelism: 8,
        }
    }
}

/// Pulls due resume tasks and drives their executions. Each resumed
/// execution re-acquires its own lock inside [`Orchestrator::resume`], so
/// workers on different processes never double-drive one execution.
pub struct ResumeWorker {
    orchestrator: Arc<Orchestrator>,
    config: WorkerConfig,
    shutdown: watch::Sender<bool>,
}

impl ResumeWorker {
    pub fn new(orchestrator: Arc<Orchestrator>, config: WorkerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            orchestrator,
            config,
            shutdown,
        }
    }

    /// Spawn the polling loop. Dropping the returned handle does not stop
    /// the worker; call [`ResumeWorker::stop`].
    pub fn spawn(&self) -> tokio::task::JoinHandle<()> {
        let orchestrator = self.orchestrator.clone();
        let config = self.config.clone();
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let semaphore = Arc::new(tokio::sync::Semaphore::new(config.max_parallelism));
            loop {
                if *shutdown.borrow() {
                    break;
                }

                match orchestrator.queue().ready_tasks(config.batch_size).await {
                    Ok(tasks) => {
                        for task in tasks {
                            let claimed = orchestrator
                                .queue()
                                .mark_processing(task.execution_id)
                                .await
                                .unwrap_or(false);
                            if !claimed {
                                continue;
                            }
                            let orchestrator = orchestrator.clone();
                            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                                break;
                            };
                            tokio::spawn(async move {
                                let _permit = permit;
                                if let Err(e) = orchestrator.resume(task.execution_id).await {
                                    warn!(
                                        execution_id = %task.execution_id,
                                        error = %e,
                                        "resume failed; requeueing with backoff"
                                    );
                                    let _ = orchestrator
                                        .queue()
                                        .schedule_resume(
                                            task.execution_id,
                                            Duration::from_millis(2_000),
                                            "resume retry",
                                            serde_json::Value::Null,
                                        )
                                        .await;
                                }
                            });
                        }
                    }
                    Err(e) => warn!(error = %e, "task queue poll failed"),
                }

                tokio::select! {
                    _ = tokio::time::sleep(config.poll_interval) => {}
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    /// Signal the polling loop to exit after the current iteration.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}
