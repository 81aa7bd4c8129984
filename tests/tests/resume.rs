//! Checkpoint, resume, and logic-drift scenarios.

use ordo_kernel::checkpoint::CheckpointReason;
use ordo_kernel::execution::{ExecutionStatus, StepStatus};
use ordo_testing::{Harness, ToolBehavior, action_intent, init_tracing, raw_step};
use serde_json::json;

/// Park an execution behind a scheduled retry so a checkpoint exists.
async fn suspend_with_checkpoint(harness: &Harness) -> uuid::Uuid {
    harness.executor.script(
        "get_weather_data",
        ToolBehavior::Fail {
            message: "connection timed out".into(),
            code: None,
        },
    );
    let intent = action_intent("get_weather_data", 0.9);
    let plan = harness.build_plan(
        &intent,
        vec![
            raw_step(0, "get_weather_data", json!({"location": "Tokyo"}), &[]),
            raw_step(1, "summarize", json!({"text": "$0.location"}), &[0]),
        ],
    );
    let state = harness
        .orchestrator
        .execute(harness.request(intent, plan))
        .await
        .unwrap();
    assert_eq!(state.status, ExecutionStatus::Executing);
    harness.clock.advance(50);
    assert!(harness
        .queue
        .mark_processing(state.execution_id)
        .await
        .unwrap());
    state.execution_id
}

#[tokio::test]
async fn checkpoint_pins_code_identity() {
    init_tracing();
    let harness = Harness::new();
    let execution_id = suspend_with_checkpoint(&harness).await;

    let checkpoint = harness
        .memory
        .load_checkpoint(execution_id)
        .await
        .unwrap()
        .expect("checkpoint exists");
    assert_eq!(checkpoint.git_sha, "sha-aaaa");
    assert_eq!(checkpoint.logic_version, "1.0.0");
    assert_eq!(checkpoint.reason, CheckpointReason::ScheduledRetry);
    assert_eq!(checkpoint.segment_number, 1);
    assert!(checkpoint.tool_versions.contains_key("get_weather_data"));
    assert_eq!(
        checkpoint.state_snapshot.execution_id,
        execution_id
    );
}

#[tokio::test]
async fn same_identity_resumes_directly() {
    let harness = Harness::new();
    let execution_id = suspend_with_checkpoint(&harness).await;

    let state = harness.orchestrator.resume(execution_id).await.unwrap();
    assert_eq!(state.status, ExecutionStatus::Completed);
    // No shadow replay was needed.
    assert!(harness.trace.events_named("shadow_dry_run").is_empty());
}

#[tokio::test]
async fn same_major_drift_runs_shadow_replay_then_resumes() {
    init_tracing();
    let harness = Harness::new();
    let execution_id = suspend_with_checkpoint(&harness).await;

    // Redeploy: new commit, same logic major.
    let redeployed = harness.orchestrator_with_identity("sha-bbbb", "1.3.0");
    let state = redeployed.resume(execution_id).await.unwrap();

    assert_eq!(state.status, ExecutionStatus::Completed);
    let replays = harness.trace.events_named("shadow_dry_run");
    assert_eq!(replays.len(), 1);
    let report = replays[0].output.as_ref().unwrap();
    // Both remaining steps were walked by the dry run.
    assert_eq!(report["checked_steps"], 2);
}

#[tokio::test]
async fn major_drift_parks_for_manual_review() {
    init_tracing();
    let harness = Harness::new();
    let execution_id = suspend_with_checkpoint(&harness).await;

    let redeployed = harness.orchestrator_with_identity("sha-cccc", "2.0.0");
    let state = redeployed.resume(execution_id).await.unwrap();

    assert_eq!(state.status, ExecutionStatus::AwaitingConfirmation);
    assert_eq!(state.transitions.last().unwrap().reason, "LOGIC_DRIFT");
    // Nothing executed under the new code yet.
    assert_eq!(harness.executor.call_count("summarize"), 0);

    // A human signs off; execution continues under the new code.
    let state = redeployed.confirm(execution_id, true).await.unwrap();
    assert_eq!(state.status, ExecutionStatus::Completed);
    assert_eq!(state.step_states[1].status, StepStatus::Completed);
}

#[tokio::test]
async fn shadow_dry_run_reports_dispatchability() {
    let harness = Harness::new();
    let execution_id = suspend_with_checkpoint(&harness).await;

    let report = harness
        .orchestrator
        .shadow_dry_run(execution_id)
        .await
        .unwrap();
    assert_eq!(report.checked_steps, 2);
    // The weather step resolves cleanly; the summarize step's reference
    // resolves against the no-op output shape.
    assert!(report.warnings.iter().all(|w| !w.contains("unknown")));
}

#[tokio::test]
async fn resume_without_checkpoint_just_runs() {
    let harness = Harness::new();
    let intent = action_intent("calendar.create", 0.9);
    let plan = harness.build_plan(
        &intent,
        vec![raw_step(0, "calendar.create", json!({"title": "x"}), &[])],
    );
    let state = harness
        .orchestrator
        .start(harness.request(intent, plan))
        .await
        .unwrap();

    let state = harness.orchestrator.resume(state.execution_id).await.unwrap();
    assert_eq!(state.status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn confirmation_gate_writes_checkpoint() {
    let harness = Harness::new();
    let intent = action_intent("calendar.delete", 0.9);
    let plan = harness.build_plan(
        &intent,
        vec![raw_step(0, "calendar.delete", json!({"all": true}), &[])],
    );
    let state = harness
        .orchestrator
        .execute(harness.request(intent, plan))
        .await
        .unwrap();
    assert_eq!(state.status, ExecutionStatus::AwaitingConfirmation);

    let checkpoint = harness
        .memory
        .load_checkpoint(state.execution_id)
        .await
        .unwrap()
        .expect("checkpoint exists");
    assert_eq!(checkpoint.reason, CheckpointReason::AwaitingConfirmation);
    assert_eq!(
        checkpoint.state_snapshot.status,
        ExecutionStatus::AwaitingConfirmation
    );
}

#[tokio::test]
async fn checkpoint_segments_increment() {
    let harness = Harness::new();
    // Two consecutive transient failures produce two checkpoints.
    for _ in 0..2 {
        harness.executor.script(
            "get_weather_data",
            ToolBehavior::Fail {
                message: "connection timed out".into(),
                code: None,
            },
        );
    }
    let intent = action_intent("get_weather_data", 0.9);
    let plan = harness.build_plan(
        &intent,
        vec![raw_step(0, "get_weather_data", json!({"location": "Tokyo"}), &[])],
    );
    let state = harness
        .orchestrator
        .execute(harness.request(intent, plan))
        .await
        .unwrap();
    let execution_id = state.execution_id;

    harness.clock.advance(50);
    assert!(harness.queue.mark_processing(execution_id).await.unwrap());
    harness.orchestrator.resume(execution_id).await.unwrap();

    let checkpoint = harness
        .memory
        .load_checkpoint(execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(checkpoint.segment_number, 2);
}

#[tokio::test]
async fn checkpoint_expires_after_seven_days() {
    let harness = Harness::new();
    let execution_id = suspend_with_checkpoint(&harness).await;
    assert!(harness
        .memory
        .load_checkpoint(execution_id)
        .await
        .unwrap()
        .is_some());

    harness.clock.advance(7 * 24 * 3600 * 1000 + 1);
    assert!(harness
        .memory
        .load_checkpoint(execution_id)
        .await
        .unwrap()
        .is_none());
}
