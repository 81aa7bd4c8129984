//! End-to-end execution scenarios over the fully wired engine.

use ordo_kernel::KVStore;
use ordo_kernel::error::{ErrorCode, OrdoError};
use ordo_kernel::execution::{ExecutionStatus, StepStatus};
use ordo_kernel::failover::{FailoverAction, FailoverPolicy};
use ordo_kernel::intent::IntentType;
use ordo_kernel::plan::{PlanConstraints, RawPlan};
use ordo_kernel::triage::{FailureCategory, SuggestedAction};
use ordo_runtime::planner::PlanBuilder;
use ordo_testing::{
    Harness, ToolBehavior, action_intent, init_tracing, make_intent, raw_step,
};
use serde_json::json;
use std::collections::HashMap;

#[tokio::test]
async fn low_risk_action_completes() {
    init_tracing();
    let harness = Harness::new();
    let intent = action_intent("calendar.create", 0.9);
    let plan = harness.build_plan(
        &intent,
        vec![raw_step(0, "calendar.create", json!({"title": "Meeting"}), &[])],
    );

    let state = harness
        .orchestrator
        .execute(harness.request(intent, plan))
        .await
        .unwrap();

    assert_eq!(state.status, ExecutionStatus::Completed);
    assert_eq!(state.step_states[0].status, StepStatus::Completed);
    assert_eq!(
        state.step_states[0].output.as_ref().unwrap()["event_id"],
        "evt-1001"
    );
    assert!(state.context.contains_key("step_result:0"));
    assert!(state.completed_at.is_some());
    // Trace narrates the lifecycle.
    assert_eq!(harness.trace.events_named("step_completed").len(), 1);
    assert_eq!(harness.trace.events_named("execution_completed").len(), 1);
}

#[tokio::test]
async fn high_risk_action_halts_for_confirmation() {
    init_tracing();
    let harness = Harness::new();
    let intent = action_intent("calendar.delete", 0.9);
    let plan = harness.build_plan(
        &intent,
        vec![raw_step(0, "calendar.delete", json!({"all": true}), &[])],
    );
    // The tool definition forces the gate even though the raw step did not.
    assert!(plan.steps[0].requires_confirmation);

    let state = harness
        .orchestrator
        .execute(harness.request(intent, plan))
        .await
        .unwrap();
    assert_eq!(state.status, ExecutionStatus::AwaitingConfirmation);
    assert_eq!(state.step_states[0].status, StepStatus::Pending);
    // Nothing was executed.
    assert_eq!(harness.executor.call_count("calendar.delete"), 0);

    // Approval resumes and completes.
    let state = harness
        .orchestrator
        .confirm(state.execution_id, true)
        .await
        .unwrap();
    assert_eq!(state.status, ExecutionStatus::Completed);
    assert_eq!(harness.executor.call_count("calendar.delete"), 1);
}

#[tokio::test]
async fn rejected_confirmation_cancels() {
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
    let state = harness
        .orchestrator
        .confirm(state.execution_id, false)
        .await
        .unwrap();

    assert_eq!(state.status, ExecutionStatus::Cancelled);
    assert_eq!(harness.executor.call_count("calendar.delete"), 0);
}

#[tokio::test]
async fn unknown_capability_rejected_before_any_state() {
    let harness = Harness::new();
    let intent = action_intent("system.hack", 0.9);

    let err = PlanBuilder::new(harness.registry.clone(), harness.clock.clone())
        .build(
            RawPlan {
                steps: vec![raw_step(0, "system.hack", json!({}), &[])],
                summary: String::new(),
            },
            &intent,
            PlanConstraints::default(),
            "test-model",
        )
        .unwrap_err();

    assert!(matches!(err, OrdoError::PlanValidationFailed(_)));
    assert_eq!(err.code(), ErrorCode::PlanValidationFailed);
    // No execution record was ever persisted.
    let keys = harness.store.scan("ordo:exec:*", 100).await.unwrap();
    assert!(keys.is_empty());
}

#[tokio::test]
async fn fan_out_runs_all_siblings_to_completion() {
    init_tracing();
    let harness = Harness::new();
    let intent = make_intent(
        IntentType::Action,
        0.9,
        json!({"capability": "get_weather_data", "location": ["Tokyo", "London", "NY"]}),
    );
    let plan = harness.build_plan(
        &intent,
        vec![raw_step(
            0,
            "get_weather_data",
            json!({"location": ["Tokyo", "London", "NY"]}),
            &[],
        )],
    );
    assert_eq!(plan.steps.len(), 3);

    let state = harness
        .orchestrator
        .execute(harness.request(intent, plan))
        .await
        .unwrap();

    assert_eq!(state.status, ExecutionStatus::Completed);
    for (i, expected) in ["Tokyo", "London", "NY"].iter().enumerate() {
        assert_eq!(state.step_states[i].status, StepStatus::Completed);
        let result = &state.context[&format!("step_result:{i}")];
        assert_eq!(result["location"], *expected);
    }
    assert_eq!(harness.executor.call_count("get_weather_data"), 3);
}

#[tokio::test]
async fn downstream_step_reads_fanned_out_outputs() {
    let harness = Harness::new();
    let intent = action_intent("get_weather_data", 0.9);
    let plan = harness.build_plan(
        &intent,
        vec![
            raw_step(0, "get_weather_data", json!({"location": ["Tokyo", "London"]}), &[]),
            raw_step(1, "summarize", json!({"inputs": ["$0.location", "$1.location"]}), &[0]),
        ],
    );
    assert_eq!(plan.steps.len(), 3);
    assert_eq!(plan.steps[2].dependencies.len(), 2);

    let state = harness
        .orchestrator
        .execute(harness.request(intent, plan))
        .await
        .unwrap();

    assert_eq!(state.status, ExecutionStatus::Completed);
    let summarize_input = state.step_states[2].input.as_ref().unwrap();
    assert_eq!(summarize_input["inputs"][0], "Tokyo");
    assert_eq!(summarize_input["inputs"][1], "London");
}

#[tokio::test]
async fn failed_step_is_skipped_when_triage_says_so() {
    let harness = Harness::new();
    harness.executor.script(
        "get_weather_data",
        ToolBehavior::Fail {
            message: "location not found".into(),
            code: Some(404),
        },
    );

    let intent = action_intent("get_weather_data", 0.9);
    let plan = harness.build_plan(
        &intent,
        vec![
            raw_step(0, "get_weather_data", json!({"location": "Atlantis"}), &[]),
            raw_step(1, "summarize", json!({"text": "whatever remains"}), &[0]),
        ],
    );

    let state = harness
        .orchestrator
        .execute(harness.request(intent, plan))
        .await
        .unwrap();

    // NotFound → SKIP_STEP; the skipped dependency unblocks the summary.
    assert_eq!(state.step_states[0].status, StepStatus::Skipped);
    assert_eq!(state.step_states[1].status, StepStatus::Completed);
    assert_eq!(state.status, ExecutionStatus::Completed);
    let error = state.step_states[0].error.as_ref().unwrap();
    assert_eq!(error.code, ErrorCode::ToolExecutionFailed);
}

#[tokio::test]
async fn escalation_renders_policy_template() {
    let harness = Harness::builder()
        .with_failover_policy(FailoverPolicy {
            name: "booking-escalate".into(),
            intent_type: IntentType::Action,
            failure_reasons: vec![FailureCategory::Auth],
            min_confidence: 0.5,
            party_size_range: None,
            actions: vec![FailoverAction {
                kind: SuggestedAction::EscalateToHuman,
                message_template: "We could not authorize the booking; call {phone}.".into(),
                max_retries: None,
                retry_delay_ms: None,
                params: HashMap::from([("phone".to_string(), json!("+81-3-5555"))]),
            }],
        })
        .build();

    harness.executor.script(
        "booking.reserve",
        ToolBehavior::Fail {
            message: "unauthorized".into(),
            code: Some(401),
        },
    );

    let intent = action_intent("booking.reserve", 0.9);
    let plan = harness.build_plan(
        &intent,
        vec![raw_step(0, "booking.reserve", json!({"time": "19:00"}), &[])],
    );

    let state = harness
        .orchestrator
        .execute(harness.request(intent, plan))
        .await
        .unwrap();

    assert_eq!(state.status, ExecutionStatus::Failed);
    assert_eq!(
        state.context["escalation_message"],
        "We could not authorize the booking; call +81-3-5555."
    );
    let error = state.error.as_ref().unwrap();
    assert_eq!(error.code, ErrorCode::ToolExecutionFailed);
    assert_eq!(error.step_id, Some(state.plan.steps[0].id));
}

#[tokio::test]
async fn modified_params_retry_applies_overrides() {
    let harness = Harness::builder()
        .with_failover_policy(FailoverPolicy {
            name: "weather-fallback-city".into(),
            intent_type: IntentType::Action,
            failure_reasons: vec![FailureCategory::InvalidInput],
            min_confidence: 0.5,
            party_size_range: None,
            actions: vec![FailoverAction {
                kind: SuggestedAction::RetryWithModifiedParams,
                message_template: "retrying with {value}".into(),
                max_retries: Some(2),
                retry_delay_ms: None,
                params: HashMap::from([(
                    "param_overrides".to_string(),
                    json!({"location": "Osaka"}),
                )]),
            }],
        })
        .build();

    harness.executor.script(
        "get_weather_data",
        ToolBehavior::Fail {
            message: "invalid location code".into(),
            code: Some(400),
        },
    );

    let intent = action_intent("get_weather_data", 0.9);
    let plan = harness.build_plan(
        &intent,
        vec![raw_step(0, "get_weather_data", json!({"location": "Osaka??"}), &[])],
    );

    let state = harness
        .orchestrator
        .execute(harness.request(intent, plan))
        .await
        .unwrap();

    assert_eq!(state.status, ExecutionStatus::Completed);
    let calls = harness.executor.calls();
    let weather_calls: Vec<_> = calls.iter().filter(|(t, _)| t == "get_weather_data").collect();
    assert_eq!(weather_calls.len(), 2);
    assert_eq!(weather_calls[0].1["location"], "Osaka??");
    assert_eq!(weather_calls[1].1["location"], "Osaka");
    assert_eq!(state.step_states[0].attempts, 2);
}

#[tokio::test]
async fn compensation_runs_in_reverse_completion_order() {
    let harness = Harness::builder()
        .with_failover_policy(FailoverPolicy {
            name: "unwind-on-internal".into(),
            intent_type: IntentType::Action,
            failure_reasons: vec![FailureCategory::Internal],
            min_confidence: 0.0,
            party_size_range: None,
            actions: vec![FailoverAction {
                kind: SuggestedAction::TriggerCompensation,
                message_template: "unwinding".into(),
                max_retries: None,
                retry_delay_ms: None,
                params: HashMap::new(),
            }],
        })
        .build();

    harness.executor.script(
        "booking.reserve",
        ToolBehavior::Fail {
            message: "internal server error".into(),
            code: Some(500),
        },
    );

    let intent = action_intent("calendar.create", 0.9);
    let plan = harness.build_plan(
        &intent,
        vec![
            raw_step(0, "calendar.create", json!({"title": "Dinner"}), &[]),
            raw_step(1, "booking.reserve", json!({"time": "20:00"}), &[0]),
        ],
    );

    let state = harness
        .orchestrator
        .execute(harness.request(intent, plan))
        .await
        .unwrap();

    assert_eq!(state.status, ExecutionStatus::Compensated);
    assert_eq!(state.step_states[0].status, StepStatus::Completed);
    assert_eq!(state.step_states[1].status, StepStatus::Failed);
    // The calendar event created by step 0 was unwound.
    assert_eq!(harness.executor.call_count("calendar.cancel"), 1);
    let cancel_call = harness
        .executor
        .calls()
        .into_iter()
        .find(|(t, _)| t == "calendar.cancel")
        .unwrap();
    assert_eq!(cancel_call.1["original_output"]["event_id"], "evt-1001");
}

#[tokio::test]
async fn execution_deadline_fails_with_timeout_code() {
    let harness = Harness::new();
    let intent = action_intent("calendar.create", 0.9);
    let mut plan = harness.build_plan(
        &intent,
        vec![raw_step(0, "calendar.create", json!({"title": "x"}), &[])],
    );
    plan.constraints.max_execution_time_ms = 0;

    let state = harness
        .orchestrator
        .execute(harness.request(intent, plan))
        .await
        .unwrap();

    assert_eq!(state.status, ExecutionStatus::Failed);
    assert_eq!(state.error.as_ref().unwrap().code, ErrorCode::ExecutionTimeout);
    assert_eq!(harness.executor.call_count("calendar.create"), 0);
}

#[tokio::test]
async fn cancel_before_run_short_circuits() {
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
    harness
        .orchestrator
        .cancel(state.execution_id, "user changed their mind")
        .await
        .unwrap();

    let state = harness.orchestrator.run(state.execution_id).await.unwrap();
    assert_eq!(state.status, ExecutionStatus::Cancelled);
    assert_eq!(harness.executor.call_count("calendar.create"), 0);
    // Cancellation is terminal.
    assert!(state.status.is_terminal());
}

#[tokio::test]
async fn dispatch_deadlock_reports_circular_dependency() {
    let harness = Harness::new();
    let intent = action_intent("calendar.create", 0.9);
    let plan = harness.build_plan(
        &intent,
        vec![
            raw_step(0, "calendar.create", json!({"title": "a"}), &[]),
            raw_step(1, "summarize", json!({"text": "b"}), &[0]),
        ],
    );

    let state = harness
        .orchestrator
        .start(harness.request(intent, plan))
        .await
        .unwrap();
    let execution_id = state.execution_id;

    // Simulate a crashed worker: step 0 is stuck in_progress, so nothing is
    // pending-and-ready but unsettled steps remain.
    harness
        .memory
        .save_with_occ(execution_id, |s| {
            let id = s.plan.steps[0].id;
            if let Some(record) = s.step_state_mut(id) {
                record.status = StepStatus::InProgress;
            }
            Ok(())
        })
        .await
        .unwrap();

    let state = harness.orchestrator.run(execution_id).await.unwrap();
    assert_eq!(state.status, ExecutionStatus::Failed);
    assert_eq!(
        state.error.as_ref().unwrap().code,
        ErrorCode::PlanCircularDependency
    );
}

#[tokio::test]
async fn trace_records_unresolved_references() {
    let harness = Harness::new();
    let intent = action_intent("summarize", 0.9);
    let plan = harness.build_plan(
        &intent,
        vec![raw_step(0, "summarize", json!({"text": "$99.output.value"}), &[])],
    );

    let state = harness
        .orchestrator
        .execute(harness.request(intent, plan))
        .await
        .unwrap();

    // The literal survives and the warning is traced; execution continues.
    assert_eq!(state.status, ExecutionStatus::Completed);
    assert_eq!(
        state.step_states[0].input.as_ref().unwrap()["text"],
        "$99.output.value"
    );
    assert!(!harness.trace.events_named("unresolved_reference").is_empty());
}
