//! Front-of-pipe scenarios: normalization, ambiguity, and structured plan
//! generation feeding the orchestrator.

use std::sync::Arc;

use ordo_kernel::error::OrdoError;
use ordo_kernel::execution::ExecutionStatus;
use ordo_kernel::intent::{CandidateIntent, IntentType};
use ordo_kernel::plan::PlanConstraints;
use ordo_kernel::trace::NoopTraceSink;
use ordo_runtime::ambiguity::{AmbiguityConfig, AmbiguityResolver};
use ordo_runtime::normalizer::{Normalizer, Ontology};
use ordo_runtime::planner::PlanGenerator;
use ordo_runtime::safety::{SafetyPolicy, SafetyVerifier};
use ordo_testing::{Harness, ScriptedGenerator, init_tracing};
use serde_json::json;
use std::collections::HashMap;

fn candidate(intent_type: &str, confidence: f64, parameters: serde_json::Value) -> CandidateIntent {
    CandidateIntent {
        intent_type: intent_type.into(),
        confidence,
        parameters: serde_json::from_value(parameters).unwrap(),
        explanation: None,
    }
}

#[tokio::test]
async fn utterance_to_completed_execution() {
    init_tracing();
    let harness = Harness::new();
    let normalizer = Normalizer::new(
        Ontology::default(),
        harness.registry.clone(),
        harness.clock.clone(),
        Arc::new(NoopTraceSink),
    );
    let resolver = AmbiguityResolver::new(AmbiguityConfig::default());

    // One clear candidate from the interpretation model.
    let intent = normalizer.normalize(
        &candidate(
            "ACTION",
            0.92,
            json!({"capability": "calendar.create", "arguments": {"title": "Meeting"}}),
        ),
        "put a meeting on my calendar",
        "interpreter-v2",
    );
    let hypotheses = resolver.resolve(vec![intent]);
    assert!(!hypotheses.is_ambiguous);
    let intent = hypotheses.primary;
    assert_eq!(intent.intent_type, IntentType::Action);

    // The planning model proposes a one-step raw plan.
    let generator = Arc::new(ScriptedGenerator::new());
    generator.enqueue(json!({
        "summary": "create the event",
        "steps": [{
            "step_number": 0,
            "tool_name": "calendar.create",
            "parameters": {"title": "Meeting"},
            "description": "create calendar event",
            "estimated_tokens": 40
        }]
    }));
    let plan_generator = PlanGenerator::new(
        generator.clone(),
        harness.registry.clone(),
        harness.clock.clone(),
        harness.trace.clone(),
    );
    let plan = plan_generator
        .generate(&intent, PlanConstraints::default())
        .await
        .unwrap();
    assert_eq!(plan.intent_id, intent.id);
    assert_eq!(plan.metadata.planning_model_id, "scripted-model");

    // Safety gate, then execution.
    SafetyVerifier::new(SafetyPolicy::default())
        .unwrap()
        .verify(&plan)
        .unwrap();
    let state = harness
        .orchestrator
        .execute(harness.request(intent, plan))
        .await
        .unwrap();
    assert_eq!(state.status, ExecutionStatus::Completed);

    // Planning trace carries model id and token usage.
    let planned = harness.trace.events_named("plan_generated");
    assert_eq!(planned.len(), 1);
    assert_eq!(planned[0].model_id.as_deref(), Some("scripted-model"));
    assert!(planned[0].token_usage.is_some());
}

#[tokio::test]
async fn ambiguous_candidates_never_reach_planning() {
    let harness = Harness::new();
    let normalizer = Normalizer::new(
        Ontology::default(),
        harness.registry.clone(),
        harness.clock.clone(),
        Arc::new(NoopTraceSink),
    );
    let resolver = AmbiguityResolver::new(AmbiguityConfig::default());

    let first = normalizer.normalize(
        &candidate("ACTION", 0.8, json!({"capability": "calendar.delete"})),
        "clear my calendar",
        "interpreter-v2",
    );
    let second = normalizer.normalize(
        &candidate("ACTION", 0.78, json!({"capability": "calendar.create"})),
        "clear my calendar",
        "interpreter-v2",
    );

    let hypotheses = resolver.resolve(vec![first, second]);
    assert!(hypotheses.is_ambiguous);
    assert_eq!(
        hypotheses.primary.intent_type,
        IntentType::ClarificationNeeded
    );
    assert!(hypotheses.primary.intent_type.is_terminal());
}

#[tokio::test]
async fn malformed_generator_output_is_plan_generation_failed() {
    let harness = Harness::new();
    let generator = Arc::new(ScriptedGenerator::new());
    generator.enqueue(json!({"steps": "not an array"}));

    let plan_generator = PlanGenerator::new(
        generator,
        harness.registry.clone(),
        harness.clock.clone(),
        harness.trace.clone(),
    );
    let intent = ordo_testing::action_intent("calendar.create", 0.9);
    let err = plan_generator
        .generate(&intent, PlanConstraints::default())
        .await
        .unwrap_err();
    assert!(matches!(err, OrdoError::PlanGenerationFailed(_)));
}

#[tokio::test]
async fn exhausted_generator_is_plan_generation_failed() {
    let harness = Harness::new();
    let plan_generator = PlanGenerator::new(
        Arc::new(ScriptedGenerator::new()),
        harness.registry.clone(),
        harness.clock.clone(),
        harness.trace.clone(),
    );
    let intent = ordo_testing::action_intent("calendar.create", 0.9);
    let err = plan_generator
        .generate(&intent, PlanConstraints::default())
        .await
        .unwrap_err();
    assert!(matches!(err, OrdoError::PlanGenerationFailed(_)));
}

#[tokio::test]
async fn forbidden_sequence_blocks_generated_plan() {
    let harness = Harness::new();
    let generator = Arc::new(ScriptedGenerator::new());
    generator.enqueue(json!({
        "summary": "fetch then summarize",
        "steps": [
            {"step_number": 0, "tool_name": "get_weather_data",
             "parameters": {"location": "Tokyo"}, "description": "fetch"},
            {"step_number": 1, "tool_name": "summarize",
             "parameters": {"text": "$0.location"}, "dependencies": [0],
             "description": "summarize"}
        ]
    }));
    let plan_generator = PlanGenerator::new(
        generator,
        harness.registry.clone(),
        harness.clock.clone(),
        harness.trace.clone(),
    );
    let intent = ordo_testing::action_intent("get_weather_data", 0.9);
    let plan = plan_generator
        .generate(&intent, PlanConstraints::default())
        .await
        .unwrap();

    let verifier = SafetyVerifier::new(SafetyPolicy {
        forbidden_sequences: vec![vec!["get_weather_data".into(), "summarize".into()]],
        parameter_limits: HashMap::new(),
        blocked_patterns: Vec::new(),
    })
    .unwrap();
    let err = verifier.verify(&plan).unwrap_err();
    assert!(matches!(err, OrdoError::PlanValidationFailed(_)));
}
