//! Concurrency substrate scenarios: optimistic writes, quorum locks,
//! idempotency, and the delayed-resume queue.

use ordo_kernel::KVStore;
use ordo_kernel::error::OrdoError;
use ordo_kernel::execution::{ExecutionState, ExecutionStatus, StepStatus};
use ordo_testing::{FlakyKVStore, Harness, ToolBehavior, action_intent, init_tracing, raw_step};
use serde_json::json;

#[tokio::test]
async fn occ_conflict_rebases_and_both_writers_land() {
    init_tracing();
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
    assert_eq!(state.version, 1);
    let execution_id = state.execution_id;

    // Two writers race from the same base version. CAS serializes them; the
    // loser rebases onto the winner's record and retries.
    let memory_a = harness.memory.clone();
    let memory_b = harness.memory.clone();
    let writer_a = tokio::spawn(async move {
        memory_a
            .save_with_occ(execution_id, |s| {
                s.context.insert("writer_a".into(), json!(true));
                Ok(())
            })
            .await
    });
    let writer_b = tokio::spawn(async move {
        memory_b
            .save_with_occ(execution_id, |s| {
                s.context.insert("writer_b".into(), json!(true));
                Ok(())
            })
            .await
    });

    let a = writer_a.await.unwrap().unwrap();
    let b = writer_b.await.unwrap().unwrap();

    // Exactly one increment per writer: versions 2 and 3 in some order.
    let mut versions = vec![a.version, b.version];
    versions.sort_unstable();
    assert_eq!(versions, vec![2, 3]);

    let last = harness.memory.load_required(execution_id).await.unwrap();
    assert_eq!(last.version, 3);
    assert_eq!(last.context.get("writer_a"), Some(&json!(true)));
    assert_eq!(last.context.get("writer_b"), Some(&json!(true)));
}

#[tokio::test]
async fn version_sequence_is_contiguous_across_a_run() {
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
        .execute(harness.request(intent, plan))
        .await
        .unwrap();
    assert_eq!(state.status, ExecutionStatus::Completed);

    // Every transition in the audit log happened under a distinct persisted
    // version; the final version equals 1 (create) + number of writes.
    let raw = harness
        .store
        .scan("ordo:exec:*", 10)
        .await
        .unwrap();
    assert_eq!(raw.len(), 1);
    let stored: ExecutionState = serde_json::from_str(
        &harness.store.get(&raw[0]).await.unwrap().unwrap(),
    )
    .unwrap();
    assert!(stored.version >= 1 + stored.transitions.len() as u64);
}

#[tokio::test]
async fn idempotent_duplicate_reuses_cached_output() {
    init_tracing();
    let harness = Harness::new();

    // First execution runs the tool for real.
    let intent = action_intent("calendar.create", 0.9);
    let plan = harness.build_plan(
        &intent,
        vec![raw_step(0, "calendar.create", json!({"title": "Standup"}), &[])],
    );
    let first = harness
        .orchestrator
        .execute(harness.request(intent, plan))
        .await
        .unwrap();
    assert_eq!(first.status, ExecutionStatus::Completed);
    assert_eq!(harness.executor.call_count("calendar.create"), 1);

    // A second execution with identical (user, tool, params) within the TTL
    // window must not re-invoke the side effect.
    let intent = action_intent("calendar.create", 0.9);
    let plan = harness.build_plan(
        &intent,
        vec![raw_step(0, "calendar.create", json!({"title": "Standup"}), &[])],
    );
    let second = harness
        .orchestrator
        .execute(harness.request(intent, plan))
        .await
        .unwrap();

    assert_eq!(second.status, ExecutionStatus::Completed);
    assert_eq!(second.step_states[0].status, StepStatus::Completed);
    assert_eq!(
        second.step_states[0].output.as_ref().unwrap()["event_id"],
        "evt-1001"
    );
    // Still exactly one real invocation.
    assert_eq!(harness.executor.call_count("calendar.create"), 1);
    assert_eq!(harness.trace.events_named("idempotent_duplicate").len(), 1);
}

#[tokio::test]
async fn idempotency_expires_and_side_effect_runs_again() {
    let harness = Harness::new();
    let intent = action_intent("calendar.create", 0.9);
    let plan = harness.build_plan(
        &intent,
        vec![raw_step(0, "calendar.create", json!({"title": "Standup"}), &[])],
    );
    harness
        .orchestrator
        .execute(harness.request(intent, plan))
        .await
        .unwrap();

    harness.clock.advance(24 * 3600 * 1000 + 1);

    let intent = action_intent("calendar.create", 0.9);
    let plan = harness.build_plan(
        &intent,
        vec![raw_step(0, "calendar.create", json!({"title": "Standup"}), &[])],
    );
    harness
        .orchestrator
        .execute(harness.request(intent, plan))
        .await
        .unwrap();

    assert_eq!(harness.executor.call_count("calendar.create"), 2);
}

#[tokio::test]
async fn transient_failure_schedules_backoff_and_resumes() {
    init_tracing();
    let harness = Harness::new();
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
        vec![raw_step(0, "get_weather_data", json!({"location": "Tokyo"}), &[])],
    );

    let state = harness
        .orchestrator
        .execute(harness.request(intent, plan))
        .await
        .unwrap();
    let execution_id = state.execution_id;

    // Suspended, not failed: the step went back to pending and a resume is
    // queued behind the backoff delay.
    assert_eq!(state.status, ExecutionStatus::Executing);
    assert_eq!(state.step_states[0].status, StepStatus::Pending);
    assert_eq!(state.step_states[0].attempts, 1);
    let checkpoint = harness
        .memory
        .load_checkpoint(execution_id)
        .await
        .unwrap()
        .expect("checkpoint written before suspension");
    assert_eq!(
        checkpoint.reason,
        ordo_kernel::checkpoint::CheckpointReason::ScheduledRetry
    );

    // Nothing due before the delay elapses.
    assert!(harness.queue.ready_tasks(10).await.unwrap().is_empty());
    harness.clock.advance(50);
    let ready = harness.queue.ready_tasks(10).await.unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].execution_id, execution_id);

    // Claim and resume; the unscripted second attempt succeeds.
    assert!(harness.queue.mark_processing(execution_id).await.unwrap());
    let state = harness.orchestrator.resume(execution_id).await.unwrap();
    assert_eq!(state.status, ExecutionStatus::Completed);
    assert_eq!(state.step_states[0].attempts, 2);
}

#[tokio::test]
async fn retries_exhaust_into_failure() {
    let harness = Harness::new();
    for _ in 0..3 {
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

    let mut state = harness
        .orchestrator
        .execute(harness.request(intent, plan))
        .await
        .unwrap();

    // Drive through the scheduled retries until the attempt cap trips.
    for _ in 0..2 {
        assert_eq!(state.status, ExecutionStatus::Executing);
        harness.clock.advance(50);
        let execution_id = state.execution_id;
        assert!(harness.queue.mark_processing(execution_id).await.unwrap());
        state = harness.orchestrator.resume(execution_id).await.unwrap();
    }

    assert_eq!(state.status, ExecutionStatus::Failed);
    assert_eq!(state.step_states[0].status, StepStatus::Failed);
    assert_eq!(state.step_states[0].attempts, 3);
    assert_eq!(harness.executor.call_count("get_weather_data"), 3);
}

#[tokio::test]
async fn per_step_timeout_is_a_failed_step_not_a_hang() {
    let harness = Harness::new();
    harness.executor.script(
        "get_weather_data",
        ToolBehavior::Hang(std::time::Duration::from_secs(60)),
    );

    let intent = action_intent("get_weather_data", 0.9);
    let plan = harness.build_plan(
        &intent,
        // raw_step sets timeout_ms = 1_000; the hang loses.
        vec![raw_step(0, "get_weather_data", json!({"location": "Tokyo"}), &[])],
    );

    let state = harness
        .orchestrator
        .execute(harness.request(intent, plan))
        .await
        .unwrap();

    // Timeout triages as recoverable → scheduled retry, step back to pending.
    assert_eq!(state.status, ExecutionStatus::Executing);
    assert_eq!(state.step_states[0].attempts, 1);
    assert_eq!(harness.trace.events_named("step_failed").len(), 1);
}

#[tokio::test]
async fn lock_serializes_concurrent_runs_of_one_execution() {
    init_tracing();
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
    let execution_id = state.execution_id;

    // Two drivers race for the same execution; the lock admits them one at a
    // time, and the second observes the terminal state instead of
    // double-running the step.
    let orch_a = harness.orchestrator.clone();
    let orch_b = harness.orchestrator.clone();
    let run_a = tokio::spawn(async move { orch_a.run(execution_id).await });
    let run_b = tokio::spawn(async move { orch_b.run(execution_id).await });

    let a = run_a.await.unwrap();
    let b = run_b.await.unwrap();

    // One of them may lose every lock round and bubble up; the one that ran
    // must have completed, and the side effect happened exactly once.
    let completed = [a, b]
        .into_iter()
        .filter_map(|r| r.ok())
        .filter(|s| s.status == ExecutionStatus::Completed)
        .count();
    assert!(completed >= 1);
    assert_eq!(harness.executor.call_count("calendar.create"), 1);
}

#[tokio::test]
async fn lock_failure_surfaces_as_lock_acquire_failed() {
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
    let execution_id = state.execution_id;

    // Hold the execution's lock out-of-band.
    let lock = ordo_runtime::lock::QuorumLock::single_store(
        harness.store.clone(),
        harness.clock.clone(),
        ordo_runtime::lock::LockConfig::default(),
    );
    let _held = lock.acquire(&format!("exec:{execution_id}")).await.unwrap();

    let err = harness.orchestrator.run(execution_id).await.unwrap_err();
    assert!(matches!(err, OrdoError::LockAcquireFailed(_)));
    assert_eq!(harness.executor.call_count("calendar.create"), 0);
}

#[tokio::test]
async fn store_faults_surface_as_memory_operation_failed() {
    let harness = Harness::new();
    let flaky = std::sync::Arc::new(FlakyKVStore::new(harness.store.clone()));
    let memory = ordo_runtime::memory::ExecutionMemory::new(
        flaky.clone(),
        harness.clock.clone(),
        ordo_runtime::memory::MemoryConfig::default(),
    );

    let intent = action_intent("calendar.create", 0.9);
    let plan = harness.build_plan(
        &intent,
        vec![raw_step(0, "calendar.create", json!({"title": "x"}), &[])],
    );
    let state = ordo_kernel::execution::ExecutionState::new(plan, "t0".into());
    let execution_id = state.execution_id;
    memory.create(state).await.unwrap();

    flaky.fail_next(1);
    let err = memory
        .save_with_occ(execution_id, |_| Ok(()))
        .await
        .unwrap_err();
    assert!(matches!(err, OrdoError::MemoryOperationFailed(_)));
    assert!(err.recoverable());

    // The fault window passed; the same write now lands.
    memory.save_with_occ(execution_id, |_| Ok(())).await.unwrap();
}

#[tokio::test]
async fn worker_loop_drains_due_resumes() {
    init_tracing();
    let harness = Harness::new();
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
        vec![raw_step(0, "get_weather_data", json!({"location": "Tokyo"}), &[])],
    );
    let state = harness
        .orchestrator
        .execute(harness.request(intent, plan))
        .await
        .unwrap();
    let execution_id = state.execution_id;
    assert_eq!(state.status, ExecutionStatus::Executing);

    // Make the queued retry due, then let a worker drain it.
    harness.clock.advance(50);
    let worker = ordo_runtime::orchestrator::ResumeWorker::new(
        harness.orchestrator.clone(),
        ordo_runtime::orchestrator::WorkerConfig {
            poll_interval: std::time::Duration::from_millis(10),
            batch_size: 4,
            max_parallelism: 2,
        },
    );
    let handle = worker.spawn();

    // Wait for the worker to finish the resume.
    let mut completed = false;
    for _ in 0..100 {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let state = harness.memory.load_required(execution_id).await.unwrap();
        if state.status == ExecutionStatus::Completed {
            completed = true;
            break;
        }
    }
    worker.stop();
    let _ = handle.await;

    assert!(completed, "worker resumed and completed the execution");
    assert_eq!(harness.executor.call_count("get_weather_data"), 2);
}
