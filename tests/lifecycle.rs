//! Operator control, global timeouts and crash recovery

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::{definition, engine, engine_with, linear, retriable, step, Reply, ScriptedInvoker};
use saga_orchestration::{
    CompensationRecord, CompensationRunStatus, CompensationStepExecution, CompensationStepStatus,
    CompensationTrigger, CompensationType, EngineError, ExecutionId, ExecutionStore, InMemoryStore,
    SagaExecution, SagaStatus, StepStatus,
};

/// Let spawned runners make progress
async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[tokio::test(start_paused = true)]
async fn test_pause_lets_in_flight_step_finish_then_holds() {
    let invoker = ScriptedInvoker::new();
    invoker.script("a", [Reply::Delay(Duration::from_secs(1))]);
    let engine = engine(linear("orders", &["a", "b"]), invoker.clone());

    let id = engine.trigger("orders", json!({})).unwrap().id;
    settle().await;
    assert_eq!(engine.pause(id).unwrap(), SagaStatus::Paused);

    tokio::time::sleep(Duration::from_secs(5)).await;
    let paused = engine.execution(id).unwrap();
    assert_eq!(paused.status, SagaStatus::Paused);
    assert_eq!(paused.step("a").unwrap().status, StepStatus::Completed);
    assert_eq!(paused.step("b").unwrap().status, StepStatus::Pending);
    assert_eq!(invoker.executed(), ["a"]);

    // Pausing twice is not a legal transition
    let err = engine.pause(id).unwrap_err();
    assert!(matches!(err, EngineError::Transition(_)));

    assert_eq!(engine.resume(id).unwrap(), SagaStatus::Running);
    let done = engine.wait(id).await.unwrap();
    assert_eq!(done.status, SagaStatus::Completed);
    assert_eq!(invoker.executed(), ["a", "b"]);
}

#[tokio::test(start_paused = true)]
async fn test_pause_holds_retries_of_failing_step() {
    let invoker = ScriptedInvoker::new();
    invoker.script(
        "a",
        [
            Reply::Fail(retriable("busy")),
            Reply::Fail(retriable("busy")),
            Reply::Fail(retriable("busy")),
            Reply::Fail(retriable("busy")),
            Reply::Ok(json!({"ok": true})),
        ],
    );
    let mut document = linear("orders", &["a"]);
    document["stepGroups"][0]["steps"][0]["retryPolicy"] =
        json!({"enabled": true, "maxAttempts": 5, "initialInterval": 1000});
    let engine = engine(document, invoker.clone());

    let id = engine.trigger("orders", json!({})).unwrap().id;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(invoker.executed(), ["a"]);
    engine.pause(id).unwrap();

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(invoker.executed(), ["a"]);
    assert_eq!(engine.execution(id).unwrap().status, SagaStatus::Paused);

    engine.resume(id).unwrap();
    let done = engine.wait(id).await.unwrap();
    assert_eq!(done.status, SagaStatus::Completed);
    assert_eq!(invoker.executed().len(), 5);
    assert_eq!(done.step("a").unwrap().retry_count, 4);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_retry_backoff_stops_dispatching() {
    let invoker = ScriptedInvoker::new();
    invoker.fail("a", retriable("busy"));
    let mut document = linear("orders", &["a", "b"]);
    document["stepGroups"][0]["steps"][0]["retryPolicy"] =
        json!({"enabled": true, "maxAttempts": 5, "initialInterval": 1000});
    let engine = engine(document, invoker.clone());

    let id = engine.trigger("orders", json!({})).unwrap().id;
    tokio::time::sleep(Duration::from_millis(10)).await;
    engine.pause(id).unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    engine.cancel(id).unwrap();

    let done = engine.wait(id).await.unwrap();
    assert_eq!(done.status, SagaStatus::Cancelled);
    assert_eq!(done.step("a").unwrap().status, StepStatus::Failed);
    assert_eq!(invoker.executed(), ["a"]);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_abandons_in_flight_step() {
    let invoker = ScriptedInvoker::new();
    invoker.script("b", [Reply::Hang]);
    let engine = engine(linear("orders", &["a", "b", "c"]), invoker.clone());

    let id = engine.trigger("orders", json!({})).unwrap().id;
    settle().await;
    assert_eq!(engine.cancel(id).unwrap(), SagaStatus::Cancelled);

    let done = engine.wait(id).await.unwrap();
    assert_eq!(done.status, SagaStatus::Cancelled);
    assert_eq!(done.error.as_deref(), Some("cancelled by operator"));
    assert_eq!(done.step("b").unwrap().status, StepStatus::Failed);
    assert_eq!(done.step("c").unwrap().status, StepStatus::Pending);
    assert!(done.compensation.is_none());
    assert!(invoker.compensated().is_empty());

    let err = engine.resume(id).unwrap_err();
    assert!(matches!(err, EngineError::Transition(_)));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_of_paused_execution() {
    let invoker = ScriptedInvoker::new();
    invoker.script("a", [Reply::Delay(Duration::from_secs(1))]);
    let engine = engine(linear("orders", &["a", "b"]), invoker.clone());

    let id = engine.trigger("orders", json!({})).unwrap().id;
    settle().await;
    engine.pause(id).unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    engine.cancel(id).unwrap();

    let done = engine.wait(id).await.unwrap();
    assert_eq!(done.status, SagaStatus::Cancelled);
    assert_eq!(invoker.executed(), ["a"]);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_compensates_when_configured() {
    let invoker = ScriptedInvoker::new();
    invoker.script("b", [Reply::Hang]);
    let mut document = linear("orders", &["a", "b"]);
    document["errorHandling"] = json!({"compensateOnCancel": true});
    let engine = engine(document, invoker.clone());

    let id = engine.trigger("orders", json!({})).unwrap().id;
    settle().await;
    engine.cancel(id).unwrap();

    let done = engine.wait(id).await.unwrap();
    assert_eq!(done.status, SagaStatus::Cancelled);
    assert_eq!(invoker.compensated(), ["undo-a"]);
    assert_eq!(
        done.compensation.unwrap().trigger,
        CompensationTrigger::Cancellation
    );
}

#[tokio::test(start_paused = true)]
async fn test_global_timeout_fails_and_compensates() {
    let invoker = ScriptedInvoker::new();
    invoker.script("h", [Reply::Hang]);
    let mut document = linear("orders", &["a", "h", "c"]);
    document["timeout"] = json!(500);
    let engine = engine(document, invoker.clone());

    let id = engine.trigger("orders", json!({})).unwrap().id;
    let done = engine.wait(id).await.unwrap();

    assert_eq!(done.status, SagaStatus::Failed);
    assert!(done.error.as_deref().unwrap().contains("global timeout"));
    assert_eq!(done.step("h").unwrap().status, StepStatus::Failed);
    assert_eq!(done.compensation.unwrap().trigger, CompensationTrigger::Timeout);
    assert_eq!(invoker.compensated(), ["undo-a"]);
}

#[tokio::test(start_paused = true)]
async fn test_global_timeout_with_one_group_of_three_still_running() {
    let invoker = ScriptedInvoker::new();
    invoker.script("h", [Reply::Hang]);
    let document = json!({
        "id": "orders",
        "name": "orders",
        "timeout": 500,
        "stepGroups": [
            {"id": "reserve", "steps": [step("a")]},
            {"id": "charge", "steps": [step("h")]},
            {"id": "ship", "steps": [step("c")]}
        ]
    });
    let engine = engine(document, invoker.clone());

    let id = engine.trigger("orders", json!({})).unwrap().id;
    let done = engine.wait(id).await.unwrap();

    assert_eq!(done.status, SagaStatus::Failed);
    assert!(done.error.as_deref().unwrap().contains("global timeout"));
    assert_eq!(done.step("a").unwrap().status, StepStatus::Completed);
    assert_eq!(done.step("h").unwrap().status, StepStatus::Failed);
    assert_eq!(done.step("c").unwrap().status, StepStatus::Pending);
    assert!(!invoker.executed().contains(&"c".to_string()));

    let record = done.compensation.unwrap();
    assert_eq!(record.trigger, CompensationTrigger::Timeout);
    assert_eq!(record.status, CompensationRunStatus::Completed);
    assert_eq!(invoker.compensated(), ["undo-a"]);
}

#[tokio::test(start_paused = true)]
async fn test_controls_on_unknown_execution() {
    let invoker = ScriptedInvoker::new();
    let engine = engine(linear("orders", &["a"]), invoker);

    let err = engine.pause(ExecutionId::new(42)).unwrap_err();
    assert!(matches!(err, EngineError::ExecutionNotFound(_)));
    assert!(matches!(
        engine.execution(ExecutionId::new(42)).unwrap_err(),
        EngineError::ExecutionNotFound(_)
    ));
}

fn interrupted(id: u64, status: SagaStatus) -> SagaExecution {
    let definition = definition(linear("orders", &["a", "b"]));
    let mut execution = SagaExecution::new(
        ExecutionId::new(id),
        &definition,
        json!({"orderId": id}),
        1_700_000_000_000,
    );
    execution.status = status;
    let a = execution.step_mut("a").unwrap();
    a.status = StepStatus::Completed;
    a.output = Some(json!({"operation": "a"}));
    execution.step_mut("b").unwrap().status = StepStatus::Running;
    execution
}

#[tokio::test(start_paused = true)]
async fn test_recover_resumes_unfinished_executions() {
    let store = Arc::new(InMemoryStore::new());
    let invoker = ScriptedInvoker::new();

    let first = engine_with(Arc::clone(&store), invoker.clone());
    first
        .save_definition(definition(linear("orders", &["a", "b"])))
        .unwrap();
    store.save_execution(&interrupted(7, SagaStatus::Running)).unwrap();
    store.save_execution(&interrupted(8, SagaStatus::Paused)).unwrap();

    let engine = engine_with(Arc::clone(&store), invoker.clone());
    assert_eq!(engine.recover().unwrap(), 2);

    let done = engine.wait(ExecutionId::new(7)).await.unwrap();
    assert_eq!(done.status, SagaStatus::Completed);
    assert_eq!(invoker.executed(), ["b"]);
    assert_eq!(done.step("b").unwrap().status, StepStatus::Completed);

    settle().await;
    let paused = engine.execution(ExecutionId::new(8)).unwrap();
    assert_eq!(paused.status, SagaStatus::Paused);
    assert_eq!(paused.step("b").unwrap().status, StepStatus::Pending);

    engine.resume(ExecutionId::new(8)).unwrap();
    let done = engine.wait(ExecutionId::new(8)).await.unwrap();
    assert_eq!(done.status, SagaStatus::Completed);

    // Ids continue after the highest stored one
    let next = engine.trigger("orders", json!({})).unwrap();
    assert_eq!(next.id, ExecutionId::new(9));

    // Terminal executions are left alone
    engine.wait(next.id).await.unwrap();
    assert_eq!(engine.recover().unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_recover_continues_interrupted_compensation() {
    let store = Arc::new(InMemoryStore::new());
    let invoker = ScriptedInvoker::new();
    let document = linear("orders", &["a", "b", "c"]);

    let first = engine_with(Arc::clone(&store), invoker.clone());
    first.save_definition(definition(document.clone())).unwrap();

    let mut execution = SagaExecution::new(
        ExecutionId::new(3),
        &definition(document),
        json!({}),
        1_700_000_000_000,
    );
    execution.step_mut("a").unwrap().status = StepStatus::Completed;
    execution.step_mut("b").unwrap().status = StepStatus::Completed;
    execution.step_mut("c").unwrap().status = StepStatus::Failed;
    execution.error = Some("step 'c' failed: boom".to_string());
    let entry = |step: &str, status| CompensationStepExecution {
        id: format!("{step}:compensate"),
        step_id: step.to_string(),
        compensation_type: CompensationType::Undo,
        status,
        retry_count: 0,
        start_time: None,
        end_time: None,
        duration: None,
        error: None,
    };
    execution.compensation = Some(CompensationRecord {
        trigger: CompensationTrigger::StepFailure,
        failed_step: Some("c".to_string()),
        status: CompensationRunStatus::Running,
        start_time: 1_700_000_000_500,
        end_time: None,
        steps: vec![
            entry("c", CompensationStepStatus::NotRequired),
            entry("b", CompensationStepStatus::Completed),
            entry("a", CompensationStepStatus::Running),
        ],
    });
    store.save_execution(&execution).unwrap();

    let engine = engine_with(Arc::clone(&store), invoker.clone());
    assert_eq!(engine.recover().unwrap(), 1);
    let done = engine.wait(ExecutionId::new(3)).await.unwrap();

    assert_eq!(done.status, SagaStatus::Failed);
    assert!(invoker.executed().is_empty());
    assert_eq!(invoker.compensated(), ["undo-a"]);
    let record = done.compensation.unwrap();
    assert_eq!(record.status, CompensationRunStatus::Completed);
    assert_eq!(record.count(CompensationStepStatus::Completed), 2);
}

#[tokio::test(start_paused = true)]
async fn test_engine_stats_count_lifecycle_events() {
    let invoker = ScriptedInvoker::new();
    invoker.script(
        "b",
        [Reply::Fail(retriable("flaky")), Reply::Ok(json!({}))],
    );
    let mut document = json!({
        "id": "orders",
        "name": "orders",
        "stepGroups": [{"id": "main", "steps": [step("a"), step("b")]}]
    });
    document["stepGroups"][0]["steps"][1]["retryPolicy"] = json!({"enabled": true, "maxAttempts": 2});
    let engine = engine(document, invoker.clone());

    let id = engine.trigger("orders", json!({})).unwrap().id;
    engine.wait(id).await.unwrap();

    let stats = engine.stats();
    assert_eq!(stats.executions_started, 1);
    assert_eq!(stats.executions_completed, 1);
    assert_eq!(stats.executions_failed, 0);
    assert_eq!(stats.steps_started, 2);
    assert_eq!(stats.steps_completed, 2);
    assert_eq!(stats.steps_retried, 1);
    assert_eq!(stats.steps_failed, 0);
    assert_eq!(engine.active_executions(), 0);
}
