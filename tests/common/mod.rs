//! Shared fixtures for scenario tests

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use saga_orchestration::{
    CompensationError, EngineOptions, InMemoryStore, Invocation, RetryPolicy, SagaDefinition,
    SagaEngine, ServiceInvoker, StepError,
};

/// How a scripted operation answers one call
#[derive(Clone, Debug)]
pub enum Reply {
    Ok(Value),
    Fail(StepError),
    /// Sleep, then answer with the echo output
    Delay(Duration),
    /// Never answers
    Hang,
}

/// In-process services driven by per-operation scripts.
///
/// Unscripted operations succeed immediately with `{"operation": <name>}`.
/// A script is consumed front to back; its last reply repeats.
#[derive(Default)]
pub struct ScriptedInvoker {
    forward: Mutex<HashMap<String, VecDeque<Reply>>>,
    compensation_failures: Mutex<HashMap<String, CompensationError>>,
    executed: Mutex<Vec<String>>,
    compensated: Mutex<Vec<String>>,
    keys: Mutex<Vec<String>>,
}

impl ScriptedInvoker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, operation: &str, replies: impl IntoIterator<Item = Reply>) {
        self.forward
            .lock()
            .insert(operation.to_string(), replies.into_iter().collect());
    }

    pub fn fail(&self, operation: &str, error: StepError) {
        self.script(operation, [Reply::Fail(error)]);
    }

    pub fn fail_compensation(&self, operation: &str, error: CompensationError) {
        self.compensation_failures
            .lock()
            .insert(operation.to_string(), error);
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().clone()
    }

    pub fn compensated(&self) -> Vec<String> {
        self.compensated.lock().clone()
    }

    pub fn idempotency_keys(&self) -> Vec<String> {
        self.keys.lock().clone()
    }

    fn next_reply(&self, operation: &str) -> Option<Reply> {
        let mut forward = self.forward.lock();
        let script = forward.get_mut(operation)?;
        if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().cloned()
        }
    }
}

#[async_trait]
impl ServiceInvoker for ScriptedInvoker {
    async fn execute(&self, invocation: Invocation) -> Result<Value, StepError> {
        let operation = invocation.operation.to_string();
        self.executed.lock().push(operation.clone());
        self.keys
            .lock()
            .push(invocation.idempotency_key.as_str().to_string());

        let echo = json!({ "operation": operation });
        match self.next_reply(&operation) {
            None => Ok(echo),
            Some(Reply::Ok(value)) => Ok(value),
            Some(Reply::Fail(error)) => Err(error),
            Some(Reply::Delay(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(echo)
            }
            Some(Reply::Hang) => std::future::pending().await,
        }
    }

    async fn compensate(&self, invocation: Invocation) -> Result<(), CompensationError> {
        let operation = invocation.operation.to_string();
        self.compensated.lock().push(operation.clone());
        match self.compensation_failures.lock().get(&operation) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

pub fn retriable(reason: &str) -> StepError {
    StepError::Retriable {
        reason: reason.into(),
    }
}

pub fn terminal(reason: &str) -> StepError {
    StepError::Terminal {
        reason: reason.into(),
    }
}

/// Sequential single-group definition; every step `x` calls `x` and is undone by `undo-x`
pub fn linear(id: &str, steps: &[&str]) -> Value {
    json!({
        "id": id,
        "name": id,
        "stepGroups": [{
            "id": "main",
            "steps": steps.iter().map(|s| step(s)).collect::<Vec<_>>()
        }]
    })
}

pub fn step(id: &str) -> Value {
    json!({
        "id": id,
        "serviceName": format!("{id}-service"),
        "operation": id,
        "compensationOperation": format!("undo-{id}")
    })
}

pub fn definition(document: Value) -> SagaDefinition {
    serde_json::from_value(document).expect("test definition parses")
}

pub fn options() -> EngineOptions {
    EngineOptions {
        retry_defaults: RetryPolicy {
            max_attempts: 3,
            initial_delay_millis: 10,
            max_delay_millis: 100,
            backoff_multiplier: 2.0,
        },
        ..Default::default()
    }
}

pub fn engine_with(store: Arc<InMemoryStore>, invoker: Arc<ScriptedInvoker>) -> SagaEngine {
    SagaEngine::new(store, invoker, options()).expect("engine builds")
}

/// Engine over a fresh in-memory store, with `document` saved
pub fn engine(document: Value, invoker: Arc<ScriptedInvoker>) -> SagaEngine {
    let engine = engine_with(Arc::new(InMemoryStore::new()), invoker);
    engine
        .save_definition(definition(document))
        .expect("definition is valid");
    engine
}
