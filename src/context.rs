//! Execution identity and per-step correlation context

use serde::{Deserialize, Serialize};

/// Unique identifier for a saga execution
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(pub u64);

impl ExecutionId {
    /// Create a new execution ID
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw ID value
    pub fn get(&self) -> u64 {
        self.0
    }

    /// Key used by persistent stores (zero padded so lexical order matches numeric order)
    pub fn storage_key(&self) -> String {
        format!("{:020}", self.0)
    }
}

impl std::fmt::Debug for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ExecutionId({})", self.0)
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ExecutionId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

/// Correlation context passed with every invocation and event
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepContext {
    /// Execution this context belongs to
    pub execution_id: ExecutionId,
    /// Definition the execution was started from
    pub definition_id: Box<str>,
    /// Forward step or compensation step id (empty for the execution root)
    pub step_id: Box<str>,
    /// Correlation ID linking all events in this execution
    pub correlation_id: u64,
    /// ID of the context that caused this one
    pub causation_id: u64,
    /// Distributed tracing ID
    pub trace_id: u64,
    /// Attempt number (1 = first attempt)
    pub attempt: u32,
    /// When the execution started (millis since UNIX epoch)
    pub execution_started_at_millis: u64,
    /// Timestamp of this context (millis since UNIX epoch)
    pub event_timestamp_millis: u64,
}

impl StepContext {
    /// Get current time in milliseconds since UNIX epoch
    pub fn now_millis() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    /// Root context for a freshly created execution
    pub fn root(execution_id: ExecutionId, definition_id: &str, started_at_millis: u64) -> Self {
        let trace_id = Self::next_trace_id();
        Self {
            execution_id,
            definition_id: definition_id.into(),
            step_id: "".into(),
            correlation_id: execution_id.0,
            causation_id: trace_id,
            trace_id,
            attempt: 1,
            execution_started_at_millis: started_at_millis,
            event_timestamp_millis: started_at_millis,
        }
    }

    /// Create a context for dispatching a forward step
    pub fn for_step(&self, step_id: &str) -> Self {
        Self {
            step_id: step_id.into(),
            causation_id: self.trace_id,
            trace_id: Self::next_trace_id(),
            attempt: 1,
            event_timestamp_millis: Self::now_millis(),
            ..self.clone()
        }
    }

    /// Create a context for a retry attempt
    pub fn retry(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            trace_id: Self::next_trace_id(),
            event_timestamp_millis: Self::now_millis(),
            ..self.clone()
        }
    }

    /// Create a context for a compensation step
    pub fn for_compensation(&self, compensation_id: &str) -> Self {
        Self {
            step_id: compensation_id.into(),
            causation_id: self.trace_id,
            trace_id: Self::next_trace_id(),
            attempt: 1,
            event_timestamp_millis: Self::now_millis(),
            ..self.clone()
        }
    }

    /// Calculate elapsed time since the execution started
    pub fn elapsed_millis(&self) -> u64 {
        self.event_timestamp_millis
            .saturating_sub(self.execution_started_at_millis)
    }

    fn next_trace_id() -> u64 {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        COUNTER.fetch_add(1, Ordering::Relaxed)
    }
}

impl std::fmt::Debug for StepContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepContext")
            .field("execution_id", &self.execution_id)
            .field("definition_id", &self.definition_id)
            .field("step_id", &self.step_id)
            .field("attempt", &self.attempt)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_bumps_attempt_and_keeps_step() {
        let root = StepContext::root(ExecutionId::new(7), "orders", 1_000);
        let step = root.for_step("reserve");
        let retried = step.retry();

        assert_eq!(step.attempt, 1);
        assert_eq!(retried.attempt, 2);
        assert_eq!(&*retried.step_id, "reserve");
        assert_eq!(retried.correlation_id, 7);
        assert_ne!(retried.trace_id, step.trace_id);
        assert_eq!(step.causation_id, root.trace_id);
    }

    #[test]
    fn test_storage_key_sorts_numerically() {
        assert!(ExecutionId::new(9).storage_key() < ExecutionId::new(10).storage_key());
        assert_eq!("42".parse::<ExecutionId>().ok(), Some(ExecutionId::new(42)));
    }
}
