//! Core traits for invoking the services a saga orchestrates

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::definition::{CompensationType, StepType};
use crate::{CompensationError, IdempotencyKey, StepContext, StepError};

/// A single call the engine makes against a bound service.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invocation {
    /// Correlation context of the step or compensation step
    pub context: StepContext,
    /// Which definition element produced this call
    pub kind: InvocationKind,
    /// Service the step is bound to
    pub service: Option<Box<str>>,
    /// Operation to run on the service
    pub operation: Box<str>,
    /// Request body
    pub payload: serde_json::Value,
    /// Key a service can use to deduplicate retries and recovery replays
    pub idempotency_key: IdempotencyKey,
    /// Per-attempt deadline enforced by the engine
    #[serde(skip)]
    pub timeout: Option<Duration>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "phase", content = "type")]
pub enum InvocationKind {
    Forward(StepType),
    Compensation(CompensationType),
}

/// Transport to the services a saga coordinates.
///
/// The engine owns ordering, retries, timeouts and policy; implementors
/// only perform one call and classify its failure.
///
/// # Example
///
/// ```rust,ignore
/// #[async_trait]
/// impl ServiceInvoker for Inventory {
///     async fn execute(&self, invocation: Invocation) -> Result<Value, StepError> {
///         self.client.reserve(invocation.payload).await
///             .map_err(|e| StepError::Retriable { reason: e.to_string().into() })
///     }
///
///     async fn compensate(&self, invocation: Invocation) -> Result<(), CompensationError> {
///         self.client.release(invocation.payload).await
///             .map_err(|e| CompensationError::SafeToRetry { reason: e.to_string().into() })
///     }
/// }
/// ```
#[async_trait]
pub trait ServiceInvoker: Send + Sync + 'static {
    /// Run a forward step operation and return its output
    async fn execute(&self, invocation: Invocation) -> Result<serde_json::Value, StepError>;

    /// Run a compensation operation
    async fn compensate(&self, invocation: Invocation) -> Result<(), CompensationError>;
}

/// Retry policy for step and compensation execution
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Initial delay before first retry (milliseconds)
    pub initial_delay_millis: u64,
    /// Maximum delay cap (milliseconds)
    pub max_delay_millis: u64,
    /// Backoff multiplier
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_millis: 1000,
            max_delay_millis: 30000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Calculate delay for a given retry (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::from_millis(0);
        }

        let delay = self.initial_delay_millis as f64
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = delay.min(self.max_delay_millis as f64);
        Duration::from_millis(capped as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(0));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4000));
        // Would be 512000 but capped at max
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(30000));
    }

    #[test]
    fn test_invocation_kind_serializes_with_phase() {
        let kind = InvocationKind::Compensation(CompensationType::Undo);
        let json = serde_json::to_value(kind).unwrap();
        assert_eq!(json["phase"], "COMPENSATION");
        assert_eq!(json["type"], "UNDO");
    }
}
