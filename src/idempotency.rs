//! Idempotency key generation for service invocations

use crate::ExecutionId;
use serde::{Deserialize, Serialize};

/// Idempotency key for deduplicating side effects
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(pub Box<str>);

impl IdempotencyKey {
    /// Create an idempotency key for a forward step attempt
    pub fn for_step(execution_id: ExecutionId, step_id: &str, attempt: u32) -> Self {
        Self(format!("saga:{}:step:{}:attempt:{}", execution_id.0, step_id, attempt).into_boxed_str())
    }

    /// Create an idempotency key for a compensation step.
    ///
    /// Stable across retries: a compensation must apply at most once.
    pub fn for_compensation(execution_id: ExecutionId, compensation_id: &str) -> Self {
        Self(format!("saga:{}:compensate:{}", execution_id.0, compensation_id).into_boxed_str())
    }

    /// Get the key as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_scoped_by_execution() {
        let a = IdempotencyKey::for_step(ExecutionId::new(1), "charge", 2);
        let b = IdempotencyKey::for_step(ExecutionId::new(2), "charge", 2);
        assert_eq!(a.as_str(), "saga:1:step:charge:attempt:2");
        assert_ne!(a, b);
        assert_eq!(
            IdempotencyKey::for_compensation(ExecutionId::new(1), "refund").as_str(),
            "saga:1:compensate:refund"
        );
    }
}
