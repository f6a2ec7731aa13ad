//! Error types for step execution, compensation and engine operations

use serde::{Deserialize, Serialize};

use crate::query::QueryError;
use crate::state::SagaStatus;
use crate::validation::DefinitionValidationError;
use crate::{ExecutionId, StoreError};

/// Error from forward step execution
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, thiserror::Error)]
pub enum StepError {
    /// Temporary error - can retry with exponential backoff
    #[error("retriable failure: {reason}")]
    Retriable {
        /// Error description
        reason: Box<str>,
    },
    /// Permanent error (business rule) - retrying will not help
    #[error("terminal failure: {reason}")]
    Terminal {
        /// Error description
        reason: Box<str>,
    },
    /// The attempt exceeded the step's timeout
    #[error("step timed out after {timeout_millis}ms")]
    Timeout {
        /// Timeout that elapsed
        timeout_millis: u64,
    },
}

impl StepError {
    /// Check if this error is retriable
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Retriable { .. } | Self::Timeout { .. })
    }

    /// Human readable message recorded on the step execution
    pub fn message(&self) -> String {
        match self {
            Self::Retriable { reason } | Self::Terminal { reason } => reason.to_string(),
            Self::Timeout { .. } => self.to_string(),
        }
    }
}

/// Error from compensation execution
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, thiserror::Error)]
pub enum CompensationError {
    /// Safe to retry - no side effects were applied
    #[error("compensation failed (safe to retry): {reason}")]
    SafeToRetry {
        /// Error description
        reason: Box<str>,
    },
    /// Ambiguous state - compensation may or may not have applied
    #[error("compensation outcome ambiguous: {reason}")]
    Ambiguous {
        /// Error description
        reason: Box<str>,
    },
    /// Terminal failure - cannot compensate
    #[error("compensation failed: {reason}")]
    Terminal {
        /// Error description
        reason: Box<str>,
    },
    /// The attempt exceeded the compensation step's timeout
    #[error("compensation timed out after {timeout_millis}ms")]
    Timeout {
        /// Timeout that elapsed
        timeout_millis: u64,
    },
}

impl CompensationError {
    /// Check if safe to retry
    pub fn is_safe_to_retry(&self) -> bool {
        matches!(self, Self::SafeToRetry { .. } | Self::Timeout { .. })
    }

    /// Check if state is ambiguous
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, Self::Ambiguous { .. })
    }

    /// Human readable message recorded on the compensation record
    pub fn message(&self) -> String {
        match self {
            Self::SafeToRetry { reason } | Self::Ambiguous { reason } | Self::Terminal { reason } => {
                reason.to_string()
            }
            Self::Timeout { .. } => self.to_string(),
        }
    }
}

/// Rejected state machine transition
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("execution {execution_id} cannot move from {from} to {to}")]
pub struct TransitionError {
    pub execution_id: ExecutionId,
    pub from: SagaStatus,
    pub to: SagaStatus,
}

/// Errors surfaced by the engine API
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("definition not found: {0}")]
    DefinitionNotFound(String),
    #[error("execution not found: {0}")]
    ExecutionNotFound(ExecutionId),
    #[error("no executions recorded for flow: {0}")]
    NoExecutions(String),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error(transparent)]
    Validation(#[from] DefinitionValidationError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error(transparent)]
    Store(#[from] StoreError),
}
