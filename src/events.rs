//! Saga lifecycle events
//!
//! The runner and the compensation executor emit one event per state
//! change. Observers (logging, counters, the metrics tracker) consume them;
//! none of them can influence the execution.

use serde::{Deserialize, Serialize};

use crate::state::{CompensationRunStatus, CompensationTrigger};
use crate::StepContext;

/// Events emitted while an execution progresses
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SagaEvent {
    // Execution lifecycle
    ExecutionStarted { context: StepContext },
    ExecutionCompleted { context: StepContext, duration_millis: u64 },
    ExecutionFailed {
        context: StepContext,
        reason: Box<str>,
        duration_millis: u64,
    },
    ExecutionPaused { context: StepContext },
    ExecutionResumed { context: StepContext },
    ExecutionCancelled { context: StepContext, duration_millis: u64 },

    // Forward steps
    StepStarted { context: StepContext, target: Box<str> },
    StepCompleted {
        context: StepContext,
        target: Box<str>,
        duration_millis: u64,
        retries: u32,
    },
    StepFailed {
        context: StepContext,
        target: Box<str>,
        error: Box<str>,
        duration_millis: u64,
        will_retry: bool,
    },
    StepSkipped { context: StepContext, target: Box<str> },

    // Compensation
    CompensationStarted {
        context: StepContext,
        trigger: CompensationTrigger,
        failed_step: Option<Box<str>>,
    },
    CompensationStepCompleted {
        context: StepContext,
        step_id: Box<str>,
        duration_millis: u64,
    },
    CompensationStepFailed {
        context: StepContext,
        step_id: Box<str>,
        error: Box<str>,
        is_ambiguous: bool,
    },
    CompensationFinished {
        context: StepContext,
        status: CompensationRunStatus,
    },

    /// Delivered to the definition's notification channels
    Notification {
        context: StepContext,
        kind: NotificationKind,
        channels: Vec<String>,
        message: Box<str>,
    },
}

/// Which `notifications` switch a notification belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    OnStart,
    OnSuccess,
    OnFailure,
}

impl SagaEvent {
    pub fn context(&self) -> &StepContext {
        match self {
            Self::ExecutionStarted { context } => context,
            Self::ExecutionCompleted { context, .. } => context,
            Self::ExecutionFailed { context, .. } => context,
            Self::ExecutionPaused { context } => context,
            Self::ExecutionResumed { context } => context,
            Self::ExecutionCancelled { context, .. } => context,
            Self::StepStarted { context, .. } => context,
            Self::StepCompleted { context, .. } => context,
            Self::StepFailed { context, .. } => context,
            Self::StepSkipped { context, .. } => context,
            Self::CompensationStarted { context, .. } => context,
            Self::CompensationStepCompleted { context, .. } => context,
            Self::CompensationStepFailed { context, .. } => context,
            Self::CompensationFinished { context, .. } => context,
            Self::Notification { context, .. } => context,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ExecutionStarted { .. } => "execution_started",
            Self::ExecutionCompleted { .. } => "execution_completed",
            Self::ExecutionFailed { .. } => "execution_failed",
            Self::ExecutionPaused { .. } => "execution_paused",
            Self::ExecutionResumed { .. } => "execution_resumed",
            Self::ExecutionCancelled { .. } => "execution_cancelled",
            Self::StepStarted { .. } => "step_started",
            Self::StepCompleted { .. } => "step_completed",
            Self::StepFailed { .. } => "step_failed",
            Self::StepSkipped { .. } => "step_skipped",
            Self::CompensationStarted { .. } => "compensation_started",
            Self::CompensationStepCompleted { .. } => "compensation_step_completed",
            Self::CompensationStepFailed { .. } => "compensation_step_failed",
            Self::CompensationFinished { .. } => "compensation_finished",
            Self::Notification { .. } => "notification",
        }
    }

    /// True for the events that end an execution
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::ExecutionCompleted { .. }
                | Self::ExecutionFailed { .. }
                | Self::ExecutionCancelled { .. }
        )
    }

    /// When the reported work finished, for events that report finished work.
    ///
    /// Execution events carry the root context, so the finish time is the
    /// execution start plus its duration. `StepCompleted` is emitted with a
    /// context stamped at completion; `StepFailed` carries the context of
    /// the attempt that failed.
    pub fn finished_at_millis(&self) -> Option<u64> {
        match self {
            Self::ExecutionCompleted { context, duration_millis }
            | Self::ExecutionFailed { context, duration_millis, .. }
            | Self::ExecutionCancelled { context, duration_millis } => {
                Some(context.execution_started_at_millis + duration_millis)
            }
            Self::StepCompleted { context, .. } => Some(context.event_timestamp_millis),
            Self::StepFailed { context, duration_millis, .. } => {
                Some(context.event_timestamp_millis + duration_millis)
            }
            _ => None,
        }
    }
}
