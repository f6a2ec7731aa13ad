//! Engine statistics

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::events::SagaEvent;
use crate::observer::SagaObserver;
use crate::state::CompensationRunStatus;

/// Engine-wide counters, fed from the event stream
pub struct EngineStats {
    pub executions_started: AtomicU64,
    pub executions_completed: AtomicU64,
    pub executions_failed: AtomicU64,
    pub executions_cancelled: AtomicU64,
    pub executions_paused: AtomicU64,
    pub steps_started: AtomicU64,
    pub steps_completed: AtomicU64,
    pub steps_failed: AtomicU64,
    pub steps_retried: AtomicU64,
    pub steps_skipped: AtomicU64,
    pub compensations_started: AtomicU64,
    pub compensations_completed: AtomicU64,
    pub compensations_partial: AtomicU64,
    pub compensations_halted: AtomicU64,
    pub notifications_sent: AtomicU64,
}

impl EngineStats {
    pub fn new() -> Self {
        Self {
            executions_started: AtomicU64::new(0),
            executions_completed: AtomicU64::new(0),
            executions_failed: AtomicU64::new(0),
            executions_cancelled: AtomicU64::new(0),
            executions_paused: AtomicU64::new(0),
            steps_started: AtomicU64::new(0),
            steps_completed: AtomicU64::new(0),
            steps_failed: AtomicU64::new(0),
            steps_retried: AtomicU64::new(0),
            steps_skipped: AtomicU64::new(0),
            compensations_started: AtomicU64::new(0),
            compensations_completed: AtomicU64::new(0),
            compensations_partial: AtomicU64::new(0),
            compensations_halted: AtomicU64::new(0),
            notifications_sent: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            executions_started: self.executions_started.load(Ordering::Relaxed),
            executions_completed: self.executions_completed.load(Ordering::Relaxed),
            executions_failed: self.executions_failed.load(Ordering::Relaxed),
            executions_cancelled: self.executions_cancelled.load(Ordering::Relaxed),
            executions_paused: self.executions_paused.load(Ordering::Relaxed),
            steps_started: self.steps_started.load(Ordering::Relaxed),
            steps_completed: self.steps_completed.load(Ordering::Relaxed),
            steps_failed: self.steps_failed.load(Ordering::Relaxed),
            steps_retried: self.steps_retried.load(Ordering::Relaxed),
            steps_skipped: self.steps_skipped.load(Ordering::Relaxed),
            compensations_started: self.compensations_started.load(Ordering::Relaxed),
            compensations_completed: self.compensations_completed.load(Ordering::Relaxed),
            compensations_partial: self.compensations_partial.load(Ordering::Relaxed),
            compensations_halted: self.compensations_halted.load(Ordering::Relaxed),
            notifications_sent: self.notifications_sent.load(Ordering::Relaxed),
        }
    }
}

impl Default for EngineStats {
    fn default() -> Self {
        Self::new()
    }
}

impl SagaObserver for EngineStats {
    fn on_event(&self, event: &SagaEvent) {
        let counter = match event {
            SagaEvent::ExecutionStarted { .. } => &self.executions_started,
            SagaEvent::ExecutionCompleted { .. } => &self.executions_completed,
            SagaEvent::ExecutionFailed { .. } => &self.executions_failed,
            SagaEvent::ExecutionCancelled { .. } => &self.executions_cancelled,
            SagaEvent::ExecutionPaused { .. } => &self.executions_paused,
            SagaEvent::ExecutionResumed { .. } => return,
            SagaEvent::StepStarted { .. } => &self.steps_started,
            SagaEvent::StepCompleted { .. } => &self.steps_completed,
            SagaEvent::StepFailed { will_retry: true, .. } => &self.steps_retried,
            SagaEvent::StepFailed { .. } => &self.steps_failed,
            SagaEvent::StepSkipped { .. } => &self.steps_skipped,
            SagaEvent::CompensationStarted { .. } => &self.compensations_started,
            SagaEvent::CompensationStepCompleted { .. }
            | SagaEvent::CompensationStepFailed { .. } => return,
            SagaEvent::CompensationFinished { status, .. } => match status {
                CompensationRunStatus::Completed => &self.compensations_completed,
                CompensationRunStatus::Partial => &self.compensations_partial,
                CompensationRunStatus::Halted => &self.compensations_halted,
                CompensationRunStatus::Running => return,
            },
            SagaEvent::Notification { .. } => &self.notifications_sent,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatsSnapshot {
    pub executions_started: u64,
    pub executions_completed: u64,
    pub executions_failed: u64,
    pub executions_cancelled: u64,
    pub executions_paused: u64,
    pub steps_started: u64,
    pub steps_completed: u64,
    pub steps_failed: u64,
    pub steps_retried: u64,
    pub steps_skipped: u64,
    pub compensations_started: u64,
    pub compensations_completed: u64,
    pub compensations_partial: u64,
    pub compensations_halted: u64,
    pub notifications_sent: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ExecutionId, StepContext};

    #[test]
    fn test_retrying_failures_are_counted_separately() {
        let stats = EngineStats::new();
        let context = StepContext::root(ExecutionId::new(1), "flow", 0).for_step("a");
        let failed = |will_retry| SagaEvent::StepFailed {
            context: context.clone(),
            target: "svc".into(),
            error: "boom".into(),
            duration_millis: 1,
            will_retry,
        };

        stats.on_event(&failed(true));
        stats.on_event(&failed(true));
        stats.on_event(&failed(false));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.steps_retried, 2);
        assert_eq!(snapshot.steps_failed, 1);
    }
}
