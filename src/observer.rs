//! Saga observer trait

use std::sync::Arc;

use crate::events::SagaEvent;

/// Observer trait for external observability
pub trait SagaObserver: Send + Sync + 'static {
    fn on_event(&self, event: &SagaEvent);
}

/// No-op observer
pub struct NoOpObserver;

impl SagaObserver for NoOpObserver {
    fn on_event(&self, _event: &SagaEvent) {}
}

/// Tracing-based observer
pub struct TracingObserver;

impl SagaObserver for TracingObserver {
    fn on_event(&self, event: &SagaEvent) {
        let ctx = event.context();
        let execution_id = ctx.execution_id;
        let definition = &*ctx.definition_id;

        match event {
            SagaEvent::ExecutionStarted { .. } => {
                tracing::info!(execution_id = %execution_id, definition = %definition, "Execution started");
            }
            SagaEvent::ExecutionCompleted { duration_millis, .. } => {
                tracing::info!(execution_id = %execution_id, duration_ms = duration_millis, "Execution completed");
            }
            SagaEvent::ExecutionFailed { reason, duration_millis, .. } => {
                tracing::error!(execution_id = %execution_id, reason = %reason, duration_ms = duration_millis, "Execution failed");
            }
            SagaEvent::ExecutionPaused { .. } => {
                tracing::info!(execution_id = %execution_id, "Execution paused");
            }
            SagaEvent::ExecutionResumed { .. } => {
                tracing::info!(execution_id = %execution_id, "Execution resumed");
            }
            SagaEvent::ExecutionCancelled { .. } => {
                tracing::warn!(execution_id = %execution_id, "Execution cancelled");
            }
            SagaEvent::StepStarted { target, .. } => {
                tracing::info!(execution_id = %execution_id, step = %ctx.step_id, target = %target, attempt = ctx.attempt, "Step started");
            }
            SagaEvent::StepCompleted { duration_millis, retries, .. } => {
                tracing::info!(execution_id = %execution_id, step = %ctx.step_id, duration_ms = duration_millis, retries = retries, "Step completed");
            }
            SagaEvent::StepFailed { error, will_retry, .. } => {
                tracing::warn!(execution_id = %execution_id, step = %ctx.step_id, error = %error, will_retry = will_retry, "Step failed");
            }
            SagaEvent::StepSkipped { .. } => {
                tracing::debug!(execution_id = %execution_id, step = %ctx.step_id, "Step skipped");
            }
            SagaEvent::CompensationStarted { trigger, failed_step, .. } => {
                tracing::info!(execution_id = %execution_id, trigger = ?trigger, failed_step = ?failed_step, "Compensation started");
            }
            SagaEvent::CompensationStepCompleted { step_id, .. } => {
                tracing::info!(execution_id = %execution_id, compensation = %ctx.step_id, step = %step_id, "Compensation step completed");
            }
            SagaEvent::CompensationStepFailed { step_id, error, is_ambiguous, .. } => {
                tracing::warn!(execution_id = %execution_id, compensation = %ctx.step_id, step = %step_id, error = %error, ambiguous = is_ambiguous, "Compensation step failed");
            }
            SagaEvent::CompensationFinished { status, .. } => match status {
                crate::state::CompensationRunStatus::Halted => {
                    tracing::error!(execution_id = %execution_id, "Compensation halted");
                }
                other => {
                    tracing::info!(execution_id = %execution_id, status = ?other, "Compensation finished");
                }
            },
            SagaEvent::Notification { kind, channels, message, .. } => {
                tracing::info!(execution_id = %execution_id, kind = ?kind, channels = ?channels, message = %message, "Notification");
            }
        }
    }
}

/// Fan-out to every registered observer
#[derive(Clone, Default)]
pub struct Observers {
    inner: Vec<Arc<dyn SagaObserver>>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: Arc<dyn SagaObserver>) -> Self {
        self.inner.push(observer);
        self
    }

    pub fn push(&mut self, observer: Arc<dyn SagaObserver>) {
        self.inner.push(observer);
    }

    pub fn emit(&self, event: SagaEvent) {
        for observer in &self.inner {
            observer.on_event(&event);
        }
    }
}

impl std::fmt::Debug for Observers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observers")
            .field("count", &self.inner.len())
            .finish()
    }
}
