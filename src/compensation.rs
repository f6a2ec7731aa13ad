//! Compensation executor
//!
//! Runs the compensation steps of one execution in resolved order. Only
//! forward steps that actually completed are undone; the others are
//! recorded as `NOT_REQUIRED` and count as finished for `dependsOn`.
//! Once started, a compensation run is not interrupted by pause or cancel.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::{json, Value};

use crate::action::{CompensationAction, CompensationDispatch};
use crate::definition::{CompensationFailurePolicy, CompensationStep, SagaDefinition};
use crate::events::{NotificationKind, SagaEvent};
use crate::journal::{checkpoint, ExecutionStore};
use crate::observer::Observers;
use crate::resolver::resolve_order;
use crate::state::{
    CompensationRecord, CompensationRunStatus, CompensationStepExecution, CompensationStepStatus,
    CompensationTrigger, SagaExecution, StepStatus,
};
use crate::{CompensationError, RetryPolicy, ServiceInvoker, StepContext};

pub struct CompensationExecutor<'a> {
    pub definition: &'a SagaDefinition,
    pub invoker: &'a dyn ServiceInvoker,
    pub store: &'a dyn ExecutionStore,
    pub observers: &'a Observers,
    /// Engine-wide retry defaults
    pub defaults: &'a RetryPolicy,
}

impl CompensationExecutor<'_> {
    /// Compensate `execution`, leaving the outcome in `execution.compensation`
    pub async fn execute(
        &self,
        execution: &mut SagaExecution,
        root: &StepContext,
        trigger: CompensationTrigger,
        failed_step: Option<&str>,
    ) -> CompensationRunStatus {
        let started = StepContext::now_millis();
        let steps = self.definition.effective_compensation_steps();

        let order = match resolve_order(self.definition, &steps, self.definition.compensation_strategy) {
            Ok(order) => order,
            Err(error) => {
                // Saved definitions are validated, so this only fires for stores edited by hand
                tracing::error!(execution_id = %execution.id, error = %error, "Cannot resolve compensation order");
                execution.compensation = Some(CompensationRecord {
                    trigger,
                    failed_step: failed_step.map(str::to_string),
                    status: CompensationRunStatus::Halted,
                    start_time: started,
                    end_time: Some(started),
                    steps: Vec::new(),
                });
                execution.partial_compensation = true;
                checkpoint(self.store, execution);
                return CompensationRunStatus::Halted;
            }
        };

        // A run cut short by a restart picks up from its stored record
        let resumed = execution
            .compensation
            .as_ref()
            .filter(|record| record.status == CompensationRunStatus::Running);
        let prior: HashMap<&str, &CompensationStepExecution> = resumed
            .iter()
            .flat_map(|record| record.steps.iter())
            .map(|entry| (entry.id.as_str(), entry))
            .collect();

        let steps: Vec<CompensationStepExecution> = order
            .iter()
            .map(|step| match prior.get(step.id.as_str()) {
                Some(&entry) => {
                    let mut entry = entry.clone();
                    if entry.status == CompensationStepStatus::Running {
                        entry.status = CompensationStepStatus::Pending;
                        entry.start_time = None;
                    }
                    entry
                }
                None => CompensationStepExecution {
                    id: step.id.clone(),
                    step_id: step.step_id.clone(),
                    compensation_type: step.compensation_type,
                    status: if execution
                        .step(&step.step_id)
                        .is_some_and(|s| s.status == StepStatus::Completed)
                    {
                        CompensationStepStatus::Pending
                    } else {
                        CompensationStepStatus::NotRequired
                    },
                    retry_count: 0,
                    start_time: None,
                    end_time: None,
                    duration: None,
                    error: None,
                },
            })
            .collect();
        if resumed.is_some() {
            tracing::info!(
                execution_id = %execution.id,
                remaining = steps.iter().filter(|s| s.status == CompensationStepStatus::Pending).count(),
                "Resuming compensation run"
            );
        }

        let mut record = CompensationRecord {
            trigger,
            failed_step: failed_step.map(str::to_string),
            status: CompensationRunStatus::Running,
            start_time: resumed.map_or(started, |record| record.start_time),
            end_time: None,
            steps,
        };

        self.checkpoint(execution, &record);
        self.observers.emit(SagaEvent::CompensationStarted {
            context: root.clone(),
            trigger,
            failed_step: failed_step.map(Into::into),
        });
        if self.definition.notifications.on_start {
            self.notify(root, NotificationKind::OnStart, "compensation started");
        }

        let position: HashMap<&str, usize> = order
            .iter()
            .enumerate()
            .map(|(i, step)| (step.id.as_str(), i))
            .collect();
        let honors_dependencies = self.definition.compensation_strategy.honors_dependencies();
        let policy = self.definition.error_handling.on_compensation_failure;
        let mut halted = false;

        loop {
            let next = (0..order.len()).find(|&i| {
                record.steps[i].status == CompensationStepStatus::Pending
                    && (!honors_dependencies
                        || order[i].depends_on.iter().all(|dependency| {
                            position
                                .get(dependency.as_str())
                                .map_or(true, |&j| record.steps[j].status.is_settled())
                        }))
            });
            let Some(index) = next else { break };

            if let Err(error) = self.run_step(execution, &mut record, index, order[index], root).await {
                match policy {
                    CompensationFailurePolicy::Continue => {}
                    CompensationFailurePolicy::Halt => {
                        halted = true;
                        break;
                    }
                    CompensationFailurePolicy::Alert => {
                        self.notify(
                            root,
                            NotificationKind::OnFailure,
                            &format!("compensation step '{}' failed: {}", order[index].id, error.message()),
                        );
                        halted = true;
                        break;
                    }
                }
            }
        }

        for step in &mut record.steps {
            if step.status == CompensationStepStatus::Pending {
                step.status = CompensationStepStatus::NotAttempted;
            }
        }
        record.status = if halted {
            CompensationRunStatus::Halted
        } else if record.is_partial() {
            CompensationRunStatus::Partial
        } else {
            CompensationRunStatus::Completed
        };
        record.end_time = Some(StepContext::now_millis());
        let status = record.status;
        execution.partial_compensation = record.is_partial();
        execution.current_step = None;
        self.checkpoint(execution, &record);

        self.observers.emit(SagaEvent::CompensationFinished {
            context: root.clone(),
            status,
        });
        match status {
            CompensationRunStatus::Completed if self.definition.notifications.on_success => {
                self.notify(root, NotificationKind::OnSuccess, "compensation completed");
            }
            CompensationRunStatus::Halted if self.definition.notifications.on_failure => {
                self.notify(root, NotificationKind::OnFailure, "compensation halted");
            }
            _ => {}
        }
        status
    }

    async fn run_step(
        &self,
        execution: &mut SagaExecution,
        record: &mut CompensationRecord,
        index: usize,
        step: &CompensationStep,
        root: &StepContext,
    ) -> Result<(), CompensationError> {
        let started = StepContext::now_millis();
        record.steps[index].status = CompensationStepStatus::Running;
        record.steps[index].start_time = Some(started);
        execution.current_step = Some(step.id.clone());
        self.checkpoint(execution, record);

        let result = match self.definition.step(&step.step_id) {
            Some(forward) => {
                let action = CompensationAction::new(step, forward);
                let policy = self.retry_policy(step);
                let timeout = step.timeout.or(forward.timeout).map(Duration::from_millis);
                let payload = compensation_payload(execution, &step.step_id);
                let mut context = root.for_compensation(&step.id);

                loop {
                    let dispatch = CompensationDispatch {
                        invoker: self.invoker,
                        context: context.clone(),
                        payload: payload.clone(),
                        timeout,
                    };
                    match action.execute(dispatch).await {
                        Ok(()) => break Ok(()),
                        Err(error) if error.is_safe_to_retry() && context.attempt < policy.max_attempts => {
                            tracing::debug!(
                                execution_id = %execution.id,
                                compensation = %step.id,
                                attempt = context.attempt,
                                error = %error,
                                "Retrying compensation step"
                            );
                            record.steps[index].retry_count += 1;
                            tokio::time::sleep(policy.delay_for_attempt(context.attempt)).await;
                            context = context.retry();
                        }
                        Err(error) => break Err(error),
                    }
                }
            }
            None => Err(CompensationError::Terminal {
                reason: format!("unknown forward step '{}'", step.step_id).into(),
            }),
        };

        let finished = StepContext::now_millis();
        let entry = &mut record.steps[index];
        entry.end_time = Some(finished);
        entry.duration = Some(finished.saturating_sub(started));
        let context = root.for_compensation(&step.id);

        match &result {
            Ok(()) => {
                entry.status = CompensationStepStatus::Completed;
                self.observers.emit(SagaEvent::CompensationStepCompleted {
                    context,
                    step_id: step.step_id.as_str().into(),
                    duration_millis: finished.saturating_sub(started),
                });
            }
            Err(error) => {
                entry.status = CompensationStepStatus::Failed;
                entry.error = Some(error.message());
                self.observers.emit(SagaEvent::CompensationStepFailed {
                    context,
                    step_id: step.step_id.as_str().into(),
                    error: error.message().into(),
                    is_ambiguous: error.is_ambiguous(),
                });
            }
        }
        self.checkpoint(execution, record);
        result
    }

    fn retry_policy(&self, step: &CompensationStep) -> RetryPolicy {
        if !step.retryable {
            return RetryPolicy::single_attempt();
        }
        match &step.retry_policy {
            Some(config) if !config.enabled => RetryPolicy::single_attempt(),
            Some(config) => config.resolve(self.defaults, self.definition.default_retry_interval),
            None => RetryPolicy {
                initial_delay_millis: self
                    .definition
                    .default_retry_interval
                    .unwrap_or(self.defaults.initial_delay_millis),
                ..self.defaults.clone()
            },
        }
    }

    fn checkpoint(&self, execution: &mut SagaExecution, record: &CompensationRecord) {
        execution.compensation = Some(record.clone());
        checkpoint(self.store, execution);
    }

    fn notify(&self, root: &StepContext, kind: NotificationKind, message: &str) {
        self.observers.emit(SagaEvent::Notification {
            context: root.clone(),
            kind,
            channels: self.definition.notifications.channels.clone(),
            message: message.into(),
        });
    }
}

/// Execution data document plus the forward step being undone
fn compensation_payload(execution: &SagaExecution, step_id: &str) -> Value {
    let mut document = execution.data_document();
    document["compensating"] = json!({
        "stepId": step_id,
        "output": execution.step(step_id).and_then(|s| s.output.clone()),
    });
    document
}
