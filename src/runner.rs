//! Per-execution task
//!
//! One `Runner` drives one execution from its first pending step to a
//! terminal state. It owns the `SagaExecution` snapshot outright and writes
//! it to the store at every step boundary.
//!
//! Operators influence a run only through the shared lifecycle channel: the
//! engine moves it to PAUSED, RUNNING or CANCELLED, the runner moves it to
//! COMPLETED or FAILED, and both sides go through the same transition table.
//! A pause takes effect at the next dispatch point; a cancel also abandons
//! whatever call is in flight.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::action::{StepAction, StepDispatch};
use crate::compensation::CompensationExecutor;
use crate::condition::Condition;
use crate::definition::{
    ExecutionMode, RetryFallback, RetryPolicyConfig, SagaDefinition, Step, StepFailurePolicy,
};
use crate::events::{NotificationKind, SagaEvent};
use crate::journal::{checkpoint, ExecutionStore};
use crate::observer::Observers;
use crate::state::{CompensationRunStatus, CompensationTrigger, SagaExecution, SagaStatus, StepStatus};
use crate::{RetryPolicy, ServiceInvoker, StepContext, StepError};

/// Shared collaborators every runner needs
#[derive(Clone)]
pub(crate) struct Services {
    pub invoker: Arc<dyn ServiceInvoker>,
    pub store: Arc<dyn ExecutionStore>,
    pub observers: Observers,
    pub defaults: RetryPolicy,
}

/// Result of all attempts of one step
struct StepRun {
    result: Result<Value, StepError>,
    retries: u32,
    execution_time: u64,
}

enum Interrupt {
    Cancelled,
    TimedOut,
}

enum Outcome {
    Completed,
    Failed {
        step: Option<String>,
        reason: String,
        compensate: Option<CompensationTrigger>,
    },
    Cancelled,
}

impl Services {
    fn retry_policy(&self, definition: &SagaDefinition, step: &Step) -> RetryPolicy {
        if step.retry_policy.enabled {
            step.retry_policy
                .resolve(&self.defaults, definition.default_retry_interval)
        } else if definition.error_handling.on_step_failure == StepFailurePolicy::Retry {
            RetryPolicyConfig::default().resolve(&self.defaults, definition.default_retry_interval)
        } else {
            RetryPolicy::single_attempt()
        }
    }

    /// Run a step until it succeeds or its retry budget is spent.
    ///
    /// A pause holds the next attempt back until resume; a cancel during the
    /// backoff ends the step without another dispatch.
    async fn attempts(
        &self,
        definition: &SagaDefinition,
        step: &Step,
        mut context: StepContext,
        payload: Value,
        previous_group: Map<String, Value>,
        mut status: watch::Receiver<SagaStatus>,
    ) -> Result<StepRun, Interrupt> {
        let action = StepAction::from_step(step);
        let policy = self.retry_policy(definition, step);
        let timeout = step.timeout.map(Duration::from_millis);
        let mut retries = 0;
        let mut execution_time = 0;

        loop {
            let started = Instant::now();
            let result = action
                .execute(StepDispatch {
                    invoker: &*self.invoker,
                    context: context.clone(),
                    payload: payload.clone(),
                    previous_group: previous_group.clone(),
                    timeout,
                })
                .await;
            let elapsed = started.elapsed().as_millis() as u64;
            execution_time += elapsed;

            let error = match result {
                Ok(output) => {
                    return Ok(StepRun {
                        result: Ok(output),
                        retries,
                        execution_time,
                    })
                }
                Err(error) => error,
            };

            let will_retry = error.is_retriable() && context.attempt < policy.max_attempts;
            self.observers.emit(SagaEvent::StepFailed {
                context: context.clone(),
                target: step.target().into(),
                error: error.message().into(),
                duration_millis: elapsed,
                will_retry,
            });
            if !will_retry {
                return Ok(StepRun {
                    result: Err(error),
                    retries,
                    execution_time,
                });
            }

            retries += 1;
            tokio::time::sleep(policy.delay_for_attempt(context.attempt)).await;
            hold(&mut status).await?;
            context = context.retry();
        }
    }
}

pub(crate) struct Runner {
    services: Services,
    definition: Arc<SagaDefinition>,
    control: Arc<watch::Sender<SagaStatus>>,
    status: watch::Receiver<SagaStatus>,
    execution: SagaExecution,
    root: StepContext,
    deadline: Option<Instant>,
}

impl Runner {
    pub(crate) fn new(
        services: Services,
        definition: Arc<SagaDefinition>,
        execution: SagaExecution,
        control: Arc<watch::Sender<SagaStatus>>,
    ) -> Self {
        let root = StepContext::root(execution.id, &definition.id, execution.start_time);
        let deadline = definition.timeout.map(|budget| {
            let elapsed = StepContext::now_millis().saturating_sub(execution.start_time);
            Instant::now() + Duration::from_millis(budget.saturating_sub(elapsed))
        });
        let status = control.subscribe();

        Self {
            services,
            definition,
            control,
            status,
            execution,
            root,
            deadline,
        }
    }

    /// Drive the execution to a terminal state and hand back the final snapshot
    pub(crate) async fn run(mut self, recovered: bool) -> SagaExecution {
        if !recovered {
            checkpoint(&*self.services.store, &self.execution);
            self.services.observers.emit(SagaEvent::ExecutionStarted {
                context: self.root.clone(),
            });
            if self.definition.notifications.on_start {
                self.notify(NotificationKind::OnStart, "execution started");
            }
        }

        let outcome = match self.interrupted_compensation() {
            Some(outcome) => outcome,
            None => self.drive().await,
        };
        self.finish(outcome).await;
        self.execution
    }

    /// A restart that landed in the middle of a compensation run picks it up again
    fn interrupted_compensation(&self) -> Option<Outcome> {
        let record = self.execution.compensation.as_ref()?;
        if record.status != CompensationRunStatus::Running {
            return None;
        }
        Some(match record.trigger {
            CompensationTrigger::Cancellation => Outcome::Cancelled,
            trigger => Outcome::Failed {
                step: record.failed_step.clone(),
                reason: self
                    .execution
                    .error
                    .clone()
                    .unwrap_or_else(|| "compensation interrupted by restart".to_string()),
                compensate: Some(trigger),
            },
        })
    }

    async fn drive(&mut self) -> Outcome {
        let definition = Arc::clone(&self.definition);

        for (index, group) in definition.step_groups.iter().enumerate() {
            let remaining: Vec<&Step> = group
                .steps
                .iter()
                .filter(|step| {
                    self.execution
                        .step(&step.id)
                        .is_some_and(|s| !s.status.is_terminal())
                })
                .collect();
            if remaining.is_empty() {
                continue;
            }

            let outcome = match group.execution_mode {
                ExecutionMode::Sequential => self.run_sequential(index, &remaining).await,
                ExecutionMode::Parallel => self.run_parallel(index, &remaining).await,
            };
            if let Some(outcome) = outcome {
                return outcome;
            }
        }

        Outcome::Completed
    }

    async fn run_sequential(&mut self, group_index: usize, steps: &[&Step]) -> Option<Outcome> {
        let scheduled = StepContext::now_millis();

        for &step in steps {
            if let Some(outcome) = self.gate(true).await {
                return Some(outcome);
            }
            if !self.admit(step) {
                continue;
            }

            let payload = self.execution.data_document();
            let previous = self.previous_group_outputs(group_index);
            let context = self.mark_started(step, &payload, scheduled);

            let work = self.services.attempts(
                &self.definition,
                step,
                context,
                payload,
                previous,
                self.status.clone(),
            );
            match race(work, &mut self.status, self.deadline).await.and_then(|run| run) {
                Ok(run) => {
                    if let Err(error) = self.record(step, run) {
                        if let Some(outcome) = self.failure_outcome(step, &error) {
                            return Some(outcome);
                        }
                    }
                }
                Err(interrupt) => return Some(self.interrupted(interrupt, &[step])),
            }
        }
        None
    }

    async fn run_parallel(&mut self, group_index: usize, steps: &[&Step]) -> Option<Outcome> {
        if let Some(outcome) = self.gate(true).await {
            return Some(outcome);
        }

        let scheduled = StepContext::now_millis();
        let payload = self.execution.data_document();
        let mut admitted = Vec::with_capacity(steps.len());
        for &step in steps {
            if self.admit(step) {
                admitted.push(step);
            }
        }
        if admitted.is_empty() {
            return None;
        }

        let previous = self.previous_group_outputs(group_index);
        let contexts: Vec<StepContext> = admitted
            .iter()
            .map(|step| self.mark_started(step, &payload, scheduled))
            .collect();

        let work = join_all(admitted.iter().zip(contexts).map(|(step, context)| {
            self.services.attempts(
                &self.definition,
                step,
                context,
                payload.clone(),
                previous.clone(),
                self.status.clone(),
            )
        }));
        let runs = match race(work, &mut self.status, self.deadline)
            .await
            .and_then(|runs| runs.into_iter().collect::<Result<Vec<_>, _>>())
        {
            Ok(runs) => runs,
            Err(interrupt) => return Some(self.interrupted(interrupt, &admitted)),
        };

        let mut first_failure = None;
        for (&step, run) in admitted.iter().zip(runs) {
            if let Err(error) = self.record(step, run) {
                first_failure.get_or_insert((step, error));
            }
        }
        first_failure.and_then(|(step, error)| self.failure_outcome(step, &error))
    }

    /// Wait out a pause; report a cancel or an expired deadline
    async fn gate(&mut self, check_deadline: bool) -> Option<Outcome> {
        loop {
            let status = *self.status.borrow_and_update();
            match status {
                SagaStatus::Paused => {
                    self.mirror(SagaStatus::Paused);
                    if self.status.changed().await.is_err() {
                        return Some(Outcome::Cancelled);
                    }
                }
                SagaStatus::Cancelled => return Some(Outcome::Cancelled),
                _ => {
                    self.mirror(SagaStatus::Running);
                    if check_deadline && self.deadline.is_some_and(|d| Instant::now() >= d) {
                        return Some(self.timed_out(None));
                    }
                    return None;
                }
            }
        }
    }

    /// Bring the snapshot in line with an operator pause or resume
    fn mirror(&mut self, next: SagaStatus) {
        if self.execution.status != next && self.execution.status.can_transition_to(next) {
            if self
                .execution
                .transition(next, StepContext::now_millis())
                .is_ok()
            {
                checkpoint(&*self.services.store, &self.execution);
            }
        }
    }

    /// Move the shared lifecycle to `next` if the table allows it
    fn claim(&self, next: SagaStatus) -> bool {
        let mut claimed = false;
        self.control.send_if_modified(|current| {
            if *current == next {
                claimed = true;
                false
            } else if current.can_transition_to(next) {
                *current = next;
                claimed = true;
                true
            } else {
                false
            }
        });
        claimed
    }

    /// Claim a terminal status, waiting out a pause first
    async fn settle(&mut self, next: SagaStatus) -> Result<(), Outcome> {
        loop {
            if let Some(outcome) = self.gate(false).await {
                return Err(outcome);
            }
            if self.claim(next) {
                return Ok(());
            }
            let current = *self.status.borrow();
            if current.is_terminal() {
                tracing::warn!(execution_id = %self.execution.id, current = %current, wanted = %next, "Lifecycle already terminal");
                return Ok(());
            }
        }
    }

    fn admit(&mut self, step: &Step) -> bool {
        let Some(expression) = &step.condition else {
            return true;
        };

        let document = self.execution.data_document();
        let holds = match Condition::parse(expression) {
            Ok(condition) => condition.evaluate(&document),
            Err(error) => {
                tracing::error!(execution_id = %self.execution.id, step = %step.id, error = %error, "Unparseable condition, skipping step");
                false
            }
        };
        if holds {
            return true;
        }

        let now = StepContext::now_millis();
        if let Some(record) = self.execution.step_mut(&step.id) {
            record.status = StepStatus::Skipped;
            record.start_time = Some(now);
            record.end_time = Some(now);
            record.duration = Some(0);
        }
        self.execution.refresh_progress();
        checkpoint(&*self.services.store, &self.execution);
        self.services.observers.emit(SagaEvent::StepSkipped {
            context: self.root.for_step(&step.id),
            target: step.target().into(),
        });
        false
    }

    fn mark_started(&mut self, step: &Step, payload: &Value, scheduled: u64) -> StepContext {
        let now = StepContext::now_millis();
        if let Some(record) = self.execution.step_mut(&step.id) {
            record.status = StepStatus::Running;
            record.start_time = Some(now);
            record.end_time = None;
            record.error = None;
            record.input = Some(payload.clone());
            record.metrics.queue_time = now.saturating_sub(scheduled);
            record.metrics.input_size = serialized_len(payload);
        }
        self.execution.current_step = Some(step.id.clone());
        checkpoint(&*self.services.store, &self.execution);

        let context = self.root.for_step(&step.id);
        self.services.observers.emit(SagaEvent::StepStarted {
            context: context.clone(),
            target: step.target().into(),
        });
        context
    }

    /// Store the outcome of a step's attempts on its record
    fn record(&mut self, step: &Step, run: StepRun) -> Result<(), StepError> {
        let now = StepContext::now_millis();
        let mut duration = 0;

        if let Some(record) = self.execution.step_mut(&step.id) {
            duration = now.saturating_sub(record.start_time.unwrap_or(now));
            record.end_time = Some(now);
            record.duration = Some(duration);
            record.retry_count = run.retries;
            record.metrics.retries = run.retries;
            record.metrics.execution_time = run.execution_time;

            match &run.result {
                Ok(output) => {
                    record.status = StepStatus::Completed;
                    record.metrics.output_size = serialized_len(output);
                    record.output = Some(output.clone());
                }
                Err(error) => {
                    record.status = StepStatus::Failed;
                    record.error = Some(error.message());
                }
            }
        }
        self.execution.refresh_progress();
        checkpoint(&*self.services.store, &self.execution);

        if let Err(error) = run.result {
            return Err(error);
        }
        let mut context = self.root.for_step(&step.id);
        context.attempt = run.retries + 1;
        self.services.observers.emit(SagaEvent::StepCompleted {
            context,
            target: step.target().into(),
            duration_millis: duration,
            retries: run.retries,
        });
        Ok(())
    }

    /// Apply `onStepFailure` to a step whose attempts are spent
    fn failure_outcome(&self, step: &Step, error: &StepError) -> Option<Outcome> {
        let handling = &self.definition.error_handling;
        let (policy, trigger) = match handling.on_step_failure {
            StepFailurePolicy::Retry => {
                let trigger = if error.is_retriable() {
                    CompensationTrigger::RetryExhausted
                } else {
                    CompensationTrigger::StepFailure
                };
                let policy = match handling.retry_exhausted_fallback {
                    RetryFallback::Compensate => StepFailurePolicy::Compensate,
                    RetryFallback::FailFast => StepFailurePolicy::FailFast,
                    RetryFallback::Continue => StepFailurePolicy::Continue,
                };
                (policy, trigger)
            }
            policy => (policy, CompensationTrigger::StepFailure),
        };

        let reason = format!("step '{}' failed: {}", step.id, error.message());
        match policy {
            StepFailurePolicy::Continue => {
                tracing::debug!(execution_id = %self.execution.id, step = %step.id, "Continuing past failed step");
                None
            }
            StepFailurePolicy::FailFast => Some(Outcome::Failed {
                step: Some(step.id.clone()),
                reason,
                compensate: None,
            }),
            StepFailurePolicy::Compensate | StepFailurePolicy::Retry => Some(Outcome::Failed {
                step: Some(step.id.clone()),
                reason,
                compensate: Some(trigger),
            }),
        }
    }

    /// Abandon in-flight steps after a cancel or a global timeout
    fn interrupted(&mut self, interrupt: Interrupt, steps: &[&Step]) -> Outcome {
        let reason = match interrupt {
            Interrupt::Cancelled => "abandoned: execution cancelled".to_string(),
            Interrupt::TimedOut => self.timeout_reason(),
        };

        let now = StepContext::now_millis();
        for step in steps {
            if let Some(record) = self.execution.step_mut(&step.id) {
                if record.status == StepStatus::Running {
                    record.status = StepStatus::Failed;
                    record.error = Some(reason.clone());
                    record.end_time = Some(now);
                    record.duration = Some(now.saturating_sub(record.start_time.unwrap_or(now)));
                }
            }
        }
        self.execution.refresh_progress();
        checkpoint(&*self.services.store, &self.execution);

        match interrupt {
            Interrupt::Cancelled => Outcome::Cancelled,
            Interrupt::TimedOut => self.timed_out(steps.first().map(|s| s.id.clone())),
        }
    }

    fn timeout_reason(&self) -> String {
        format!(
            "global timeout of {}ms exceeded",
            self.definition.timeout.unwrap_or_default()
        )
    }

    fn timed_out(&self, step: Option<String>) -> Outcome {
        Outcome::Failed {
            step,
            reason: self.timeout_reason(),
            compensate: Some(CompensationTrigger::Timeout),
        }
    }

    async fn finish(&mut self, mut outcome: Outcome) {
        loop {
            outcome = match outcome {
                Outcome::Completed => match self.settle(SagaStatus::Completed).await {
                    Ok(()) => return self.complete(),
                    Err(next) => next,
                },
                Outcome::Failed {
                    step,
                    reason,
                    compensate,
                } => match self.settle(SagaStatus::Failed).await {
                    Ok(()) => return self.fail(step, reason, compensate).await,
                    Err(next) => next,
                },
                Outcome::Cancelled => return self.cancel().await,
            };
        }
    }

    fn complete(&mut self) {
        let now = StepContext::now_millis();
        if let Err(error) = self.execution.transition(SagaStatus::Completed, now) {
            tracing::warn!(error = %error, "Unexpected lifecycle state on completion");
        }
        self.execution.refresh_progress();
        checkpoint(&*self.services.store, &self.execution);

        self.services.observers.emit(SagaEvent::ExecutionCompleted {
            context: self.root.clone(),
            duration_millis: self.execution.duration_millis().unwrap_or_default(),
        });
        if self.definition.notifications.on_success {
            self.notify(NotificationKind::OnSuccess, "execution completed");
        }
    }

    async fn fail(&mut self, step: Option<String>, reason: String, compensate: Option<CompensationTrigger>) {
        self.execution.error = Some(reason.clone());

        if let Some(trigger) = compensate {
            let executor = CompensationExecutor {
                definition: &self.definition,
                invoker: &*self.services.invoker,
                store: &*self.services.store,
                observers: &self.services.observers,
                defaults: &self.services.defaults,
            };
            executor
                .execute(&mut self.execution, &self.root, trigger, step.as_deref())
                .await;
        }

        let now = StepContext::now_millis();
        if let Err(error) = self.execution.transition(SagaStatus::Failed, now) {
            tracing::warn!(error = %error, "Unexpected lifecycle state on failure");
        }
        self.execution.refresh_progress();
        checkpoint(&*self.services.store, &self.execution);

        self.services.observers.emit(SagaEvent::ExecutionFailed {
            context: self.root.clone(),
            reason: reason.into(),
            duration_millis: self.execution.duration_millis().unwrap_or_default(),
        });
        if self.definition.notifications.on_failure {
            self.notify(NotificationKind::OnFailure, "execution failed");
        }
    }

    async fn cancel(&mut self) {
        if self.definition.error_handling.compensate_on_cancel {
            let executor = CompensationExecutor {
                definition: &self.definition,
                invoker: &*self.services.invoker,
                store: &*self.services.store,
                observers: &self.services.observers,
                defaults: &self.services.defaults,
            };
            executor
                .execute(
                    &mut self.execution,
                    &self.root,
                    CompensationTrigger::Cancellation,
                    None,
                )
                .await;
        }

        self.execution
            .error
            .get_or_insert_with(|| "cancelled by operator".to_string());
        let now = StepContext::now_millis();
        if let Err(error) = self.execution.transition(SagaStatus::Cancelled, now) {
            tracing::warn!(error = %error, "Unexpected lifecycle state on cancel");
        }
        self.execution.refresh_progress();
        checkpoint(&*self.services.store, &self.execution);

        self.services.observers.emit(SagaEvent::ExecutionCancelled {
            context: self.root.clone(),
            duration_millis: self.execution.duration_millis().unwrap_or_default(),
        });
    }

    fn previous_group_outputs(&self, group_index: usize) -> Map<String, Value> {
        let Some(previous) = group_index
            .checked_sub(1)
            .and_then(|i| self.definition.step_groups.get(i))
        else {
            return Map::new();
        };

        previous
            .steps
            .iter()
            .filter_map(|step| {
                let record = self.execution.step(&step.id)?;
                (record.status == StepStatus::Completed)
                    .then(|| (step.id.clone(), record.output.clone().unwrap_or(Value::Null)))
            })
            .collect()
    }

    fn notify(&self, kind: NotificationKind, message: &str) {
        self.services.observers.emit(SagaEvent::Notification {
            context: self.root.clone(),
            kind,
            channels: self.definition.notifications.channels.clone(),
            message: message.into(),
        });
    }
}

/// Await `work` unless a cancel arrives or the deadline passes while RUNNING
async fn race<F: Future>(
    work: F,
    status: &mut watch::Receiver<SagaStatus>,
    deadline: Option<Instant>,
) -> Result<F::Output, Interrupt> {
    tokio::pin!(work);
    loop {
        let current = *status.borrow_and_update();
        if current == SagaStatus::Cancelled {
            return Err(Interrupt::Cancelled);
        }
        let running = current == SagaStatus::Running;

        let closed = tokio::select! {
            output = &mut work => return Ok(output),
            changed = status.changed() => changed.is_err(),
            _ = sleep_until(deadline), if running => return Err(Interrupt::TimedOut),
        };
        if closed {
            return Ok(work.await);
        }
    }
}

/// Wait out a pause between attempts of one step
async fn hold(status: &mut watch::Receiver<SagaStatus>) -> Result<(), Interrupt> {
    loop {
        let current = *status.borrow_and_update();
        match current {
            SagaStatus::Paused => {
                if status.changed().await.is_err() {
                    return Err(Interrupt::Cancelled);
                }
            }
            SagaStatus::Cancelled => return Err(Interrupt::Cancelled),
            _ => return Ok(()),
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn serialized_len(value: &Value) -> u64 {
    serde_json::to_vec(value)
        .map(|bytes| bytes.len() as u64)
        .unwrap_or_default()
}
