//! Saga orchestration engine
//!
//! `SagaEngine` is the facade the HTTP layer and embedding code talk to. It
//! starts one runner task per execution, relays operator pause, resume and
//! cancel requests through the execution's lifecycle channel, and answers
//! dashboard queries from the store and the tracker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::watch;

use crate::definition::SagaDefinition;
use crate::events::SagaEvent;
use crate::journal::{DefinitionStore, ExecutionStore, SagaStore};
use crate::observer::{Observers, TracingObserver};
use crate::query::{
    execution_stats, list_executions, parse_time_range, ExecutionFilter, ExecutionStats,
    ExecutionSummary, FlowExecution, QueryError, TargetMetrics, TargetMetricsQuery,
    TargetMetricsReport,
};
use crate::registry::DefinitionRegistry;
use crate::runner::{Runner, Services};
use crate::state::{CompensationRunStatus, CompensationTrigger, SagaExecution, SagaStatus, StepStatus};
use crate::stats::{EngineStats, EngineStatsSnapshot};
use crate::tracker::{ExecutionTracker, SeriesKey, TrackerConfig};
use crate::{EngineError, ExecutionId, RetryPolicy, ServiceInvoker, StepContext, TransitionError};

const DEFAULT_TARGET_RANGE: &str = "1h";

/// Knobs for building a [`SagaEngine`]
#[derive(Clone, Debug, Default)]
pub struct EngineOptions {
    /// Applied to steps without an enabled retry policy of their own
    pub retry_defaults: RetryPolicy,
    pub tracker: TrackerConfig,
    /// Extra observers, in addition to logging, stats and the tracker
    pub observers: Observers,
}

struct LiveExecution {
    control: Arc<watch::Sender<SagaStatus>>,
    done: watch::Receiver<bool>,
    definition_id: String,
    start_time: u64,
}

struct Inner {
    registry: DefinitionRegistry,
    services: Services,
    live: RwLock<HashMap<ExecutionId, LiveExecution>>,
    next_id: AtomicU64,
    stats: Arc<EngineStats>,
    tracker: Arc<ExecutionTracker>,
}

/// Cheap to clone; all clones share one engine
#[derive(Clone)]
pub struct SagaEngine {
    inner: Arc<Inner>,
}

impl SagaEngine {
    /// Build an engine over one backend holding both executions and definitions
    pub fn new<S: SagaStore>(
        store: Arc<S>,
        invoker: Arc<dyn ServiceInvoker>,
        options: EngineOptions,
    ) -> Result<Self, EngineError> {
        let executions: Arc<dyn ExecutionStore> = store.clone();
        let definitions: Arc<dyn DefinitionStore> = store;
        Self::with_stores(executions, definitions, invoker, options)
    }

    pub fn with_stores(
        executions: Arc<dyn ExecutionStore>,
        definitions: Arc<dyn DefinitionStore>,
        invoker: Arc<dyn ServiceInvoker>,
        options: EngineOptions,
    ) -> Result<Self, EngineError> {
        let registry = DefinitionRegistry::load(definitions)?;
        let next_id = executions
            .list_executions()?
            .iter()
            .map(|e| e.id.get())
            .max()
            .map_or(1, |max| max + 1);

        let stats = Arc::new(EngineStats::new());
        let tracker = Arc::new(ExecutionTracker::new(options.tracker));
        let mut observers = options.observers;
        observers.push(Arc::new(TracingObserver));
        observers.push(stats.clone());
        observers.push(tracker.clone());

        Ok(Self {
            inner: Arc::new(Inner {
                registry,
                services: Services {
                    invoker,
                    store: executions,
                    observers,
                    defaults: options.retry_defaults,
                },
                live: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(next_id),
                stats,
                tracker,
            }),
        })
    }

    // === Definitions ===

    pub fn save_definition(&self, definition: SagaDefinition) -> Result<Arc<SagaDefinition>, EngineError> {
        self.inner.registry.save(definition)
    }

    /// Import an exported JSON document
    pub fn import_definition(
        &self,
        document: &str,
        id: Option<&str>,
    ) -> Result<Arc<SagaDefinition>, EngineError> {
        self.inner.registry.import(document, id)
    }

    pub fn definition(&self, id: &str) -> Option<Arc<SagaDefinition>> {
        self.inner.registry.get(id)
    }

    pub fn definitions(&self) -> Vec<Arc<SagaDefinition>> {
        self.inner.registry.list()
    }

    // === Lifecycle ===

    /// Start a new execution of `definition_id`.
    ///
    /// The execution is persisted before its task is spawned, so the
    /// returned snapshot is always visible to queries. Must be called from
    /// within a Tokio runtime.
    pub fn trigger(&self, definition_id: &str, input: Value) -> Result<SagaExecution, EngineError> {
        let definition = self
            .inner
            .registry
            .get(definition_id)
            .ok_or_else(|| EngineError::DefinitionNotFound(definition_id.to_string()))?;

        let id = ExecutionId::new(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let execution = SagaExecution::new(id, &definition, input, StepContext::now_millis());
        self.inner.services.store.save_execution(&execution)?;

        tracing::info!(execution_id = %id, definition = %definition.id, "Triggering saga execution");
        self.spawn(definition, execution.clone(), SagaStatus::Running, false);
        Ok(execution)
    }

    /// Stop dispatching new steps; in-flight steps run to completion
    pub fn pause(&self, id: ExecutionId) -> Result<SagaStatus, EngineError> {
        let context = self.request(id, SagaStatus::Paused)?;
        self.inner
            .services
            .observers
            .emit(SagaEvent::ExecutionPaused { context });
        Ok(SagaStatus::Paused)
    }

    pub fn resume(&self, id: ExecutionId) -> Result<SagaStatus, EngineError> {
        let context = self.request(id, SagaStatus::Running)?;
        self.inner
            .services
            .observers
            .emit(SagaEvent::ExecutionResumed { context });
        Ok(SagaStatus::Running)
    }

    /// Cancel a running or paused execution, abandoning any in-flight call
    pub fn cancel(&self, id: ExecutionId) -> Result<SagaStatus, EngineError> {
        self.request(id, SagaStatus::Cancelled)?;
        Ok(SagaStatus::Cancelled)
    }

    /// Move a live execution's lifecycle to `next`, or report why it cannot move
    fn request(&self, id: ExecutionId, next: SagaStatus) -> Result<StepContext, EngineError> {
        let live = self
            .inner
            .live
            .read()
            .get(&id)
            .map(|l| (Arc::clone(&l.control), l.definition_id.clone(), l.start_time));

        let Some((control, definition_id, start_time)) = live else {
            let stored = self
                .inner
                .services
                .store
                .load_execution(id)?
                .ok_or(EngineError::ExecutionNotFound(id))?;
            return Err(TransitionError {
                execution_id: id,
                from: stored.status,
                to: next,
            }
            .into());
        };

        let mut rejected = None;
        control.send_if_modified(|current| {
            if current.can_transition_to(next) {
                *current = next;
                true
            } else {
                rejected = Some(*current);
                false
            }
        });
        if let Some(from) = rejected {
            return Err(TransitionError {
                execution_id: id,
                from,
                to: next,
            }
            .into());
        }

        tracing::info!(execution_id = %id, status = %next, "Lifecycle change requested");
        Ok(StepContext::root(id, &definition_id, start_time))
    }

    /// Wait for an execution's task to finish and return its final snapshot
    pub async fn wait(&self, id: ExecutionId) -> Result<SagaExecution, EngineError> {
        let done = self.inner.live.read().get(&id).map(|l| l.done.clone());
        if let Some(mut done) = done {
            // A closed channel means the task is gone, which is just as final
            let _ = done.wait_for(|finished| *finished).await;
        }
        self.execution(id)
    }

    /// Restart every non-terminal execution found in the store.
    ///
    /// PAUSED executions come back paused. Steps that were RUNNING when the
    /// process stopped are dispatched again. Must be called from within a
    /// Tokio runtime.
    pub fn recover(&self) -> Result<usize, EngineError> {
        let mut recovered = 0;

        for mut execution in self.inner.services.store.list_executions()? {
            if execution.is_terminal() || self.inner.live.read().contains_key(&execution.id) {
                continue;
            }
            let Some(definition) = self.inner.registry.get(&execution.definition_id) else {
                tracing::warn!(execution_id = %execution.id, definition = %execution.definition_id, "Definition missing, cannot recover execution");
                continue;
            };

            for step in &mut execution.steps {
                if step.status == StepStatus::Running {
                    step.status = StepStatus::Pending;
                }
            }
            execution.current_step = None;
            execution.refresh_progress();
            self.inner.services.store.save_execution(&execution)?;

            let cancelling = execution.compensation.as_ref().is_some_and(|c| {
                c.status == CompensationRunStatus::Running
                    && c.trigger == CompensationTrigger::Cancellation
            });
            let initial = if cancelling {
                SagaStatus::Cancelled
            } else {
                execution.status
            };

            tracing::info!(execution_id = %execution.id, status = %initial, "Recovering execution");
            self.spawn(definition, execution, initial, true);
            recovered += 1;
        }

        if recovered > 0 {
            tracing::info!(count = recovered, "Recovered executions");
        }
        Ok(recovered)
    }

    fn spawn(
        &self,
        definition: Arc<SagaDefinition>,
        execution: SagaExecution,
        initial: SagaStatus,
        recovered: bool,
    ) {
        let id = execution.id;
        let (control, _) = watch::channel(initial);
        let control = Arc::new(control);
        let (done_tx, done_rx) = watch::channel(false);

        self.inner.live.write().insert(
            id,
            LiveExecution {
                control: Arc::clone(&control),
                done: done_rx,
                definition_id: definition.id.clone(),
                start_time: execution.start_time,
            },
        );

        let runner = Runner::new(self.inner.services.clone(), definition, execution, control);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let finished = runner.run(recovered).await;
            inner.live.write().remove(&id);
            done_tx.send_replace(true);
            tracing::debug!(execution_id = %id, status = %finished.status, "Execution task finished");
        });
    }

    // === Queries ===

    /// Stored snapshot, with the live lifecycle status laid over it
    pub fn execution(&self, id: ExecutionId) -> Result<SagaExecution, EngineError> {
        let mut execution = self
            .inner
            .services
            .store
            .load_execution(id)?
            .ok_or(EngineError::ExecutionNotFound(id))?;
        self.overlay(&mut execution);
        Ok(execution)
    }

    pub fn executions(&self) -> Result<Vec<SagaExecution>, EngineError> {
        let mut executions = self.inner.services.store.list_executions()?;
        for execution in &mut executions {
            self.overlay(execution);
        }
        Ok(executions)
    }

    fn overlay(&self, execution: &mut SagaExecution) {
        if execution.is_terminal() {
            return;
        }
        if let Some(live) = self.inner.live.read().get(&execution.id) {
            execution.status = *live.control.borrow();
        }
    }

    pub fn list_executions(&self, filter: &ExecutionFilter) -> Result<Vec<ExecutionSummary>, EngineError> {
        let query = filter.parse()?;
        Ok(list_executions(&self.executions()?, &query))
    }

    pub fn execution_stats(&self, filter: &ExecutionFilter) -> Result<ExecutionStats, EngineError> {
        let query = filter.parse()?;
        let key = match &query.flow_id {
            Some(flow) => SeriesKey::Flow(flow.clone()),
            None => SeriesKey::All,
        };
        let series = self
            .inner
            .tracker
            .snapshot(&key, query.range, StepContext::now_millis());
        Ok(execution_stats(&self.executions()?, &query, series))
    }

    /// One execution of a flow; `reference` is an id or `latest`
    pub fn flow_execution(&self, flow_id: &str, reference: &str) -> Result<FlowExecution, EngineError> {
        let execution = if reference == "latest" {
            self.executions()?
                .into_iter()
                .filter(|e| e.definition_id == flow_id)
                .max_by(|a, b| a.start_time.cmp(&b.start_time).then(a.id.cmp(&b.id)))
                .ok_or_else(|| EngineError::NoExecutions(flow_id.to_string()))?
        } else {
            let id: ExecutionId = reference
                .parse()
                .map_err(|_| QueryError::InvalidExecutionId(reference.to_string()))?;
            let execution = self.execution(id)?;
            if execution.definition_id != flow_id {
                return Err(EngineError::ExecutionNotFound(id));
            }
            execution
        };
        Ok(FlowExecution::from(execution))
    }

    /// Per-target aggregates for one flow, or for every saved flow
    pub fn target_metrics(&self, query: &TargetMetricsQuery) -> Result<TargetMetricsReport, EngineError> {
        let time_range = query
            .time_range
            .clone()
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| DEFAULT_TARGET_RANGE.to_string());
        let range = parse_time_range(&time_range)?;
        let now = StepContext::now_millis();
        let tracker = &self.inner.tracker;

        let flow_id = query.flow_id.clone().filter(|f| !f.is_empty());
        let flows: Vec<String> = match &flow_id {
            Some(flow) => vec![flow.clone()],
            None => self.definitions().iter().map(|d| d.id.clone()).collect(),
        };

        let mut targets = Vec::new();
        for flow in &flows {
            for target in tracker.targets(flow) {
                if query
                    .target_id
                    .as_deref()
                    .is_some_and(|wanted| !wanted.is_empty() && wanted != target)
                {
                    continue;
                }
                let key = SeriesKey::Target {
                    flow: flow.clone(),
                    target: target.clone(),
                };
                targets.push(TargetMetrics {
                    flow_id: flow.clone(),
                    target_id: target,
                    metrics: tracker.snapshot(&key, range, now),
                });
            }
        }

        let overall_key = match &flow_id {
            Some(flow) => SeriesKey::Flow(flow.clone()),
            None => SeriesKey::All,
        };
        Ok(TargetMetricsReport {
            flow_id,
            time_range,
            overall: tracker.snapshot(&overall_key, range, now),
            targets,
        })
    }

    pub fn stats(&self) -> EngineStatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn tracker(&self) -> &ExecutionTracker {
        &self.inner.tracker
    }

    /// Number of executions with a live task
    pub fn active_executions(&self) -> usize {
        self.inner.live.read().len()
    }
}

impl std::fmt::Debug for SagaEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaEngine")
            .field("definitions", &self.inner.registry.list().len())
            .field("active_executions", &self.active_executions())
            .finish()
    }
}

