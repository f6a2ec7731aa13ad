//! Orchestration-Based SAGA Engine
//!
//! Runs saga definitions (groups of service calls, each optionally paired
//! with a compensation) as independent async executions. A failed step is
//! handled per the definition's `errorHandling` policy; when compensation is
//! required, completed steps are undone in an order resolved from the
//! definition's strategy and `dependsOn` graph.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! // 1. Implement the transport to your services
//! struct Services;
//!
//! #[async_trait]
//! impl ServiceInvoker for Services { /* execute + compensate */ }
//!
//! // 2. Build an engine over a store
//! let engine = SagaEngine::new(Arc::new(InMemoryStore::new()), Arc::new(Services), Default::default())?;
//!
//! // 3. Save a definition (the exported JSON document) and trigger it
//! engine.import_definition(&document, None)?;
//! let execution = engine.trigger("order-fulfilment", json!({"orderId": 42}))?;
//!
//! // 4. Operate and observe it
//! engine.pause(execution.id)?;
//! engine.resume(execution.id)?;
//! let finished = engine.wait(execution.id).await?;
//! ```

// === Core Types ===
mod context;
mod definition;
mod errors;
mod events;
mod idempotency;
mod state;

// === Definition Handling ===
mod condition;
mod registry;
mod resolver;
mod validation;

// === Execution ===
mod action;
mod compensation;
mod engine;
mod runner;
mod traits;

// === Storage ===
mod journal;
#[cfg(feature = "lmdb")]
mod lmdb;

// === Observability ===
mod observer;
mod query;
mod stats;
mod tracker;

// === Service Surfaces ===
pub mod api;
pub mod config;
pub mod http_invoker;

// === Re-exports ===

// Types
pub use context::{ExecutionId, StepContext};
pub use idempotency::IdempotencyKey;

// Definitions
pub use definition::{
    CompensationFailurePolicy, CompensationStep, CompensationStrategy, CompensationType,
    ErrorHandling, ExecutionMode, IsolationLevel, NotificationConfig, RetryFallback,
    RetryPolicyConfig, SagaDefinition, Step, StepFailurePolicy, StepGroup, StepType,
    TransactionBoundary,
};
pub use condition::{Condition, ConditionError};
pub use registry::DefinitionRegistry;
pub use resolver::{resolve_order, ResolveError};
pub use validation::{validate_definition, DefinitionValidationError, ValidationIssue};

// State
pub use state::{
    CompensationRecord, CompensationRunStatus, CompensationStepExecution, CompensationStepStatus,
    CompensationTrigger, SagaExecution, SagaStatus, StepExecution, StepMetrics, StepStatus,
};

// Events
pub use events::{NotificationKind, SagaEvent};

// Errors
pub use errors::{CompensationError, EngineError, StepError, TransitionError};

// Engine
pub use engine::{EngineOptions, SagaEngine};
pub use traits::{Invocation, InvocationKind, RetryPolicy, ServiceInvoker};

// Storage
pub use journal::{DefinitionStore, ExecutionStore, InMemoryStore, SagaStore, StoreError};
#[cfg(feature = "lmdb")]
pub use lmdb::LmdbStore;

// Observability
pub use observer::{NoOpObserver, Observers, SagaObserver, TracingObserver};
pub use query::{
    ExecutionFilter, ExecutionStats, ExecutionSummary, FlowExecution, FlowMetrics, QueryError,
    TargetMetrics, TargetMetricsQuery, TargetMetricsReport,
};
pub use stats::{EngineStats, EngineStatsSnapshot};
pub use tracker::{ExecutionTracker, Observation, SeriesKey, SeriesSnapshot, TrackerConfig, TrendPoint};
