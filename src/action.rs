//! Step and compensation dispatch
//!
//! The step and compensation types are a fixed set, so each maps onto a
//! closed enum with a single `execute` capability. Only the variants that
//! talk to a service go through the [`ServiceInvoker`]; SPLIT, JOIN and
//! IGNORE are resolved inside the engine.

use std::time::Duration;

use serde_json::{Map, Value};

use crate::definition::{CompensationStep, CompensationType, Step, StepType};
use crate::traits::{Invocation, InvocationKind};
use crate::{CompensationError, IdempotencyKey, ServiceInvoker, StepContext, StepError};

/// Service operation a step or compensation step is bound to
#[derive(Clone, Debug, PartialEq)]
pub struct ServiceCall {
    pub service: Option<Box<str>>,
    pub operation: Box<str>,
}

/// Forward step behaviour, one variant per step type
#[derive(Clone, Debug, PartialEq)]
pub enum StepAction {
    ServiceCall(ServiceCall),
    Transformation(ServiceCall),
    Validation(ServiceCall),
    Custom(ServiceCall),
    /// Passes the execution input through unchanged
    Split,
    /// Merges the outputs of the previous group into one object
    Join,
}

/// Everything one forward attempt needs
pub struct StepDispatch<'a> {
    pub invoker: &'a dyn ServiceInvoker,
    pub context: StepContext,
    /// Execution data document (`{"input", "steps"}`)
    pub payload: Value,
    /// Outputs of the previous group's completed steps, keyed by step id
    pub previous_group: Map<String, Value>,
    pub timeout: Option<Duration>,
}

impl StepAction {
    pub fn from_step(step: &Step) -> Self {
        let call = || ServiceCall {
            service: step.service_name.as_deref().map(Into::into),
            operation: step.operation.as_deref().unwrap_or_default().into(),
        };
        match step.step_type {
            StepType::ServiceCall => Self::ServiceCall(call()),
            StepType::Transformation => Self::Transformation(call()),
            StepType::Validation => Self::Validation(call()),
            StepType::Custom => Self::Custom(call()),
            StepType::Split => Self::Split,
            StepType::Join => Self::Join,
        }
    }

    pub fn step_type(&self) -> StepType {
        match self {
            Self::ServiceCall(_) => StepType::ServiceCall,
            Self::Transformation(_) => StepType::Transformation,
            Self::Validation(_) => StepType::Validation,
            Self::Custom(_) => StepType::Custom,
            Self::Split => StepType::Split,
            Self::Join => StepType::Join,
        }
    }

    pub async fn execute(&self, dispatch: StepDispatch<'_>) -> Result<Value, StepError> {
        let call = match self {
            Self::ServiceCall(call)
            | Self::Transformation(call)
            | Self::Validation(call)
            | Self::Custom(call) => call,
            Self::Split => return Ok(dispatch.payload.get("input").cloned().unwrap_or(Value::Null)),
            Self::Join => return Ok(Value::Object(dispatch.previous_group)),
        };

        let invocation = Invocation {
            idempotency_key: IdempotencyKey::for_step(
                dispatch.context.execution_id,
                &dispatch.context.step_id,
                dispatch.context.attempt,
            ),
            context: dispatch.context,
            kind: InvocationKind::Forward(self.step_type()),
            service: call.service.clone(),
            operation: call.operation.clone(),
            payload: dispatch.payload,
            timeout: dispatch.timeout,
        };

        match dispatch.timeout {
            Some(limit) => tokio::time::timeout(limit, dispatch.invoker.execute(invocation))
                .await
                .unwrap_or_else(|_| {
                    Err(StepError::Timeout {
                        timeout_millis: limit.as_millis() as u64,
                    })
                }),
            None => dispatch.invoker.execute(invocation).await,
        }
    }
}

/// Compensation behaviour, one variant per compensation type
#[derive(Clone, Debug, PartialEq)]
pub enum CompensationAction {
    Undo(ServiceCall),
    Compensate(ServiceCall),
    /// Nothing to undo; completes without a call
    Ignore,
    Custom(ServiceCall),
}

/// Everything one compensation attempt needs
pub struct CompensationDispatch<'a> {
    pub invoker: &'a dyn ServiceInvoker,
    pub context: StepContext,
    pub payload: Value,
    pub timeout: Option<Duration>,
}

impl CompensationAction {
    /// Bind a compensation step to the forward step it undoes
    pub fn new(compensation: &CompensationStep, forward: &Step) -> Self {
        let service = forward.service_name.as_deref().map(Into::into);
        let undo_operation = || ServiceCall {
            service: service.clone(),
            operation: forward
                .compensation_operation
                .as_deref()
                .unwrap_or_default()
                .into(),
        };
        match compensation.compensation_type {
            CompensationType::Undo => Self::Undo(undo_operation()),
            CompensationType::Compensate => Self::Compensate(undo_operation()),
            CompensationType::Ignore => Self::Ignore,
            CompensationType::Custom => Self::Custom(ServiceCall {
                service: service.clone(),
                operation: compensation
                    .custom_logic
                    .as_deref()
                    .unwrap_or_default()
                    .into(),
            }),
        }
    }

    pub fn compensation_type(&self) -> CompensationType {
        match self {
            Self::Undo(_) => CompensationType::Undo,
            Self::Compensate(_) => CompensationType::Compensate,
            Self::Ignore => CompensationType::Ignore,
            Self::Custom(_) => CompensationType::Custom,
        }
    }

    pub async fn execute(&self, dispatch: CompensationDispatch<'_>) -> Result<(), CompensationError> {
        let call = match self {
            Self::Undo(call) | Self::Compensate(call) | Self::Custom(call) => call,
            Self::Ignore => return Ok(()),
        };

        let invocation = Invocation {
            idempotency_key: IdempotencyKey::for_compensation(
                dispatch.context.execution_id,
                &dispatch.context.step_id,
            ),
            context: dispatch.context,
            kind: InvocationKind::Compensation(self.compensation_type()),
            service: call.service.clone(),
            operation: call.operation.clone(),
            payload: dispatch.payload,
            timeout: dispatch.timeout,
        };

        match dispatch.timeout {
            Some(limit) => tokio::time::timeout(limit, dispatch.invoker.compensate(invocation))
                .await
                .unwrap_or_else(|_| {
                    Err(CompensationError::Timeout {
                        timeout_millis: limit.as_millis() as u64,
                    })
                }),
            None => dispatch.invoker.compensate(invocation).await,
        }
    }
}
