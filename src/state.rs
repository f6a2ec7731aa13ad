//! Runtime state of saga executions
//!
//! A `SagaExecution` is owned by the one task driving it. Every status
//! change goes through [`SagaExecution::transition`], which enforces the
//! lifecycle:
//!
//! ```text
//! RUNNING -> COMPLETED | FAILED | CANCELLED | PAUSED
//! PAUSED  -> RUNNING | CANCELLED
//! ```
//!
//! COMPLETED, FAILED and CANCELLED are terminal.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::definition::{CompensationType, SagaDefinition, StepType};
use crate::{ExecutionId, TransitionError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaStatus {
    Running,
    Completed,
    Failed,
    Paused,
    Cancelled,
}

impl SagaStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn can_transition_to(&self, next: SagaStatus) -> bool {
        use SagaStatus::*;
        matches!(
            (self, next),
            (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Paused)
                | (Paused, Running)
                | (Paused, Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Paused => "PAUSED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "RUNNING" => Some(Self::Running),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "PAUSED" => Some(Self::Paused),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepMetrics {
    /// Milliseconds spent inside service calls, all attempts
    pub execution_time: u64,
    /// Milliseconds between scheduling and first dispatch
    pub queue_time: u64,
    pub retries: u32,
    /// Serialized request size in bytes
    pub input_size: u64,
    /// Serialized response size in bytes
    pub output_size: u64,
    /// Reported by services that measure it; the engine never fills it in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_peak: Option<u64>,
}

/// Runtime record of one forward step within one execution
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepExecution {
    pub step_id: String,
    pub name: String,
    pub group_id: String,
    pub step_type: StepType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    pub status: StepStatus,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default)]
    pub metrics: StepMetrics,
}

impl StepExecution {
    /// Target the tracker aggregates this step under
    pub fn target(&self) -> &str {
        self.service_name.as_deref().unwrap_or(&self.step_id)
    }
}

/// What started a compensation run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompensationTrigger {
    StepFailure,
    RetryExhausted,
    Timeout,
    Cancellation,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompensationRunStatus {
    Running,
    /// Every required compensation step completed
    Completed,
    /// Finished under CONTINUE with at least one failed step
    Partial,
    /// Stopped by HALT or ALERT
    Halted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompensationStepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    /// The run stopped before reaching this step
    NotAttempted,
    /// Its forward step never completed, so there is nothing to undo
    NotRequired,
}

impl CompensationStepStatus {
    /// Finished for the purpose of `dependsOn` ordering
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::NotRequired)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompensationStepExecution {
    pub id: String,
    pub step_id: String,
    pub compensation_type: CompensationType,
    pub status: CompensationStepStatus,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompensationRecord {
    pub trigger: CompensationTrigger,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,
    pub status: CompensationRunStatus,
    pub start_time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<u64>,
    /// One entry per compensation step, in resolved order
    pub steps: Vec<CompensationStepExecution>,
}

impl CompensationRecord {
    pub fn count(&self, status: CompensationStepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }

    /// True unless every required compensation step completed
    pub fn is_partial(&self) -> bool {
        self.steps.iter().any(|s| {
            !matches!(
                s.status,
                CompensationStepStatus::Completed | CompensationStepStatus::NotRequired
            )
        })
    }
}

/// One runtime instance of a saga definition
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaExecution {
    pub id: ExecutionId,
    pub definition_id: String,
    pub definition_name: String,
    pub status: SagaStatus,
    pub start_time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<u64>,
    /// Percentage of forward steps in a terminal state
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    #[serde(default)]
    pub input: Value,
    pub steps: Vec<StepExecution>,
    /// Why the execution failed or was cancelled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation: Option<CompensationRecord>,
    #[serde(default)]
    pub partial_compensation: bool,
}

impl SagaExecution {
    /// Fresh RUNNING execution with one PENDING record per forward step
    pub fn new(id: ExecutionId, definition: &SagaDefinition, input: Value, now_millis: u64) -> Self {
        let steps = definition
            .step_groups
            .iter()
            .flat_map(|group| {
                group.steps.iter().map(move |step| StepExecution {
                    step_id: step.id.clone(),
                    name: step.name.clone(),
                    group_id: group.id.clone(),
                    step_type: step.step_type,
                    service_name: step.service_name.clone(),
                    status: StepStatus::Pending,
                    retry_count: 0,
                    start_time: None,
                    end_time: None,
                    duration: None,
                    error: None,
                    input: None,
                    output: None,
                    metrics: StepMetrics::default(),
                })
            })
            .collect();

        Self {
            id,
            definition_id: definition.id.clone(),
            definition_name: definition.name.clone(),
            status: SagaStatus::Running,
            start_time: now_millis,
            end_time: None,
            progress: 0,
            current_step: None,
            input,
            steps,
            error: None,
            compensation: None,
            partial_compensation: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move along a lifecycle edge, rejecting anything else
    pub fn transition(&mut self, next: SagaStatus, now_millis: u64) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                execution_id: self.id,
                from: self.status,
                to: next,
            });
        }

        self.status = next;
        if next.is_terminal() {
            self.end_time = Some(now_millis);
            self.current_step = None;
        }
        Ok(())
    }

    pub fn step(&self, step_id: &str) -> Option<&StepExecution> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut StepExecution> {
        self.steps.iter_mut().find(|s| s.step_id == step_id)
    }

    pub fn count_steps(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }

    pub fn completed_steps(&self) -> usize {
        self.count_steps(StepStatus::Completed)
    }

    pub fn failed_steps(&self) -> usize {
        self.count_steps(StepStatus::Failed)
    }

    pub fn skipped_steps(&self) -> usize {
        self.count_steps(StepStatus::Skipped)
    }

    pub fn duration_millis(&self) -> Option<u64> {
        self.end_time.map(|end| end.saturating_sub(self.start_time))
    }

    pub fn refresh_progress(&mut self) {
        if self.steps.is_empty() {
            self.progress = 100;
            return;
        }
        let done = self.steps.iter().filter(|s| s.status.is_terminal()).count();
        self.progress = ((done * 100) / self.steps.len()) as u8;
    }

    /// Document handed to steps and guard conditions:
    /// `{"input": <payload>, "steps": {<id>: <output>}}`
    pub fn data_document(&self) -> Value {
        let outputs: Map<String, Value> = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .map(|s| (s.step_id.clone(), s.output.clone().unwrap_or(Value::Null)))
            .collect();

        serde_json::json!({
            "input": self.input,
            "steps": outputs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{ExecutionMode, RetryPolicyConfig, Step, StepGroup};

    fn definition() -> SagaDefinition {
        let step = |id: &str| Step {
            id: id.to_string(),
            name: id.to_uppercase(),
            step_type: StepType::ServiceCall,
            service_name: Some("svc".to_string()),
            operation: Some(id.to_string()),
            compensation_operation: None,
            timeout: None,
            retry_policy: RetryPolicyConfig::default(),
            condition: None,
        };
        SagaDefinition {
            id: "flow".to_string(),
            name: "Flow".to_string(),
            description: String::new(),
            transaction_boundary: Default::default(),
            isolation_level: Default::default(),
            timeout: None,
            step_groups: vec![StepGroup {
                id: "g".to_string(),
                name: String::new(),
                execution_mode: ExecutionMode::Sequential,
                steps: vec![step("a"), step("b")],
            }],
            compensation_steps: Vec::new(),
            compensation_strategy: Default::default(),
            error_handling: Default::default(),
            default_retry_interval: None,
            notifications: Default::default(),
        }
    }

    #[test]
    fn test_new_execution_is_running_with_pending_steps() {
        let execution = SagaExecution::new(ExecutionId::new(1), &definition(), Value::Null, 10);
        assert_eq!(execution.status, SagaStatus::Running);
        assert_eq!(execution.steps.len(), 2);
        assert!(execution.steps.iter().all(|s| s.status == StepStatus::Pending));
    }

    #[test]
    fn test_resume_of_terminal_execution_is_rejected() {
        for terminal in [SagaStatus::Completed, SagaStatus::Failed, SagaStatus::Cancelled] {
            let mut execution =
                SagaExecution::new(ExecutionId::new(1), &definition(), Value::Null, 10);
            execution.transition(terminal, 20).unwrap();
            let before = execution.clone();

            let err = execution.transition(SagaStatus::Running, 30).unwrap_err();
            assert_eq!(err.from, terminal);
            assert_eq!(execution, before);
        }
    }

    #[test]
    fn test_pause_and_resume_round_trip() {
        let mut execution = SagaExecution::new(ExecutionId::new(1), &definition(), Value::Null, 10);
        execution.transition(SagaStatus::Paused, 11).unwrap();
        assert!(execution.transition(SagaStatus::Completed, 12).is_err());
        execution.transition(SagaStatus::Running, 13).unwrap();
        execution.transition(SagaStatus::Completed, 14).unwrap();
        assert_eq!(execution.end_time, Some(14));
        assert_eq!(execution.duration_millis(), Some(4));
    }

    #[test]
    fn test_data_document_only_carries_completed_outputs() {
        let mut execution = SagaExecution::new(
            ExecutionId::new(1),
            &definition(),
            serde_json::json!({"amount": 5}),
            10,
        );
        let a = execution.step_mut("a").unwrap();
        a.status = StepStatus::Completed;
        a.output = Some(serde_json::json!({"ok": true}));
        execution.step_mut("b").unwrap().output = Some(serde_json::json!("ignored"));
        execution.refresh_progress();

        let doc = execution.data_document();
        assert_eq!(doc["input"]["amount"], 5);
        assert_eq!(doc["steps"]["a"]["ok"], true);
        assert!(doc["steps"].get("b").is_none());
        assert_eq!(execution.progress, 50);
    }
}
