//! Saga definition document
//!
//! The persisted, exported and imported shape of a saga. Everything here is
//! plain data; behaviour lives in the resolver, the runner and the
//! compensation executor. Field names serialize in camelCase and enum
//! values in SCREAMING_SNAKE_CASE so the document round-trips unchanged
//! between the designer UI and the engine.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};

use crate::traits::RetryPolicy;

/// Static configuration of a saga
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub transaction_boundary: TransactionBoundary,
    #[serde(default)]
    pub isolation_level: IsolationLevel,
    /// Global wall-clock budget in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub step_groups: Vec<StepGroup>,
    #[serde(default)]
    pub compensation_steps: Vec<CompensationStep>,
    #[serde(default)]
    pub compensation_strategy: CompensationStrategy,
    #[serde(default)]
    pub error_handling: ErrorHandling,
    /// Base retry interval (ms) for policies that leave it unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_retry_interval: Option<u64>,
    #[serde(default)]
    pub notifications: NotificationConfig,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionBoundary {
    #[default]
    Flow,
    Group,
    Step,
}

/// Advisory only; the engine records it but does not enforce it
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompensationStrategy {
    #[default]
    Backward,
    Forward,
    DependencyBased,
    Custom,
}

impl CompensationStrategy {
    /// Whether `dependsOn` constrains the compensation run
    pub fn honors_dependencies(&self) -> bool {
        matches!(self, Self::DependencyBased | Self::Custom)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepFailurePolicy {
    #[default]
    Compensate,
    Retry,
    Continue,
    FailFast,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompensationFailurePolicy {
    Continue,
    #[default]
    Halt,
    Alert,
}

/// What a RETRY policy escalates to once the retry budget is spent
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetryFallback {
    #[default]
    Compensate,
    FailFast,
    Continue,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorHandling {
    #[serde(default)]
    pub on_step_failure: StepFailurePolicy,
    #[serde(default)]
    pub on_compensation_failure: CompensationFailurePolicy,
    #[serde(default)]
    pub retry_exhausted_fallback: RetryFallback,
    /// Run the compensation flow when an operator cancels an execution
    #[serde(default)]
    pub compensate_on_cancel: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationConfig {
    #[serde(default = "enabled")]
    pub on_start: bool,
    #[serde(default = "enabled")]
    pub on_success: bool,
    #[serde(default = "enabled")]
    pub on_failure: bool,
    #[serde(default)]
    pub channels: Vec<String>,
}

fn enabled() -> bool {
    true
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            on_start: true,
            on_success: true,
            on_failure: true,
            channels: Vec::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    #[default]
    Sequential,
    Parallel,
}

/// Steps sharing an execution mode; groups run in definition order
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepGroup {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepType {
    #[default]
    ServiceCall,
    Transformation,
    Validation,
    Split,
    Join,
    Custom,
}

/// One forward unit of work
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub step_type: StepType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    /// Absent for steps that need no compensation (read-only steps)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation_operation: Option<String>,
    /// Per-attempt timeout in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub retry_policy: RetryPolicyConfig,
    /// Guard expression; the step is skipped when it evaluates false
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl Step {
    /// Metrics target for this step: its service, or the step id when unbound
    pub fn target(&self) -> &str {
        self.service_name.as_deref().unwrap_or(&self.id)
    }
}

/// Retry settings as they appear in the document
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicyConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    /// Milliseconds before the first retry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_interval: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_multiplier: Option<f64>,
}

impl RetryPolicyConfig {
    /// Resolve unset fields against engine defaults and the definition's base interval
    pub fn resolve(&self, defaults: &RetryPolicy, base_interval: Option<u64>) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.unwrap_or(defaults.max_attempts).max(1),
            initial_delay_millis: self
                .initial_interval
                .or(base_interval)
                .unwrap_or(defaults.initial_delay_millis),
            max_delay_millis: defaults.max_delay_millis,
            backoff_multiplier: self
                .backoff_multiplier
                .unwrap_or(defaults.backoff_multiplier),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompensationType {
    #[default]
    Undo,
    Compensate,
    Ignore,
    Custom,
}

/// One compensation action, tied to at most one forward step
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompensationStep {
    pub id: String,
    pub step_id: String,
    #[serde(default)]
    pub compensation_type: CompensationType,
    /// Compensation step ids that must finish first
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default = "enabled")]
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicyConfig>,
    /// Operation invoked for CUSTOM compensation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_logic: Option<String>,
}

impl SagaDefinition {
    /// Parse an imported document
    pub fn from_json(document: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(document)
    }

    /// Serialize for export
    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Forward steps flattened in definition order, with their forward index
    pub fn forward_steps(&self) -> impl Iterator<Item = (usize, &Step)> {
        self.step_groups
            .iter()
            .flat_map(|group| group.steps.iter())
            .enumerate()
    }

    pub fn step_count(&self) -> usize {
        self.step_groups.iter().map(|g| g.steps.len()).sum()
    }

    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.forward_steps()
            .map(|(_, step)| step)
            .find(|step| step.id == step_id)
    }

    /// Position of a forward step in definition order
    pub fn forward_index(&self, step_id: &str) -> Option<usize> {
        self.forward_steps()
            .find(|(_, step)| step.id == step_id)
            .map(|(index, _)| index)
    }

    /// Compensation steps in effect.
    ///
    /// When the document lists none, one UNDO step is derived for every
    /// forward step that declares a `compensationOperation`.
    pub fn effective_compensation_steps(&self) -> Cow<'_, [CompensationStep]> {
        if !self.compensation_steps.is_empty() {
            return Cow::Borrowed(&self.compensation_steps);
        }

        Cow::Owned(
            self.forward_steps()
                .filter(|(_, step)| step.compensation_operation.is_some())
                .map(|(_, step)| CompensationStep {
                    id: format!("{}:compensate", step.id),
                    step_id: step.id.clone(),
                    compensation_type: CompensationType::Undo,
                    depends_on: Vec::new(),
                    retryable: true,
                    timeout: step.timeout,
                    retry_policy: None,
                    custom_logic: None,
                })
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOCUMENT: &str = r#"{
        "id": "order-flow",
        "name": "Order Flow",
        "description": "reserve, charge, ship",
        "transactionBoundary": "GROUP",
        "isolationLevel": "SERIALIZABLE",
        "timeout": 60000,
        "stepGroups": [
            {
                "id": "g1",
                "name": "Reserve",
                "executionMode": "PARALLEL",
                "steps": [
                    {
                        "id": "reserve",
                        "name": "Reserve stock",
                        "type": "SERVICE_CALL",
                        "serviceName": "inventory",
                        "operation": "reserve",
                        "compensationOperation": "release",
                        "timeout": 5000,
                        "retryPolicy": { "enabled": true, "maxAttempts": 5, "initialInterval": 100, "backoffMultiplier": 1.5 }
                    },
                    {
                        "id": "lookup",
                        "type": "VALIDATION",
                        "serviceName": "customers",
                        "operation": "lookup",
                        "condition": "$.input.customer != null"
                    }
                ]
            }
        ],
        "compensationSteps": [
            { "id": "c-reserve", "stepId": "reserve", "compensationType": "UNDO", "dependsOn": [], "retryable": true }
        ],
        "compensationStrategy": "DEPENDENCY_BASED",
        "errorHandling": { "onStepFailure": "RETRY", "onCompensationFailure": "ALERT" },
        "notifications": { "onStart": true, "onSuccess": false, "onFailure": true, "channels": ["ops"] }
    }"#;

    #[test]
    fn test_document_round_trips() {
        let definition = SagaDefinition::from_json(DOCUMENT).unwrap();
        assert_eq!(definition.transaction_boundary, TransactionBoundary::Group);
        assert_eq!(definition.isolation_level, IsolationLevel::Serializable);
        assert_eq!(definition.step_groups[0].execution_mode, ExecutionMode::Parallel);
        assert_eq!(definition.step_groups[0].steps[1].step_type, StepType::Validation);
        assert_eq!(
            definition.error_handling.retry_exhausted_fallback,
            RetryFallback::Compensate
        );
        assert!(!definition.notifications.on_success);

        let exported = definition.to_json_pretty().unwrap();
        let reimported = SagaDefinition::from_json(&exported).unwrap();
        assert_eq!(definition, reimported);
    }

    #[test]
    fn test_unknown_enum_value_is_rejected() {
        let bad = DOCUMENT.replace("DEPENDENCY_BASED", "SIDEWAYS");
        assert!(SagaDefinition::from_json(&bad).is_err());
    }

    #[test]
    fn test_derives_undo_steps_when_none_listed() {
        let mut definition = SagaDefinition::from_json(DOCUMENT).unwrap();
        definition.compensation_steps.clear();

        let derived = definition.effective_compensation_steps();
        assert_eq!(derived.len(), 1);
        assert_eq!(derived[0].id, "reserve:compensate");
        assert_eq!(derived[0].step_id, "reserve");
        assert_eq!(derived[0].compensation_type, CompensationType::Undo);
    }

    #[test]
    fn test_retry_config_falls_back_to_definition_interval() {
        let config = RetryPolicyConfig {
            enabled: true,
            ..Default::default()
        };
        let policy = config.resolve(&RetryPolicy::default(), Some(250));
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_delay_millis, 250);
    }
}
