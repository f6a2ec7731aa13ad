//! Save-time validation of saga definitions
//!
//! A definition that passes here never produces a definition-level error at
//! execution time: ids are unique, compensation targets exist and declare a
//! compensation operation, the `dependsOn` graph is acyclic and every guard
//! expression parses.

use std::collections::HashSet;

use crate::condition::{Condition, ConditionError};
use crate::definition::{CompensationType, RetryPolicyConfig, SagaDefinition, StepType};
use crate::resolver::{CompensationGraph, ResolveError};

/// One problem found in a definition
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationIssue {
    #[error("document could not be parsed: {0}")]
    InvalidDocument(String),
    #[error("definition id is required")]
    MissingId,
    #[error("definition name is required")]
    MissingName,
    #[error("definition has no steps")]
    NoSteps,
    #[error("duplicate step group id: '{0}'")]
    DuplicateGroupId(String),
    #[error("duplicate step id: '{0}'")]
    DuplicateStepId(String),
    #[error("step '{0}' has no operation")]
    MissingOperation(String),
    #[error("duplicate compensation step id: '{0}'")]
    DuplicateCompensationId(String),
    #[error("compensation step '{compensation}' targets unknown step '{step}'")]
    UnknownCompensationTarget { compensation: String, step: String },
    #[error("compensation step '{compensation}' targets step '{step}' which declares no compensationOperation")]
    NotCompensable { compensation: String, step: String },
    #[error("step '{step}' is compensated by more than one compensation step")]
    DuplicateCompensationTarget { step: String },
    #[error("compensation step '{compensation}' depends on unknown step '{dependency}'")]
    UnknownDependency {
        compensation: String,
        dependency: String,
    },
    #[error("dependency cycle detected: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),
    #[error("CUSTOM compensation step '{0}' has no customLogic")]
    MissingCustomLogic(String),
    #[error("invalid retry policy on '{element}': {reason}")]
    InvalidRetryPolicy { element: String, reason: String },
    #[error("timeout on '{0}' must be greater than zero")]
    InvalidTimeout(String),
    #[error("invalid condition on step '{step}': {error}")]
    InvalidCondition { step: String, error: ConditionError },
}

/// Raised when a definition is saved or imported with problems
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("definition '{definition_id}' is invalid: {}", format_issues(.issues))]
pub struct DefinitionValidationError {
    pub definition_id: String,
    pub issues: Vec<ValidationIssue>,
}

fn format_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl DefinitionValidationError {
    /// Wrap a document that failed to deserialize (bad JSON, unknown enum value)
    pub fn invalid_document(definition_id: &str, error: &serde_json::Error) -> Self {
        Self {
            definition_id: definition_id.to_string(),
            issues: vec![ValidationIssue::InvalidDocument(error.to_string())],
        }
    }

    pub fn has_cycle(&self) -> bool {
        self.issues
            .iter()
            .any(|i| matches!(i, ValidationIssue::DependencyCycle(_)))
    }
}

/// Validate a definition, collecting every issue found
pub fn validate_definition(definition: &SagaDefinition) -> Result<(), DefinitionValidationError> {
    let mut issues = Vec::new();

    if definition.id.trim().is_empty() {
        issues.push(ValidationIssue::MissingId);
    }
    if definition.name.trim().is_empty() {
        issues.push(ValidationIssue::MissingName);
    }
    if definition.step_count() == 0 {
        issues.push(ValidationIssue::NoSteps);
    }
    if definition.timeout == Some(0) {
        issues.push(ValidationIssue::InvalidTimeout(definition.id.clone()));
    }

    validate_steps(definition, &mut issues);
    validate_compensation(definition, &mut issues);

    if issues.is_empty() {
        Ok(())
    } else {
        Err(DefinitionValidationError {
            definition_id: definition.id.clone(),
            issues,
        })
    }
}

fn validate_steps(definition: &SagaDefinition, issues: &mut Vec<ValidationIssue>) {
    let mut group_ids = HashSet::new();
    for group in &definition.step_groups {
        if !group_ids.insert(group.id.as_str()) {
            issues.push(ValidationIssue::DuplicateGroupId(group.id.clone()));
        }
    }

    let mut step_ids = HashSet::new();
    for (_, step) in definition.forward_steps() {
        if !step_ids.insert(step.id.as_str()) {
            issues.push(ValidationIssue::DuplicateStepId(step.id.clone()));
        }

        let needs_operation = !matches!(step.step_type, StepType::Split | StepType::Join);
        if needs_operation && step.operation.as_deref().map_or(true, |op| op.trim().is_empty()) {
            issues.push(ValidationIssue::MissingOperation(step.id.clone()));
        }
        if step.timeout == Some(0) {
            issues.push(ValidationIssue::InvalidTimeout(step.id.clone()));
        }
        check_retry_policy(&step.id, &step.retry_policy, issues);

        if let Some(expression) = &step.condition {
            if let Err(error) = Condition::parse(expression) {
                issues.push(ValidationIssue::InvalidCondition {
                    step: step.id.clone(),
                    error,
                });
            }
        }
    }
}

fn check_retry_policy(element: &str, policy: &RetryPolicyConfig, issues: &mut Vec<ValidationIssue>) {
    if policy.max_attempts == Some(0) {
        issues.push(ValidationIssue::InvalidRetryPolicy {
            element: element.to_string(),
            reason: "maxAttempts must be at least 1".to_string(),
        });
    }
    if let Some(multiplier) = policy.backoff_multiplier {
        if !multiplier.is_finite() || multiplier < 1.0 {
            issues.push(ValidationIssue::InvalidRetryPolicy {
                element: element.to_string(),
                reason: format!("backoffMultiplier must be >= 1.0, got {multiplier}"),
            });
        }
    }
}

fn validate_compensation(definition: &SagaDefinition, issues: &mut Vec<ValidationIssue>) {
    let compensation_steps = definition.effective_compensation_steps();

    let mut ids = HashSet::new();
    let mut targets = HashSet::new();
    for compensation in compensation_steps.iter() {
        if !ids.insert(compensation.id.as_str()) {
            issues.push(ValidationIssue::DuplicateCompensationId(compensation.id.clone()));
        }

        match definition.step(&compensation.step_id) {
            None => issues.push(ValidationIssue::UnknownCompensationTarget {
                compensation: compensation.id.clone(),
                step: compensation.step_id.clone(),
            }),
            Some(step) if step.compensation_operation.is_none() => {
                issues.push(ValidationIssue::NotCompensable {
                    compensation: compensation.id.clone(),
                    step: step.id.clone(),
                })
            }
            Some(_) => {}
        }

        if !targets.insert(compensation.step_id.as_str()) {
            issues.push(ValidationIssue::DuplicateCompensationTarget {
                step: compensation.step_id.clone(),
            });
        }

        if compensation.compensation_type == CompensationType::Custom
            && compensation
                .custom_logic
                .as_deref()
                .map_or(true, |logic| logic.trim().is_empty())
        {
            issues.push(ValidationIssue::MissingCustomLogic(compensation.id.clone()));
        }
        if compensation.timeout == Some(0) {
            issues.push(ValidationIssue::InvalidTimeout(compensation.id.clone()));
        }
        if let Some(policy) = &compensation.retry_policy {
            check_retry_policy(&compensation.id, policy, issues);
        }
    }

    match CompensationGraph::build(definition, &compensation_steps) {
        Ok(graph) => {
            if let Some(cycle) = graph.find_cycle() {
                issues.push(ValidationIssue::DependencyCycle(cycle));
            }
        }
        Err(ResolveError::UnknownDependency {
            compensation,
            dependency,
        }) => issues.push(ValidationIssue::UnknownDependency {
            compensation,
            dependency,
        }),
        Err(ResolveError::CyclicDependency(cycle)) => {
            issues.push(ValidationIssue::DependencyCycle(cycle))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn definition(value: serde_json::Value) -> SagaDefinition {
        serde_json::from_value(value).unwrap()
    }

    fn valid() -> serde_json::Value {
        json!({
            "id": "payments",
            "name": "Payments",
            "stepGroups": [{
                "id": "g1",
                "steps": [
                    {"id": "debit", "operation": "debit", "compensationOperation": "credit"},
                    {"id": "notify", "operation": "notify", "condition": "$.input.notify == true"}
                ]
            }],
            "compensationSteps": [
                {"id": "undo-debit", "stepId": "debit"}
            ]
        })
    }

    #[test]
    fn test_accepts_valid_definition() {
        assert!(validate_definition(&definition(valid())).is_ok());
    }

    #[test]
    fn test_requires_name_and_steps() {
        let err = validate_definition(&definition(json!({"id": "x", "name": " "}))).unwrap_err();
        assert!(err.issues.contains(&ValidationIssue::MissingName));
        assert!(err.issues.contains(&ValidationIssue::NoSteps));
    }

    #[test]
    fn test_rejects_cycles_deterministically() {
        let mut doc = valid();
        doc["stepGroups"][0]["steps"][1]["compensationOperation"] = json!("unnotify");
        doc["compensationSteps"] = json!([
            {"id": "a", "stepId": "debit", "dependsOn": ["b"]},
            {"id": "b", "stepId": "notify", "dependsOn": ["a"]}
        ]);
        let def = definition(doc);

        let first = validate_definition(&def).unwrap_err();
        let second = validate_definition(&def).unwrap_err();
        assert!(first.has_cycle());
        assert_eq!(first, second);
        assert!(first.to_string().contains("a -> b -> a"));
    }

    #[test]
    fn test_rejects_compensation_of_step_without_operation() {
        let mut doc = valid();
        doc["compensationSteps"] = json!([{"id": "c", "stepId": "notify"}]);
        let err = validate_definition(&definition(doc)).unwrap_err();
        assert_eq!(
            err.issues,
            vec![ValidationIssue::NotCompensable {
                compensation: "c".to_string(),
                step: "notify".to_string()
            }]
        );
    }

    #[test]
    fn test_reports_bad_references_and_policies() {
        let mut doc = valid();
        doc["stepGroups"][0]["steps"][0]["retryPolicy"] = json!({"enabled": true, "maxAttempts": 0});
        doc["stepGroups"][0]["steps"][1]["condition"] = json!("$.input.amount >");
        doc["compensationSteps"] = json!([
            {"id": "c1", "stepId": "debit", "dependsOn": ["ghost"]},
            {"id": "c2", "stepId": "missing", "compensationType": "CUSTOM"}
        ]);
        let err = validate_definition(&definition(doc)).unwrap_err();

        assert!(err.issues.iter().any(|i| matches!(i, ValidationIssue::InvalidRetryPolicy { .. })));
        assert!(err.issues.iter().any(|i| matches!(i, ValidationIssue::InvalidCondition { .. })));
        assert!(err.issues.iter().any(|i| matches!(i, ValidationIssue::UnknownDependency { .. })));
        assert!(err.issues.contains(&ValidationIssue::UnknownCompensationTarget {
            compensation: "c2".to_string(),
            step: "missing".to_string()
        }));
        assert!(err.issues.contains(&ValidationIssue::MissingCustomLogic("c2".to_string())));
    }

    #[test]
    fn test_duplicate_ids_are_rejected() {
        let mut doc = valid();
        doc["stepGroups"][0]["steps"][1]["id"] = json!("debit");
        let err = validate_definition(&definition(doc)).unwrap_err();
        assert!(err.issues.contains(&ValidationIssue::DuplicateStepId("debit".to_string())));
    }
}
