//! Read models served to dashboards

use std::time::Duration;

use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::state::{CompensationStepStatus, SagaExecution, SagaStatus};
use crate::tracker::{SeriesSnapshot, TrendPoint};
use crate::ExecutionId;

const DEFAULT_LIMIT: usize = 100;
const DEFAULT_RANGE: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    #[error("unknown status: {0}")]
    InvalidStatus(String),
    #[error("invalid date '{0}': expected RFC 3339, YYYY-MM-DD or epoch millis")]
    InvalidDate(String),
    #[error("invalid time range '{0}'")]
    InvalidTimeRange(String),
    #[error("invalid execution id '{0}'")]
    InvalidExecutionId(String),
    #[error("request body is not valid JSON: {0}")]
    InvalidPayload(String),
}

/// `GET /executions` query string
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionFilter {
    pub flow_id: Option<String>,
    pub status: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub limit: Option<usize>,
    /// Window for throughput and trends, `24h` when absent
    pub time_range: Option<String>,
}

/// Filter with its fields parsed
#[derive(Clone, Debug, PartialEq)]
pub struct ExecutionQuery {
    pub flow_id: Option<String>,
    pub status: Option<SagaStatus>,
    pub from_millis: Option<u64>,
    pub to_millis: Option<u64>,
    pub limit: usize,
    pub range: Duration,
}

impl Default for ExecutionQuery {
    fn default() -> Self {
        Self {
            flow_id: None,
            status: None,
            from_millis: None,
            to_millis: None,
            limit: DEFAULT_LIMIT,
            range: DEFAULT_RANGE,
        }
    }
}

impl ExecutionFilter {
    pub fn parse(&self) -> Result<ExecutionQuery, QueryError> {
        let status = match self.status.as_deref().filter(|s| !s.is_empty()) {
            Some(raw) => {
                Some(SagaStatus::parse(raw).ok_or_else(|| QueryError::InvalidStatus(raw.to_string()))?)
            }
            None => None,
        };
        Ok(ExecutionQuery {
            flow_id: self.flow_id.clone().filter(|f| !f.is_empty()),
            status,
            from_millis: self.start_date.as_deref().map(parse_date).transpose()?,
            to_millis: self
                .end_date
                .as_deref()
                .map(parse_end_date)
                .transpose()?,
            limit: self.limit.unwrap_or(DEFAULT_LIMIT).max(1),
            range: match self.time_range.as_deref().filter(|r| !r.is_empty()) {
                Some(raw) => parse_time_range(raw)?,
                None => DEFAULT_RANGE,
            },
        })
    }
}

impl ExecutionQuery {
    pub fn matches(&self, execution: &SagaExecution) -> bool {
        self.flow_id
            .as_deref()
            .map_or(true, |flow| execution.definition_id == flow)
            && self.status.map_or(true, |status| execution.status == status)
            && self.from_millis.map_or(true, |from| execution.start_time >= from)
            && self.to_millis.map_or(true, |to| execution.start_time <= to)
    }
}

fn parse_date(raw: &str) -> Result<u64, QueryError> {
    if let Ok(millis) = raw.parse::<u64>() {
        return Ok(millis);
    }
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(raw) {
        return u64::try_from(timestamp.timestamp_millis())
            .map_err(|_| QueryError::InvalidDate(raw.to_string()));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .and_then(|start| u64::try_from(start.and_utc().timestamp_millis()).ok())
        .ok_or_else(|| QueryError::InvalidDate(raw.to_string()))
}

/// A bare date as an end bound covers the whole day
fn parse_end_date(raw: &str) -> Result<u64, QueryError> {
    let millis = parse_date(raw)?;
    if NaiveDate::parse_from_str(raw, "%Y-%m-%d").is_ok() {
        Ok(millis + 24 * 60 * 60 * 1000 - 1)
    } else {
        Ok(millis)
    }
}

/// `15m`, `1h`, `6h`, `24h`, `7d` or a plain number of minutes
pub fn parse_time_range(raw: &str) -> Result<Duration, QueryError> {
    let invalid = || QueryError::InvalidTimeRange(raw.to_string());
    let raw = raw.trim();
    let (digits, unit) = match raw.find(|c: char| !c.is_ascii_digit()) {
        Some(split) => raw.split_at(split),
        None => (raw, "m"),
    };
    let amount: u64 = digits.parse().map_err(|_| invalid())?;
    if amount == 0 {
        return Err(invalid());
    }
    let seconds = match unit {
        "m" => 60,
        "h" => 60 * 60,
        "d" => 24 * 60 * 60,
        _ => return Err(invalid()),
    };
    Ok(Duration::from_secs(amount * seconds))
}

/// One row of the executions list
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub id: ExecutionId,
    pub flow_id: String,
    pub flow_name: String,
    pub status: SagaStatus,
    pub start_time: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    pub total_steps: usize,
    pub completed_steps: usize,
    pub failed_steps: usize,
    pub skipped_steps: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub compensated: bool,
    pub partial_compensation: bool,
}

impl From<&SagaExecution> for ExecutionSummary {
    fn from(execution: &SagaExecution) -> Self {
        Self {
            id: execution.id,
            flow_id: execution.definition_id.clone(),
            flow_name: execution.definition_name.clone(),
            status: execution.status,
            start_time: execution.start_time,
            end_time: execution.end_time,
            duration: execution.duration_millis(),
            progress: execution.progress,
            current_step: execution.current_step.clone(),
            total_steps: execution.steps.len(),
            completed_steps: execution.completed_steps(),
            failed_steps: execution.failed_steps(),
            skipped_steps: execution.skipped_steps(),
            error: execution.error.clone(),
            compensated: execution.compensation.is_some(),
            partial_compensation: execution.partial_compensation,
        }
    }
}

/// Matching executions, newest first
pub fn list_executions(executions: &[SagaExecution], query: &ExecutionQuery) -> Vec<ExecutionSummary> {
    let mut matching: Vec<&SagaExecution> = executions.iter().filter(|e| query.matches(e)).collect();
    matching.sort_by(|a, b| b.start_time.cmp(&a.start_time).then(b.id.cmp(&a.id)));
    matching
        .into_iter()
        .take(query.limit)
        .map(ExecutionSummary::from)
        .collect()
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStats {
    pub total_executions: usize,
    pub running_executions: usize,
    pub completed_executions: usize,
    pub failed_executions: usize,
    pub paused_executions: usize,
    pub cancelled_executions: usize,
    /// Mean duration of finished executions (ms)
    pub average_duration: u64,
    /// Percentage of finished executions that completed
    pub success_rate: f64,
    /// Executions finished per minute
    pub throughput: f64,
    pub trends_data: Vec<TrendPoint>,
}

/// Counts come from the stored executions; throughput and trends from the tracker
pub fn execution_stats(
    executions: &[SagaExecution],
    query: &ExecutionQuery,
    series: SeriesSnapshot,
) -> ExecutionStats {
    let mut stats = ExecutionStats::default();
    let mut finished_durations = 0u64;
    let mut finished = 0u64;

    for execution in executions.iter().filter(|e| query.matches(e)) {
        stats.total_executions += 1;
        match execution.status {
            SagaStatus::Running => stats.running_executions += 1,
            SagaStatus::Completed => stats.completed_executions += 1,
            SagaStatus::Failed => stats.failed_executions += 1,
            SagaStatus::Paused => stats.paused_executions += 1,
            SagaStatus::Cancelled => stats.cancelled_executions += 1,
        }
        if let Some(duration) = execution.duration_millis() {
            finished_durations += duration;
            finished += 1;
        }
    }

    if finished > 0 {
        stats.average_duration = finished_durations / finished;
        stats.success_rate = stats.completed_executions as f64 * 100.0 / finished as f64;
    }
    stats.throughput = series.throughput;
    stats.trends_data = series.points;
    stats
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowMetrics {
    pub total_duration: u64,
    pub average_step_duration: u64,
    pub total_retries: u32,
    pub completed_steps: usize,
    pub failed_steps: usize,
    pub skipped_steps: usize,
    pub compensated_steps: usize,
    pub input_bytes: u64,
    pub output_bytes: u64,
}

/// Full execution detail for the flow view
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowExecution {
    #[serde(flatten)]
    pub execution: SagaExecution,
    pub metrics: FlowMetrics,
}

impl From<SagaExecution> for FlowExecution {
    fn from(execution: SagaExecution) -> Self {
        let timed: Vec<u64> = execution.steps.iter().filter_map(|s| s.duration).collect();
        let metrics = FlowMetrics {
            total_duration: execution
                .duration_millis()
                .unwrap_or_else(|| crate::StepContext::now_millis().saturating_sub(execution.start_time)),
            average_step_duration: if timed.is_empty() {
                0
            } else {
                timed.iter().sum::<u64>() / timed.len() as u64
            },
            total_retries: execution.steps.iter().map(|s| s.retry_count).sum(),
            completed_steps: execution.completed_steps(),
            failed_steps: execution.failed_steps(),
            skipped_steps: execution.skipped_steps(),
            compensated_steps: execution
                .compensation
                .as_ref()
                .map_or(0, |c| c.count(CompensationStepStatus::Completed)),
            input_bytes: execution.steps.iter().map(|s| s.metrics.input_size).sum(),
            output_bytes: execution.steps.iter().map(|s| s.metrics.output_size).sum(),
        };
        Self { execution, metrics }
    }
}

/// `GET /metrics/targets` query string
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetMetricsQuery {
    pub flow_id: Option<String>,
    pub target_id: Option<String>,
    pub time_range: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetMetrics {
    pub flow_id: String,
    pub target_id: String,
    #[serde(flatten)]
    pub metrics: SeriesSnapshot,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetMetricsReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow_id: Option<String>,
    pub time_range: String,
    /// Aggregate over the flow (or all flows)
    pub overall: SeriesSnapshot,
    pub targets: Vec<TargetMetrics>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::SagaDefinition;
    use serde_json::json;

    fn execution(id: u64, flow: &str, status: SagaStatus, start: u64) -> SagaExecution {
        let definition: SagaDefinition = serde_json::from_value(json!({
            "id": flow,
            "name": flow,
            "stepGroups": [{"id": "g", "steps": [{"id": "a", "operation": "a"}]}]
        }))
        .unwrap();
        let mut execution = SagaExecution::new(ExecutionId::new(id), &definition, json!({}), start);
        if status != SagaStatus::Running {
            execution.transition(status, start + 100).unwrap();
        }
        execution
    }

    #[test]
    fn test_time_ranges() {
        assert_eq!(parse_time_range("15m").unwrap(), Duration::from_secs(900));
        assert_eq!(parse_time_range("24h").unwrap(), Duration::from_secs(86_400));
        assert_eq!(parse_time_range("7d").unwrap(), Duration::from_secs(604_800));
        assert_eq!(parse_time_range("30").unwrap(), Duration::from_secs(1_800));
        assert!(parse_time_range("1w").is_err());
        assert!(parse_time_range("h").is_err());
        assert!(parse_time_range("0m").is_err());
    }

    #[test]
    fn test_dates_accept_several_formats() {
        let filter = ExecutionFilter {
            start_date: Some("2024-01-02".into()),
            end_date: Some("2024-01-02".into()),
            ..Default::default()
        };
        let query = filter.parse().unwrap();
        assert_eq!(query.from_millis, Some(1_704_153_600_000));
        assert_eq!(query.to_millis, Some(1_704_239_999_999));

        let rfc = ExecutionFilter {
            start_date: Some("2024-01-02T00:00:00Z".into()),
            ..Default::default()
        };
        assert_eq!(rfc.parse().unwrap().from_millis, Some(1_704_153_600_000));

        let bad = ExecutionFilter {
            status: Some("SLEEPING".into()),
            ..Default::default()
        };
        assert_eq!(bad.parse(), Err(QueryError::InvalidStatus("SLEEPING".into())));
    }

    #[test]
    fn test_list_filters_and_orders_newest_first() {
        let executions = vec![
            execution(1, "orders", SagaStatus::Completed, 10),
            execution(2, "orders", SagaStatus::Failed, 20),
            execution(3, "billing", SagaStatus::Completed, 30),
            execution(4, "orders", SagaStatus::Running, 40),
        ];
        let query = ExecutionFilter {
            flow_id: Some("orders".into()),
            limit: Some(2),
            ..Default::default()
        }
        .parse()
        .unwrap();

        let ids: Vec<u64> = list_executions(&executions, &query)
            .iter()
            .map(|s| s.id.get())
            .collect();
        assert_eq!(ids, vec![4, 2]);

        let stats = execution_stats(&executions, &query, SeriesSnapshot::default());
        assert_eq!(stats.total_executions, 3);
        assert_eq!(stats.running_executions, 1);
        assert_eq!(stats.average_duration, 100);
        assert_eq!(stats.success_rate, 50.0);
    }
}
