//! Execution tracker and metrics aggregator
//!
//! Aggregates are kept per series key: all executions, one definition, or
//! one (definition, target) pair where the target is a step's service.
//! Each series holds a ring of fixed-width time buckets with atomic
//! counters. Events land in the bucket of the time their reported work
//! finished, not the time the observer saw them. Only the newest bucket is open; once a later bucket exists the
//! older ones are closed and never written again, and an event that maps to
//! a closed bucket is dropped and counted in [`ExecutionTracker::late_events`].
//!
//! Percentiles come from a bounded window of recent duration samples, not
//! from all-time data.
//!
//! Series live in lock-striped shards. Writers to an existing bucket only
//! take a shard read lock and a series read lock, and hold the series read
//! lock while adding, so a bucket cannot gain a write after a newer one
//! opens. Readers copy what they need and release.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::events::SagaEvent;
use crate::observer::SagaObserver;
use crate::StepContext;

const SHARDS: usize = 16;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct TrackerConfig {
    pub bucket_width_secs: u64,
    pub retained_buckets: usize,
    pub sample_window: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            bucket_width_secs: 60,
            retained_buckets: 7 * 24 * 60,
            sample_window: 1024,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SeriesKey {
    All,
    Flow(String),
    Target { flow: String, target: String },
}

/// One finished unit of work
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Observation {
    Succeeded { duration_millis: u64 },
    Failed { duration_millis: u64 },
    /// Counted, but neither a success nor a failure
    Cancelled { duration_millis: u64 },
}

impl Observation {
    fn duration_millis(&self) -> u64 {
        match *self {
            Self::Succeeded { duration_millis }
            | Self::Failed { duration_millis }
            | Self::Cancelled { duration_millis } => duration_millis,
        }
    }
}

struct Bucket {
    start: u64,
    total: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    duration_sum: AtomicU64,
}

impl Bucket {
    fn new(start: u64) -> Self {
        Self {
            start,
            total: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            duration_sum: AtomicU64::new(0),
        }
    }

    fn add(&self, observation: Observation) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.duration_sum
            .fetch_add(observation.duration_millis(), Ordering::Relaxed);
        match observation {
            Observation::Succeeded { .. } => self.succeeded.fetch_add(1, Ordering::Relaxed),
            Observation::Failed { .. } => self.failed.fetch_add(1, Ordering::Relaxed),
            Observation::Cancelled { .. } => 0,
        };
    }

    fn point(&self) -> TrendPoint {
        let total = self.total.load(Ordering::Relaxed);
        let duration_sum = self.duration_sum.load(Ordering::Relaxed);
        TrendPoint {
            timestamp: self.start,
            executions: total,
            successful: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            average_duration: if total == 0 { 0 } else { duration_sum / total },
        }
    }
}

struct Series {
    buckets: RwLock<VecDeque<Arc<Bucket>>>,
    samples: Mutex<VecDeque<u64>>,
}

impl Series {
    fn new() -> Self {
        Self {
            buckets: RwLock::new(VecDeque::new()),
            samples: Mutex::new(VecDeque::new()),
        }
    }
}

/// Totals for one bucket as shown on dashboards
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendPoint {
    /// Bucket start, millis since UNIX epoch
    pub timestamp: u64,
    pub executions: u64,
    pub successful: u64,
    pub failed: u64,
    pub average_duration: u64,
}

/// Point-in-time copy of one series over a time range
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesSnapshot {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub average_duration: u64,
    pub success_rate: f64,
    pub p50: u64,
    pub p95: u64,
    pub p99: u64,
    /// Finished units per minute over the range
    pub throughput: f64,
    pub points: Vec<TrendPoint>,
}

pub struct ExecutionTracker {
    config: TrackerConfig,
    shards: Vec<RwLock<HashMap<SeriesKey, Arc<Series>>>>,
    late_events: AtomicU64,
}

impl ExecutionTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config: TrackerConfig {
                bucket_width_secs: config.bucket_width_secs.max(1),
                retained_buckets: config.retained_buckets.max(1),
                sample_window: config.sample_window.max(1),
            },
            shards: (0..SHARDS).map(|_| RwLock::new(HashMap::new())).collect(),
            late_events: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    fn width_millis(&self) -> u64 {
        self.config.bucket_width_secs * 1000
    }

    fn shard(&self, key: &SeriesKey) -> &RwLock<HashMap<SeriesKey, Arc<Series>>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % SHARDS]
    }

    fn series(&self, key: &SeriesKey) -> Arc<Series> {
        let shard = self.shard(key);
        if let Some(series) = shard.read().get(key) {
            return Arc::clone(series);
        }
        Arc::clone(
            shard
                .write()
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Series::new())),
        )
    }

    fn existing(&self, key: &SeriesKey) -> Option<Arc<Series>> {
        self.shard(key).read().get(key).cloned()
    }

    /// Record one observation that happened at `at_millis`
    pub fn record_at(&self, key: &SeriesKey, at_millis: u64, observation: Observation) {
        let series = self.series(key);
        let width = self.width_millis();
        let start = at_millis - at_millis % width;

        // Counters are bumped under the series lock; opening a newer bucket
        // needs the write half, so no write can land in a bucket it closed.
        let mut placement = add_to_open(&series.buckets.read(), start, observation);
        if placement == Placement::NoBucket {
            let mut buckets = series.buckets.write();
            placement = add_to_open(&buckets, start, observation);
            if placement == Placement::NoBucket {
                let bucket = Bucket::new(start);
                bucket.add(observation);
                buckets.push_back(Arc::new(bucket));
                let horizon = self.config.retained_buckets as u64 * width;
                while buckets
                    .front()
                    .is_some_and(|front| front.start + horizon <= start)
                {
                    buckets.pop_front();
                }
                placement = Placement::Added;
            }
        }
        if placement == Placement::Closed {
            self.late_events.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let mut samples = series.samples.lock();
        if samples.len() == self.config.sample_window {
            samples.pop_front();
        }
        samples.push_back(observation.duration_millis());
    }

    /// Events dropped because their bucket had already closed
    pub fn late_events(&self) -> u64 {
        self.late_events.load(Ordering::Relaxed)
    }

    /// Copy a series restricted to buckets overlapping `[now - range, now]`
    pub fn snapshot(&self, key: &SeriesKey, range: Duration, now_millis: u64) -> SeriesSnapshot {
        let Some(series) = self.existing(key) else {
            return SeriesSnapshot::default();
        };

        let width = self.width_millis();
        let range_millis = range.as_millis() as u64;
        let from = now_millis.saturating_sub(range_millis);
        let points: Vec<TrendPoint> = series
            .buckets
            .read()
            .iter()
            .filter(|b| b.start + width > from && b.start <= now_millis)
            .map(|b| b.point())
            .collect();

        let mut samples: Vec<u64> = series.samples.lock().iter().copied().collect();
        samples.sort_unstable();

        let total: u64 = points.iter().map(|p| p.executions).sum();
        let successful: u64 = points.iter().map(|p| p.successful).sum();
        let failed: u64 = points.iter().map(|p| p.failed).sum();
        let duration_sum: u64 = points.iter().map(|p| p.average_duration * p.executions).sum();
        let minutes = (range_millis as f64 / 60_000.0).max(1.0 / 60.0);

        SeriesSnapshot {
            total,
            successful,
            failed,
            average_duration: if total == 0 { 0 } else { duration_sum / total },
            success_rate: if total == 0 {
                0.0
            } else {
                successful as f64 * 100.0 / total as f64
            },
            p50: percentile(&samples, 50.0),
            p95: percentile(&samples, 95.0),
            p99: percentile(&samples, 99.0),
            throughput: total as f64 / minutes,
            points,
        }
    }

    /// Targets recorded for a definition, sorted by name
    pub fn targets(&self, flow: &str) -> Vec<String> {
        let mut targets: Vec<String> = self
            .shards
            .iter()
            .flat_map(|shard| {
                shard
                    .read()
                    .keys()
                    .filter_map(|key| match key {
                        SeriesKey::Target { flow: f, target } if f == flow => Some(target.clone()),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        targets.sort();
        targets
    }

    /// Fold one event in, bucketed at `at_millis`
    pub fn observe_at(&self, event: &SagaEvent, at_millis: u64) {
        let context = event.context();
        let flow = context.definition_id.to_string();

        let (observation, target) = match event {
            SagaEvent::ExecutionCompleted { duration_millis, .. } => {
                (Observation::Succeeded { duration_millis: *duration_millis }, None)
            }
            SagaEvent::ExecutionFailed { duration_millis, .. } => {
                (Observation::Failed { duration_millis: *duration_millis }, None)
            }
            SagaEvent::ExecutionCancelled { duration_millis, .. } => {
                (Observation::Cancelled { duration_millis: *duration_millis }, None)
            }
            SagaEvent::StepCompleted { target, duration_millis, .. } => (
                Observation::Succeeded { duration_millis: *duration_millis },
                Some(target),
            ),
            SagaEvent::StepFailed {
                target,
                duration_millis,
                will_retry: false,
                ..
            } => (
                Observation::Failed { duration_millis: *duration_millis },
                Some(target),
            ),
            _ => return,
        };

        match target {
            Some(target) => self.record_at(
                &SeriesKey::Target {
                    flow,
                    target: target.to_string(),
                },
                at_millis,
                observation,
            ),
            None => {
                self.record_at(&SeriesKey::All, at_millis, observation);
                self.record_at(&SeriesKey::Flow(flow), at_millis, observation);
            }
        }
    }
}

impl SagaObserver for ExecutionTracker {
    fn on_event(&self, event: &SagaEvent) {
        let at = event
            .finished_at_millis()
            .unwrap_or_else(StepContext::now_millis);
        self.observe_at(event, at);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Placement {
    Added,
    /// A newer bucket is open
    Closed,
    /// No bucket is open for this start yet
    NoBucket,
}

fn add_to_open(buckets: &VecDeque<Arc<Bucket>>, start: u64, observation: Observation) -> Placement {
    match buckets.back() {
        Some(back) if back.start == start => {
            back.add(observation);
            Placement::Added
        }
        Some(back) if back.start > start => Placement::Closed,
        _ => Placement::NoBucket,
    }
}

/// Nearest-rank percentile over sorted samples
fn percentile(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}
