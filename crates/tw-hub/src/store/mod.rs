//! # Store
//!
//! The storage collaborator behind search and ingestion. A [`Store`] owns
//! runs, experiments and their side entities (params, tags, raw metric
//! series, latest metric values) and answers [`RowQuery`]s: a compiled
//! predicate tree, its join requirements, a sort and a window.
//!
//! [`MemoryStore`] is the reference implementation.

pub mod eval;
pub mod memory;

pub use memory::MemoryStore;

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tw_core::MetricPoint;
use tw_query::{JoinRequirement, Predicate, SortKey};

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    AlreadyExists(String),
    /// The row exists but is not in a state that allows the write.
    #[error("{0}")]
    InvalidState(String),
    #[allow(dead_code)]
    #[error("storage failure for {context}: {message}")]
    Backend { context: String, message: String },
}

impl StoreError {
    /// Attach the identifying key of the failed operation to a backend error.
    pub fn within(self, context: impl Into<String>) -> Self {
        match self {
            Self::Backend { message, .. } => Self::Backend {
                context: context.into(),
                message,
            },
            other => other,
        }
    }
}

// =============================================================================
// Rows
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Experiment {
    pub experiment_id: i64,
    pub name: String,
    pub artifact_location: String,
    pub lifecycle_stage: String,
    pub creation_time: i64,
    pub last_update_time: i64,
    pub tags: BTreeMap<String, String>,
}

impl Experiment {
    pub fn field(&self, name: &str) -> Option<Value> {
        let value = match name {
            "experiment_id" => Value::from(self.experiment_id),
            "name" => Value::from(self.name.as_str()),
            "artifact_location" => Value::from(self.artifact_location.as_str()),
            "lifecycle_stage" => Value::from(self.lifecycle_stage.as_str()),
            "creation_time" => Value::from(self.creation_time),
            "last_update_time" => Value::from(self.last_update_time),
            _ => return None,
        };
        Some(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Run {
    pub run_uuid: String,
    pub name: String,
    pub experiment_id: i64,
    pub user_id: String,
    pub status: String,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub lifecycle_stage: String,
    pub artifact_uri: String,
}

impl Run {
    pub fn field(&self, name: &str) -> Option<Value> {
        let value = match name {
            "run_uuid" => Value::from(self.run_uuid.as_str()),
            "name" => Value::from(self.name.as_str()),
            "experiment_id" => Value::from(self.experiment_id),
            "user_id" => Value::from(self.user_id.as_str()),
            "status" => Value::from(self.status.as_str()),
            "start_time" => Value::from(self.start_time),
            "end_time" => return self.end_time.map(Value::from),
            "lifecycle_stage" => Value::from(self.lifecycle_stage.as_str()),
            "artifact_uri" => Value::from(self.artifact_uri.as_str()),
            _ => return None,
        };
        Some(value)
    }
}

/// The summary row for one `(run, key)` metric series.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatestMetric {
    pub key: String,
    pub value: f64,
    pub is_nan: bool,
    pub step: i64,
    pub timestamp: i64,
}

impl LatestMetric {
    pub fn new(key: &str, point: MetricPoint) -> Self {
        Self {
            key: key.to_string(),
            value: point.value,
            is_nan: point.is_nan,
            step: point.step,
            timestamp: point.timestamp,
        }
    }

    pub fn point(&self) -> MetricPoint {
        MetricPoint {
            value: self.value,
            is_nan: self.is_nan,
            step: self.step,
            timestamp: self.timestamp,
        }
    }

    pub fn field(&self, name: &str) -> Option<Value> {
        let value = match name {
            "key" => Value::from(self.key.as_str()),
            "value" => Value::from(self.value),
            "is_nan" => Value::from(self.is_nan),
            "step" => Value::from(self.step),
            "timestamp" => Value::from(self.timestamp),
            _ => return None,
        };
        Some(value)
    }
}

/// One raw sample after sentinel mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub key: String,
    pub point: MetricPoint,
}

/// A run with its side entities, as returned by searches.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunView {
    pub info: Run,
    pub params: BTreeMap<String, String>,
    pub tags: BTreeMap<String, String>,
    pub metrics: Vec<LatestMetric>,
}

#[derive(Debug, Clone, Default)]
pub struct NewRun {
    pub experiment_id: i64,
    pub name: String,
    pub user_id: String,
    pub start_time: i64,
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct RunUpdate {
    pub status: Option<String>,
    pub end_time: Option<i64>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StoreCounts {
    pub experiments: usize,
    pub runs: usize,
    pub metric_samples: usize,
}

// =============================================================================
// Queries
// =============================================================================

/// A filtered, ordered window over one table.
#[derive(Debug, Clone)]
pub struct RowQuery {
    pub predicate: Predicate,
    pub joins: Vec<JoinRequirement>,
    pub order: Vec<SortKey>,
    pub offset: usize,
    pub limit: usize,
}

impl RowQuery {
    /// Every row matching `predicate`, unordered.
    pub fn all(predicate: Predicate, joins: Vec<JoinRequirement>) -> Self {
        Self {
            predicate,
            joins,
            order: Vec::new(),
            offset: 0,
            limit: usize::MAX,
        }
    }
}

// =============================================================================
// Trait
// =============================================================================

#[async_trait::async_trait]
pub trait Store: Send + Sync {
    async fn create_experiment(
        &self,
        name: &str,
        tags: BTreeMap<String, String>,
    ) -> Result<Experiment, StoreError>;

    async fn create_run(&self, run: NewRun) -> Result<RunView, StoreError>;

    async fn get_run(&self, run_id: &str) -> Result<RunView, StoreError>;

    async fn update_run(&self, run_id: &str, update: RunUpdate) -> Result<Run, StoreError>;

    async fn set_lifecycle_stage(&self, run_id: &str, stage: &str) -> Result<(), StoreError>;

    async fn log_params(
        &self,
        run_id: &str,
        params: BTreeMap<String, String>,
    ) -> Result<(), StoreError>;

    async fn set_tags(&self, run_id: &str, tags: BTreeMap<String, String>)
        -> Result<(), StoreError>;

    /// Append raw samples to their series. Never touches latest values.
    async fn append_metrics(&self, run_id: &str, samples: &[MetricSample])
        -> Result<(), StoreError>;

    /// Stored latest values for `keys`; absent keys are omitted.
    async fn latest_metrics(
        &self,
        run_id: &str,
        keys: &[String],
    ) -> Result<HashMap<String, MetricPoint>, StoreError>;

    /// Insert or replace latest values.
    async fn upsert_latest(&self, run_id: &str, rows: Vec<LatestMetric>) -> Result<(), StoreError>;

    /// Compare each candidate with the stored value and replace it only if
    /// the candidate supersedes it, atomically with respect to other writers.
    /// Returns the keys that were written.
    async fn merge_latest(
        &self,
        run_id: &str,
        candidates: Vec<LatestMetric>,
    ) -> Result<Vec<String>, StoreError>;

    async fn query_runs(&self, query: &RowQuery) -> Result<Vec<RunView>, StoreError>;

    async fn count_runs(
        &self,
        predicate: &Predicate,
        joins: &[JoinRequirement],
    ) -> Result<usize, StoreError>;

    async fn query_experiments(&self, query: &RowQuery) -> Result<Vec<Experiment>, StoreError>;

    /// `(run, latest metric)` pairs matching the query, ordered by run then key.
    async fn query_metrics(
        &self,
        query: &RowQuery,
    ) -> Result<Vec<(RunView, LatestMetric)>, StoreError>;

    async fn counts(&self) -> StoreCounts;
}
