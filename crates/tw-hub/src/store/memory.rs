//! # Memory Store
//!
//! Reference [`Store`] over in-process maps behind one tokio `RwLock`.
//! Queries scan every candidate row, evaluate the compiled [`Matcher`],
//! sort by the requested keys and cut the `[offset, offset + limit)` window.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use tokio::sync::RwLock;
use tw_core::{MetricPoint, LIFECYCLE_ACTIVE, STATUS_RUNNING};
use tw_query::{JoinRequirement, Predicate, SortKey};

use super::eval::{order_values, Matcher, Resolver, RowContext};
use super::{
    Experiment, LatestMetric, MetricSample, NewRun, Run, RowQuery, RunUpdate, RunView, Store,
    StoreCounts, StoreError,
};

pub const DEFAULT_EXPERIMENT_NAME: &str = "Default";

#[derive(Debug)]
struct RunEntry {
    run: Run,
    params: BTreeMap<String, String>,
    tags: BTreeMap<String, String>,
    latest: BTreeMap<String, LatestMetric>,
    history: Vec<MetricSample>,
}

impl RunEntry {
    fn view(&self) -> RunView {
        RunView {
            info: self.run.clone(),
            params: self.params.clone(),
            tags: self.tags.clone(),
            metrics: self.latest.values().cloned().collect(),
        }
    }
}

#[derive(Debug, Default)]
struct Tables {
    experiments: BTreeMap<i64, Experiment>,
    runs: HashMap<String, RunEntry>,
    next_experiment_id: i64,
}

impl Tables {
    fn run(&self, run_id: &str) -> Result<&RunEntry, StoreError> {
        self.runs
            .get(run_id)
            .ok_or_else(|| StoreError::NotFound(format!("Run with id={} not found", run_id)))
    }

    fn run_mut(&mut self, run_id: &str) -> Result<&mut RunEntry, StoreError> {
        self.runs
            .get_mut(run_id)
            .ok_or_else(|| StoreError::NotFound(format!("Run with id={} not found", run_id)))
    }

    /// A run that accepts new data: present and not deleted.
    fn active_run_mut(&mut self, run_id: &str) -> Result<&mut RunEntry, StoreError> {
        let entry = self.run_mut(run_id)?;
        if entry.run.lifecycle_stage != LIFECYCLE_ACTIVE {
            return Err(StoreError::InvalidState(format!(
                "The run {} must be in the 'active' state. Current state is {}.",
                run_id, entry.run.lifecycle_stage
            )));
        }
        Ok(entry)
    }

    fn context<'a>(&'a self, entry: &'a RunEntry) -> RowContext<'a> {
        RowContext {
            run: Some(&entry.run),
            params: Some(&entry.params),
            tags: Some(&entry.tags),
            metrics: Some(&entry.latest),
            experiment: self.experiments.get(&entry.run.experiment_id),
            metric: None,
        }
    }

    fn matching_runs<'a>(
        &'a self,
        predicate: &Predicate,
        joins: &[JoinRequirement],
    ) -> Result<Vec<&'a RunEntry>, StoreError> {
        let matcher = Matcher::compile(predicate)?;
        let resolver = Resolver::new(joins);
        Ok(self
            .runs
            .values()
            .filter(|entry| matcher.matches(&resolver, &self.context(entry)))
            .collect())
    }
}

pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    /// An empty store holding only the default experiment `0`.
    pub fn new() -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        let mut tables = Tables::default();
        tables.experiments.insert(
            0,
            Experiment {
                experiment_id: 0,
                name: DEFAULT_EXPERIMENT_NAME.to_string(),
                artifact_location: "mlruns/0".to_string(),
                lifecycle_stage: LIFECYCLE_ACTIVE.to_string(),
                creation_time: now,
                last_update_time: now,
                tags: BTreeMap::new(),
            },
        );
        tables.next_experiment_id = 1;
        Self {
            tables: RwLock::new(tables),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Sort rows by `keys`, reading each key through `value_of`.
fn sort_rows<T>(
    rows: &mut [T],
    keys: &[SortKey],
    value_of: impl Fn(&T, &SortKey) -> Option<serde_json::Value>,
) {
    rows.sort_by(|a, b| {
        keys.iter()
            .map(|k| order_values(value_of(a, k).as_ref(), value_of(b, k).as_ref(), k.descending))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    });
}

fn experiment_context(experiment: &Experiment) -> RowContext<'_> {
    RowContext {
        tags: Some(&experiment.tags),
        experiment: Some(experiment),
        ..Default::default()
    }
}

fn window<T>(rows: Vec<T>, offset: usize, limit: usize) -> Vec<T> {
    rows.into_iter().skip(offset).take(limit).collect()
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn create_experiment(
        &self,
        name: &str,
        tags: BTreeMap<String, String>,
    ) -> Result<Experiment, StoreError> {
        let mut tables = self.tables.write().await;
        if tables.experiments.values().any(|e| e.name == name) {
            return Err(StoreError::AlreadyExists(format!(
                "Experiment '{}' already exists.",
                name
            )));
        }
        let id = tables.next_experiment_id;
        tables.next_experiment_id += 1;
        let now = chrono::Utc::now().timestamp_millis();
        let experiment = Experiment {
            experiment_id: id,
            name: name.to_string(),
            artifact_location: format!("mlruns/{}", id),
            lifecycle_stage: LIFECYCLE_ACTIVE.to_string(),
            creation_time: now,
            last_update_time: now,
            tags,
        };
        tables.experiments.insert(id, experiment.clone());
        Ok(experiment)
    }

    async fn create_run(&self, new: NewRun) -> Result<RunView, StoreError> {
        let mut tables = self.tables.write().await;
        let experiment = tables.experiments.get(&new.experiment_id).ok_or_else(|| {
            StoreError::NotFound(format!(
                "No Experiment with id={} exists",
                new.experiment_id
            ))
        })?;
        if experiment.lifecycle_stage != LIFECYCLE_ACTIVE {
            return Err(StoreError::InvalidState(format!(
                "Experiment id={} must be active",
                new.experiment_id
            )));
        }
        let run_uuid = uuid::Uuid::new_v4().as_simple().to_string();
        let run = Run {
            artifact_uri: format!("{}/{}/artifacts", experiment.artifact_location, run_uuid),
            run_uuid: run_uuid.clone(),
            name: new.name,
            experiment_id: new.experiment_id,
            user_id: new.user_id,
            status: STATUS_RUNNING.to_string(),
            start_time: new.start_time,
            end_time: None,
            lifecycle_stage: LIFECYCLE_ACTIVE.to_string(),
        };
        let entry = RunEntry {
            run,
            params: BTreeMap::new(),
            tags: new.tags,
            latest: BTreeMap::new(),
            history: Vec::new(),
        };
        let view = entry.view();
        tables.runs.insert(run_uuid, entry);
        Ok(view)
    }

    async fn get_run(&self, run_id: &str) -> Result<RunView, StoreError> {
        Ok(self.tables.read().await.run(run_id)?.view())
    }

    async fn update_run(&self, run_id: &str, update: RunUpdate) -> Result<Run, StoreError> {
        let mut tables = self.tables.write().await;
        let entry = tables.active_run_mut(run_id)?;
        if let Some(status) = update.status {
            entry.run.status = status;
        }
        if let Some(end_time) = update.end_time {
            entry.run.end_time = Some(end_time);
        }
        if let Some(name) = update.name {
            entry.tags.insert("mlflow.runName".to_string(), name.clone());
            entry.run.name = name;
        }
        Ok(entry.run.clone())
    }

    async fn set_lifecycle_stage(&self, run_id: &str, stage: &str) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        tables.run_mut(run_id)?.run.lifecycle_stage = stage.to_string();
        Ok(())
    }

    async fn log_params(
        &self,
        run_id: &str,
        params: BTreeMap<String, String>,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let entry = tables.active_run_mut(run_id)?;
        for (key, value) in params {
            match entry.params.get(&key) {
                Some(existing) if *existing != value => {
                    return Err(StoreError::InvalidState(format!(
                        "Changing param values is not allowed. Param with key='{}' was already \
                         logged with value='{}' for run ID='{}'. Attempted logging new value '{}'.",
                        key, existing, run_id, value
                    )));
                }
                _ => {
                    entry.params.insert(key, value);
                }
            }
        }
        Ok(())
    }

    async fn set_tags(
        &self,
        run_id: &str,
        tags: BTreeMap<String, String>,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let entry = tables.active_run_mut(run_id)?;
        if let Some(name) = tags.get("mlflow.runName") {
            entry.run.name = name.clone();
        }
        entry.tags.extend(tags);
        Ok(())
    }

    async fn append_metrics(
        &self,
        run_id: &str,
        samples: &[MetricSample],
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let entry = tables.active_run_mut(run_id)?;
        entry.history.extend_from_slice(samples);
        Ok(())
    }

    async fn latest_metrics(
        &self,
        run_id: &str,
        keys: &[String],
    ) -> Result<HashMap<String, MetricPoint>, StoreError> {
        let tables = self.tables.read().await;
        let entry = tables.run(run_id)?;
        Ok(keys
            .iter()
            .filter_map(|k| entry.latest.get(k).map(|m| (k.clone(), m.point())))
            .collect())
    }

    async fn upsert_latest(&self, run_id: &str, rows: Vec<LatestMetric>) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let entry = tables.run_mut(run_id)?;
        for row in rows {
            entry.latest.insert(row.key.clone(), row);
        }
        Ok(())
    }

    async fn merge_latest(
        &self,
        run_id: &str,
        candidates: Vec<LatestMetric>,
    ) -> Result<Vec<String>, StoreError> {
        let mut tables = self.tables.write().await;
        let entry = tables.run_mut(run_id)?;
        let mut written = Vec::new();
        for candidate in candidates {
            let wins = entry
                .latest
                .get(&candidate.key)
                .map_or(true, |stored| candidate.point().supersedes(&stored.point()));
            if wins {
                written.push(candidate.key.clone());
                entry.latest.insert(candidate.key.clone(), candidate);
            }
        }
        Ok(written)
    }

    async fn query_runs(&self, query: &RowQuery) -> Result<Vec<RunView>, StoreError> {
        let tables = self.tables.read().await;
        let mut rows = tables.matching_runs(&query.predicate, &query.joins)?;
        let resolver = Resolver::new(&query.joins);
        sort_rows(&mut rows, &query.order, |entry, key| {
            resolver.value(&key.column, &tables.context(entry))
        });
        Ok(window(rows, query.offset, query.limit)
            .into_iter()
            .map(RunEntry::view)
            .collect())
    }

    async fn count_runs(
        &self,
        predicate: &Predicate,
        joins: &[JoinRequirement],
    ) -> Result<usize, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables.matching_runs(predicate, joins)?.len())
    }

    async fn query_experiments(&self, query: &RowQuery) -> Result<Vec<Experiment>, StoreError> {
        let tables = self.tables.read().await;
        let matcher = Matcher::compile(&query.predicate)?;
        let resolver = Resolver::new(&query.joins);
        let mut rows: Vec<&Experiment> = tables
            .experiments
            .values()
            .filter(|e| matcher.matches(&resolver, &experiment_context(e)))
            .collect();
        sort_rows(&mut rows, &query.order, |e, key| {
            resolver.value(&key.column, &experiment_context(e))
        });
        Ok(window(rows, query.offset, query.limit)
            .into_iter()
            .cloned()
            .collect())
    }

    async fn query_metrics(
        &self,
        query: &RowQuery,
    ) -> Result<Vec<(RunView, LatestMetric)>, StoreError> {
        let tables = self.tables.read().await;
        let matcher = Matcher::compile(&query.predicate)?;
        let resolver = Resolver::new(&query.joins);

        let mut runs: Vec<&RunEntry> = tables.runs.values().collect();
        runs.sort_by(|a, b| {
            b.run
                .start_time
                .cmp(&a.run.start_time)
                .then_with(|| a.run.run_uuid.cmp(&b.run.run_uuid))
        });

        let mut out = Vec::new();
        for entry in runs {
            let matched: Vec<&LatestMetric> = entry
                .latest
                .values()
                .filter(|metric| {
                    let row = RowContext {
                        metric: Some(*metric),
                        ..tables.context(entry)
                    };
                    matcher.matches(&resolver, &row)
                })
                .collect();
            if matched.is_empty() {
                continue;
            }
            let view = entry.view();
            out.extend(matched.into_iter().map(|m| (view.clone(), m.clone())));
        }
        Ok(window(out, query.offset, query.limit))
    }

    async fn counts(&self) -> StoreCounts {
        let tables = self.tables.read().await;
        StoreCounts {
            experiments: tables.experiments.len(),
            runs: tables.runs.len(),
            metric_samples: tables.runs.values().map(|r| r.history.len()).sum(),
        }
    }
}
