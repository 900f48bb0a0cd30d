//! # Latest-Value Materializer
//!
//! Keeps one summary row per `(run, metric key)` holding the greatest sample
//! under the `(step, timestamp, value)` order. Each batch is appended to the
//! raw series unconditionally, reduced to one local winner per key, and
//! merged against the stored summary.
//!
//! In the default mode the stored summary is read and written in two separate
//! store calls, so two concurrent batches for the same key may both read a
//! stale value and the later write wins. The raw series is never affected.
//! With `strict_latest_merge` the comparison happens inside the store's write
//! lock instead.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tw_core::{MetricPoint, WireValue};
use tw_query::{ErrorKind, QueryError};

use crate::error::HubError;
use crate::store::{LatestMetric, MetricSample, Store};

/// A metric sample as it arrives on the wire: the value may be a number or
/// one of the `NaN` / `Infinity` / `-Infinity` sentinel strings.
#[derive(Debug, Clone, Deserialize)]
pub struct RawMetric {
    pub key: String,
    pub value: Value,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub step: i64,
}

impl RawMetric {
    pub fn parse(&self) -> Result<MetricSample, QueryError> {
        let wire = parse_metric_value(&self.value)?;
        Ok(MetricSample {
            key: self.key.clone(),
            point: MetricPoint::from_wire(wire, self.step, self.timestamp),
        })
    }
}

/// Map a wire value to a finite number plus NaN flag. Strings other than
/// the three sentinels are rejected, numeric-looking ones included.
pub fn parse_metric_value(raw: &Value) -> Result<WireValue, QueryError> {
    let parsed = match raw {
        Value::Number(n) => n.as_f64().map(WireValue::from_f64),
        Value::String(s) => WireValue::from_sentinel(s.trim()),
        _ => None,
    };
    parsed.ok_or_else(|| {
        QueryError::invalid(
            ErrorKind::InvalidMetricValue,
            format!("invalid metric value '{}'", display_raw(raw)),
        )
    })
}

fn display_raw(raw: &Value) -> String {
    match raw {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// The greatest sample per key within one batch.
pub fn local_winners(samples: &[MetricSample]) -> BTreeMap<String, MetricPoint> {
    let mut winners: BTreeMap<String, MetricPoint> = BTreeMap::new();
    for sample in samples {
        match winners.get(&sample.key) {
            Some(current) if !sample.point.supersedes(current) => {}
            _ => {
                winners.insert(sample.key.clone(), sample.point);
            }
        }
    }
    winners
}

pub struct Materializer {
    store: Arc<dyn Store>,
    strict: bool,
}

impl Materializer {
    pub fn new(store: Arc<dyn Store>, strict: bool) -> Self {
        Self { store, strict }
    }

    /// Validate, append and merge one batch for `run_id`. Returns the keys
    /// whose stored latest value changed.
    pub async fn merge_batch(
        &self,
        run_id: &str,
        batch: &[RawMetric],
    ) -> Result<Vec<String>, HubError> {
        let samples = batch
            .iter()
            .map(RawMetric::parse)
            .collect::<Result<Vec<_>, _>>()?;
        if samples.is_empty() {
            return Ok(Vec::new());
        }

        self.store
            .append_metrics(run_id, &samples)
            .await
            .map_err(|e| e.within(format!("run {}", run_id)))?;

        let winners = local_winners(&samples);
        let written = if self.strict {
            let candidates = winners
                .iter()
                .map(|(key, point)| LatestMetric::new(key, *point))
                .collect();
            let keys: Vec<&String> = winners.keys().collect();
            self.store
                .merge_latest(run_id, candidates)
                .await
                .map_err(|e| e.within(format!("run {} metrics {:?}", run_id, keys)))?
        } else {
            self.merge_unlocked(run_id, winners).await?
        };

        tracing::debug!(run_id, keys = ?written, "upserted latest metrics");
        Ok(written)
    }

    async fn merge_unlocked(
        &self,
        run_id: &str,
        winners: BTreeMap<String, MetricPoint>,
    ) -> Result<Vec<String>, HubError> {
        let keys: Vec<String> = winners.keys().cloned().collect();
        let stored = self
            .store
            .latest_metrics(run_id, &keys)
            .await
            .map_err(|e| e.within(format!("run {} metrics {:?}", run_id, keys)))?;

        let changed: Vec<LatestMetric> = winners
            .iter()
            .filter(|(key, point)| stored.get(*key).map_or(true, |s| point.supersedes(s)))
            .map(|(key, point)| LatestMetric::new(key, *point))
            .collect();
        let written: Vec<String> = changed.iter().map(|m| m.key.clone()).collect();
        if !changed.is_empty() {
            self.store
                .upsert_latest(run_id, changed)
                .await
                .map_err(|e| e.within(format!("run {} metrics {:?}", run_id, written)))?;
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ApiError, ErrorCode};
    use crate::store::{
        Experiment, MemoryStore, NewRun, RowQuery, Run, RunUpdate, RunView, StoreCounts,
        StoreError,
    };
    use proptest::prelude::*;
    use serde_json::json;
    use std::collections::HashMap;
    use tw_query::{JoinRequirement, Predicate};

    /// Delegates to a [`MemoryStore`] but fails every latest-value write.
    struct ReadOnlyLatest {
        inner: MemoryStore,
    }

    fn disk_full() -> StoreError {
        StoreError::Backend {
            context: String::new(),
            message: "disk full".into(),
        }
    }

    #[async_trait::async_trait]
    impl Store for ReadOnlyLatest {
        async fn create_experiment(
            &self,
            name: &str,
            tags: BTreeMap<String, String>,
        ) -> Result<Experiment, StoreError> {
            self.inner.create_experiment(name, tags).await
        }

        async fn create_run(&self, run: NewRun) -> Result<RunView, StoreError> {
            self.inner.create_run(run).await
        }

        async fn get_run(&self, run_id: &str) -> Result<RunView, StoreError> {
            self.inner.get_run(run_id).await
        }

        async fn update_run(&self, run_id: &str, update: RunUpdate) -> Result<Run, StoreError> {
            self.inner.update_run(run_id, update).await
        }

        async fn set_lifecycle_stage(&self, run_id: &str, stage: &str) -> Result<(), StoreError> {
            self.inner.set_lifecycle_stage(run_id, stage).await
        }

        async fn log_params(
            &self,
            run_id: &str,
            params: BTreeMap<String, String>,
        ) -> Result<(), StoreError> {
            self.inner.log_params(run_id, params).await
        }

        async fn set_tags(
            &self,
            run_id: &str,
            tags: BTreeMap<String, String>,
        ) -> Result<(), StoreError> {
            self.inner.set_tags(run_id, tags).await
        }

        async fn append_metrics(
            &self,
            run_id: &str,
            samples: &[MetricSample],
        ) -> Result<(), StoreError> {
            self.inner.append_metrics(run_id, samples).await
        }

        async fn latest_metrics(
            &self,
            run_id: &str,
            keys: &[String],
        ) -> Result<HashMap<String, MetricPoint>, StoreError> {
            self.inner.latest_metrics(run_id, keys).await
        }

        async fn upsert_latest(
            &self,
            _run_id: &str,
            _rows: Vec<LatestMetric>,
        ) -> Result<(), StoreError> {
            Err(disk_full())
        }

        async fn merge_latest(
            &self,
            _run_id: &str,
            _candidates: Vec<LatestMetric>,
        ) -> Result<Vec<String>, StoreError> {
            Err(disk_full())
        }

        async fn query_runs(&self, query: &RowQuery) -> Result<Vec<RunView>, StoreError> {
            self.inner.query_runs(query).await
        }

        async fn count_runs(
            &self,
            predicate: &Predicate,
            joins: &[JoinRequirement],
        ) -> Result<usize, StoreError> {
            self.inner.count_runs(predicate, joins).await
        }

        async fn query_experiments(&self, query: &RowQuery) -> Result<Vec<Experiment>, StoreError> {
            self.inner.query_experiments(query).await
        }

        async fn query_metrics(
            &self,
            query: &RowQuery,
        ) -> Result<Vec<(RunView, LatestMetric)>, StoreError> {
            self.inner.query_metrics(query).await
        }

        async fn counts(&self) -> StoreCounts {
            self.inner.counts().await
        }
    }

    fn raw(key: &str, value: Value, step: i64, timestamp: i64) -> RawMetric {
        RawMetric {
            key: key.to_string(),
            value,
            timestamp,
            step,
        }
    }

    async fn store_with_run() -> (Arc<dyn Store>, String) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let run = store.create_run(NewRun::default()).await.unwrap();
        (store, run.info.run_uuid)
    }

    #[test]
    fn test_sentinels_and_rejections() {
        assert_eq!(
            parse_metric_value(&json!("NaN")).unwrap(),
            WireValue { value: 0.0, is_nan: true }
        );
        assert_eq!(parse_metric_value(&json!("Infinity")).unwrap().value, f64::MAX);
        assert_eq!(parse_metric_value(&json!("-Infinity")).unwrap().value, -f64::MAX);
        assert_eq!(parse_metric_value(&json!(0.25)).unwrap().value, 0.25);
        let err = parse_metric_value(&json!("fast")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidMetricValue);
        assert_eq!(err.to_string(), "invalid metric value 'fast'");
        let err = parse_metric_value(&json!("0.25")).unwrap_err();
        assert_eq!(err.to_string(), "invalid metric value '0.25'");
        assert!(parse_metric_value(&json!("nan")).is_err());
        assert!(parse_metric_value(&json!(true)).is_err());
    }

    #[tokio::test]
    async fn test_highest_step_wins_in_either_order() {
        let batch = vec![
            raw("k", json!(1.0), 1, 100),
            raw("k", json!(2.0), 1, 100),
            raw("k", json!(1.5), 2, 50),
        ];
        for ordered in [batch.clone(), batch.into_iter().rev().collect::<Vec<_>>()] {
            let (store, run_id) = store_with_run().await;
            let materializer = Materializer::new(store.clone(), false);
            assert_eq!(materializer.merge_batch(&run_id, &ordered).await.unwrap(), vec!["k"]);
            let latest = store.latest_metrics(&run_id, &["k".to_string()]).await.unwrap();
            assert_eq!(latest["k"].value, 1.5);
            assert_eq!(latest["k"].step, 2);
        }
    }

    #[tokio::test]
    async fn test_stale_batch_does_not_regress_latest() {
        let (store, run_id) = store_with_run().await;
        let materializer = Materializer::new(store.clone(), false);
        materializer
            .merge_batch(&run_id, &[raw("loss", json!(0.3), 10, 0)])
            .await
            .unwrap();
        let written = materializer
            .merge_batch(&run_id, &[raw("loss", json!(0.9), 4, 0), raw("acc", json!(0.7), 4, 0)])
            .await
            .unwrap();
        assert_eq!(written, vec!["acc"]);
        let latest = store
            .latest_metrics(&run_id, &["loss".to_string()])
            .await
            .unwrap();
        assert_eq!(latest["loss"].step, 10);
        assert_eq!(store.counts().await.metric_samples, 3);
    }

    #[tokio::test]
    async fn test_nan_sample_stored_with_flag() {
        let (store, run_id) = store_with_run().await;
        Materializer::new(store.clone(), true)
            .merge_batch(&run_id, &[raw("loss", json!("NaN"), 0, 0)])
            .await
            .unwrap();
        let latest = store
            .latest_metrics(&run_id, &["loss".to_string()])
            .await
            .unwrap();
        assert!(latest["loss"].is_nan);
        assert_eq!(latest["loss"].value, 0.0);
    }

    #[tokio::test]
    async fn test_invalid_value_rejects_whole_batch() {
        let (store, run_id) = store_with_run().await;
        let err = Materializer::new(store.clone(), false)
            .merge_batch(&run_id, &[raw("a", json!(1), 0, 0), raw("b", json!("x"), 0, 0)])
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::Query(_)));
        assert_eq!(store.counts().await.metric_samples, 0);
    }

    #[tokio::test]
    async fn test_latest_write_failure_names_run_and_keys() {
        let inner = MemoryStore::new();
        let run_id = inner.create_run(NewRun::default()).await.unwrap().info.run_uuid;
        let store: Arc<dyn Store> = Arc::new(ReadOnlyLatest { inner });

        for strict in [false, true] {
            let err = Materializer::new(store.clone(), strict)
                .merge_batch(&run_id, &[raw("loss", json!(0.5), 1, 0)])
                .await
                .unwrap_err();
            let HubError::Store(StoreError::Backend { context, message }) = &err else {
                panic!("expected backend error, got {:?}", err);
            };
            assert_eq!(context, &format!("run {} metrics [\"loss\"]", run_id));
            assert_eq!(message, "disk full");

            let api = ApiError::from(err);
            assert_eq!(api.error_code, ErrorCode::InternalError);
            assert!(api.message.contains(&run_id));
            assert!(api.message.contains("loss"));
        }
        // The raw series is appended before the latest-value write fails.
        assert_eq!(store.counts().await.metric_samples, 2);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn prop_local_winner_is_order_independent(
            points in proptest::collection::vec((0i64..4, 0i64..4, -2.0f64..2.0), 1..20),
            seed in any::<u64>(),
        ) {
            let samples: Vec<MetricSample> = points
                .iter()
                .map(|(step, ts, v)| MetricSample {
                    key: "k".into(),
                    point: MetricPoint::new(*v, *step, *ts),
                })
                .collect();
            let mut shuffled = samples.clone();
            let len = shuffled.len();
            shuffled.rotate_left((seed as usize) % len);
            shuffled.reverse();
            prop_assert_eq!(local_winners(&samples), local_winners(&shuffled));
        }
    }
}
