//! # Query Executor
//!
//! Drives the [`Store`] for the search endpoints. Every request is compiled
//! and validated in full before the first store call: filter text, order
//! clauses, page size and page token. The compiled filter is then conjoined
//! with the request's scope (experiment ids, lifecycle view), the ordering is
//! made total, and the store is asked for one row more than the page size so
//! a continuation is only issued when more rows exist.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tw_core::{LIFECYCLE_ACTIVE, LIFECYCLE_DELETED};
use tw_query::pagination::{validate_max_results, Direction};
use tw_query::{
    ColumnDescriptor, CompareOp, DialectHints, EntityRuleTable, ExpressionCompiler, FlatFilter,
    JoinRequirement, KeysetCursor, KeysetOrder, ListOp, Page, PageToken, Predicate, SortKey,
};

use crate::error::HubError;
use crate::store::{Experiment, LatestMetric, RowQuery, RunView, Store};

/// Which lifecycle stages a search covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViewType {
    #[default]
    ActiveOnly,
    DeletedOnly,
    All,
}

impl ViewType {
    fn predicate(self, table: &str) -> Predicate {
        let stage = ColumnDescriptor::attribute(table, "lifecycle_stage");
        match self {
            Self::ActiveOnly => Predicate::compare(stage, CompareOp::Eq, LIFECYCLE_ACTIVE),
            Self::DeletedOnly => Predicate::compare(stage, CompareOp::Eq, LIFECYCLE_DELETED),
            Self::All => Predicate::always(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunSearch {
    pub experiment_ids: Vec<i64>,
    pub filter: String,
    pub order_by: Vec<String>,
    pub max_results: Option<i64>,
    pub page_token: Option<String>,
    pub view: ViewType,
}

#[derive(Debug, Clone, Default)]
pub struct ExperimentSearch {
    pub filter: String,
    pub order_by: Vec<String>,
    pub max_results: Option<i64>,
    pub page_token: Option<String>,
    pub view: ViewType,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Progress {
    /// Rows matching the query that precede the cursor.
    pub checked: usize,
    /// Rows matching the query.
    pub total: usize,
}

#[derive(Debug, Clone)]
pub struct KeysetPage {
    pub runs: Vec<RunView>,
    pub next_cursor: Option<String>,
    pub progress: Progress,
}

#[derive(Debug, Clone, Copy)]
pub struct SearchLimits {
    pub default_max_results: usize,
    pub max_results_limit: usize,
}

pub struct Searcher {
    store: Arc<dyn Store>,
    flat: FlatFilter,
    expressions: ExpressionCompiler,
    dialect: DialectHints,
    run_rules: EntityRuleTable,
    experiment_rules: EntityRuleTable,
    limits: SearchLimits,
}

impl Searcher {
    pub fn new(
        store: Arc<dyn Store>,
        flat: FlatFilter,
        expressions: ExpressionCompiler,
        dialect: DialectHints,
        limits: SearchLimits,
    ) -> Self {
        Self {
            store,
            flat,
            expressions,
            dialect,
            run_rules: EntityRuleTable::runs(),
            experiment_rules: EntityRuleTable::experiments(),
            limits,
        }
    }

    fn page_size(&self, requested: Option<i64>) -> Result<usize, HubError> {
        Ok(validate_max_results(
            requested,
            self.limits.default_max_results,
            self.limits.max_results_limit,
        )?)
    }

    // =========================================================================
    // Flat filter searches (offset pagination)
    // =========================================================================

    pub async fn search_runs(&self, req: &RunSearch) -> Result<Page<RunView>, HubError> {
        let limit = self.page_size(req.max_results)?;
        let offset = PageToken::resolve(req.page_token.as_deref())?;
        let filter = self.flat.compile(&req.filter, &self.run_rules, self.dialect)?;
        let sort = self
            .flat
            .parse_order_by(&req.order_by, &self.run_rules)?
            .complete(&self.run_rules);

        let mut scope = req.view.predicate("runs");
        if !req.experiment_ids.is_empty() {
            scope = scope.and(Predicate::ListMembership {
                column: ColumnDescriptor::attribute("runs", "experiment_id"),
                op: ListOp::In,
                literals: req.experiment_ids.iter().map(|id| Value::from(*id)).collect(),
            });
        }
        let predicate = scope.and(filter.predicate);
        let joins = [filter.joins, sort.joins].concat();
        tracing::debug!(
            joins = joins.len(),
            depth = predicate.depth(),
            offset,
            limit,
            "searching runs"
        );

        let rows = self
            .store
            .query_runs(&RowQuery {
                predicate,
                joins,
                order: sort.keys,
                offset: offset as usize,
                limit: limit.saturating_add(1),
            })
            .await?;
        Ok(Page::from_lookahead(rows, offset, limit)?)
    }

    pub async fn search_experiments(
        &self,
        req: &ExperimentSearch,
    ) -> Result<Page<Experiment>, HubError> {
        let limit = self.page_size(req.max_results)?;
        let offset = PageToken::resolve(req.page_token.as_deref())?;
        let filter = self
            .flat
            .compile(&req.filter, &self.experiment_rules, self.dialect)?;
        let sort = self
            .flat
            .parse_order_by(&req.order_by, &self.experiment_rules)?
            .complete(&self.experiment_rules);

        let predicate = req.view.predicate("experiments").and(filter.predicate);
        let rows = self
            .store
            .query_experiments(&RowQuery {
                predicate,
                joins: [filter.joins, sort.joins].concat(),
                order: sort.keys,
                offset: offset as usize,
                limit: limit.saturating_add(1),
            })
            .await?;
        Ok(Page::from_lookahead(rows, offset, limit)?)
    }

    // =========================================================================
    // Expression searches (keyset pagination)
    // =========================================================================

    fn run_order() -> KeysetOrder {
        KeysetOrder {
            sort_column: ColumnDescriptor::attribute("runs", "start_time"),
            sort: Direction::Desc,
            tie_break_column: ColumnDescriptor::attribute("runs", "run_uuid"),
            tie_break: Direction::Desc,
        }
    }

    /// Runs matching expression `q`, newest first, resumed after `cursor`.
    pub async fn search_runs_keyset(
        &self,
        q: &str,
        tz_offset_minutes: i32,
        limit: Option<i64>,
        cursor: Option<&str>,
    ) -> Result<KeysetPage, HubError> {
        let limit = self.page_size(limit)?;
        let cursor = cursor
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(KeysetCursor::decode)
            .transpose()?;
        let compiled = self.expressions.compile(q, tz_offset_minutes)?;
        let order = Self::run_order();
        let joins: Vec<JoinRequirement> = compiled.joins;

        let total = self.store.count_runs(&compiled.predicate, &joins).await?;
        let (predicate, checked) = match &cursor {
            Some(cursor) => {
                let resume = order.resume_predicate(cursor);
                let seen = compiled.predicate.clone().and(resume.clone().negate());
                let checked = self.store.count_runs(&seen, &joins).await?;
                (compiled.predicate.and(resume), checked)
            }
            None => (compiled.predicate, 0),
        };

        let mut runs = self
            .store
            .query_runs(&RowQuery {
                predicate,
                joins,
                order: vec![
                    SortKey {
                        column: order.sort_column.clone(),
                        descending: true,
                    },
                    SortKey {
                        column: order.tie_break_column.clone(),
                        descending: true,
                    },
                ],
                offset: 0,
                limit: limit.saturating_add(1),
            })
            .await?;

        let next_cursor = if runs.len() > limit {
            runs.truncate(limit);
            runs.last().map(|last| {
                KeysetCursor {
                    sort_value: Value::from(last.info.start_time),
                    tie_break: last.info.run_uuid.clone(),
                }
                .encode()
            })
        } else {
            None
        };

        Ok(KeysetPage {
            progress: Progress {
                checked: checked + runs.len(),
                total,
            },
            runs,
            next_cursor,
        })
    }

    /// Latest metric rows matching expression `q`.
    pub async fn search_metrics(
        &self,
        q: &str,
        tz_offset_minutes: i32,
        limit: Option<i64>,
    ) -> Result<Vec<(RunView, LatestMetric)>, HubError> {
        let limit = self.page_size(limit)?;
        let compiled = self.expressions.compile(q, tz_offset_minutes)?;
        let mut query = RowQuery::all(compiled.predicate, compiled.joins);
        query.limit = limit;
        Ok(self.store.query_metrics(&query).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{Materializer, RawMetric};
    use crate::store::{MemoryStore, NewRun};
    use proptest::prelude::*;
    use std::collections::BTreeMap;
    use tw_query::{ErrorKind, FunctionRegistry, SymbolTable};

    fn searcher(store: Arc<dyn Store>) -> Searcher {
        Searcher::new(
            store,
            FlatFilter::new().unwrap(),
            ExpressionCompiler::new(SymbolTable::builtin(), FunctionRegistry::builtin())
                .with_default_filter("run.archived", "not run.archived"),
            DialectHints::sqlite(),
            SearchLimits {
                default_max_results: 1000,
                max_results_limit: 50_000,
            },
        )
    }

    /// `n` runs in experiment 0 with start times `0, 10, 20, ...`, each with
    /// `loss = i` and tag `parity`.
    async fn seeded(n: usize) -> (Arc<dyn Store>, Vec<String>) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let materializer = Materializer::new(store.clone(), false);
        let mut ids = Vec::new();
        for i in 0..n {
            let parity = if i % 2 == 0 { "even" } else { "odd" };
            let run = store
                .create_run(NewRun {
                    experiment_id: 0,
                    name: format!("run-{}", i),
                    user_id: "ana".into(),
                    start_time: 10 * i as i64,
                    tags: BTreeMap::from([("parity".to_string(), parity.to_string())]),
                })
                .await
                .unwrap();
            let id = run.info.run_uuid;
            materializer
                .merge_batch(
                    &id,
                    &[RawMetric {
                        key: "loss".into(),
                        value: Value::from(i as f64),
                        timestamp: 0,
                        step: 0,
                    }],
                )
                .await
                .unwrap();
            ids.push(id);
        }
        (store, ids)
    }

    fn names(runs: &[RunView]) -> Vec<String> {
        runs.iter().map(|r| r.info.name.clone()).collect()
    }

    #[tokio::test]
    async fn test_default_order_is_newest_first() {
        let (store, _) = seeded(3).await;
        let page = searcher(store).search_runs(&RunSearch::default()).await.unwrap();
        assert_eq!(names(&page.items), vec!["run-2", "run-1", "run-0"]);
        assert!(page.next_page_token.is_none());
    }

    #[tokio::test]
    async fn test_filter_and_order_by_metric() {
        let (store, _) = seeded(6).await;
        let page = searcher(store)
            .search_runs(&RunSearch {
                filter: "metrics.loss >= 2 AND tags.parity = 'even'".into(),
                order_by: vec!["metrics.loss ASC".into()],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(names(&page.items), vec!["run-2", "run-4"]);
    }

    #[tokio::test]
    async fn test_view_type_and_experiment_scope() {
        let (store, ids) = seeded(3).await;
        store
            .set_lifecycle_stage(&ids[0], LIFECYCLE_DELETED)
            .await
            .unwrap();
        let searcher = searcher(store);
        let active = searcher.search_runs(&RunSearch::default()).await.unwrap();
        assert_eq!(active.items.len(), 2);
        let deleted = searcher
            .search_runs(&RunSearch {
                view: ViewType::DeletedOnly,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(names(&deleted.items), vec!["run-0"]);
        let elsewhere = searcher
            .search_runs(&RunSearch {
                experiment_ids: vec![7],
                view: ViewType::All,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(elsewhere.items.is_empty());
    }

    #[tokio::test]
    async fn test_validation_happens_before_storage() {
        let (store, _) = seeded(1).await;
        let searcher = searcher(store);
        let err = searcher
            .search_runs(&RunSearch {
                max_results: Some(50_001),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::Query(e) if e.kind() == ErrorKind::InvalidMaxResults));
        let err = searcher
            .search_runs(&RunSearch {
                page_token: Some("not-a-token".into()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::Query(e) if e.kind() == ErrorKind::InvalidPageToken));
    }

    #[tokio::test]
    async fn test_experiment_search() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        for name in ["bert-a", "bert-b", "gpt"] {
            store.create_experiment(name, BTreeMap::new()).await.unwrap();
        }
        let page = searcher(store)
            .search_experiments(&ExperimentSearch {
                filter: "name LIKE 'bert%'".into(),
                order_by: vec!["name DESC".into()],
                ..Default::default()
            })
            .await
            .unwrap();
        let names: Vec<_> = page.items.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["bert-b", "bert-a"]);
    }

    #[tokio::test]
    async fn test_keyset_progress_and_resume() {
        let (store, _) = seeded(5).await;
        let searcher = searcher(store);
        let first = searcher
            .search_runs_keyset("run.metrics['loss'].last >= 1", 0, Some(2), None)
            .await
            .unwrap();
        assert_eq!(names(&first.runs), vec!["run-4", "run-3"]);
        assert_eq!(first.progress.total, 4);
        assert_eq!(first.progress.checked, 2);

        let second = searcher
            .search_runs_keyset(
                "run.metrics['loss'].last >= 1",
                0,
                Some(2),
                first.next_cursor.as_deref(),
            )
            .await
            .unwrap();
        assert_eq!(names(&second.runs), vec!["run-2", "run-1"]);
        assert_eq!(second.progress.checked, 4);
        assert!(second.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_archived_runs_hidden_unless_asked() {
        let (store, ids) = seeded(2).await;
        store
            .set_lifecycle_stage(&ids[1], LIFECYCLE_DELETED)
            .await
            .unwrap();
        let searcher = searcher(store);
        let visible = searcher.search_runs_keyset("", 0, None, None).await.unwrap();
        assert_eq!(names(&visible.runs), vec!["run-0"]);
        let archived = searcher
            .search_runs_keyset("run.archived", 0, None, None)
            .await
            .unwrap();
        assert_eq!(names(&archived.runs), vec!["run-1"]);
    }

    #[tokio::test]
    async fn test_metric_scope_search() {
        let (store, _) = seeded(3).await;
        let rows = searcher(store)
            .search_metrics("metric.name == 'loss' and metric.last > 0.5", 0, None)
            .await
            .unwrap();
        let mut runs: Vec<_> = rows.iter().map(|(r, m)| (r.info.name.clone(), m.value)).collect();
        runs.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(runs, vec![("run-1".to_string(), 1.0), ("run-2".to_string(), 2.0)]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(20))]

        #[test]
        fn prop_offset_pages_reproduce_full_result(n in 0usize..25, page in 1i64..7) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async {
                let (store, _) = seeded(n).await;
                let searcher = searcher(store);
                let full = searcher.search_runs(&RunSearch::default()).await.unwrap();

                let mut collected = Vec::new();
                let mut token = None;
                loop {
                    let page = searcher
                        .search_runs(&RunSearch {
                            max_results: Some(page),
                            page_token: token.clone(),
                            ..Default::default()
                        })
                        .await
                        .unwrap();
                    collected.extend(page.items);
                    match page.next_page_token {
                        Some(t) => token = Some(t),
                        None => break,
                    }
                }
                assert_eq!(names(&collected), names(&full.items));
            });
        }
    }
}
