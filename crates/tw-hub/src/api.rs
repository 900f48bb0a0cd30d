//! # API Handlers
//!
//! Axum handlers for the tracking REST surface (`/api/2.0/mlflow/...`) and
//! the run explorer search (`/aim/api/runs/search/...`).
//!
//! Ids travel as strings on the wire; experiment ids must parse as integers.
//! Body and query-string decoding failures are reported as `BAD_REQUEST`.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tw_core::{LIFECYCLE_DELETED, RUN_STATUSES, SENTINEL_NAN};

use crate::error::{ApiError, ErrorCode};
use crate::metrics::RawMetric;
use crate::search::{ExperimentSearch, Progress, RunSearch, ViewType};
use crate::store::{Experiment, LatestMetric, NewRun, Run, RunUpdate, RunView};
use crate::AppState;

pub const RUN_NAME_TAG: &str = "mlflow.runName";
pub const TIMEZONE_HEADER: &str = "x-timezone-offset";

type ApiResult<T> = Result<Json<T>, ApiError>;

fn decode<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    body.map(|Json(value)| value)
        .map_err(|e| ApiError::bad_request(e.body_text()))
}

fn decode_query<T>(query: Result<Query<T>, QueryRejection>) -> Result<T, ApiError> {
    query
        .map(|Query(value)| value)
        .map_err(|e| ApiError::bad_request(e.body_text()))
}

pub fn parse_experiment_id(raw: &str) -> Result<i64, ApiError> {
    raw.trim().parse::<i64>().map_err(|_| {
        ApiError::bad_request(format!(
            "experiment_id '{}' is not a valid integer",
            raw
        ))
    })
}

/// Client UTC offset in minutes (positive west of UTC) from the
/// `x-timezone-offset` header; absent means 0.
pub fn timezone_offset(headers: &HeaderMap) -> Result<i32, ApiError> {
    match headers.get(TIMEZONE_HEADER) {
        None => Ok(0),
        Some(raw) => raw
            .to_str()
            .ok()
            .and_then(|s| s.trim().parse::<i32>().ok())
            .ok_or_else(|| ApiError::bad_request(format!("invalid {} header", TIMEZONE_HEADER))),
    }
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

fn to_map(pairs: Vec<KeyValue>) -> BTreeMap<String, String> {
    pairs.into_iter().map(|kv| (kv.key, kv.value)).collect()
}

fn from_map(map: &BTreeMap<String, String>) -> Vec<KeyValue> {
    map.iter()
        .map(|(key, value)| KeyValue {
            key: key.clone(),
            value: value.clone(),
        })
        .collect()
}

#[derive(Debug, Serialize)]
pub struct ExperimentJson {
    pub experiment_id: String,
    pub name: String,
    pub artifact_location: String,
    pub lifecycle_stage: String,
    pub creation_time: i64,
    pub last_update_time: i64,
    pub tags: Vec<KeyValue>,
}

impl From<&Experiment> for ExperimentJson {
    fn from(e: &Experiment) -> Self {
        Self {
            experiment_id: e.experiment_id.to_string(),
            name: e.name.clone(),
            artifact_location: e.artifact_location.clone(),
            lifecycle_stage: e.lifecycle_stage.clone(),
            creation_time: e.creation_time,
            last_update_time: e.last_update_time,
            tags: from_map(&e.tags),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RunInfoJson {
    pub run_id: String,
    pub run_uuid: String,
    pub run_name: String,
    pub experiment_id: String,
    pub user_id: String,
    pub status: String,
    pub start_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    pub lifecycle_stage: String,
    pub artifact_uri: String,
}

impl From<&Run> for RunInfoJson {
    fn from(run: &Run) -> Self {
        Self {
            run_id: run.run_uuid.clone(),
            run_uuid: run.run_uuid.clone(),
            run_name: run.name.clone(),
            experiment_id: run.experiment_id.to_string(),
            user_id: run.user_id.clone(),
            status: run.status.clone(),
            start_time: run.start_time,
            end_time: run.end_time,
            lifecycle_stage: run.lifecycle_stage.clone(),
            artifact_uri: run.artifact_uri.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MetricJson {
    pub key: String,
    /// A number, or `"NaN"` for samples stored with the NaN flag.
    pub value: Value,
    pub timestamp: i64,
    pub step: i64,
}

impl From<&LatestMetric> for MetricJson {
    fn from(m: &LatestMetric) -> Self {
        Self {
            key: m.key.clone(),
            value: if m.is_nan {
                Value::from(SENTINEL_NAN)
            } else {
                Value::from(m.value)
            },
            timestamp: m.timestamp,
            step: m.step,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RunDataJson {
    pub metrics: Vec<MetricJson>,
    pub params: Vec<KeyValue>,
    pub tags: Vec<KeyValue>,
}

#[derive(Debug, Serialize)]
pub struct RunJson {
    pub info: RunInfoJson,
    pub data: RunDataJson,
}

impl From<&RunView> for RunJson {
    fn from(view: &RunView) -> Self {
        Self {
            info: RunInfoJson::from(&view.info),
            data: RunDataJson {
                metrics: view.metrics.iter().map(MetricJson::from).collect(),
                params: from_map(&view.params),
                tags: from_map(&view.tags),
            },
        }
    }
}

// =============================================================================
// Experiments
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateExperimentRequest {
    pub name: String,
    #[serde(default)]
    pub tags: Vec<KeyValue>,
}

pub async fn create_experiment(
    State(state): State<Arc<AppState>>,
    body: Result<Json<CreateExperimentRequest>, JsonRejection>,
) -> ApiResult<Value> {
    let req = decode(body)?;
    if req.name.trim().is_empty() {
        return Err(ApiError::new(
            ErrorCode::InvalidParameterValue,
            "experiment name must not be empty",
        ));
    }
    let experiment = state
        .store
        .create_experiment(&req.name, to_map(req.tags))
        .await?;
    tracing::info!(id = experiment.experiment_id, name = %experiment.name, "created experiment");
    Ok(Json(json!({ "experiment_id": experiment.experiment_id.to_string() })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SearchExperimentsRequest {
    pub filter: String,
    pub max_results: Option<i64>,
    pub order_by: Vec<String>,
    pub page_token: Option<String>,
    pub view_type: ViewType,
}

#[derive(Debug, Serialize)]
pub struct SearchExperimentsResponse {
    pub experiments: Vec<ExperimentJson>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
}

pub async fn search_experiments(
    State(state): State<Arc<AppState>>,
    body: Result<Json<SearchExperimentsRequest>, JsonRejection>,
) -> ApiResult<SearchExperimentsResponse> {
    let req = decode(body)?;
    let page = state
        .searcher
        .search_experiments(&ExperimentSearch {
            filter: req.filter,
            order_by: req.order_by,
            max_results: req.max_results,
            page_token: req.page_token,
            view: req.view_type,
        })
        .await?;
    Ok(Json(SearchExperimentsResponse {
        experiments: page.items.iter().map(ExperimentJson::from).collect(),
        next_page_token: page.next_page_token,
    }))
}

// =============================================================================
// Runs
// =============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CreateRunRequest {
    pub experiment_id: String,
    pub user_id: String,
    pub run_name: Option<String>,
    pub start_time: Option<i64>,
    pub tags: Vec<KeyValue>,
}

pub async fn create_run(
    State(state): State<Arc<AppState>>,
    body: Result<Json<CreateRunRequest>, JsonRejection>,
) -> ApiResult<Value> {
    let req = decode(body)?;
    let experiment_id = if req.experiment_id.is_empty() {
        0
    } else {
        parse_experiment_id(&req.experiment_id)?
    };
    let mut tags = to_map(req.tags);
    let name = match req.run_name.filter(|n| !n.is_empty()) {
        Some(name) => name,
        None => tags.get(RUN_NAME_TAG).cloned().unwrap_or_default(),
    };
    if !name.is_empty() {
        tags.insert(RUN_NAME_TAG.to_string(), name.clone());
    }

    let view = state
        .store
        .create_run(NewRun {
            experiment_id,
            name,
            user_id: req.user_id,
            start_time: req
                .start_time
                .unwrap_or_else(|| chrono::Utc::now().timestamp_millis()),
            tags,
        })
        .await?;
    tracing::info!(run_id = %view.info.run_uuid, experiment_id, "created run");
    Ok(Json(json!({ "run": RunJson::from(&view) })))
}

#[derive(Debug, Deserialize)]
pub struct RunIdQuery {
    pub run_id: String,
}

pub async fn get_run(
    State(state): State<Arc<AppState>>,
    query: Result<Query<RunIdQuery>, QueryRejection>,
) -> ApiResult<Value> {
    let RunIdQuery { run_id } = decode_query(query)?;
    let view = state.store.get_run(&run_id).await?;
    Ok(Json(json!({ "run": RunJson::from(&view) })))
}

#[derive(Debug, Deserialize)]
pub struct UpdateRunRequest {
    pub run_id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub end_time: Option<i64>,
    #[serde(default)]
    pub run_name: Option<String>,
}

pub async fn update_run(
    State(state): State<Arc<AppState>>,
    body: Result<Json<UpdateRunRequest>, JsonRejection>,
) -> ApiResult<Value> {
    let req = decode(body)?;
    if let Some(status) = &req.status {
        if !RUN_STATUSES.contains(&status.as_str()) {
            return Err(ApiError::new(
                ErrorCode::InvalidParameterValue,
                format!(
                    "invalid run status '{}'. Valid values are {:?}",
                    status, RUN_STATUSES
                ),
            ));
        }
    }
    let run = state
        .store
        .update_run(
            &req.run_id,
            RunUpdate {
                status: req.status,
                end_time: req.end_time,
                name: req.run_name.filter(|n| !n.is_empty()),
            },
        )
        .await?;
    Ok(Json(json!({ "run_info": RunInfoJson::from(&run) })))
}

#[derive(Debug, Deserialize)]
pub struct DeleteRunRequest {
    pub run_id: String,
}

pub async fn delete_run(
    State(state): State<Arc<AppState>>,
    body: Result<Json<DeleteRunRequest>, JsonRejection>,
) -> ApiResult<Value> {
    let req = decode(body)?;
    state
        .store
        .set_lifecycle_stage(&req.run_id, LIFECYCLE_DELETED)
        .await?;
    tracing::info!(run_id = %req.run_id, "archived run");
    Ok(Json(json!({})))
}

// =============================================================================
// Logging
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct LogMetricRequest {
    pub run_id: String,
    #[serde(flatten)]
    pub metric: RawMetric,
}

pub async fn log_metric(
    State(state): State<Arc<AppState>>,
    body: Result<Json<LogMetricRequest>, JsonRejection>,
) -> ApiResult<Value> {
    let req = decode(body)?;
    state
        .materializer
        .merge_batch(&req.run_id, std::slice::from_ref(&req.metric))
        .await?;
    Ok(Json(json!({})))
}

#[derive(Debug, Deserialize)]
pub struct LogBatchRequest {
    pub run_id: String,
    #[serde(default)]
    pub metrics: Vec<RawMetric>,
    #[serde(default)]
    pub params: Vec<KeyValue>,
    #[serde(default)]
    pub tags: Vec<KeyValue>,
}

/// Metrics are validated before anything is written, so a bad value
/// leaves params and tags untouched too.
pub async fn log_batch(
    State(state): State<Arc<AppState>>,
    body: Result<Json<LogBatchRequest>, JsonRejection>,
) -> ApiResult<Value> {
    let req = decode(body)?;
    for metric in &req.metrics {
        metric.parse()?;
    }
    if !req.params.is_empty() {
        state.store.log_params(&req.run_id, to_map(req.params)).await?;
    }
    if !req.tags.is_empty() {
        state.store.set_tags(&req.run_id, to_map(req.tags)).await?;
    }
    state
        .materializer
        .merge_batch(&req.run_id, &req.metrics)
        .await?;
    Ok(Json(json!({})))
}

// =============================================================================
// Flat filter search
// =============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SearchRunsRequest {
    pub experiment_ids: Vec<String>,
    pub filter: String,
    pub run_view_type: ViewType,
    pub max_results: Option<i64>,
    pub order_by: Vec<String>,
    pub page_token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SearchRunsResponse {
    pub runs: Vec<RunJson>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
}

pub async fn search_runs(
    State(state): State<Arc<AppState>>,
    body: Result<Json<SearchRunsRequest>, JsonRejection>,
) -> ApiResult<SearchRunsResponse> {
    let req = decode(body)?;
    let experiment_ids = req
        .experiment_ids
        .iter()
        .map(|id| parse_experiment_id(id))
        .collect::<Result<Vec<_>, _>>()?;
    let page = state
        .searcher
        .search_runs(&RunSearch {
            experiment_ids,
            filter: req.filter,
            order_by: req.order_by,
            max_results: req.max_results,
            page_token: req.page_token,
            view: req.run_view_type,
        })
        .await?;
    Ok(Json(SearchRunsResponse {
        runs: page.items.iter().map(RunJson::from).collect(),
        next_page_token: page.next_page_token,
    }))
}

// =============================================================================
// Expression search
// =============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ExpressionSearchParams {
    pub q: String,
    pub limit: Option<i64>,
    pub cursor: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ExpressionRunsResponse {
    pub runs: Vec<RunJson>,
    pub progress: Progress,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

pub async fn search_runs_expression(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    params: Result<Query<ExpressionSearchParams>, QueryRejection>,
) -> ApiResult<ExpressionRunsResponse> {
    let params = decode_query(params)?;
    let tz = timezone_offset(&headers)?;
    let page = state
        .searcher
        .search_runs_keyset(&params.q, tz, params.limit, params.cursor.as_deref())
        .await?;
    Ok(Json(ExpressionRunsResponse {
        runs: page.runs.iter().map(RunJson::from).collect(),
        progress: page.progress,
        next_cursor: page.next_cursor,
    }))
}

#[derive(Debug, Serialize)]
pub struct MetricRowJson {
    pub run: RunInfoJson,
    pub metric: MetricJson,
}

pub async fn search_metrics_expression(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    params: Result<Query<ExpressionSearchParams>, QueryRejection>,
) -> ApiResult<Vec<MetricRowJson>> {
    let params = decode_query(params)?;
    let tz = timezone_offset(&headers)?;
    let rows = state
        .searcher
        .search_metrics(&params.q, tz, params.limit)
        .await?;
    Ok(Json(
        rows.iter()
            .map(|(run, metric)| MetricRowJson {
                run: RunInfoJson::from(&run.info),
                metric: MetricJson::from(metric),
            })
            .collect(),
    ))
}
