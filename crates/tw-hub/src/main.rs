use axum::{
    extract::State,
    http::Uri,
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tw_query::pagination::{DEFAULT_MAX_RESULTS, MAX_RESULTS_LIMIT};
use tw_query::{DialectHints, ExpressionCompiler, FlatFilter, FunctionRegistry, SymbolTable};

use error::{ApiError, ErrorCode};
use metrics::Materializer;
use search::{SearchLimits, Searcher};
use store::{MemoryStore, Store, StoreCounts};

mod api;
mod error;
mod metrics;
mod search;
mod store;

// =============================================================================
// CLI
// =============================================================================

#[derive(Parser)]
#[command(
    name = "tw-hub",
    version = "0.3.0",
    about = "TRACKWELL Tracking Server"
)]
struct Args {
    /// Server bind address
    #[arg(long, default_value = "0.0.0.0:5000")]
    bind: String,

    /// Path to config file
    #[arg(long, default_value = "tw-hub.toml")]
    config: PathBuf,

    /// SQL dialect of the backing store (sqlite, postgres); overrides the config
    #[arg(long)]
    dialect: Option<String>,
}

// =============================================================================
// Config
// =============================================================================

#[derive(Deserialize, Default, Clone, Debug)]
pub(crate) struct Config {
    #[serde(default)]
    search: SearchConfig,
    #[serde(default)]
    metrics: MetricsConfig,
}

#[derive(Deserialize, Clone, Debug)]
struct SearchConfig {
    #[serde(default = "default_max_results")]
    default_max_results: usize,
    #[serde(default = "default_max_results_limit")]
    max_results_limit: usize,
    #[serde(default = "default_dialect")]
    dialect: String,
    #[serde(default = "default_expression")]
    default_expression: String,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_max_results: DEFAULT_MAX_RESULTS,
            max_results_limit: MAX_RESULTS_LIMIT,
            dialect: default_dialect(),
            default_expression: default_expression(),
        }
    }
}

#[derive(Deserialize, Clone, Debug, Default)]
struct MetricsConfig {
    #[serde(default)]
    strict_latest_merge: bool,
}

fn default_max_results() -> usize {
    DEFAULT_MAX_RESULTS
}
fn default_max_results_limit() -> usize {
    MAX_RESULTS_LIMIT
}
fn default_dialect() -> String {
    "sqlite".into()
}
fn default_expression() -> String {
    "not run.archived".into()
}

/// Queries mentioning this attribute opt out of the default expression.
const DEFAULT_EXPRESSION_GUARD: &str = "run.archived";

fn load_config(args: &Args) -> Config {
    let mut config = if args.config.exists() {
        let content = std::fs::read_to_string(&args.config).unwrap_or_default();
        toml::from_str(&content).unwrap_or_else(|e| {
            tracing::warn!("Ignoring invalid config {:?}: {}", args.config, e);
            Config::default()
        })
    } else {
        Config::default()
    };
    if let Some(dialect) = &args.dialect {
        config.search.dialect = dialect.clone();
    }
    config
}

// =============================================================================
// Application State
// =============================================================================

pub(crate) struct AppState {
    store: Arc<dyn Store>,
    searcher: Searcher,
    materializer: Materializer,
    start_time: Instant,
}

impl AppState {
    fn new(config: &Config) -> Result<Self, regex::Error> {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let mut expressions =
            ExpressionCompiler::new(SymbolTable::builtin(), FunctionRegistry::builtin());
        if !config.search.default_expression.trim().is_empty() {
            expressions = expressions
                .with_default_filter(DEFAULT_EXPRESSION_GUARD, &config.search.default_expression);
        }
        let searcher = Searcher::new(
            store.clone(),
            FlatFilter::new()?,
            expressions,
            DialectHints::named(&config.search.dialect),
            SearchLimits {
                default_max_results: config.search.default_max_results,
                max_results_limit: config.search.max_results_limit,
            },
        );
        Ok(Self {
            materializer: Materializer::new(store.clone(), config.metrics.strict_latest_merge),
            store,
            searcher,
            start_time: Instant::now(),
        })
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "tw_hub=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = load_config(&args);

    let state = match AppState::new(&config) {
        Ok(state) => Arc::new(state),
        Err(e) => {
            tracing::error!("Failed to build filter patterns: {}", e);
            std::process::exit(1);
        }
    };

    let app = Router::new()
        .route("/api/status", get(api_status))
        // Tracking
        .route(
            "/api/2.0/mlflow/experiments/create",
            post(api::create_experiment),
        )
        .route(
            "/api/2.0/mlflow/experiments/search",
            post(api::search_experiments),
        )
        .route("/api/2.0/mlflow/runs/create", post(api::create_run))
        .route("/api/2.0/mlflow/runs/get", get(api::get_run))
        .route("/api/2.0/mlflow/runs/update", post(api::update_run))
        .route("/api/2.0/mlflow/runs/delete", post(api::delete_run))
        .route("/api/2.0/mlflow/runs/log-metric", post(api::log_metric))
        .route("/api/2.0/mlflow/runs/log-batch", post(api::log_batch))
        .route("/api/2.0/mlflow/runs/search", post(api::search_runs))
        // Run explorer
        .route("/aim/api/runs/search/run", get(api::search_runs_expression))
        .route(
            "/aim/api/runs/search/metric",
            get(api::search_metrics_expression),
        )
        .fallback(endpoint_not_found)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr: SocketAddr = match args.bind.parse() {
        Ok(addr) => addr,
        Err(e) => {
            tracing::error!("Invalid bind address {:?}: {}", args.bind, e);
            std::process::exit(1);
        }
    };
    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    tracing::info!("  📈 TRACKWELL v0.3.0");
    tracing::info!("  API:        http://{}/api/2.0/mlflow", addr);
    tracing::info!("  Explorer:   http://{}/aim/api/runs/search/run", addr);
    tracing::info!("  Status:     http://{}/api/status", addr);
    tracing::info!(
        "  Search:     dialect={} max_results={}/{} default={:?}",
        config.search.dialect,
        config.search.default_max_results,
        config.search.max_results_limit,
        config.search.default_expression
    );
    tracing::info!(
        "  Metrics:    strict_latest_merge={}",
        config.metrics.strict_latest_merge
    );
    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }
}

// =============================================================================
// Core handlers
// =============================================================================

#[derive(Serialize)]
struct SystemStatus {
    version: &'static str,
    uptime_seconds: u64,
    #[serde(flatten)]
    counts: StoreCounts,
}

async fn api_status(State(state): State<Arc<AppState>>) -> Json<SystemStatus> {
    Json(SystemStatus {
        version: "0.3.0",
        uptime_seconds: state.start_time.elapsed().as_secs(),
        counts: state.store.counts().await,
    })
}

async fn endpoint_not_found(uri: Uri) -> ApiError {
    ApiError::new(
        ErrorCode::EndpointNotFound,
        format!("No endpoint registered for {}", uri.path()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_fill_missing_fields() {
        let config: Config = toml::from_str(
            r#"
            [search]
            dialect = "postgres"

            [metrics]
            strict_latest_merge = true
            "#,
        )
        .unwrap();
        assert_eq!(config.search.dialect, "postgres");
        assert_eq!(config.search.default_max_results, 1000);
        assert_eq!(config.search.max_results_limit, 1_000_000);
        assert_eq!(config.search.default_expression, "not run.archived");
        assert!(config.metrics.strict_latest_merge);
    }

    #[test]
    fn test_dialect_flag_overrides_config() {
        let args = Args::parse_from(["tw-hub", "--config", "/nonexistent.toml", "--dialect", "postgres"]);
        let config = load_config(&args);
        assert_eq!(config.search.dialect, "postgres");
        assert!(DialectHints::named(&config.search.dialect).native_ilike);
    }

    #[tokio::test]
    async fn test_status_reports_counts() {
        let state = Arc::new(AppState::new(&Config::default()).unwrap());
        let Json(status) = api_status(State(state)).await;
        assert_eq!(status.counts.experiments, 1);
        assert_eq!(status.counts.runs, 0);
    }
}
