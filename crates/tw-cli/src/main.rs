//! # tw-cli — The Console of TRACKWELL
//!
//! Minimal client for the tracking server.
//!
//! - `tw search-runs --filter "metrics.loss < 0.1"` — flat filter search.
//! - `tw query "run.metrics['loss'].last < 0.1"` — expression search.
//! - `tw log-metric <run> loss NaN` — log one sample.
//! - `tw hub` — launch the server.

use std::process::Command;

use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tabled::{Table, Tabled};

/// 📈 TRACKWELL — experiment tracking with a searchable run history.
#[derive(Parser)]
#[command(name = "tw", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch the tracking server.
    Hub {
        /// Server bind address.
        #[arg(long, default_value = "0.0.0.0:5000")]
        bind: String,

        /// Path to the server config file.
        #[arg(long, default_value = "tw-hub.toml")]
        config: String,
    },

    /// Run Kani formal verification proofs.
    Verify,

    /// Report server status as JSON.
    Status,

    /// Search runs with a flat filter (`metrics.loss < 0.1 AND tags.team = 'x'`).
    SearchRuns {
        #[arg(long, default_value = "")]
        filter: String,
        /// Experiment ids; all experiments when omitted.
        #[arg(long = "experiment-id")]
        experiment_ids: Vec<String>,
        /// Order clauses, e.g. `metrics.loss ASC`.
        #[arg(long = "order-by")]
        order_by: Vec<String>,
        #[arg(long)]
        max_results: Option<i64>,
        /// ACTIVE_ONLY, DELETED_ONLY or ALL.
        #[arg(long, default_value = "ACTIVE_ONLY")]
        view: String,
        /// Follow page tokens until exhausted.
        #[arg(long)]
        all: bool,
    },

    /// Search experiments with a flat filter.
    SearchExperiments {
        #[arg(long, default_value = "")]
        filter: String,
        #[arg(long = "order-by")]
        order_by: Vec<String>,
        #[arg(long)]
        max_results: Option<i64>,
        #[arg(long)]
        all: bool,
    },

    /// Search runs with an expression, following cursors to the end.
    Query {
        query: String,
        /// Page size per request.
        #[arg(long)]
        limit: Option<i64>,
        /// UTC offset in minutes, positive west of UTC, used by `datetime(...)`.
        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        tz_offset: i32,
    },

    CreateExperiment {
        name: String,
    },

    CreateRun {
        #[arg(long, default_value = "0")]
        experiment_id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long, default_value = "")]
        user: String,
    },

    /// Log one metric sample. VALUE may be a number, NaN, Infinity or -Infinity.
    LogMetric {
        run_id: String,
        key: String,
        #[arg(allow_hyphen_values = true)]
        value: String,
        #[arg(long, default_value_t = 0)]
        step: i64,
        /// Milliseconds since the epoch; now when omitted.
        #[arg(long)]
        timestamp: Option<i64>,
    },
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Hub { bind, config } => {
            eprintln!("📈 TRACKWELL: Launching tracking server...");
            eprintln!("   Bind:   {}", bind);
            eprintln!("   Config: {}", config);
            eprintln!();

            let status = Command::new("cargo")
                .args(["run", "-p", "tw-hub", "--", "--bind", &bind, "--config", &config])
                .status();

            match status {
                Ok(s) if s.success() => {}
                Ok(s) => {
                    eprintln!("Hub exited with: {}", s);
                    std::process::exit(1);
                }
                Err(e) => {
                    eprintln!("Failed to launch hub: {}", e);
                    std::process::exit(1);
                }
            }
        }

        Commands::Verify => {
            eprintln!("📈 TRACKWELL: Running formal verification...");
            eprintln!("   Tool: Kani Model Checker");
            eprintln!("   Target: tw-verify (latest-value ordering proofs)");
            eprintln!();

            let status = Command::new("cargo")
                .args(["kani", "--package", "tw-verify"])
                .status();

            match status {
                Ok(status) if status.success() => {
                    eprintln!("   ✅ tw-verify: ALL PROOFS PASSED");
                }
                Ok(_) => {
                    eprintln!("   ❌ tw-verify: PROOF FAILURE");
                    std::process::exit(1);
                }
                Err(e) => {
                    eprintln!("   ⚠️  Kani not found: {}", e);
                    eprintln!("   Install with: cargo install kani-verifier && cargo kani setup");
                    std::process::exit(1);
                }
            }
        }

        // Async Commands
        cmd => {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    eprintln!("Failed to build tokio runtime: {}", e);
                    std::process::exit(1);
                }
            };

            if let Err(e) = rt.block_on(async_main(cmd)) {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
    }
}

// =============================================================================
// HTTP
// =============================================================================

struct Client {
    http: reqwest::Client,
    base_url: String,
}

impl Client {
    fn from_env() -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: std::env::var("TW_BASE_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:5000".to_string()),
        }
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Value, String> {
        let request = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .query(query);
        Self::send(request).await
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value, String> {
        let request = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .json(body);
        Self::send(request).await
    }

    async fn send(request: reqwest::RequestBuilder) -> Result<Value, String> {
        let response = request.send().await.map_err(|e| e.to_string())?;
        let status = response.status();
        let body: Value = response.json().await.map_err(|e| e.to_string())?;
        if status.is_success() {
            Ok(body)
        } else {
            Err(describe_error(status.as_u16(), &body))
        }
    }
}

fn describe_error(status: u16, body: &Value) -> String {
    match (body["error_code"].as_str(), body["message"].as_str()) {
        (Some(code), Some(message)) => format!("{} ({}): {}", code, status, message),
        _ => format!("HTTP {}: {}", status, body),
    }
}

fn print_json(value: &Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
}

// =============================================================================
// Rendering
// =============================================================================

#[derive(Tabled)]
struct RunRow {
    run_id: String,
    name: String,
    status: String,
    started: String,
    metrics: String,
}

#[derive(Tabled)]
struct ExperimentRow {
    experiment_id: String,
    name: String,
    lifecycle_stage: String,
    created: String,
}

fn format_millis(ms: Option<i64>) -> String {
    ms.and_then(chrono::DateTime::from_timestamp_millis)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default()
}

fn run_row(run: &Value) -> RunRow {
    let info = &run["info"];
    let metrics = run["data"]["metrics"]
        .as_array()
        .map(|metrics| {
            metrics
                .iter()
                .map(|m| format!("{}={}", m["key"].as_str().unwrap_or_default(), m["value"]))
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default();
    RunRow {
        run_id: info["run_id"].as_str().unwrap_or_default().to_string(),
        name: info["run_name"].as_str().unwrap_or_default().to_string(),
        status: info["status"].as_str().unwrap_or_default().to_string(),
        started: format_millis(info["start_time"].as_i64()),
        metrics,
    }
}

fn experiment_row(experiment: &Value) -> ExperimentRow {
    ExperimentRow {
        experiment_id: experiment["experiment_id"]
            .as_str()
            .unwrap_or_default()
            .to_string(),
        name: experiment["name"].as_str().unwrap_or_default().to_string(),
        lifecycle_stage: experiment["lifecycle_stage"]
            .as_str()
            .unwrap_or_default()
            .to_string(),
        created: format_millis(experiment["creation_time"].as_i64()),
    }
}

/// Wire value for a metric argument: sentinels pass through as strings.
fn metric_value(raw: &str) -> Result<Value, String> {
    let raw = raw.trim();
    if tw_core::WireValue::from_sentinel(raw).is_some() {
        return Ok(Value::from(raw));
    }
    match raw.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(Value::from(v)),
        _ => Err(format!(
            "invalid metric value '{}': expected a number, {}, {} or {}",
            raw,
            tw_core::SENTINEL_NAN,
            tw_core::SENTINEL_POS_INF,
            tw_core::SENTINEL_NEG_INF
        )),
    }
}

fn items<'a>(page: &'a Value, field: &str) -> &'a [Value] {
    page[field].as_array().map(Vec::as_slice).unwrap_or_default()
}

// =============================================================================
// Commands
// =============================================================================

async fn async_main(cmd: Commands) -> Result<(), String> {
    let client = Client::from_env();

    match cmd {
        Commands::Status => {
            print_json(&client.get("/api/status", &[]).await?);
        }

        Commands::SearchRuns {
            filter,
            experiment_ids,
            order_by,
            max_results,
            view,
            all,
        } => {
            let mut rows = Vec::new();
            let mut token: Option<String> = None;
            loop {
                let mut body = json!({
                    "experiment_ids": experiment_ids,
                    "filter": filter,
                    "order_by": order_by,
                    "run_view_type": view,
                });
                if let Some(max) = max_results {
                    body["max_results"] = json!(max);
                }
                if let Some(t) = &token {
                    body["page_token"] = json!(t);
                }
                let page = client.post("/api/2.0/mlflow/runs/search", &body).await?;
                rows.extend(items(&page, "runs").iter().map(run_row));
                token = page["next_page_token"].as_str().map(str::to_string);
                if !all || token.is_none() {
                    break;
                }
            }
            println!("{}", Table::new(rows));
            if let Some(t) = token {
                eprintln!("next page token: {}", t);
            }
        }

        Commands::SearchExperiments {
            filter,
            order_by,
            max_results,
            all,
        } => {
            let mut rows = Vec::new();
            let mut token: Option<String> = None;
            loop {
                let mut body = json!({ "filter": filter, "order_by": order_by });
                if let Some(max) = max_results {
                    body["max_results"] = json!(max);
                }
                if let Some(t) = &token {
                    body["page_token"] = json!(t);
                }
                let page = client
                    .post("/api/2.0/mlflow/experiments/search", &body)
                    .await?;
                rows.extend(items(&page, "experiments").iter().map(experiment_row));
                token = page["next_page_token"].as_str().map(str::to_string);
                if !all || token.is_none() {
                    break;
                }
            }
            println!("{}", Table::new(rows));
            if let Some(t) = token {
                eprintln!("next page token: {}", t);
            }
        }

        Commands::Query {
            query,
            limit,
            tz_offset,
        } => {
            let mut rows = Vec::new();
            let mut cursor: Option<String> = None;
            let mut progress = Value::Null;
            loop {
                let mut params = vec![("q", query.clone())];
                if let Some(limit) = limit {
                    params.push(("limit", limit.to_string()));
                }
                if let Some(c) = &cursor {
                    params.push(("cursor", c.clone()));
                }
                let request = client
                    .http
                    .get(format!("{}/aim/api/runs/search/run", client.base_url))
                    .header("x-timezone-offset", tz_offset.to_string())
                    .query(&params);
                let page = Client::send(request).await?;
                rows.extend(items(&page, "runs").iter().map(run_row));
                progress = page["progress"].clone();
                cursor = page["next_cursor"].as_str().map(str::to_string);
                if cursor.is_none() {
                    break;
                }
            }
            println!("{}", Table::new(rows));
            eprintln!(
                "checked {} of {} runs",
                progress["checked"], progress["total"]
            );
        }

        Commands::CreateExperiment { name } => {
            let created = client
                .post("/api/2.0/mlflow/experiments/create", &json!({ "name": name }))
                .await?;
            println!("{}", created["experiment_id"].as_str().unwrap_or_default());
        }

        Commands::CreateRun {
            experiment_id,
            name,
            user,
        } => {
            let mut body = json!({
                "experiment_id": experiment_id,
                "user_id": user,
                "start_time": chrono::Utc::now().timestamp_millis(),
            });
            if let Some(name) = name {
                body["run_name"] = json!(name);
            }
            let created = client.post("/api/2.0/mlflow/runs/create", &body).await?;
            println!(
                "{}",
                created["run"]["info"]["run_id"].as_str().unwrap_or_default()
            );
        }

        Commands::LogMetric {
            run_id,
            key,
            value,
            step,
            timestamp,
        } => {
            let body = json!({
                "run_id": run_id,
                "key": key,
                "value": metric_value(&value)?,
                "step": step,
                "timestamp": timestamp.unwrap_or_else(|| chrono::Utc::now().timestamp_millis()),
            });
            client.post("/api/2.0/mlflow/runs/log-metric", &body).await?;
            eprintln!("logged {}={} at step {}", key, value, step);
        }

        Commands::Hub { .. } | Commands::Verify => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_value_sentinels() {
        assert_eq!(metric_value("NaN").unwrap(), json!("NaN"));
        assert_eq!(metric_value("-Infinity").unwrap(), json!("-Infinity"));
        assert_eq!(metric_value("0.5").unwrap(), json!(0.5));
        assert!(metric_value("inf").is_err());
        assert!(metric_value("fast").is_err());
    }

    #[test]
    fn test_run_row_reads_wire_shape() {
        let run = json!({
            "info": {"run_id": "abc", "run_name": "warmup", "status": "RUNNING", "start_time": 0},
            "data": {"metrics": [{"key": "loss", "value": 0.25}], "params": [], "tags": []}
        });
        let row = run_row(&run);
        assert_eq!(row.run_id, "abc");
        assert_eq!(row.started, "1970-01-01 00:00:00");
        assert_eq!(row.metrics, "loss=0.25");
    }

    #[test]
    fn test_error_description() {
        let body = json!({"error_code": "BAD_REQUEST", "message": "invalid page token"});
        assert_eq!(
            describe_error(400, &body),
            "BAD_REQUEST (400): invalid page token"
        );
        assert_eq!(describe_error(502, &json!(null)), "HTTP 502: null");
    }

    #[test]
    fn test_cli_parses_negative_values() {
        let cli = Cli::parse_from(["tw", "log-metric", "r1", "loss", "-Infinity", "--step", "3"]);
        match cli.command {
            Commands::LogMetric { value, step, .. } => {
                assert_eq!(value, "-Infinity");
                assert_eq!(step, 3);
            }
            _ => panic!("expected log-metric"),
        }
    }
}
