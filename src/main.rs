//! # Runner — Core Test-Execution Engine of the API Test Platform
//!
//! This is the **entry point** of the engine: the CLI surface a developer
//! or a CI job drives directly, and the same surface the out-of-scope REST
//! admin layer (§1) would sit in front of in a full deployment.
//!
//! ## What this file does
//!
//! 1. Parses CLI arguments with `clap`.
//! 2. Loads a JSON fixture (`ApiConfig`s, globals, connection configs,
//!    scheduled tasks) into an in-memory [`Repository`].
//! 3. Initializes telemetry (OpenTelemetry, same as before).
//! 4. Dispatches to the Per-API Pipeline, the Batch Runner, the Scheduler,
//!    or the Load Driver depending on the subcommand.
//! 5. Prints the resulting `TestReport`/`TestResult` JSON (or writes it to
//!    `--output`).
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           main.rs (CLI)                          │
//! └───────────────────────────────┬─────────────────────────────────┘
//!          ┌──────────────┬───────┼────────┬──────────────┐
//!          ▼              ▼       ▼        ▼              ▼
//!    ┌──────────┐   ┌──────────┐ ┌──────┐ ┌──────────┐ ┌───────────┐
//!    │ loader/  │   │ pipeline/│ │batch/│ │scheduler/│ │ loadtest/ │
//!    │ (fixture)│   │ (§4.H)   │ │(§4.I)│ │ (§4.J)   │ │  (§4.K)   │
//!    └──────────┘   └──────────┘ └──────┘ └──────────┘ └───────────┘
//! ```

mod assertions;
mod batch;
mod crypto;
mod db;
mod errors;
mod extract;
mod http;
mod limits;
mod loader;
mod mailer;
mod model;
mod pipeline;
mod redis_unit;
mod repository;
mod scheduler;
mod telemetry;
mod variables;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info, Level};

use batch::BatchRunner;
use loader::{load_fixture_from_file, repository_from_fixture};
use loadtest::LoadDriver;
use mailer::NoopMailer;
use pipeline::Pipeline;
use repository::{InMemoryRepository, Repository};
use scheduler::Scheduler;
use telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig};
use variables::VariableStore;

mod loadtest;

#[derive(Parser)]
#[command(name = "runner")]
#[command(about = "API test platform core engine: pipeline, batch runner, scheduler, load driver", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enables OpenTelemetry OTLP export. Uses `OTEL_EXPORTER_OTLP_ENDPOINT`
    /// or `--otel-endpoint` when set.
    #[arg(long, global = true, default_value = "false")]
    otel: bool,

    #[arg(long, global = true)]
    otel_endpoint: Option<String>,

    #[arg(long, short = 'v', global = true, default_value = "false")]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Runs a single API once (or `repeat_count` times), mirroring
    /// `POST /apis/{id}/run` (§6).
    RunApi {
        /// JSON fixture file with `apis`/`globals`/`databases`/`redis`.
        #[arg(short, long)]
        file: PathBuf,
        /// The `ApiConfig.id` to run.
        #[arg(long)]
        id: i64,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Runs an ordered batch of APIs into one `TestReport`, mirroring
    /// `POST /run/batch` (§6), but synchronously rather than backgrounded.
    RunBatch {
        #[arg(short, long)]
        file: PathBuf,
        /// Comma-separated API ids, in the order to attempt (actual order
        /// used is `(sort_order, id)` per §4.I).
        #[arg(long, value_delimiter = ',')]
        ids: Vec<i64>,
        #[arg(long)]
        report_name: Option<String>,
        #[arg(long, default_value = "false")]
        stop_on_failure: bool,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Scheduler operations (§4.J).
    Scheduler {
        #[command(subcommand)]
        action: SchedulerAction,
    },

    /// Load-test driver operations (§4.K).
    Loadtest {
        #[command(subcommand)]
        action: LoadtestAction,
    },

    /// Hidden worker entry point: re-invoked by `LoadDriver::start` as a
    /// child process. Not meant to be run directly by a user.
    #[command(hide = true)]
    LoadtestWorker {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        status: PathBuf,
        #[arg(long)]
        result: PathBuf,
    },
}

#[derive(Subcommand)]
enum SchedulerAction {
    /// Loads every `active` scheduled task from the fixture and fires
    /// `task_id` once immediately (`trigger_now`, §4.J), synchronously.
    RunOnce {
        #[arg(short, long)]
        file: PathBuf,
        #[arg(long)]
        task_id: i64,
    },
}

#[derive(Subcommand)]
enum LoadtestAction {
    Start {
        #[arg(short, long)]
        file: PathBuf,
        #[arg(long)]
        task_id: String,
        #[arg(long, value_delimiter = ',')]
        ids: Vec<i64>,
        #[arg(long, default_value = "10")]
        users: u32,
        #[arg(long, default_value = "2.0")]
        spawn_rate: f64,
        #[arg(long)]
        duration_secs: Option<u64>,
    },
    Status {
        #[arg(long)]
        task_id: String,
    },
    Stop {
        #[arg(long)]
        task_id: String,
    },
    Collect {
        #[arg(short, long)]
        file: PathBuf,
        #[arg(long)]
        task_id: String,
        #[arg(long)]
        report_name: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut telemetry_config = TelemetryConfig::from_env();
    telemetry_config.log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    if cli.otel {
        if let Some(endpoint) = &cli.otel_endpoint {
            telemetry_config.otlp_endpoint = Some(endpoint.clone());
        } else if telemetry_config.otlp_endpoint.is_none() {
            telemetry_config.otlp_endpoint = Some("http://localhost:4317".to_string());
        }
    }
    if let Err(e) = init_telemetry(telemetry_config) {
        eprintln!("Warning: failed to initialize telemetry: {e}");
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }

    let exit_code = run(cli.command).await;

    shutdown_telemetry();
    std::process::exit(exit_code);
}

async fn run(command: Commands) -> i32 {
    match command {
        Commands::RunApi { file, id, output } => run_api(&file, id, output.as_deref()).await,
        Commands::RunBatch { file, ids, report_name, stop_on_failure, output } => {
            run_batch(&file, &ids, report_name.as_deref(), stop_on_failure, output.as_deref()).await
        }
        Commands::Scheduler { action } => run_scheduler_action(action).await,
        Commands::Loadtest { action } => run_loadtest_action(action).await,
        Commands::LoadtestWorker { config, status, result } => {
            match loadtest::worker::run(&config, &status, &result).await {
                Ok(()) => 0,
                Err(e) => {
                    error!(error = %e, "load-test worker failed");
                    1
                }
            }
        }
    }
}

fn load_repo(file: &PathBuf) -> Result<InMemoryRepository, i32> {
    let fixture = load_fixture_from_file(file).map_err(|e| {
        error!(error = %e, "failed to load fixture");
        1
    })?;
    Ok(repository_from_fixture(fixture))
}

fn emit(value: &impl serde::Serialize, output: Option<&std::path::Path>) {
    let json = serde_json::to_string_pretty(value).expect("result is always serializable");
    match output {
        Some(path) => {
            if let Err(e) = std::fs::write(path, &json) {
                eprintln!("failed to write output: {e}");
                println!("{json}");
            }
        }
        None => println!("{json}"),
    }
}

async fn run_api(file: &PathBuf, id: i64, output: Option<&std::path::Path>) -> i32 {
    let repo = match load_repo(file) {
        Ok(r) => r,
        Err(code) => return code,
    };
    let Ok(Some(api)) = repo.get_api(id).await else {
        error!(api_id = id, "API not found in fixture");
        return 1;
    };

    let pipeline = Pipeline::new();
    let mut vars = VariableStore::new();
    if let Ok(globals) = repo.list_global_variables().await {
        vars.extend(globals.into_iter().map(|g| (g.name, g.value)));
    }

    info!(api_id = id, name = %api.name, "running API");
    let results = pipeline.run(&api, &mut vars, &repo).await;
    let all_passed = results.iter().all(|r| r.status == model::ResultStatus::Pass);
    emit(&results, output);
    if all_passed {
        0
    } else {
        1
    }
}

async fn run_batch(
    file: &PathBuf,
    ids: &[i64],
    report_name: Option<&str>,
    stop_on_failure: bool,
    output: Option<&std::path::Path>,
) -> i32 {
    let repo = match load_repo(file) {
        Ok(r) => r,
        Err(code) => return code,
    };

    let runner = BatchRunner::new();
    info!(api_count = ids.len(), "running batch");
    match runner.run(&repo, ids, report_name, stop_on_failure, None, None).await {
        Ok(Some(report)) => {
            let results = repo.results_for(report.id);
            emit(&serde_json::json!({ "report": report, "results": results }), output);
            if report.failed == 0 && report.error == 0 {
                0
            } else {
                1
            }
        }
        Ok(None) => {
            error!("no APIs matched the given ids");
            1
        }
        Err(e) => {
            error!(error = %e, "batch run failed");
            1
        }
    }
}

async fn run_scheduler_action(action: SchedulerAction) -> i32 {
    match action {
        SchedulerAction::RunOnce { file, task_id } => {
            let repo = match load_repo(&file) {
                Ok(r) => r,
                Err(code) => return code,
            };
            let repo: Arc<dyn Repository> = Arc::new(repo);
            let scheduler = Scheduler::new(repo, Arc::new(NoopMailer));
            match scheduler.trigger_now(task_id).await {
                Ok(()) => {
                    info!(task_id, "scheduled task triggered");
                    0
                }
                Err(e) => {
                    error!(task_id, error = %e, "failed to trigger scheduled task");
                    1
                }
            }
        }
    }
}

async fn run_loadtest_action(action: LoadtestAction) -> i32 {
    let worker_exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("runner"));
    let base_dir = limits::EngineConfig::from_env().load_test_dir;
    let driver = LoadDriver::new(base_dir, worker_exe);

    match action {
        LoadtestAction::Start { file, task_id, ids, users, spawn_rate, duration_secs } => {
            let repo = match load_repo(&file) {
                Ok(r) => r,
                Err(code) => return code,
            };
            match driver.start(&repo, &task_id, &ids, users, spawn_rate, duration_secs).await {
                Ok(pid) => {
                    println!("{}", serde_json::json!({ "task_id": task_id, "pid": pid }));
                    0
                }
                Err(e) => {
                    error!(error = %e, "failed to start load test");
                    1
                }
            }
        }
        LoadtestAction::Status { task_id } => match driver.status(&task_id).await {
            Ok(status) => {
                emit(&status, None);
                0
            }
            Err(e) => {
                error!(error = %e, "failed to read load-test status");
                1
            }
        },
        LoadtestAction::Stop { task_id } => match driver.stop(&task_id).await {
            Ok(()) => 0,
            Err(e) => {
                error!(error = %e, "failed to stop load test");
                1
            }
        },
        LoadtestAction::Collect { file, task_id, report_name } => {
            let repo = match load_repo(&file) {
                Ok(r) => r,
                Err(code) => return code,
            };
            match driver.collect(&repo, &task_id, report_name.as_deref()).await {
                Ok(report) => {
                    let results = repo.results_for(report.id);
                    emit(&serde_json::json!({ "report": report, "results": results }), None);
                    0
                }
                Err(e) => {
                    error!(error = %e, "failed to collect load-test results");
                    1
                }
            }
        }
    }
}
