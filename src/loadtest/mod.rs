//! Load Driver (§4.K): spawns an isolated worker process per load-test task
//! and exchanges `config`/`status`/`result` JSON files with it.
//!
//! Grounded in `locust_runner.py`, which wrote a Locust worker script,
//! spawned it with `subprocess.Popen`, and polled `status_<id>.json` /
//! `result_<id>.json`. Per SPEC_FULL.md's Design Notes ("a separate
//! executable... rather than string-embedded source"), the worker here is
//! this same binary re-invoked with the hidden `loadtest-worker`
//! subcommand (see [`crate::loadtest::worker`]) instead of a generated
//! Python file — the three-file interchange (`config`, `status`, `result`)
//! is unchanged.

pub mod worker;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::errors::EngineError;
use crate::model::{ApiConfig, ReportStatus, TestReport, TestResult};
use crate::repository::Repository;
use crate::variables::VariableStore;

/// Minimal per-step request template handed to the worker, produced by
/// substituting variables through each API once, up front (§4.K step 1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStep {
    pub name: String,
    pub method: String,
    pub url: String,
    pub headers: serde_json::Value,
    pub body: serde_json::Value,
    pub params: serde_json::Value,
    pub body_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadTestConfig {
    pub task_id: String,
    pub users: u32,
    pub spawn_rate: f64,
    /// `None` means "run until stopped"; `Some(secs)` bounds the run.
    pub duration_secs: Option<u64>,
    pub steps: Vec<WorkerStep>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Starting,
    Ramping,
    Running,
    Completed,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusFile {
    pub state: WorkerState,
    pub elapsed: f64,
    pub active_users: u32,
    pub total_requests: u64,
    pub total_failures: u64,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Percentiles {
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointStat {
    pub name: String,
    pub num_requests: u64,
    pub num_failures: u64,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub percentiles: Percentiles,
    pub rps: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultFile {
    pub endpoints: Vec<EndpointStat>,
    pub aggregated: EndpointStat,
}

/// Host-visible status (§4.K "merges the child's liveness... with the
/// latest status.json and, on abnormal exit, the last 10 log lines").
#[derive(Debug, Clone, Serialize)]
pub struct LoadTestStatus {
    pub running: bool,
    pub exit_code: Option<i32>,
    pub status: Option<StatusFile>,
    pub log_tail: Vec<String>,
}

struct RunningTask {
    child: Child,
    config_path: PathBuf,
    status_path: PathBuf,
    result_path: PathBuf,
    log_path: PathBuf,
}

/// Spawns and supervises one load-test worker process per `task_id`.
pub struct LoadDriver {
    base_dir: PathBuf,
    tasks: Arc<Mutex<HashMap<String, RunningTask>>>,
    worker_exe: PathBuf,
}

impl LoadDriver {
    /// `base_dir` is the `<tmp>/locust_presstest/` directory (§6) this
    /// driver writes its per-task files under. `worker_exe` is the
    /// executable re-invoked with `loadtest-worker` (normally
    /// `std::env::current_exe()`).
    pub fn new(base_dir: PathBuf, worker_exe: PathBuf) -> Self {
        Self { base_dir, tasks: Arc::new(Mutex::new(HashMap::new())), worker_exe }
    }

    /// Materializes `api_ids` into [`WorkerStep`]s via the repository and
    /// the current global-variable snapshot, then spawns a worker process
    /// for `task_id`. Returns the child's pid.
    pub async fn start(
        &self,
        repo: &dyn Repository,
        task_id: &str,
        api_ids: &[i64],
        users: u32,
        spawn_rate: f64,
        duration_secs: Option<u64>,
    ) -> Result<u32, EngineError> {
        let apis = repo.list_apis_by_ids(api_ids).await?;
        let mut vars = VariableStore::new();
        let globals = repo.list_global_variables().await?;
        vars.extend(globals.into_iter().map(|g| (g.name, g.value)));

        let steps: Vec<WorkerStep> = apis.iter().map(|api| materialize_step(api, &vars)).collect();

        let config = LoadTestConfig {
            task_id: task_id.to_string(),
            users,
            spawn_rate,
            duration_secs,
            steps,
        };

        tokio::fs::create_dir_all(&self.base_dir)
            .await
            .map_err(|e| EngineError::worker(format!("cannot create load-test dir: {e}")))?;

        let config_path = self.base_dir.join(format!("config_{task_id}.json"));
        let status_path = self.base_dir.join(format!("status_{task_id}.json"));
        let result_path = self.base_dir.join(format!("result_{task_id}.json"));
        let log_path = self.base_dir.join(format!("log_{task_id}.txt"));

        let config_json = serde_json::to_string_pretty(&config)
            .map_err(|e| EngineError::worker(format!("cannot serialize load-test config: {e}")))?;
        tokio::fs::write(&config_path, config_json)
            .await
            .map_err(|e| EngineError::worker(format!("cannot write config file: {e}")))?;

        let initial_status = StatusFile {
            state: WorkerState::Starting,
            elapsed: 0.0,
            active_users: 0,
            total_requests: 0,
            total_failures: 0,
            error: None,
        };
        tokio::fs::write(&status_path, serde_json::to_string(&initial_status).unwrap_or_default())
            .await
            .map_err(|e| EngineError::worker(format!("cannot write status file: {e}")))?;

        let log_file = std::fs::File::create(&log_path)
            .map_err(|e| EngineError::worker(format!("cannot create log file: {e}")))?;
        let log_file_err = log_file
            .try_clone()
            .map_err(|e| EngineError::worker(format!("cannot clone log file handle: {e}")))?;

        let child = Command::new(&self.worker_exe)
            .arg("loadtest-worker")
            .arg("--config")
            .arg(&config_path)
            .arg("--status")
            .arg(&status_path)
            .arg("--result")
            .arg(&result_path)
            .stdout(std::process::Stdio::from(log_file))
            .stderr(std::process::Stdio::from(log_file_err))
            .spawn()
            .map_err(|e| EngineError::worker(format!("cannot spawn load-test worker: {e}")))?;

        let pid = child.id().unwrap_or(0);

        self.tasks.lock().await.insert(
            task_id.to_string(),
            RunningTask { child, config_path, status_path, result_path, log_path },
        );

        Ok(pid)
    }

    /// Merges process liveness with `status.json`; on abnormal exit, tails
    /// the last 10 log lines.
    pub async fn status(&self, task_id: &str) -> Result<LoadTestStatus, EngineError> {
        let mut tasks = self.tasks.lock().await;
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| EngineError::worker(format!("no running load test for task {task_id}")))?;

        let exit_code = match task.child.try_wait() {
            Ok(Some(status)) => Some(status.code().unwrap_or(-1)),
            Ok(None) => None,
            Err(_) => Some(-1),
        };
        let running = exit_code.is_none();

        let status_file = read_status_file(&task.status_path).await;

        let log_tail = if !running && exit_code != Some(0) {
            tail_log(&task.log_path, 10).await
        } else {
            Vec::new()
        };

        Ok(LoadTestStatus { running, exit_code, status: status_file, log_tail })
    }

    /// Sends a graceful termination request: this implementation asks the
    /// worker to stop by writing a `.stop` sentinel file next to its config
    /// (the worker's loop polls for it between steps), giving it up to 15s
    /// (§5 "up to 15s to drain its worker pool") before a hard kill.
    pub async fn stop(&self, task_id: &str) -> Result<(), EngineError> {
        let mut tasks = self.tasks.lock().await;
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| EngineError::worker(format!("no running load test for task {task_id}")))?;

        let stop_sentinel = task.config_path.with_extension("stop");
        let _ = tokio::fs::write(&stop_sentinel, b"stop").await;

        let drained = tokio::time::timeout(Duration::from_secs(15), task.child.wait()).await;
        if drained.is_err() {
            let _ = task.child.start_kill();
        }
        Ok(())
    }

    /// Reads `result.json` and builds a [`TestReport`] plus one
    /// [`TestResult`] per endpoint, with that endpoint's stats serialized
    /// into `request_body` (§4.K).
    pub async fn collect(
        &self,
        repo: &dyn Repository,
        task_id: &str,
        report_name: Option<&str>,
    ) -> Result<TestReport, EngineError> {
        let result_path = {
            let tasks = self.tasks.lock().await;
            tasks
                .get(task_id)
                .map(|t| t.result_path.clone())
                .unwrap_or_else(|| self.base_dir.join(format!("result_{task_id}.json")))
        };

        let bytes = tokio::fs::read(&result_path)
            .await
            .map_err(|e| EngineError::worker(format!("cannot read result file: {e}")))?;
        let result: ResultFile = serde_json::from_slice(&bytes)
            .map_err(|e| EngineError::worker(format!("cannot parse result file: {e}")))?;

        let name = report_name
            .map(str::to_string)
            .unwrap_or_else(|| format!("loadtest-{task_id}"));
        let total = result.aggregated.num_requests as u32;
        let failed = result.aggregated.num_failures as u32;
        let passed = total.saturating_sub(failed);

        let mut report = repo.create_running_report(&name, total).await?;
        report.passed = passed;
        report.failed = failed;
        report.status = ReportStatus::Completed;
        repo.finalize_report(&report).await?;

        for endpoint in &result.endpoints {
            let test_result = TestResult {
                id: 0,
                report_id: report.id,
                api_id: None,
                api_name: endpoint.name.clone(),
                url: String::new(),
                method: String::new(),
                use_async: false,
                request_headers: String::new(),
                request_params: String::new(),
                request_body: serde_json::to_string(endpoint).unwrap_or_default(),
                response_status: 0,
                response_headers: String::new(),
                response_body: String::new(),
                response_time_ms: endpoint.avg_ms,
                status: if endpoint.num_failures == 0 {
                    crate::model::ResultStatus::Pass
                } else {
                    crate::model::ResultStatus::Fail
                },
                error_message: String::new(),
                extracted_vars: String::new(),
                assertion_results: String::new(),
                db_assertion_results: String::new(),
                deepdiff_results: String::new(),
                pre_sql_result: String::new(),
                post_sql_result: String::new(),
                created_at: chrono::Utc::now(),
            };
            repo.save_result(test_result).await?;
        }

        Ok(report)
    }
}

fn materialize_step(api: &ApiConfig, vars: &VariableStore) -> WorkerStep {
    let url = vars.substitute(&api.url);
    let headers = vars.substitute_deep(&serde_json::Value::Object(api.parsed_headers()));
    let params = vars.substitute_deep(&serde_json::Value::Object(api.parsed_params()));
    let body = vars.substitute_deep(&api.parsed_body());
    WorkerStep {
        name: api.name.clone(),
        method: api.method.as_str().to_string(),
        url,
        headers,
        body,
        params,
        body_type: format!("{:?}", api.body_type).to_lowercase(),
    }
}

async fn read_status_file(path: &PathBuf) -> Option<StatusFile> {
    let bytes = tokio::fs::read(path).await.ok()?;
    serde_json::from_slice(&bytes).ok()
}

async fn tail_log(path: &PathBuf, lines: usize) -> Vec<String> {
    let mut contents = String::new();
    if let Ok(mut f) = tokio::fs::File::open(path).await {
        let _ = f.read_to_string(&mut contents).await;
    }
    let all: Vec<String> = contents.lines().map(str::to_string).collect();
    let start = all.len().saturating_sub(lines);
    all[start..].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BodyType, EncryptionAlgorithm, HttpMethod};

    fn sample_api() -> ApiConfig {
        ApiConfig {
            id: 1,
            name: "get-thing".to_string(),
            category_id: None,
            sort_order: 0,
            url: "http://h/{{path}}".to_string(),
            method: HttpMethod::Get,
            timeout_seconds: 30,
            headers: "{}".to_string(),
            params: "{}".to_string(),
            body: "{}".to_string(),
            body_type: BodyType::Json,
            use_session: false,
            use_async: false,
            ssl_verify: "true".to_string(),
            ssl_cert: None,
            client_cert_enabled: false,
            client_cert: None,
            client_key: None,
            encrypted: false,
            encryption_key: String::new(),
            encryption_algorithm: EncryptionAlgorithm::Aes,
            body_enc_rules: "[]".to_string(),
            extract_vars: "[]".to_string(),
            assertions: "[]".to_string(),
            deepdiff_assertions: "[]".to_string(),
            db_assertions: "[]".to_string(),
            pre_redis_rules: "[]".to_string(),
            pre_sql_db_id: None,
            pre_sql: None,
            post_sql_db_id: None,
            post_sql: None,
            repeat_enabled: false,
            repeat_count: 1,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn materialize_step_substitutes_url() {
        let mut vars = VariableStore::new();
        vars.set("path", "v1/users");
        let step = materialize_step(&sample_api(), &vars);
        assert_eq!(step.url, "http://h/v1/users");
        assert_eq!(step.method, "GET");
    }
}
