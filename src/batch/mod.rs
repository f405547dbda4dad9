//! Batch Runner (§4.I): sequential execution of an ordered API list into one
//! persisted `TestReport` with per-API `TestResult` rows.
//!
//! Grounded in `executor.py`'s `run_test_batch`, which resets the Variable
//! Store, creates a `running` report, walks the ordered API list, and
//! publishes `(progress, total)` into a shared task registry when invoked as
//! a background batch (as opposed to the ad-hoc single-API run the REST
//! surface also exposes).

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;

use crate::errors::EngineError;
use crate::model::{ReportStatus, TestReport};
use crate::pipeline::Pipeline;
use crate::repository::Repository;
use crate::variables::VariableStore;

/// Progress published for a background batch, read by `GET
/// /run/batch/status/{task_id}` (§6).
#[derive(Debug, Clone)]
pub struct BatchProgress {
    pub status: BatchTaskStatus,
    pub progress: u32,
    pub total: u32,
    pub report_id: Option<i64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchTaskStatus {
    Running,
    Completed,
    Error,
}

/// The batch-task progress registry (§5 "a map under a lock"): entries are
/// created by the submitting request and read by status polls. No reaper is
/// implemented here (§5 notes one is optional); callers that want bounded
/// memory can periodically drain [`TaskRegistry::remove`].
#[derive(Default, Clone)]
pub struct TaskRegistry {
    inner: Arc<Mutex<std::collections::HashMap<String, BatchProgress>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn publish(&self, task_id: &str, progress: BatchProgress) {
        self.inner.lock().await.insert(task_id.to_string(), progress);
    }

    pub async fn get(&self, task_id: &str) -> Option<BatchProgress> {
        self.inner.lock().await.get(task_id).cloned()
    }

    pub async fn remove(&self, task_id: &str) {
        self.inner.lock().await.remove(task_id);
    }
}

/// Runs one ordered batch of APIs against a fresh Variable Store and
/// persists a `TestReport` plus one `TestResult` per executed iteration.
pub struct BatchRunner {
    pipeline: Pipeline,
}

impl Default for BatchRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchRunner {
    pub fn new() -> Self {
        Self { pipeline: Pipeline::new() }
    }

    /// Runs `api_ids` in `(sort_order, id)` order (the ordering the
    /// repository itself applies). Returns `Ok(None)` when none of the ids
    /// resolve to a stored API (§4.I: "if none, return null"). `stop_on_failure`
    /// aborts after the first non-`pass` result, never mid-request (§5).
    pub async fn run(
        &self,
        repo: &dyn Repository,
        api_ids: &[i64],
        report_name: Option<&str>,
        stop_on_failure: bool,
        task_id: Option<&str>,
        registry: Option<&TaskRegistry>,
    ) -> Result<Option<TestReport>, EngineError> {
        let apis = repo.list_apis_by_ids(api_ids).await?;
        if apis.is_empty() {
            return Ok(None);
        }

        let mut vars = VariableStore::new();
        vars.reset();
        let globals = repo.list_global_variables().await?;
        vars.extend(globals.into_iter().map(|g| (g.name, g.value)));

        let name = report_name.map(str::to_string).unwrap_or_else(default_report_name);
        let mut report = repo.create_running_report(&name, apis.len() as u32).await?;

        if let (Some(task_id), Some(registry)) = (task_id, registry) {
            registry
                .publish(
                    task_id,
                    BatchProgress {
                        status: BatchTaskStatus::Running,
                        progress: 0,
                        total: report.total,
                        report_id: Some(report.id),
                        error: None,
                    },
                )
                .await;
        }

        let started = Instant::now();
        let mut executed = 0u32;

        let run_result: Result<(), EngineError> = async {
            for api in &apis {
                let results = self.pipeline.run(api, &mut vars, repo).await;
                for result in results {
                    let mut result = result;
                    result.report_id = report.id;
                    let status = result.status;
                    repo.save_result(result).await?;
                    executed += 1;
                    match status {
                        crate::model::ResultStatus::Pass => report.passed += 1,
                        crate::model::ResultStatus::Fail => report.failed += 1,
                        crate::model::ResultStatus::Error => report.error += 1,
                    }

                    if let (Some(task_id), Some(registry)) = (task_id, registry) {
                        registry
                            .publish(
                                task_id,
                                BatchProgress {
                                    status: BatchTaskStatus::Running,
                                    progress: executed,
                                    total: report.total,
                                    report_id: Some(report.id),
                                    error: None,
                                },
                            )
                            .await;
                    }

                    if stop_on_failure && status != crate::model::ResultStatus::Pass {
                        return Ok(());
                    }
                }
            }
            Ok(())
        }
        .await;

        report.duration_seconds = round3(started.elapsed().as_secs_f64());

        if let Err(e) = run_result {
            report.status = ReportStatus::Error;
            repo.finalize_report(&report).await?;
            if let (Some(task_id), Some(registry)) = (task_id, registry) {
                registry
                    .publish(
                        task_id,
                        BatchProgress {
                            status: BatchTaskStatus::Error,
                            progress: executed,
                            total: report.total,
                            report_id: Some(report.id),
                            error: Some(e.to_string()),
                        },
                    )
                    .await;
            }
            return Err(e);
        }

        // `total` reflects how many results were actually recorded: when
        // `stop_on_failure` cut the batch short, remaining APIs never ran.
        report.total = executed;
        report.status = ReportStatus::Completed;
        repo.finalize_report(&report).await?;

        if let (Some(task_id), Some(registry)) = (task_id, registry) {
            registry
                .publish(
                    task_id,
                    BatchProgress {
                        status: BatchTaskStatus::Completed,
                        progress: executed,
                        total: report.total,
                        report_id: Some(report.id),
                        error: None,
                    },
                )
                .await;
        }

        Ok(Some(report))
    }
}

fn default_report_name() -> String {
    format!("batch-{}", chrono::Utc::now().format("%Y%m%d_%H%M%S"))
}

fn round3(secs: f64) -> f64 {
    (secs * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ApiConfig, BodyType, EncryptionAlgorithm, HttpMethod};
    use crate::repository::InMemoryRepository;

    fn unreachable_api(id: i64, sort_order: i64) -> ApiConfig {
        ApiConfig {
            id,
            name: format!("api-{id}"),
            category_id: None,
            sort_order,
            url: "http://127.0.0.1:1/unreachable".to_string(),
            method: HttpMethod::Get,
            timeout_seconds: 1,
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

    #[tokio::test]
    async fn empty_api_list_returns_none() {
        let repo = InMemoryRepository::new();
        let runner = BatchRunner::new();
        let report = runner.run(&repo, &[1, 2], None, false, None, None).await.unwrap();
        assert!(report.is_none());
    }

    #[tokio::test]
    async fn stop_on_failure_aborts_between_apis() {
        let repo = InMemoryRepository::new();
        repo.insert_api(unreachable_api(1, 0));
        repo.insert_api(unreachable_api(2, 1));
        repo.insert_api(unreachable_api(3, 2));
        let runner = BatchRunner::new();
        let report = runner
            .run(&repo, &[1, 2, 3], None, true, None, None)
            .await
            .unwrap()
            .expect("report created");
        // every unreachable_api errors, so the batch stops after api 1.
        assert_eq!(report.total, 1);
        assert_eq!(report.error, 1);
        assert_eq!(repo.results_for(report.id).len(), 1);
    }

    #[tokio::test]
    async fn counters_sum_to_total() {
        let repo = InMemoryRepository::new();
        repo.insert_api(unreachable_api(1, 0));
        repo.insert_api(unreachable_api(2, 1));
        let runner = BatchRunner::new();
        let report = runner.run(&repo, &[1, 2], None, false, None, None).await.unwrap().unwrap();
        assert_eq!(report.passed + report.failed + report.error, report.total);
        assert_eq!(report.total, 2);
    }

    #[tokio::test]
    async fn progress_is_published_to_registry() {
        let repo = InMemoryRepository::new();
        repo.insert_api(unreachable_api(1, 0));
        let runner = BatchRunner::new();
        let registry = TaskRegistry::new();
        let report = runner
            .run(&repo, &[1], None, false, Some("task-1"), Some(&registry))
            .await
            .unwrap()
            .unwrap();
        let progress = registry.get("task-1").await.expect("progress recorded");
        assert_eq!(progress.status, BatchTaskStatus::Completed);
        assert_eq!(progress.report_id, Some(report.id));
        assert_eq!(progress.progress, 1);
    }
}
