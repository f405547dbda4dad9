//! Repository trait (§1 "out of scope... the core consumes a repository
//! interface"): the persistence collaborator this crate is built against but
//! does not implement. The admin surface, its ORM, and its migrations are
//! out of scope; this module only defines the seam and an in-memory
//! implementation used by the batch/pipeline/scheduler tests in this crate.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::errors::EngineError;
use crate::model::{
    ApiConfig, DatabaseConfig, EmailConfig, GlobalVariable, RedisConfig, ScheduledTask, TestReport,
    TestResult, VarType,
};

/// Everything the engine needs from durable storage. One async trait so both
/// a real SQL-backed adapter and the in-memory fixture used in tests satisfy
/// the same interface the Batch Runner, Scheduler, and Load Driver depend on.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn get_api(&self, id: i64) -> Result<Option<ApiConfig>, EngineError>;

    /// Fetches the given ids, ordered by `(sort_order, id)` per §4.I.
    async fn list_apis_by_ids(&self, ids: &[i64]) -> Result<Vec<ApiConfig>, EngineError>;

    async fn list_global_variables(&self) -> Result<Vec<GlobalVariable>, EngineError>;

    /// Upserts one global variable by name, used by the Redis captcha helper
    /// (§4.F `fetch_to_global`) which writes to both stores.
    async fn upsert_global_variable(&self, name: &str, value: &str, var_type: VarType) -> Result<(), EngineError>;

    async fn get_database_config(&self, id: i64) -> Result<Option<DatabaseConfig>, EngineError>;
    async fn get_redis_config(&self, id: i64) -> Result<Option<RedisConfig>, EngineError>;
    async fn list_email_configs(&self) -> Result<Vec<EmailConfig>, EngineError>;

    /// Creates a `running` report with the given total, returning its id.
    async fn create_running_report(&self, name: &str, total: u32) -> Result<TestReport, EngineError>;
    async fn save_result(&self, result: TestResult) -> Result<(), EngineError>;
    async fn finalize_report(&self, report: &TestReport) -> Result<(), EngineError>;

    async fn get_scheduled_task(&self, id: i64) -> Result<Option<ScheduledTask>, EngineError>;
    async fn list_active_scheduled_tasks(&self) -> Result<Vec<ScheduledTask>, EngineError>;
    async fn record_task_run(
        &self,
        task_id: i64,
        report_id: Option<i64>,
        result_summary: &str,
    ) -> Result<(), EngineError>;
}

/// An in-process fixture backing this crate's own tests; not meant to back a
/// real deployment (that's the out-of-scope admin surface's job).
#[derive(Default)]
pub struct InMemoryRepository {
    inner: Mutex<InMemoryState>,
}

#[derive(Default)]
struct InMemoryState {
    apis: HashMap<i64, ApiConfig>,
    globals: HashMap<String, GlobalVariable>,
    databases: HashMap<i64, DatabaseConfig>,
    redis: HashMap<i64, RedisConfig>,
    emails: Vec<EmailConfig>,
    tasks: HashMap<i64, ScheduledTask>,
    reports: Vec<TestReport>,
    results: Vec<TestResult>,
    next_report_id: i64,
    next_result_id: i64,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_api(&self, api: ApiConfig) {
        self.inner.lock().unwrap().apis.insert(api.id, api);
    }

    pub fn insert_global(&self, var: GlobalVariable) {
        self.inner.lock().unwrap().globals.insert(var.name.clone(), var);
    }

    pub fn insert_database(&self, cfg: DatabaseConfig) {
        self.inner.lock().unwrap().databases.insert(cfg.id, cfg);
    }

    pub fn insert_redis(&self, cfg: RedisConfig) {
        self.inner.lock().unwrap().redis.insert(cfg.id, cfg);
    }

    pub fn insert_task(&self, task: ScheduledTask) {
        self.inner.lock().unwrap().tasks.insert(task.id, task);
    }

    pub fn insert_email(&self, email: EmailConfig) {
        self.inner.lock().unwrap().emails.push(email);
    }

    pub fn reports(&self) -> Vec<TestReport> {
        self.inner.lock().unwrap().reports.clone()
    }

    pub fn results_for(&self, report_id: i64) -> Vec<TestResult> {
        self.inner
            .lock()
            .unwrap()
            .results
            .iter()
            .filter(|r| r.report_id == report_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn get_api(&self, id: i64) -> Result<Option<ApiConfig>, EngineError> {
        Ok(self.inner.lock().unwrap().apis.get(&id).cloned())
    }

    async fn list_apis_by_ids(&self, ids: &[i64]) -> Result<Vec<ApiConfig>, EngineError> {
        let state = self.inner.lock().unwrap();
        let mut found: Vec<ApiConfig> = ids.iter().filter_map(|id| state.apis.get(id).cloned()).collect();
        found.sort_by_key(|a| (a.sort_order, a.id));
        Ok(found)
    }

    async fn list_global_variables(&self) -> Result<Vec<GlobalVariable>, EngineError> {
        Ok(self.inner.lock().unwrap().globals.values().cloned().collect())
    }

    async fn upsert_global_variable(&self, name: &str, value: &str, var_type: VarType) -> Result<(), EngineError> {
        let mut state = self.inner.lock().unwrap();
        let now = Utc::now();
        state
            .globals
            .entry(name.to_string())
            .and_modify(|v| {
                v.value = value.to_string();
                v.updated_at = now;
            })
            .or_insert_with(|| GlobalVariable {
                id: 0,
                name: name.to_string(),
                value: value.to_string(),
                var_type,
                description: String::new(),
                created_at: now,
                updated_at: now,
            });
        Ok(())
    }

    async fn get_database_config(&self, id: i64) -> Result<Option<DatabaseConfig>, EngineError> {
        Ok(self.inner.lock().unwrap().databases.get(&id).cloned())
    }

    async fn get_redis_config(&self, id: i64) -> Result<Option<RedisConfig>, EngineError> {
        Ok(self.inner.lock().unwrap().redis.get(&id).cloned())
    }

    async fn list_email_configs(&self) -> Result<Vec<EmailConfig>, EngineError> {
        Ok(self.inner.lock().unwrap().emails.clone())
    }

    async fn create_running_report(&self, name: &str, total: u32) -> Result<TestReport, EngineError> {
        let mut state = self.inner.lock().unwrap();
        state.next_report_id += 1;
        let report = TestReport::new_running(state.next_report_id, name.to_string(), total);
        state.reports.push(report.clone());
        Ok(report)
    }

    async fn save_result(&self, mut result: TestResult) -> Result<(), EngineError> {
        let mut state = self.inner.lock().unwrap();
        state.next_result_id += 1;
        result.id = state.next_result_id;
        state.results.push(result);
        Ok(())
    }

    async fn finalize_report(&self, report: &TestReport) -> Result<(), EngineError> {
        let mut state = self.inner.lock().unwrap();
        if let Some(existing) = state.reports.iter_mut().find(|r| r.id == report.id) {
            *existing = report.clone();
        }
        Ok(())
    }

    async fn get_scheduled_task(&self, id: i64) -> Result<Option<ScheduledTask>, EngineError> {
        Ok(self.inner.lock().unwrap().tasks.get(&id).cloned())
    }

    async fn list_active_scheduled_tasks(&self) -> Result<Vec<ScheduledTask>, EngineError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .tasks
            .values()
            .filter(|t| t.status == crate::model::TaskStatus::Active)
            .cloned()
            .collect())
    }

    async fn record_task_run(
        &self,
        task_id: i64,
        report_id: Option<i64>,
        result_summary: &str,
    ) -> Result<(), EngineError> {
        let mut state = self.inner.lock().unwrap();
        if let Some(task) = state.tasks.get_mut(&task_id) {
            task.last_run_at = Some(Utc::now());
            task.last_report_id = report_id;
            task.last_result = result_summary.to_string();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BodyType, HttpMethod};

    fn sample_api(id: i64, sort_order: i64) -> ApiConfig {
        ApiConfig {
            id,
            name: format!("api-{id}"),
            category_id: None,
            sort_order,
            url: "http://example.test/v".to_string(),
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
            encryption_algorithm: crate::model::EncryptionAlgorithm::Aes,
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
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn lists_apis_ordered_by_sort_order_then_id() {
        let repo = InMemoryRepository::new();
        repo.insert_api(sample_api(2, 5));
        repo.insert_api(sample_api(1, 5));
        repo.insert_api(sample_api(3, 1));
        let apis = repo.list_apis_by_ids(&[1, 2, 3]).await.unwrap();
        assert_eq!(apis.iter().map(|a| a.id).collect::<Vec<_>>(), vec![3, 1, 2]);
    }

    #[tokio::test]
    async fn upsert_global_variable_inserts_then_updates() {
        let repo = InMemoryRepository::new();
        repo.upsert_global_variable("token", "a", VarType::String).await.unwrap();
        repo.upsert_global_variable("token", "b", VarType::String).await.unwrap();
        let vars = repo.list_global_variables().await.unwrap();
        assert_eq!(vars.len(), 1);
        assert_eq!(vars[0].value, "b");
    }
}
