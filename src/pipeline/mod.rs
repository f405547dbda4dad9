//! Per-API Pipeline (§4.H): the 12-stage transformation from one `ApiConfig`
//! into one or more `TestResult` rows (more than one when `repeat_enabled`).
//!
//! Grounded in `executor.py`'s `execute_api` / `execute_api_async`, which run
//! the same ordered stage list this module does. The DB connection cache is
//! scoped to one `run_once` call (§5: "scoped to one invocation of the
//! DB-assertion evaluator"); the Redis unit cache lives on the `Pipeline`
//! itself since a `redis::Client` is just a parsed connection URL, cheap to
//! keep around for the life of a batch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};
use tokio::sync::Mutex as AsyncMutex;

use crate::assertions;
use crate::crypto;
use crate::db::DbConnection;
use crate::errors::EngineError;
use crate::extract;
use crate::http::HttpDispatcher;
use crate::model::{ApiConfig, BodyType, DbAssertionRule, ResultStatus, TestResult};
use crate::redis_unit::RedisUnit;
use crate::repository::Repository;
use crate::variables::VariableStore;

/// Shared, reusable machinery for running API configs. One `Pipeline` is
/// created per batch (or per ad-hoc single-API run) and dropped at the end,
/// closing every cached session and connection.
pub struct Pipeline {
    http: HttpDispatcher,
    redis_cache: AsyncMutex<HashMap<i64, Arc<RedisUnit>>>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            http: HttpDispatcher::new(),
            redis_cache: AsyncMutex::new(HashMap::new()),
        }
    }

    /// Runs `api` once, or `repeat_count` times if `repeat_enabled`, against
    /// the given runtime store. Each iteration sees the variable writes of
    /// the previous one (extraction updates `vars` in place), matching
    /// "the pipeline runs repeat_count times serially with the same snapshot
    /// input" loosely — the *input* is the same API config, but extraction
    /// still threads through iterations the same way it does across APIs in
    /// one batch, since there is only one Variable Store.
    pub async fn run(&self, api: &ApiConfig, vars: &mut VariableStore, repo: &dyn Repository) -> Vec<TestResult> {
        let iterations = if api.repeat_enabled { api.effective_repeat_count() } else { 1 };
        let mut results = Vec::with_capacity(iterations as usize);
        for _ in 0..iterations {
            results.push(self.run_once(api, vars, repo).await);
        }
        results
    }

    async fn run_once(&self, api: &ApiConfig, vars: &mut VariableStore, repo: &dyn Repository) -> TestResult {
        let mut db_cache: HashMap<i64, DbConnection> = HashMap::new();

        // ---- Stage 2: pre-Redis rules -------------------------------------------------
        for rule in api.parsed_pre_redis_rules() {
            match self.redis_for(rule.redis_id, repo).await {
                Ok(unit) => match unit
                    .fetch_to_global(&rule.key, &rule.var_name, rule.extract_field.as_deref(), vars)
                    .await
                {
                    Ok(value) => {
                        let _ = repo
                            .upsert_global_variable(&rule.var_name, &value, crate::model::VarType::String)
                            .await;
                    }
                    Err(e) => {
                        tracing::warn!(redis_id = rule.redis_id, key = %rule.key, error = %e, "pre-Redis rule failed, continuing");
                    }
                },
                Err(e) => {
                    tracing::warn!(redis_id = rule.redis_id, error = %e, "pre-Redis config lookup failed, continuing");
                }
            }
        }

        // ---- Stage 3: substitution ------------------------------------------------------
        let url = vars.substitute(&api.url);
        let headers_value = vars.substitute_deep(&Value::Object(api.parsed_headers()));
        let params_value = vars.substitute_deep(&Value::Object(api.parsed_params()));
        let mut body = vars.substitute_deep(&api.parsed_body());
        let headers_map = headers_value.as_object().cloned().unwrap_or_default();
        let params_map = params_value.as_object().cloned().unwrap_or_default();
        let mut effective_body_type = api.body_type;
        let mut encrypted_fields: Vec<String> = Vec::new();

        // ---- Stage 4: field-level encryption ---------------------------------------------
        let field_rules = api.parsed_body_enc_rules();
        if !field_rules.is_empty() {
            match crypto::apply_body_enc_rules(&mut body, &field_rules, &api.encryption_key, vars) {
                Ok(fields) => encrypted_fields = fields,
                Err(e) => tracing::warn!(api_id = api.id, error = %e, "body_enc_rules failed, continuing with unmodified body"),
            }
        } else if api.encrypted {
            // ---- Stage 5: whole-body encryption (skipped when field-level rules exist) --
            let plaintext = match &body {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            match crypto::apply_algorithm(api.encryption_algorithm, &api.encryption_key, &plaintext) {
                Ok(ciphertext) => {
                    let ciphertext_str = ciphertext.as_str().unwrap_or_default().to_string();
                    match effective_body_type {
                        BodyType::Text | BodyType::Data | BodyType::Raw => {
                            body = Value::String(ciphertext_str);
                        }
                        _ => {
                            body = json!({ "encrypted": ciphertext_str });
                            effective_body_type = BodyType::Json;
                        }
                    }
                }
                Err(e) => tracing::warn!(api_id = api.id, error = %e, "whole-body encryption failed, sending plaintext body"),
            }
        }

        let url_url = Arc::new(url);
        let request_headers_json = serde_json::to_string(&headers_map).unwrap_or_default();
        let request_params_json = serde_json::to_string(&params_map).unwrap_or_default();
        let request_body_json = serde_json::to_string(&body).unwrap_or_default();

        // ---- Stage 6: pre-SQL ------------------------------------------------------------
        let pre_sql_result =
            self.run_sql_stage(api.pre_sql_db_id, api.pre_sql.as_deref(), vars, repo, &mut db_cache).await;

        // ---- Stage 7: HTTP dispatch -------------------------------------------------------
        let mut dispatch_api = api.clone();
        dispatch_api.url = (*url_url).clone();
        dispatch_api.body_type = effective_body_type;

        let started = Instant::now();
        let dispatch = self.http.dispatch(&dispatch_api, &headers_map, &params_map, &body, api.use_async).await;
        let response_time_ms = round2(started.elapsed().as_secs_f64() * 1000.0);

        let (status_code, response_headers, response_body_raw, decoded, error_message) = match dispatch {
            Ok(resp) => {
                // ---- Stage 8: parse response ------------------------------------------
                let trimmed = resp.body_text.trim();
                let decoded = if resp.body_json.is_null() && !trimmed.is_empty() && trimmed != "null" {
                    Value::String(resp.body_text.clone())
                } else {
                    resp.body_json.clone()
                };
                (resp.status, resp.headers, resp.body_text, decoded, String::new())
            }
            Err(EngineError::NetworkTimeout(_)) => {
                let mode = if api.use_async { "异步请求" } else { "同步请求" };
                let msg = format!("{mode}超时：{}s", api.timeout_seconds);
                (0, HashMap::new(), String::new(), Value::Null, msg)
            }
            Err(e) => {
                let msg: String = e.to_string().chars().take(400).collect();
                (0, HashMap::new(), String::new(), Value::Null, msg)
            }
        };

        let mut extracted_vars: HashMap<String, String> = HashMap::new();
        let mut http_assertions = Vec::new();
        let mut deepdiff_assertions = Vec::new();

        if error_message.is_empty() {
            // ---- Stage 9: extraction -----------------------------------------------
            for rule in api.parsed_extract_vars() {
                if let Some(value) = extract::extract(&decoded, &rule.path) {
                    let s = extract::stringify(value);
                    vars.set(rule.name.clone(), s.clone());
                    extracted_vars.insert(rule.name.clone(), s);
                }
            }

            // ---- Stage 10: HTTP + structural-diff assertions ------------------------
            for assertion in api.parsed_assertions() {
                http_assertions.push(assertions::evaluate_http_assertion(&assertion, status_code, &decoded));
            }
            for rule in api.parsed_deepdiff_assertions() {
                deepdiff_assertions.push(assertions::evaluate_structural_diff(&rule, &decoded));
            }
        }

        // ---- Stage 11: post-SQL -----------------------------------------------------
        let post_sql_result =
            self.run_sql_stage(api.post_sql_db_id, api.post_sql.as_deref(), vars, repo, &mut db_cache).await;

        // ---- Stage 12: DB assertions --------------------------------------------------
        let mut db_assertion_outcomes = Vec::new();
        for rule in api.parsed_db_assertions() {
            let substituted = substitute_db_rule(&rule, vars);
            match self.db_for(substituted.db_id, repo, &mut db_cache).await {
                Ok(conn) => match conn.first_row(&substituted.sql).await {
                    Ok(row) => db_assertion_outcomes.push(assertions::evaluate_db_assertion(&substituted, row.as_ref())),
                    Err(e) => db_assertion_outcomes.push(failed_outcome(&substituted, &e.to_string())),
                },
                Err(e) => db_assertion_outcomes.push(failed_outcome(&substituted, &e.to_string())),
            }
        }

        let all_http_ok = http_assertions.iter().all(|o| o.passed());
        let all_dd_ok = deepdiff_assertions.iter().all(|o| o.passed());
        let all_db_ok = db_assertion_outcomes.iter().all(|o| o.passed());
        let any_assertions_declared =
            !http_assertions.is_empty() || !deepdiff_assertions.is_empty() || !db_assertion_outcomes.is_empty();

        let status = if !error_message.is_empty() {
            ResultStatus::Error
        } else if !any_assertions_declared {
            if (200..300).contains(&status_code) {
                ResultStatus::Pass
            } else {
                ResultStatus::Fail
            }
        } else if all_http_ok && all_dd_ok && all_db_ok {
            ResultStatus::Pass
        } else {
            ResultStatus::Fail
        };

        TestResult {
            id: 0,
            report_id: 0,
            api_id: Some(api.id),
            api_name: api.name.clone(),
            url: (*url_url).clone(),
            method: api.method.as_str().to_string(),
            use_async: api.use_async,
            request_headers: request_headers_json,
            request_params: request_params_json,
            request_body: request_body_json,
            response_status: status_code,
            response_headers: serde_json::to_string(&response_headers).unwrap_or_default(),
            response_body: crate::model::truncate_response_body(&response_body_raw),
            response_time_ms,
            status,
            error_message,
            extracted_vars: serde_json::to_string(&extracted_vars).unwrap_or_default(),
            assertion_results: outcomes_to_json(&http_assertions),
            db_assertion_results: outcomes_to_json(&db_assertion_outcomes),
            deepdiff_results: outcomes_to_json(&deepdiff_assertions),
            pre_sql_result,
            post_sql_result,
            created_at: chrono::Utc::now(),
        }
        .with_encrypted_fields_logged(&encrypted_fields)
    }

    async fn redis_for(&self, redis_id: i64, repo: &dyn Repository) -> Result<Arc<RedisUnit>, EngineError> {
        let mut cache = self.redis_cache.lock().await;
        if let Some(existing) = cache.get(&redis_id) {
            return Ok(existing.clone());
        }
        let cfg = repo
            .get_redis_config(redis_id)
            .await?
            .ok_or_else(|| EngineError::config(format!("redis config {redis_id} not found")))?;
        let unit = Arc::new(RedisUnit::connect(&cfg)?);
        cache.insert(redis_id, unit.clone());
        Ok(unit)
    }

    /// Looks up (or opens and caches) the connection for `db_id` within one
    /// `run_once` call's cache. Not shared across concurrent pipeline runs —
    /// each `run_once` owns its cache outright, so no locking is needed.
    async fn db_for<'a>(
        &self,
        db_id: i64,
        repo: &dyn Repository,
        cache: &'a mut HashMap<i64, DbConnection>,
    ) -> Result<&'a DbConnection, EngineError> {
        if !cache.contains_key(&db_id) {
            let cfg = repo
                .get_database_config(db_id)
                .await?
                .ok_or_else(|| EngineError::config(format!("database config {db_id} not found")))?;
            let conn = DbConnection::connect(&cfg).await?;
            cache.insert(db_id, conn);
        }
        Ok(cache.get(&db_id).expect("just inserted"))
    }

    /// Stages 6 and 11: substitutes `sql` through `vars`, runs it via the
    /// DB Executor, and returns its JSON-serialized statement results. A
    /// missing `db_id`/`sql` pair, or an execution error, is captured in the
    /// returned JSON rather than aborting the pipeline (§7: "a pre-SQL
    /// failure does not abort the pipeline").
    async fn run_sql_stage(
        &self,
        db_id: Option<i64>,
        sql: Option<&str>,
        vars: &VariableStore,
        repo: &dyn Repository,
        cache: &mut HashMap<i64, DbConnection>,
    ) -> String {
        let (Some(db_id), Some(sql)) = (db_id, sql) else {
            return String::new();
        };
        if sql.trim().is_empty() {
            return String::new();
        }
        let substituted = vars.substitute(sql);
        match self.db_for(db_id, repo, cache).await {
            Ok(conn) => match conn.execute_statements(&substituted).await {
                Ok(results) => serde_json::to_string(&statement_results_to_json(&results)).unwrap_or_default(),
                Err(e) => json!({"success": false, "error": e.to_string()}).to_string(),
            },
            Err(e) => json!({"success": false, "error": e.to_string()}).to_string(),
        }
    }
}

fn statement_results_to_json(results: &[crate::db::StatementResult]) -> Value {
    let success = results.iter().all(|r| r.is_ok());
    let items: Vec<Value> = results
        .iter()
        .map(|r| match r {
            crate::db::StatementResult::Rows(rows) => json!({"rows": rows, "error": null}),
            crate::db::StatementResult::RowsAffected(n) => json!({"rows_affected": n, "error": null}),
            crate::db::StatementResult::Error(e) => json!({"error": e}),
        })
        .collect();
    json!({"success": success, "statements": items})
}

fn outcomes_to_json(outcomes: &[assertions::AssertionOutcome]) -> String {
    let items: Vec<Value> = outcomes
        .iter()
        .map(|o| json!({"label": o.label, "passed": o.passed(), "message": o.message}))
        .collect();
    serde_json::to_string(&items).unwrap_or_default()
}

fn failed_outcome(rule: &DbAssertionRule, message: &str) -> assertions::AssertionOutcome {
    assertions::AssertionOutcome {
        label: rule.label_or_default(),
        status: assertions::AssertionStatus::Fail,
        message: message.to_string(),
    }
}

fn substitute_db_rule(rule: &DbAssertionRule, vars: &VariableStore) -> DbAssertionRule {
    let mut out = rule.clone();
    out.sql = vars.substitute(&rule.sql);
    if let Some(expected) = &out.expected {
        out.expected = Some(vars.substitute(expected));
    }
    if let Some(fields) = &mut out.fields {
        for field in fields.iter_mut() {
            field.expected = vars.substitute(&field.expected);
        }
    }
    out
}

fn round2(ms: f64) -> f64 {
    (ms * 100.0).round() / 100.0
}

/// No separate field exists on `TestResult` for which body fields were
/// encrypted; logged via tracing instead (mirrors `executor.py` which logs
/// `encrypted_fields` without persisting it on the result row).
trait EncryptedFieldsLog {
    fn with_encrypted_fields_logged(self, fields: &[String]) -> Self;
}

impl EncryptedFieldsLog for TestResult {
    fn with_encrypted_fields_logged(self, fields: &[String]) -> Self {
        if !fields.is_empty() {
            tracing::debug!(api_id = ?self.api_id, fields = ?fields, "encrypted body fields");
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BodyType, EncryptionAlgorithm, HttpMethod};
    use crate::repository::InMemoryRepository;

    fn base_api() -> ApiConfig {
        ApiConfig {
            id: 1,
            name: "get-thing".to_string(),
            category_id: None,
            sort_order: 0,
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
    async fn unreachable_host_yields_error_status_with_zero_response_status() {
        let pipeline = Pipeline::new();
        let repo = InMemoryRepository::new();
        let mut vars = VariableStore::new();
        let api = base_api();
        let results = pipeline.run(&api, &mut vars, &repo).await;
        assert_eq!(results.len(), 1);
        let result = &results[0];
        assert_eq!(result.status, ResultStatus::Error);
        assert_eq!(result.response_status, 0);
        assert!(!result.error_message.is_empty());
    }

    #[tokio::test]
    async fn repeat_enabled_produces_repeat_count_results() {
        let pipeline = Pipeline::new();
        let repo = InMemoryRepository::new();
        let mut vars = VariableStore::new();
        let mut api = base_api();
        api.repeat_enabled = true;
        api.repeat_count = 3;
        let results = pipeline.run(&api, &mut vars, &repo).await;
        assert_eq!(results.len(), 3);
    }
}
