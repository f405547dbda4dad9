//! Data model for the API test platform: [`ApiConfig`] and the entities that
//! surround it (global variables, connection configs, reports, scheduled tasks).
//!
//! Every text-blob field that the original platform stores as JSON (`headers`,
//! `params`, `body`, `assertions`, ...) is kept here as a raw `String` plus a
//! `parsed_*`/`get_*` accessor, mirroring `ApiConfig.get_headers()` /
//! `get_params()` / `get_body()` in the source platform: malformed JSON never
//! panics, it degrades to an empty/raw value.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ===========================================================================
// HTTP method / body framing
// ===========================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyType {
    Json,
    Data,
    Params,
    Form,
    Text,
    Raw,
    Files,
}

impl Default for BodyType {
    fn default() -> Self {
        BodyType::Json
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EncryptionAlgorithm {
    Aes,
    #[serde(rename = "AES-GCM")]
    AesGcm,
    Base64,
    Md5,
}

// ===========================================================================
// Rule types embedded in ApiConfig's JSON-blob fields
// ===========================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BodyEncRule {
    pub field: String,
    pub ssrc: String,
    #[serde(default)]
    pub json_dumps: bool,
    #[serde(default)]
    pub raw: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractRule {
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssertionType {
    StatusCode,
    JsonPath,
    Contains,
    NotEmpty,
    Regex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assertion {
    #[serde(rename = "type")]
    pub kind: AssertionType,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub expected: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeepDiffAssertion {
    #[serde(default = "default_diff_label")]
    pub label: String,
    pub expected: Value,
    #[serde(default)]
    pub ignore_fields: Vec<String>,
    #[serde(default)]
    pub check_path: Option<String>,
}

fn default_diff_label() -> String {
    "structural diff".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOperator {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
    Contains,
    NotEmpty,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbFieldCheck {
    pub field: String,
    pub operator: CompareOperator,
    pub expected: String,
}

/// A single `db_assertions` entry. Accepts both the single-field legacy shape
/// (`field`/`operator`/`expected`) and the multi-field shape (`fields: [...]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbAssertionRule {
    pub db_id: i64,
    pub sql: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub operator: Option<CompareOperator>,
    #[serde(default)]
    pub expected: Option<String>,
    #[serde(default)]
    pub fields: Option<Vec<DbFieldCheck>>,
}

impl DbAssertionRule {
    /// Normalizes the legacy single-field shape and the multi-field shape into
    /// one list of field checks, as `db_utils.run_db_assertions` does.
    pub fn field_checks(&self) -> Vec<DbFieldCheck> {
        if let Some(fields) = &self.fields {
            return fields.clone();
        }
        vec![DbFieldCheck {
            field: self.field.clone().unwrap_or_default(),
            operator: self.operator.unwrap_or(CompareOperator::Eq),
            expected: self.expected.clone().unwrap_or_default(),
        }]
    }

    pub fn label_or_default(&self) -> String {
        self.label
            .clone()
            .unwrap_or_else(|| self.sql.chars().take(60).collect())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreRedisRule {
    pub redis_id: i64,
    pub key: String,
    pub var_name: String,
    #[serde(default)]
    pub extract_field: Option<String>,
}

// ===========================================================================
// GlobalVariable
// ===========================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VarType {
    String,
    Token,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalVariable {
    pub id: i64,
    pub name: String,
    pub value: String,
    pub var_type: VarType,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ===========================================================================
// DatabaseConfig / RedisConfig / EmailConfig
// ===========================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbDriver {
    MySql,
    Postgres,
}

impl Default for DbDriver {
    fn default() -> Self {
        DbDriver::MySql
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub driver: DbDriver,
    pub host: String,
    pub port: u16,
    pub username: String,
    /// Never serialized in full; redacted views use [`DatabaseConfig::redacted`].
    #[serde(skip_serializing)]
    pub password: String,
    pub database: String,
    #[serde(default = "default_charset")]
    pub charset: String,
    #[serde(default)]
    pub description: String,
}

fn default_charset() -> String {
    "utf8mb4".to_string()
}

impl DatabaseConfig {
    pub fn redacted(&self) -> Value {
        serde_json::json!({
            "id": self.id, "name": self.name, "driver": self.driver, "host": self.host, "port": self.port,
            "username": self.username, "password": "******",
            "database": self.database, "charset": self.charset,
            "description": self.description,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub id: i64,
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing)]
    pub password: String,
    #[serde(default)]
    pub db: u8,
    #[serde(default)]
    pub description: String,
}

impl RedisConfig {
    pub fn redacted(&self) -> Value {
        serde_json::json!({
            "id": self.id, "name": self.name, "host": self.host, "port": self.port,
            "password": if self.password.is_empty() { "" } else { "******" },
            "db": self.db, "description": self.description,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    pub id: i64,
    #[serde(default = "default_email_config_name")]
    pub name: String,
    pub smtp_host: String,
    pub smtp_port: u16,
    #[serde(default)]
    pub use_ssl: bool,
    #[serde(default)]
    pub use_tls: bool,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub from_addr: String,
    #[serde(default = "default_email_from_name")]
    pub from_name: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_email_config_name() -> String {
    "default".to_string()
}
fn default_email_from_name() -> String {
    "API Test Platform".to_string()
}
fn default_true() -> bool {
    true
}

// ===========================================================================
// ApiConfig
// ===========================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub category_id: Option<i64>,
    #[serde(default)]
    pub sort_order: i64,

    pub url: String,
    pub method: HttpMethod,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Raw JSON-or-degraded-text blobs, parsed on demand (see `parsed_*`).
    #[serde(default = "default_json_object_blob")]
    pub headers: String,
    #[serde(default = "default_json_object_blob")]
    pub params: String,
    #[serde(default = "default_json_object_blob")]
    pub body: String,
    #[serde(default)]
    pub body_type: BodyType,

    #[serde(default)]
    pub use_session: bool,
    #[serde(default)]
    pub use_async: bool,

    #[serde(default = "default_ssl_verify")]
    pub ssl_verify: String,
    #[serde(default)]
    pub ssl_cert: Option<String>,
    #[serde(default)]
    pub client_cert_enabled: bool,
    #[serde(default)]
    pub client_cert: Option<String>,
    #[serde(default)]
    pub client_key: Option<String>,

    #[serde(default)]
    pub encrypted: bool,
    #[serde(default)]
    pub encryption_key: String,
    #[serde(default = "default_encryption_algorithm")]
    pub encryption_algorithm: EncryptionAlgorithm,
    #[serde(default = "default_json_array_blob")]
    pub body_enc_rules: String,

    #[serde(default = "default_json_array_blob")]
    pub extract_vars: String,
    #[serde(default = "default_json_array_blob")]
    pub assertions: String,
    #[serde(default = "default_json_array_blob")]
    pub deepdiff_assertions: String,
    #[serde(default = "default_json_array_blob")]
    pub db_assertions: String,
    #[serde(default = "default_json_array_blob")]
    pub pre_redis_rules: String,

    #[serde(default)]
    pub pre_sql_db_id: Option<i64>,
    #[serde(default)]
    pub pre_sql: Option<String>,
    #[serde(default)]
    pub post_sql_db_id: Option<i64>,
    #[serde(default)]
    pub post_sql: Option<String>,

    #[serde(default)]
    pub repeat_enabled: bool,
    #[serde(default = "default_repeat_count")]
    pub repeat_count: u32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_timeout() -> u64 {
    30
}
fn default_json_object_blob() -> String {
    "{}".to_string()
}
fn default_json_array_blob() -> String {
    "[]".to_string()
}
fn default_ssl_verify() -> String {
    "true".to_string()
}
fn default_encryption_algorithm() -> EncryptionAlgorithm {
    EncryptionAlgorithm::Aes
}
fn default_repeat_count() -> u32 {
    1
}

impl ApiConfig {
    /// `ApiConfig.get_headers()`: parses the headers blob, degrading to `{}`.
    pub fn parsed_headers(&self) -> Map<String, Value> {
        serde_json::from_str::<Value>(&self.headers)
            .ok()
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default()
    }

    /// `ApiConfig.get_params()`: JSON object, `k=v&k2=v2` query string, or a
    /// bare path segment folded into `{"_raw": "..."}`.
    pub fn parsed_params(&self) -> Map<String, Value> {
        let raw = self.params.trim();
        if raw.is_empty() || raw == "{}" {
            return Map::new();
        }
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(raw) {
            return map;
        }
        if raw.contains('=') {
            let mut map = Map::new();
            for pair in raw.split('&') {
                if pair.is_empty() {
                    continue;
                }
                let mut it = pair.splitn(2, '=');
                let k = it.next().unwrap_or_default();
                let v = it.next().unwrap_or_default();
                if !k.is_empty() {
                    map.insert(k.to_string(), Value::String(v.to_string()));
                }
            }
            return map;
        }
        let mut map = Map::new();
        map.insert("_raw".to_string(), Value::String(raw.to_string()));
        map
    }

    /// `ApiConfig.get_body()`: parsed JSON value (object/array/scalar), or the
    /// raw string verbatim when it isn't valid JSON (text/plain mode).
    pub fn parsed_body(&self) -> Value {
        match serde_json::from_str::<Value>(&self.body) {
            Ok(v) => v,
            Err(_) => Value::String(self.body.clone()),
        }
    }

    pub fn parsed_extract_vars(&self) -> Vec<ExtractRule> {
        serde_json::from_str(&self.extract_vars).unwrap_or_default()
    }

    pub fn parsed_assertions(&self) -> Vec<Assertion> {
        serde_json::from_str(&self.assertions).unwrap_or_default()
    }

    pub fn parsed_deepdiff_assertions(&self) -> Vec<DeepDiffAssertion> {
        serde_json::from_str(&self.deepdiff_assertions).unwrap_or_default()
    }

    pub fn parsed_db_assertions(&self) -> Vec<DbAssertionRule> {
        serde_json::from_str(&self.db_assertions).unwrap_or_default()
    }

    pub fn parsed_pre_redis_rules(&self) -> Vec<PreRedisRule> {
        serde_json::from_str(&self.pre_redis_rules).unwrap_or_default()
    }

    pub fn parsed_body_enc_rules(&self) -> Vec<BodyEncRule> {
        serde_json::from_str(&self.body_enc_rules).unwrap_or_default()
    }

    /// Clamps `repeat_count` into the spec's `[1, 100]` range regardless of
    /// what was persisted.
    pub fn effective_repeat_count(&self) -> u32 {
        self.repeat_count.clamp(1, 100)
    }
}

// ===========================================================================
// TestReport / TestResult
// ===========================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    Running,
    Completed,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestReport {
    pub id: i64,
    pub name: String,
    pub status: ReportStatus,
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub error: u32,
    pub duration_seconds: f64,
    pub created_at: DateTime<Utc>,
}

impl TestReport {
    pub fn pass_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.passed as f64 / self.total as f64 * 1000.0).round() / 10.0
        }
    }

    pub fn new_running(id: i64, name: String, total: u32) -> Self {
        Self {
            id,
            name,
            status: ReportStatus::Running,
            total,
            passed: 0,
            failed: 0,
            error: 0,
            duration_seconds: 0.0,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Pass,
    Fail,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub id: i64,
    pub report_id: i64,
    pub api_id: Option<i64>,
    pub api_name: String,
    pub url: String,
    pub method: String,
    pub use_async: bool,
    pub request_headers: String,
    pub request_params: String,
    pub request_body: String,
    pub response_status: u16,
    pub response_headers: String,
    pub response_body: String,
    pub response_time_ms: f64,
    pub status: ResultStatus,
    pub error_message: String,
    pub extracted_vars: String,
    pub assertion_results: String,
    pub db_assertion_results: String,
    pub deepdiff_results: String,
    pub pre_sql_result: String,
    pub post_sql_result: String,
    pub created_at: DateTime<Utc>,
}

/// Response bodies are capped at 10,000 chars before being stored, per spec.
pub fn truncate_response_body(body: &str) -> String {
    if body.chars().count() <= 10_000 {
        body.to_string()
    } else {
        body.chars().take(10_000).collect()
    }
}

// ===========================================================================
// ScheduledTask
// ===========================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    Cron,
    Interval,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Active,
    Paused,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: i64,
    pub name: String,
    pub api_ids: Vec<i64>,
    pub trigger_type: TriggerType,
    #[serde(default = "default_cron_expr")]
    pub cron_expr: String,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_report_name_tpl")]
    pub report_name_tpl: String,
    #[serde(default)]
    pub send_email: bool,
    #[serde(default)]
    pub email_to: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_report_id: Option<i64>,
    #[serde(default)]
    pub last_result: String,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_cron_expr() -> String {
    "0 9 * * *".to_string()
}
fn default_interval_secs() -> u64 {
    3600
}
fn default_report_name_tpl() -> String {
    "scheduled-{task}".to_string()
}

impl ScheduledTask {
    pub fn email_to_list(&self) -> Vec<String> {
        self.email_to
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Effective interval, enforcing the 60s floor from §4.J.
    pub fn effective_interval_secs(&self) -> u64 {
        self.interval_secs.max(60)
    }
}
