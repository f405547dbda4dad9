//! DB Executor (§4.E): runs pre/post-SQL and DB-assertion queries against a
//! configured relational database.
//!
//! Grounded in `db_utils.py`: statements are split on `;` top-level
//! semicolons and classified as `SELECT` (rows collected, every cell
//! stringified), `DML` (INSERT/UPDATE/DELETE/REPLACE, rowcount collected), or
//! `DDL` (anything else, executed for effect only). A batch run caches one
//! connection per `db_id` and closes all of them when the batch ends,
//! mirroring the source platform's per-run connection cache.

use std::collections::HashMap;

use sqlx::mysql::MySqlPoolOptions;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Column, MySqlPool, PgPool, Row, TypeInfo};

use crate::errors::EngineError;
use crate::model::{DatabaseConfig, DbDriver};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Select,
    Dml,
    Ddl,
}

/// `_sql_type`: classifies a single statement by its leading keyword.
pub fn classify_statement(stmt: &str) -> StatementKind {
    let trimmed = stmt.trim_start();
    let first_word: String = trimmed
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    match first_word.as_str() {
        "SELECT" | "SHOW" | "DESC" | "DESCRIBE" | "EXPLAIN" => StatementKind::Select,
        "INSERT" | "UPDATE" | "DELETE" | "REPLACE" => StatementKind::Dml,
        _ => StatementKind::Ddl,
    }
}

/// Splits a multi-statement SQL blob on `;`, dropping blank statements.
pub fn split_statements(sql: &str) -> Vec<String> {
    sql.split(';')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Result of running one statement.
#[derive(Debug, Clone)]
pub enum StatementResult {
    Rows(Vec<HashMap<String, Option<String>>>),
    RowsAffected(u64),
    Error(String),
}

impl StatementResult {
    pub fn is_ok(&self) -> bool {
        !matches!(self, StatementResult::Error(_))
    }
}

enum Pool {
    MySql(MySqlPool),
    Postgres(PgPool),
}

/// One live connection, keyed by `db_id` in the batch-scoped cache.
pub struct DbConnection {
    pool: Pool,
}

impl DbConnection {
    pub async fn connect(cfg: &DatabaseConfig) -> Result<Self, EngineError> {
        let pool = match cfg.driver {
            DbDriver::MySql => {
                let url = format!(
                    "mysql://{}:{}@{}:{}/{}?charset={}",
                    cfg.username, cfg.password, cfg.host, cfg.port, cfg.database, cfg.charset
                );
                let pool = MySqlPoolOptions::new()
                    .max_connections(5)
                    .acquire_timeout(std::time::Duration::from_secs(10))
                    .connect(&url)
                    .await
                    .map_err(|e| EngineError::sql(format!("mysql connect failed: {e}")))?;
                Pool::MySql(pool)
            }
            DbDriver::Postgres => {
                let url = format!(
                    "postgres://{}:{}@{}:{}/{}",
                    cfg.username, cfg.password, cfg.host, cfg.port, cfg.database
                );
                let pool = PgPoolOptions::new()
                    .max_connections(5)
                    .acquire_timeout(std::time::Duration::from_secs(10))
                    .connect(&url)
                    .await
                    .map_err(|e| EngineError::sql(format!("postgres connect failed: {e}")))?;
                Pool::Postgres(pool)
            }
        };
        Ok(Self { pool })
    }

    /// `test_connection`: a bare round-trip, used by the (out-of-scope) admin
    /// surface and by health checks.
    pub async fn ping(&self) -> Result<(), EngineError> {
        match &self.pool {
            Pool::MySql(p) => sqlx::query("SELECT 1")
                .execute(p)
                .await
                .map(|_| ())
                .map_err(|e| EngineError::sql(format!("ping failed: {e}"))),
            Pool::Postgres(p) => sqlx::query("SELECT 1")
                .execute(p)
                .await
                .map(|_| ())
                .map_err(|e| EngineError::sql(format!("ping failed: {e}"))),
        }
    }

    /// Runs every `;`-separated statement in `sql` in order, returning one
    /// result per statement. A statement that fails is captured as
    /// `StatementResult::Error` rather than aborting the remaining
    /// statements — the batch's overall success is the conjunction of each
    /// statement's own success, matching `db_utils.py`'s per-statement
    /// `try/except` loop.
    pub async fn execute_statements(&self, sql: &str) -> Result<Vec<StatementResult>, EngineError> {
        let mut results = Vec::new();
        for stmt in split_statements(sql) {
            let kind = classify_statement(&stmt);
            let result = match (&self.pool, kind) {
                (Pool::MySql(p), StatementKind::Select) => sqlx::query(&stmt)
                    .fetch_all(p)
                    .await
                    .map(|rows| StatementResult::Rows(rows.iter().map(stringify_mysql_row).collect()))
                    .unwrap_or_else(|e| StatementResult::Error(format!("query failed: {e}"))),
                (Pool::MySql(p), _) => sqlx::query(&stmt)
                    .execute(p)
                    .await
                    .map(|res| StatementResult::RowsAffected(res.rows_affected()))
                    .unwrap_or_else(|e| StatementResult::Error(format!("statement failed: {e}"))),
                (Pool::Postgres(p), StatementKind::Select) => sqlx::query(&stmt)
                    .fetch_all(p)
                    .await
                    .map(|rows| StatementResult::Rows(rows.iter().map(stringify_pg_row).collect()))
                    .unwrap_or_else(|e| StatementResult::Error(format!("query failed: {e}"))),
                (Pool::Postgres(p), _) => sqlx::query(&stmt)
                    .execute(p)
                    .await
                    .map(|res| StatementResult::RowsAffected(res.rows_affected()))
                    .unwrap_or_else(|e| StatementResult::Error(format!("statement failed: {e}"))),
            };
            results.push(result);
        }
        Ok(results)
    }

    /// Runs `sql` and returns the first row of the first `SELECT` result, if
    /// any — the shape `run_db_assertions` consumes.
    pub async fn first_row(&self, sql: &str) -> Result<Option<HashMap<String, Option<String>>>, EngineError> {
        for result in self.execute_statements(sql).await? {
            match result {
                StatementResult::Rows(rows) => return Ok(rows.into_iter().next()),
                StatementResult::Error(e) => return Err(EngineError::sql(e)),
                StatementResult::RowsAffected(_) => continue,
            }
        }
        Ok(None)
    }
}

fn stringify_mysql_row(row: &sqlx::mysql::MySqlRow) -> HashMap<String, Option<String>> {
    let mut out = HashMap::new();
    for col in row.columns() {
        let name = col.name().to_string();
        let value = stringify_column_mysql(row, col);
        out.insert(name, value);
    }
    out
}

fn stringify_column_mysql(row: &sqlx::mysql::MySqlRow, col: &sqlx::mysql::MySqlColumn) -> Option<String> {
    use sqlx::ValueRef;
    let raw = row.try_get_raw(col.ordinal()).ok()?;
    if raw.is_null() {
        return None;
    }
    match col.type_info().name() {
        "BIGINT" | "INT" | "INTEGER" | "SMALLINT" | "TINYINT" => row
            .try_get::<i64, _>(col.ordinal())
            .map(|v| v.to_string())
            .or_else(|_| row.try_get::<i32, _>(col.ordinal()).map(|v| v.to_string()))
            .ok(),
        "DOUBLE" | "FLOAT" | "DECIMAL" => row
            .try_get::<f64, _>(col.ordinal())
            .map(|v| v.to_string())
            .or_else(|_| row.try_get::<f32, _>(col.ordinal()).map(|v| v.to_string()))
            .ok(),
        _ => row.try_get::<String, _>(col.ordinal()).ok(),
    }
}

fn stringify_pg_row(row: &sqlx::postgres::PgRow) -> HashMap<String, Option<String>> {
    let mut out = HashMap::new();
    for col in row.columns() {
        let name = col.name().to_string();
        let value = stringify_column_pg(row, col);
        out.insert(name, value);
    }
    out
}

fn stringify_column_pg(row: &sqlx::postgres::PgRow, col: &sqlx::postgres::PgColumn) -> Option<String> {
    use sqlx::ValueRef;
    let raw = row.try_get_raw(col.ordinal()).ok()?;
    if raw.is_null() {
        return None;
    }
    match col.type_info().name() {
        "INT8" | "INT4" | "INT2" => row
            .try_get::<i64, _>(col.ordinal())
            .map(|v| v.to_string())
            .or_else(|_| row.try_get::<i32, _>(col.ordinal()).map(|v| v.to_string()))
            .ok(),
        "FLOAT8" | "FLOAT4" | "NUMERIC" => row
            .try_get::<f64, _>(col.ordinal())
            .map(|v| v.to_string())
            .or_else(|_| row.try_get::<f32, _>(col.ordinal()).map(|v| v.to_string()))
            .ok(),
        _ => row.try_get::<String, _>(col.ordinal()).ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_statement_kinds() {
        assert_eq!(classify_statement("SELECT * FROM t"), StatementKind::Select);
        assert_eq!(classify_statement("  update t set a=1"), StatementKind::Dml);
        assert_eq!(classify_statement("insert into t values (1)"), StatementKind::Dml);
        assert_eq!(classify_statement("CREATE TABLE t (id int)"), StatementKind::Ddl);
    }

    #[test]
    fn splits_multiple_statements_and_drops_blanks() {
        let stmts = split_statements("SELECT 1; ; UPDATE t SET a=1 WHERE id=2;  ");
        assert_eq!(stmts, vec!["SELECT 1".to_string(), "UPDATE t SET a=1 WHERE id=2".to_string()]);
    }

    #[test]
    fn statement_error_does_not_mark_other_results_as_failed() {
        let results = vec![
            StatementResult::RowsAffected(1),
            StatementResult::Error("syntax error".to_string()),
            StatementResult::RowsAffected(2),
        ];
        assert!(results[0].is_ok());
        assert!(!results[1].is_ok());
        assert!(results[2].is_ok());
        assert!(!results.iter().all(|r| r.is_ok()));
    }
}
