//! Structured error codes and the engine's typed error enum (§7).
//!
//! Every pipeline stage captures failures locally and turns them into one of
//! nine kinds: `ConfigError`, `NetworkTimeout`, `NetworkFailure`,
//! `ParseFailure`, `AssertionFailure`, `SqlError`, `RedisError`,
//! `SchedulerError`, `WorkerError`. None of these ever escape a single
//! pipeline run as a `?`-propagated failure across API boundaries — the
//! pipeline always reduces to one of `pass`/`fail`/`error` at exit and stores
//! the error's message/code on the `TestResult` instead.
//!
//! The numeric code registry (`E1xxx`..`E9xxx`) exists so stored
//! `error_message` strings and CLI diagnostics stay greppable, the same
//! pattern this crate has always used for surfaced errors.

use std::fmt;
use thiserror::Error;

// ============================================================================
// ERROR CODE REGISTRY
// ============================================================================

/// A four-digit code: first digit is the category, the rest identify the
/// specific failure within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCode(u16);

impl ErrorCode {
    // E1xxx: configuration
    pub const MISSING_PARAM: Self = Self(1001);
    pub const INVALID_METHOD: Self = Self(1002);
    pub const INVALID_ENCRYPTION_KEY: Self = Self(1003);
    pub const INVALID_BODY_TYPE: Self = Self(1004);

    // E2xxx: network
    pub const NETWORK_TIMEOUT: Self = Self(2001);
    pub const NETWORK_CONNECTION_FAILED: Self = Self(2002);
    pub const NETWORK_TLS_ERROR: Self = Self(2003);

    // E3xxx: parsing
    pub const RESPONSE_NOT_JSON: Self = Self(3001);
    pub const EXTRACT_PATH_NOT_FOUND: Self = Self(3002);

    // E4xxx: assertions
    pub const ASSERTION_HTTP_FAILED: Self = Self(4001);
    pub const ASSERTION_DIFF_FAILED: Self = Self(4002);
    pub const ASSERTION_DB_FAILED: Self = Self(4003);

    // E5xxx: SQL
    pub const SQL_CONNECTION_FAILED: Self = Self(5001);
    pub const SQL_EXECUTION_FAILED: Self = Self(5002);

    // E6xxx: Redis
    pub const REDIS_CONNECTION_FAILED: Self = Self(6001);
    pub const REDIS_COMMAND_FAILED: Self = Self(6002);

    // E7xxx: scheduler
    pub const SCHEDULER_BAD_CRON: Self = Self(7001);
    pub const SCHEDULER_JOB_FAILED: Self = Self(7002);

    // E8xxx: worker / load driver
    pub const WORKER_SPAWN_FAILED: Self = Self(8001);
    pub const WORKER_IO_FAILED: Self = Self(8002);

    // E9xxx: internal
    pub const INTERNAL_ERROR: Self = Self(9001);

    pub fn code(&self) -> u16 {
        self.0
    }

    pub fn formatted(&self) -> String {
        format!("E{:04}", self.0)
    }

    pub fn category(&self) -> ErrorCategory {
        match self.0 / 1000 {
            1 => ErrorCategory::Config,
            2 => ErrorCategory::Network,
            3 => ErrorCategory::Parse,
            4 => ErrorCategory::Assertion,
            5 => ErrorCategory::Sql,
            6 => ErrorCategory::Redis,
            7 => ErrorCategory::Scheduler,
            8 => ErrorCategory::Worker,
            _ => ErrorCategory::Internal,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.formatted())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Config,
    Network,
    Parse,
    Assertion,
    Sql,
    Redis,
    Scheduler,
    Worker,
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Config => "config",
            Self::Network => "network",
            Self::Parse => "parse",
            Self::Assertion => "assertion",
            Self::Sql => "sql",
            Self::Redis => "redis",
            Self::Scheduler => "scheduler",
            Self::Worker => "worker",
            Self::Internal => "internal",
        };
        write!(f, "{s}")
    }
}

// ============================================================================
// ENGINE ERROR
// ============================================================================

/// The engine's single error type. Every module in this crate returns
/// `Result<T, EngineError>`; the pipeline is the only place that catches it
/// per-stage and folds it into a `TestResult`.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("[{}] config error: {0}", ErrorCode::MISSING_PARAM)]
    Config(String),

    #[error("[{}] network timeout: {0}", ErrorCode::NETWORK_TIMEOUT)]
    NetworkTimeout(String),

    #[error("[{}] network failure: {0}", ErrorCode::NETWORK_CONNECTION_FAILED)]
    NetworkFailure(String),

    #[error("[{}] parse failure: {0}", ErrorCode::RESPONSE_NOT_JSON)]
    ParseFailure(String),

    #[error("[{}] assertion failure: {0}", ErrorCode::ASSERTION_HTTP_FAILED)]
    AssertionFailure(String),

    #[error("[{}] sql error: {0}", ErrorCode::SQL_EXECUTION_FAILED)]
    Sql(String),

    #[error("[{}] redis error: {0}", ErrorCode::REDIS_COMMAND_FAILED)]
    Redis(String),

    #[error("[{}] scheduler error: {0}", ErrorCode::SCHEDULER_JOB_FAILED)]
    Scheduler(String),

    #[error("[{}] worker error: {0}", ErrorCode::WORKER_IO_FAILED)]
    Worker(String),
}

impl EngineError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
    pub fn network_timeout(msg: impl Into<String>) -> Self {
        Self::NetworkTimeout(msg.into())
    }
    pub fn network_failure(msg: impl Into<String>) -> Self {
        Self::NetworkFailure(msg.into())
    }
    pub fn parse_failure(msg: impl Into<String>) -> Self {
        Self::ParseFailure(msg.into())
    }
    pub fn assertion_failure(msg: impl Into<String>) -> Self {
        Self::AssertionFailure(msg.into())
    }
    pub fn sql(msg: impl Into<String>) -> Self {
        Self::Sql(msg.into())
    }
    pub fn redis(msg: impl Into<String>) -> Self {
        Self::Redis(msg.into())
    }
    pub fn scheduler(msg: impl Into<String>) -> Self {
        Self::Scheduler(msg.into())
    }
    pub fn worker(msg: impl Into<String>) -> Self {
        Self::Worker(msg.into())
    }

    /// The error kind name as stored on `TestResult.error_message` prefixes
    /// and the scheduler/load-test JSON status files.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "ConfigError",
            Self::NetworkTimeout(_) => "NetworkTimeout",
            Self::NetworkFailure(_) => "NetworkFailure",
            Self::ParseFailure(_) => "ParseFailure",
            Self::AssertionFailure(_) => "AssertionFailure",
            Self::Sql(_) => "SQLError",
            Self::Redis(_) => "RedisError",
            Self::Scheduler(_) => "SchedulerError",
            Self::Worker(_) => "WorkerError",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_formatting() {
        assert_eq!(ErrorCode::MISSING_PARAM.formatted(), "E1001");
        assert_eq!(ErrorCode::SQL_EXECUTION_FAILED.formatted(), "E5002");
    }

    #[test]
    fn error_code_category() {
        assert_eq!(ErrorCode::NETWORK_TIMEOUT.category(), ErrorCategory::Network);
        assert_eq!(ErrorCode::REDIS_COMMAND_FAILED.category(), ErrorCategory::Redis);
    }

    #[test]
    fn engine_error_kind_names() {
        assert_eq!(EngineError::config("x").kind(), "ConfigError");
        assert_eq!(EngineError::sql("x").kind(), "SQLError");
        assert_eq!(EngineError::worker("x").kind(), "WorkerError");
    }
}
