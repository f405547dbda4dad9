//! Execution limits / ambient configuration (SPEC_FULL.md "Configuration"):
//! environment-driven bounds on batch size, repeat count, HTTP defaults,
//! scheduler pool size, and the load-test tmp directory.
//!
//! Kept in the same `from_env()`-constructor shape this crate has always
//! used for its execution limits, repurposed from per-plan DAG limits to
//! per-batch API-test limits.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Maximum number of APIs a single batch run will accept before the caller
/// is expected to split it up. Not enforced by the Batch Runner itself
/// (§4.I has no such cap) — this is a guard the out-of-scope admin surface
/// applies before submitting a batch.
pub const DEFAULT_MAX_BATCH_APIS: usize = 500;

/// Upper bound matching `repeat_count`'s `[1, 100]` range (§3).
pub const DEFAULT_MAX_REPEAT_COUNT: u32 = 100;

/// Default per-request HTTP timeout when an `ApiConfig` doesn't specify one.
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Scheduler worker-pool size (§4.J).
pub const DEFAULT_SCHEDULER_POOL_SIZE: usize = 5;

/// Misfire grace window (§4.J).
pub const DEFAULT_MISFIRE_GRACE_SECS: u64 = 60;

fn default_load_test_dir() -> std::path::PathBuf {
    std::env::temp_dir().join("locust_presstest")
}

/// Process-wide ambient configuration, loaded once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub max_batch_apis: usize,
    pub max_repeat_count: u32,
    pub default_http_timeout: Duration,
    pub scheduler_pool_size: usize,
    pub misfire_grace: Duration,
    #[serde(default = "default_load_test_dir")]
    pub load_test_dir: std::path::PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_batch_apis: DEFAULT_MAX_BATCH_APIS,
            max_repeat_count: DEFAULT_MAX_REPEAT_COUNT,
            default_http_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
            scheduler_pool_size: DEFAULT_SCHEDULER_POOL_SIZE,
            misfire_grace: Duration::from_secs(DEFAULT_MISFIRE_GRACE_SECS),
            load_test_dir: default_load_test_dir(),
        }
    }
}

impl EngineConfig {
    /// Loads overrides from environment variables, falling back to defaults
    /// for anything unset or unparseable:
    /// - `RUNNER_MAX_BATCH_APIS`
    /// - `RUNNER_MAX_REPEAT_COUNT`
    /// - `RUNNER_HTTP_TIMEOUT_SECS`
    /// - `RUNNER_SCHEDULER_POOL_SIZE`
    /// - `RUNNER_MISFIRE_GRACE_SECS`
    /// - `RUNNER_LOAD_TEST_DIR`
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("RUNNER_MAX_BATCH_APIS") {
            if let Ok(n) = val.parse() {
                config.max_batch_apis = n;
            }
        }
        if let Ok(val) = std::env::var("RUNNER_MAX_REPEAT_COUNT") {
            if let Ok(n) = val.parse() {
                config.max_repeat_count = n;
            }
        }
        if let Ok(val) = std::env::var("RUNNER_HTTP_TIMEOUT_SECS") {
            if let Ok(n) = val.parse() {
                config.default_http_timeout = Duration::from_secs(n);
            }
        }
        if let Ok(val) = std::env::var("RUNNER_SCHEDULER_POOL_SIZE") {
            if let Ok(n) = val.parse() {
                config.scheduler_pool_size = n;
            }
        }
        if let Ok(val) = std::env::var("RUNNER_MISFIRE_GRACE_SECS") {
            if let Ok(n) = val.parse() {
                config.misfire_grace = Duration::from_secs(n);
            }
        }
        if let Ok(val) = std::env::var("RUNNER_LOAD_TEST_DIR") {
            config.load_test_dir = std::path::PathBuf::from(val);
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_constants() {
        let config = EngineConfig::default();
        assert_eq!(config.scheduler_pool_size, 5);
        assert_eq!(config.misfire_grace, Duration::from_secs(60));
        assert_eq!(config.max_repeat_count, 100);
    }

    #[test]
    fn from_env_overrides_pool_size() {
        std::env::set_var("RUNNER_SCHEDULER_POOL_SIZE", "12");
        let config = EngineConfig::from_env();
        assert_eq!(config.scheduler_pool_size, 12);
        std::env::remove_var("RUNNER_SCHEDULER_POOL_SIZE");
    }
}
