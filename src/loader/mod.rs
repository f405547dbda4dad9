//! Fixture loader: reads a JSON file describing `ApiConfig`s, global
//! variables, connection configs, and scheduled tasks, and seeds an
//! [`InMemoryRepository`] from it.
//!
//! The out-of-scope admin surface (§1) is the real source of this data in a
//! deployed system; this loader exists so the CLI entry point (`main.rs`)
//! has something concrete to run against without a SQL backend.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::model::{ApiConfig, DatabaseConfig, EmailConfig, GlobalVariable, RedisConfig, ScheduledTask};
use crate::repository::InMemoryRepository;

#[derive(Debug, Default, Deserialize)]
pub struct Fixture {
    #[serde(default)]
    pub apis: Vec<ApiConfig>,
    #[serde(default)]
    pub globals: Vec<GlobalVariable>,
    #[serde(default)]
    pub databases: Vec<DatabaseConfig>,
    #[serde(default)]
    pub redis: Vec<RedisConfig>,
    #[serde(default)]
    pub emails: Vec<EmailConfig>,
    #[serde(default)]
    pub tasks: Vec<ScheduledTask>,
}

pub fn load_fixture_from_file<P: AsRef<Path>>(path: P) -> Result<Fixture> {
    let content = fs::read_to_string(path).context("failed to read fixture file")?;
    let fixture: Fixture = serde_json::from_str(&content).context("failed to parse fixture JSON")?;
    Ok(fixture)
}

/// Builds an [`InMemoryRepository`] pre-populated from `fixture`.
pub fn repository_from_fixture(fixture: Fixture) -> InMemoryRepository {
    let repo = InMemoryRepository::new();
    for api in fixture.apis {
        repo.insert_api(api);
    }
    for global in fixture.globals {
        repo.insert_global(global);
    }
    for db in fixture.databases {
        repo.insert_database(db);
    }
    for redis in fixture.redis {
        repo.insert_redis(redis);
    }
    for task in fixture.tasks {
        repo.insert_task(task);
    }
    for email in fixture.emails {
        repo.insert_email(email);
    }
    repo
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_fixture() {
        let json = r#"{"apis": [], "globals": []}"#;
        let fixture: Fixture = serde_json::from_str(json).unwrap();
        assert!(fixture.apis.is_empty());
        assert!(fixture.tasks.is_empty());
    }
}
