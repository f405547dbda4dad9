//! Redis Unit (§4.F): typed GET/SET/DEL/SCAN/TTL/EXPIRE plus the
//! captcha-extract-to-global helper, grounded in `redis_utils.py`.
//!
//! `redis_get` shapes its return by the key's Redis type (string/hash/list/
//! set/zset) the same way the source platform does, rather than returning
//! one raw bytes value for every type.

use std::collections::HashMap;

use redis::AsyncCommands;
use serde_json::{json, Value};

use crate::errors::EngineError;
use crate::model::RedisConfig;
use crate::variables::VariableStore;

pub struct RedisUnit {
    client: redis::Client,
}

impl RedisUnit {
    pub fn connect(cfg: &RedisConfig) -> Result<Self, EngineError> {
        let url = if cfg.password.is_empty() {
            format!("redis://{}:{}/{}", cfg.host, cfg.port, cfg.db)
        } else {
            format!("redis://:{}@{}:{}/{}", cfg.password, cfg.host, cfg.port, cfg.db)
        };
        let client = redis::Client::open(url).map_err(|e| EngineError::redis(format!("bad redis url: {e}")))?;
        Ok(Self { client })
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection, EngineError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| EngineError::redis(format!("connection failed: {e}")))
    }

    /// `test_connection`: PING round-trip.
    pub async fn ping(&self) -> Result<(), EngineError> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| EngineError::redis(format!("ping failed: {e}")))?;
        Ok(())
    }

    /// `redis_get`: returns a JSON shape matching the key's Redis type, or a
    /// `{"value": null, "message": "key不存在"}`-style miss when absent.
    pub async fn get(&self, key: &str) -> Result<Value, EngineError> {
        let mut conn = self.conn().await?;
        let key_type: String = conn
            .key_type(key)
            .await
            .map_err(|e| EngineError::redis(format!("TYPE failed: {e}")))?;

        let shaped = match key_type.as_str() {
            "string" => {
                let v: Option<String> = conn
                    .get(key)
                    .await
                    .map_err(|e| EngineError::redis(format!("GET failed: {e}")))?;
                json!({"success": true, "key": key, "type": "string", "value": v})
            }
            "hash" => {
                let v: HashMap<String, String> = conn
                    .hgetall(key)
                    .await
                    .map_err(|e| EngineError::redis(format!("HGETALL failed: {e}")))?;
                json!({"success": true, "key": key, "type": "hash", "value": v})
            }
            "list" => {
                let v: Vec<String> = conn
                    .lrange(key, 0, -1)
                    .await
                    .map_err(|e| EngineError::redis(format!("LRANGE failed: {e}")))?;
                json!({"success": true, "key": key, "type": "list", "value": v})
            }
            "set" => {
                let v: Vec<String> = conn
                    .smembers(key)
                    .await
                    .map_err(|e| EngineError::redis(format!("SMEMBERS failed: {e}")))?;
                json!({"success": true, "key": key, "type": "set", "value": v})
            }
            "zset" => {
                let v: Vec<(String, f64)> = conn
                    .zrange_withscores(key, 0, -1)
                    .await
                    .map_err(|e| EngineError::redis(format!("ZRANGE failed: {e}")))?;
                let members: Vec<Value> = v
                    .into_iter()
                    .map(|(member, score)| json!({"member": member, "score": score}))
                    .collect();
                json!({"success": true, "key": key, "type": "zset", "value": members})
            }
            "none" => json!({"success": true, "key": key, "type": "none", "value": null, "message": "key does not exist"}),
            other => json!({"success": false, "key": key, "type": other, "error": "unsupported redis type"}),
        };
        Ok(shaped)
    }

    /// `redis_set`: `SETEX` when `ttl > 0`, else a plain `SET`.
    pub async fn set(&self, key: &str, value: &str, ttl_secs: i64) -> Result<(), EngineError> {
        let mut conn = self.conn().await?;
        if ttl_secs > 0 {
            conn.set_ex::<_, _, ()>(key, value, ttl_secs as u64)
                .await
                .map_err(|e| EngineError::redis(format!("SETEX failed: {e}")))?;
        } else {
            conn.set::<_, _, ()>(key, value)
                .await
                .map_err(|e| EngineError::redis(format!("SET failed: {e}")))?;
        }
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<i64, EngineError> {
        let mut conn = self.conn().await?;
        conn.del(key).await.map_err(|e| EngineError::redis(format!("DEL failed: {e}")))
    }

    pub async fn ttl(&self, key: &str) -> Result<i64, EngineError> {
        let mut conn = self.conn().await?;
        conn.ttl(key).await.map_err(|e| EngineError::redis(format!("TTL failed: {e}")))
    }

    pub async fn expire(&self, key: &str, ttl_secs: i64) -> Result<bool, EngineError> {
        let mut conn = self.conn().await?;
        conn.expire(key, ttl_secs)
            .await
            .map_err(|e| EngineError::redis(format!("EXPIRE failed: {e}")))
    }

    /// `redis_scan`: iterates `SCAN` cursors, capping the total at 200 keys
    /// and returning them sorted, matching the source platform's limit.
    pub async fn scan(&self, pattern: &str, count: usize) -> Result<Vec<String>, EngineError> {
        let mut conn = self.conn().await?;
        let mut cursor: u64 = 0;
        let mut found: Vec<String> = Vec::new();
        loop {
            let (next_cursor, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(count)
                .query_async(&mut conn)
                .await
                .map_err(|e| EngineError::redis(format!("SCAN failed: {e}")))?;
            found.extend(batch);
            cursor = next_cursor;
            if cursor == 0 || found.len() >= 200 {
                break;
            }
        }
        found.truncate(200);
        found.sort();
        Ok(found)
    }

    /// `fetch_captcha_to_global`: substitutes `{{var}}` into the key
    /// template, reads it, optionally pulls one field out of a JSON value,
    /// and writes the final string to the runtime Variable Store (the
    /// persisted `GlobalVariable` side of this dual-write is the caller's
    /// responsibility via the repository trait).
    pub async fn fetch_to_global(
        &self,
        key_template: &str,
        var_name: &str,
        extract_field: Option<&str>,
        vars: &mut VariableStore,
    ) -> Result<String, EngineError> {
        let key = vars.substitute(key_template);
        let shaped = self.get(&key).await?;
        let raw_value = shaped.get("value").cloned().unwrap_or(Value::Null);
        let final_value = match extract_field {
            Some(field) => {
                let as_json: Value = match &raw_value {
                    Value::String(s) => serde_json::from_str(s).unwrap_or(Value::Null),
                    other => other.clone(),
                };
                as_json
                    .get(field)
                    .map(crate::extract::stringify)
                    .unwrap_or_default()
            }
            None => crate::extract::stringify(&raw_value),
        };
        vars.set(var_name, final_value.clone());
        Ok(final_value)
    }
}

#[cfg(test)]
mod tests {
    // RedisUnit requires a live connection for every operation; its pure
    // logic (key templating, field extraction) is exercised indirectly via
    // `variables::tests` and `extract::tests`. No fixture-free unit tests
    // apply here.
}
