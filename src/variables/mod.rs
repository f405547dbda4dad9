//! Variable Store (§4.A): a flat `name -> String` map plus `{{name}}`
//! substitution over strings and nested JSON values.
//!
//! Grounded in `executor.py`'s `_replace_vars`, which matches `\{\{([^}]+)\}\}`
//! and trims the captured identifier before lookup. Unknown placeholders are
//! left verbatim, which gives substitution its fixed-point property: running
//! it twice on output that still contains unresolved `{{..}}` is a no-op past
//! the first pass.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\{\s*([^}]+?)\s*\}\}").unwrap());

/// Runtime variable store for one batch run. Not thread-safe by itself; the
/// batch runner owns one per sequential run and the pipeline borrows it
/// mutably one stage at a time.
#[derive(Debug, Default, Clone)]
pub struct VariableStore {
    vars: HashMap<String, String>,
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears all variables, as done before each batch run.
    pub fn reset(&mut self) {
        self.vars.clear();
    }

    /// Sets a variable, overwriting any existing value. Non-string values are
    /// stringified the same way extraction results are before storage.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(|s| s.as_str())
    }

    /// Seeds the store from a batch of global variables, used at batch start.
    pub fn extend(&mut self, entries: impl IntoIterator<Item = (String, String)>) {
        self.vars.extend(entries);
    }

    /// A point-in-time copy, used to log "variables at time of request" for a
    /// test result without holding a reference into the live store.
    pub fn snapshot(&self) -> HashMap<String, String> {
        self.vars.clone()
    }

    /// Replaces every `{{name}}` occurrence in `input` with the variable's
    /// current string value. Unresolved names (not present in the store) are
    /// left untouched, including their braces.
    pub fn substitute(&self, input: &str) -> String {
        PLACEHOLDER
            .replace_all(input, |caps: &regex::Captures| {
                let name = caps[1].trim();
                match self.vars.get(name) {
                    Some(v) => v.clone(),
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
    }

    /// Recursively substitutes through a JSON value: every string node (keys
    /// untouched, values walked) gets `substitute` applied; other node types
    /// are rebuilt structurally.
    pub fn substitute_deep(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.substitute(s)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.substitute_deep(v)).collect()),
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.substitute_deep(v));
                }
                Value::Object(out)
            }
            other => other.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_known_and_leaves_unknown_verbatim() {
        let mut store = VariableStore::new();
        store.set("token", "abc123");
        assert_eq!(store.substitute("Bearer {{token}}"), "Bearer abc123");
        assert_eq!(store.substitute("Bearer {{missing}}"), "Bearer {{missing}}");
    }

    #[test]
    fn trims_whitespace_inside_braces() {
        let mut store = VariableStore::new();
        store.set("id", "42");
        assert_eq!(store.substitute("{{ id }}"), "42");
    }

    #[test]
    fn substitution_is_idempotent_on_unresolved_output() {
        let store = VariableStore::new();
        let once = store.substitute("{{unknown}}");
        let twice = store.substitute(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn substitutes_deep_through_nested_json() {
        let mut store = VariableStore::new();
        store.set("name", "alice");
        let input = serde_json::json!({"user": {"name": "{{name}}", "tags": ["{{name}}", "static"]}});
        let out = store.substitute_deep(&input);
        assert_eq!(out["user"]["name"], "alice");
        assert_eq!(out["user"]["tags"][0], "alice");
        assert_eq!(out["user"]["tags"][1], "static");
    }

    #[test]
    fn reset_clears_all_variables() {
        let mut store = VariableStore::new();
        store.set("a", "1");
        store.reset();
        assert_eq!(store.get("a"), None);
    }
}
