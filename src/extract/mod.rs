//! Extractor (§4.D): pulls a single value out of a JSON document by a
//! dotted/indexed path, used both for `extract_vars` (pipeline stage 9) and
//! for `json_path` assertions.
//!
//! Path grammar: segments separated by `.`, with an optional `[index]`
//! suffix on any segment for array indexing (e.g. `items[0].name`); a bare
//! all-digit segment also indexes into an array, for paths written as
//! `items.0.name`. A leading `$`, `/`, or `.` is stripped before splitting. A
//! missing key, an out-of-range index, or indexing into a scalar all yield
//! `None` rather than an error — extraction failures are soft, matching
//! `executor.py`'s `_extract_by_path` (`try/except` collapsing to `None`).

use serde_json::Value;

/// Walks `data` along `path` (e.g. `"data.items[0].id"`) and returns the
/// value found, or `None` if any segment fails to resolve.
pub fn extract<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.trim_start_matches(['$', '/', '.']);
    if path.is_empty() {
        return Some(data);
    }
    let mut current = data;
    for raw_segment in path.split('.') {
        if raw_segment.is_empty() {
            continue;
        }
        for segment in split_bracket_indexes(raw_segment) {
            if segment.is_empty() {
                continue;
            }
            current = if let Ok(index) = segment.parse::<usize>() {
                current.as_array()?.get(index)?
            } else {
                current.as_object()?.get(segment)?
            };
        }
    }
    Some(current)
}

/// Splits `name[0][1]`-style segments into `["name", "0", "1"]`; a segment
/// with no brackets passes through unchanged.
fn split_bracket_indexes(segment: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut rest = segment;
    while let Some(open) = rest.find('[') {
        if open > 0 {
            parts.push(&rest[..open]);
        }
        let Some(close) = rest[open..].find(']') else {
            parts.push(rest);
            return parts;
        };
        parts.push(&rest[open + 1..open + close]);
        rest = &rest[open + close + 1..];
    }
    if !rest.is_empty() {
        parts.push(rest);
    }
    parts
}

/// Stringifies an extracted value for storage in the Variable Store: strings
/// pass through unquoted, everything else becomes its compact JSON form.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_nested_object_field() {
        let data = json!({"data": {"user": {"id": 42}}});
        assert_eq!(extract(&data, "data.user.id"), Some(&json!(42)));
    }

    #[test]
    fn extracts_array_index() {
        let data = json!({"items": [{"name": "a"}, {"name": "b"}]});
        assert_eq!(extract(&data, "items.1.name"), Some(&json!("b")));
    }

    #[test]
    fn missing_path_yields_none() {
        let data = json!({"a": 1});
        assert_eq!(extract(&data, "a.b.c"), None);
    }

    #[test]
    fn out_of_range_index_yields_none() {
        let data = json!({"items": [1, 2]});
        assert_eq!(extract(&data, "items.5"), None);
    }

    #[test]
    fn empty_path_returns_whole_document() {
        let data = json!({"a": 1});
        assert_eq!(extract(&data, ""), Some(&data));
    }

    #[test]
    fn extracts_bracket_style_array_index() {
        let data = json!({"items": [{"name": "a"}, {"name": "b"}]});
        assert_eq!(extract(&data, "items[1].name"), Some(&json!("b")));
    }

    #[test]
    fn strips_leading_slash_before_splitting() {
        let data = json!({"a": {"b": 1}});
        assert_eq!(extract(&data, "/a.b"), Some(&json!(1)));
    }

    #[test]
    fn stringify_unquotes_strings_but_not_numbers() {
        assert_eq!(stringify(&json!("abc")), "abc");
        assert_eq!(stringify(&json!(42)), "42");
        assert_eq!(stringify(&json!(null)), "");
    }
}
