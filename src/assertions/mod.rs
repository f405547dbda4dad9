//! Assertion Evaluators (§4.C): four evaluator classes sharing one operator
//! set, grounded in `db_utils.py`'s `OPERATORS` table and `executor.py`'s
//! HTTP-assertion and structural-diff handling.
//!
//! `==`/`!=` compare stringified values, `> < >= <=` coerce both sides to a
//! float (defaulting to `0.0` on parse failure — never erroring), `contains`
//! is a substring check, `not_empty` is true unless the value is absent,
//! empty, or the literal string `"0"`.

use std::collections::HashMap;

use serde_json::Value;

use crate::extract;
use crate::model::{Assertion, AssertionType, CompareOperator, DbAssertionRule, DeepDiffAssertion};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssertionStatus {
    Pass,
    Fail,
}

#[derive(Debug, Clone)]
pub struct AssertionOutcome {
    pub label: String,
    pub status: AssertionStatus,
    pub message: String,
}

impl AssertionOutcome {
    pub fn passed(&self) -> bool {
        self.status == AssertionStatus::Pass
    }
}

/// `_to_num`: best-effort float coercion, defaulting to `0.0`.
fn to_num(s: &str) -> f64 {
    s.trim().parse::<f64>().unwrap_or(0.0)
}

/// `not_empty`: false for `None`, `""`, or the literal `"0"`.
fn is_not_empty(s: Option<&str>) -> bool {
    match s {
        None => false,
        Some(v) => !v.is_empty() && v != "0",
    }
}

/// Applies one comparison operator the way `db_utils.OPERATORS` does, over
/// stringified operands.
pub fn compare(op: CompareOperator, actual: Option<&str>, expected: &str) -> bool {
    match op {
        CompareOperator::Eq => actual.unwrap_or("") == expected,
        CompareOperator::Ne => actual.unwrap_or("") != expected,
        CompareOperator::Gt => to_num(actual.unwrap_or("")) > to_num(expected),
        CompareOperator::Lt => to_num(actual.unwrap_or("")) < to_num(expected),
        CompareOperator::Ge => to_num(actual.unwrap_or("")) >= to_num(expected),
        CompareOperator::Le => to_num(actual.unwrap_or("")) <= to_num(expected),
        CompareOperator::Contains => actual.unwrap_or("").contains(expected),
        CompareOperator::NotEmpty => is_not_empty(actual),
    }
}

// ===========================================================================
// HTTP assertion evaluator
// ===========================================================================

/// Evaluates one `assertions[]` entry (§4.C, HTTP assertion class) against
/// the dispatched response.
pub fn evaluate_http_assertion(
    assertion: &Assertion,
    status_code: u16,
    body: &Value,
) -> AssertionOutcome {
    match assertion.kind {
        AssertionType::StatusCode => {
            let expected = assertion
                .expected
                .as_ref()
                .and_then(|v| v.as_u64())
                .unwrap_or(200) as u16;
            if status_code == expected {
                AssertionOutcome {
                    label: "status_code".into(),
                    status: AssertionStatus::Pass,
                    message: format!("status_code == {expected}"),
                }
            } else {
                AssertionOutcome {
                    label: "status_code".into(),
                    status: AssertionStatus::Fail,
                    message: format!("expected status_code {expected}, got {status_code}"),
                }
            }
        }
        AssertionType::JsonPath => {
            let path = assertion.path.clone().unwrap_or_default();
            let found = extract::extract(body, &path);
            let expected = assertion.expected.clone().unwrap_or(Value::Null);
            match found {
                Some(actual) if *actual == expected => AssertionOutcome {
                    label: format!("json_path:{path}"),
                    status: AssertionStatus::Pass,
                    message: format!("{path} == {expected}"),
                },
                Some(actual) => AssertionOutcome {
                    label: format!("json_path:{path}"),
                    status: AssertionStatus::Fail,
                    message: format!("{path}: expected {expected}, got {actual}"),
                },
                None => AssertionOutcome {
                    label: format!("json_path:{path}"),
                    status: AssertionStatus::Fail,
                    message: format!("{path}: path not found"),
                },
            }
        }
        AssertionType::Contains => {
            let needle = assertion
                .expected
                .as_ref()
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            let haystack = serde_json::to_string(body).unwrap_or_default();
            if haystack.contains(needle) {
                AssertionOutcome {
                    label: "contains".to_string(),
                    status: AssertionStatus::Pass,
                    message: format!("body contains {needle:?}"),
                }
            } else {
                AssertionOutcome {
                    label: "contains".to_string(),
                    status: AssertionStatus::Fail,
                    message: format!("body does not contain {needle:?}"),
                }
            }
        }
        AssertionType::NotEmpty => {
            let path = assertion.path.clone().unwrap_or_default();
            let value = extract::extract(body, &path).map(extract::stringify);
            if is_not_empty(value.as_deref()) {
                AssertionOutcome {
                    label: format!("not_empty:{path}"),
                    status: AssertionStatus::Pass,
                    message: format!("{path} is not empty"),
                }
            } else {
                AssertionOutcome {
                    label: format!("not_empty:{path}"),
                    status: AssertionStatus::Fail,
                    message: format!("{path} is empty"),
                }
            }
        }
        AssertionType::Regex => {
            let path = assertion.path.clone().unwrap_or_default();
            let pattern = assertion
                .expected
                .as_ref()
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            let haystack = extract::extract(body, &path)
                .map(extract::stringify)
                .unwrap_or_default();
            match regex::Regex::new(pattern) {
                Ok(re) if re.is_match(&haystack) => AssertionOutcome {
                    label: format!("regex:{path}"),
                    status: AssertionStatus::Pass,
                    message: format!("{path} matches {pattern}"),
                },
                Ok(_) => AssertionOutcome {
                    label: format!("regex:{path}"),
                    status: AssertionStatus::Fail,
                    message: format!("{path} does not match {pattern}"),
                },
                Err(e) => AssertionOutcome {
                    label: format!("regex:{path}"),
                    status: AssertionStatus::Fail,
                    message: format!("invalid regex {pattern:?}: {e}"),
                },
            }
        }
    }
}

// ===========================================================================
// Structural-diff evaluator
// ===========================================================================

/// Deep-compares `actual` against `rule.expected`, ignoring any field name in
/// `ignore_fields` at any depth and comparing numeric leaves up to 6
/// significant digits. Falls back to canonical-JSON equality when no
/// specialised handling applies (i.e. this *is* the canonical comparison,
/// walked recursively).
pub fn evaluate_structural_diff(rule: &DeepDiffAssertion, actual_doc: &Value) -> AssertionOutcome {
    let scoped_actual = match &rule.check_path {
        Some(path) => extract::extract(actual_doc, path).cloned().unwrap_or(Value::Null),
        None => actual_doc.clone(),
    };
    let mut diffs = Vec::new();
    diff_values("$", &scoped_actual, &rule.expected, &rule.ignore_fields, &mut diffs);
    if diffs.is_empty() {
        AssertionOutcome {
            label: rule.label.clone(),
            status: AssertionStatus::Pass,
            message: "no structural differences".to_string(),
        }
    } else {
        AssertionOutcome {
            label: rule.label.clone(),
            status: AssertionStatus::Fail,
            message: diffs.join("; "),
        }
    }
}

fn numbers_approx_equal(a: f64, b: f64) -> bool {
    if a == b {
        return true;
    }
    let sig = |x: f64| -> f64 {
        if x == 0.0 {
            0.0
        } else {
            let mag = x.abs().log10().floor();
            (x / 10f64.powf(mag - 5.0)).round() * 10f64.powf(mag - 5.0)
        }
    };
    sig(a) == sig(b)
}

fn diff_values(path: &str, actual: &Value, expected: &Value, ignore: &[String], out: &mut Vec<String>) {
    match (actual, expected) {
        (Value::Object(a), Value::Object(e)) => {
            for (key, evalue) in e {
                if ignore.iter().any(|f| f == key) {
                    continue;
                }
                let child_path = format!("{path}.{key}");
                match a.get(key) {
                    Some(avalue) => diff_values(&child_path, avalue, evalue, ignore, out),
                    None => out.push(format!("{child_path}: missing in actual")),
                }
            }
        }
        (Value::Array(a), Value::Array(e)) => {
            if a.len() != e.len() {
                out.push(format!("{path}: array length {} != expected {}", a.len(), e.len()));
                return;
            }
            for (i, (av, ev)) in a.iter().zip(e.iter()).enumerate() {
                diff_values(&format!("{path}[{i}]"), av, ev, ignore, out);
            }
        }
        (Value::Number(a), Value::Number(e)) => {
            if !numbers_approx_equal(a.as_f64().unwrap_or(0.0), e.as_f64().unwrap_or(0.0)) {
                out.push(format!("{path}: {a} != expected {e}"));
            }
        }
        (a, e) if a != e => out.push(format!("{path}: {a} != expected {e}")),
        _ => {}
    }
}

// ===========================================================================
// DB assertion evaluator (single- and multi-field)
// ===========================================================================

/// Evaluates one `db_assertions[]` rule against the first row returned by its
/// query. `run_db_assertions` unifies legacy single-field and multi-field
/// shapes into `field_checks`; a query that returned no rows fails every
/// check against a missing column.
pub fn evaluate_db_assertion(
    rule: &DbAssertionRule,
    row: Option<&HashMap<String, Option<String>>>,
) -> AssertionOutcome {
    let checks = rule.field_checks();
    let mut messages = Vec::new();
    let mut all_pass = !checks.is_empty() && row.is_some();
    for check in &checks {
        let actual = row.and_then(|r| r.get(&check.field)).and_then(|v| v.as_deref());
        let pass = row.is_some() && compare(check.operator, actual, &check.expected);
        all_pass &= pass;
        messages.push(format!(
            "{}: actual={:?} expected={:?} -> {}",
            check.field,
            actual,
            check.expected,
            if pass { "pass" } else { "fail" }
        ));
    }
    if row.is_none() {
        messages.insert(0, "query returned no rows".to_string());
    }
    AssertionOutcome {
        label: rule.label_or_default(),
        status: if all_pass { AssertionStatus::Pass } else { AssertionStatus::Fail },
        message: messages.join("; "),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn db_assertion_passes_when_all_field_checks_pass() {
        let rule = DbAssertionRule {
            db_id: 1,
            sql: "SELECT * FROM users WHERE id=1".to_string(),
            label: None,
            field: None,
            operator: None,
            expected: None,
            fields: Some(vec![crate::model::DbFieldCheck {
                field: "status".to_string(),
                operator: CompareOperator::Eq,
                expected: "active".to_string(),
            }]),
        };
        let mut row = HashMap::new();
        row.insert("status".to_string(), Some("active".to_string()));
        assert!(evaluate_db_assertion(&rule, Some(&row)).passed());
    }

    #[test]
    fn db_assertion_fails_when_no_rows_returned() {
        let rule = DbAssertionRule {
            db_id: 1,
            sql: "SELECT * FROM users WHERE id=999".to_string(),
            label: None,
            field: Some("status".to_string()),
            operator: Some(CompareOperator::Eq),
            expected: Some("active".to_string()),
            fields: None,
        };
        assert!(!evaluate_db_assertion(&rule, None).passed());
    }

    #[test]
    fn compare_operators_match_db_semantics() {
        assert!(compare(CompareOperator::Eq, Some("5"), "5"));
        assert!(compare(CompareOperator::Gt, Some("10"), "2"));
        assert!(compare(CompareOperator::Gt, Some("not-a-number"), "-1"));
        assert!(!compare(CompareOperator::NotEmpty, Some("0"), ""));
        assert!(compare(CompareOperator::NotEmpty, Some("0.0"), ""));
        assert!(!compare(CompareOperator::NotEmpty, None, ""));
        assert!(compare(CompareOperator::Contains, Some("hello world"), "world"));
    }

    #[test]
    fn http_status_code_assertion_pass_and_fail() {
        let a = Assertion {
            kind: AssertionType::StatusCode,
            path: None,
            expected: Some(json!(200)),
        };
        let outcome = evaluate_http_assertion(&a, 200, &json!({}));
        assert!(outcome.passed());
        let outcome = evaluate_http_assertion(&a, 404, &json!({}));
        assert!(!outcome.passed());
    }

    #[test]
    fn json_path_assertion_pass() {
        let a = Assertion {
            kind: AssertionType::JsonPath,
            path: Some("data.id".to_string()),
            expected: Some(json!(42)),
        };
        let body = json!({"data": {"id": 42}});
        assert!(evaluate_http_assertion(&a, 200, &body).passed());
    }

    #[test]
    fn contains_assertion_ignores_path_and_searches_whole_body() {
        let a = Assertion {
            kind: AssertionType::Contains,
            path: Some("data.name".to_string()),
            expected: Some(json!("foo")),
        };
        let body = json!({"other": "foo"});
        assert!(evaluate_http_assertion(&a, 200, &body).passed());
    }

    #[test]
    fn structural_diff_ignores_named_fields() {
        let rule = DeepDiffAssertion {
            label: "diff".to_string(),
            expected: json!({"id": 1, "updated_at": "2020-01-01"}),
            ignore_fields: vec!["updated_at".to_string()],
            check_path: None,
        };
        let actual = json!({"id": 1, "updated_at": "2026-07-28"});
        assert!(evaluate_structural_diff(&rule, &actual).passed());
    }

    #[test]
    fn structural_diff_tolerates_tiny_float_noise() {
        let rule = DeepDiffAssertion {
            label: "diff".to_string(),
            expected: json!({"ratio": 0.333333}),
            ignore_fields: vec![],
            check_path: None,
        };
        let actual = json!({"ratio": 0.3333330001});
        assert!(evaluate_structural_diff(&rule, &actual).passed());
    }

    #[test]
    fn structural_diff_reports_missing_field() {
        let rule = DeepDiffAssertion {
            label: "diff".to_string(),
            expected: json!({"id": 1, "name": "a"}),
            ignore_fields: vec![],
            check_path: None,
        };
        let actual = json!({"id": 1});
        let outcome = evaluate_structural_diff(&rule, &actual);
        assert!(!outcome.passed());
        assert!(outcome.message.contains("name"));
    }
}
