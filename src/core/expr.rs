//! `${{ path.to.value }}` expressions inside input values.
//!
//! The graph builder scans expressions to derive edges; the executor
//! substitutes them with dependency outputs right before a module runs.

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

static EXPRESSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{\{\s*([^}]*?)\s*\}\}").expect("expression pattern is valid")
});

static PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_\-]+(\.[A-Za-z0-9_\-]+)*$").expect("path pattern is valid")
});

/// Collect the inner text of every expression found in string leaves.
pub fn scan(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            for cap in EXPRESSION.captures_iter(s) {
                out.push(cap[1].to_string());
            }
        }
        Value::Array(items) => items.iter().for_each(|v| scan(v, out)),
        Value::Object(map) => map.values().for_each(|v| scan(v, out)),
        _ => {}
    }
}

/// Number of `${{` openers that never close. Used by validation.
pub fn unclosed(s: &str) -> usize {
    let opened = s.matches("${{").count();
    let matched = EXPRESSION.find_iter(s).count();
    opened.saturating_sub(matched)
}

/// Whether an expression body is a dotted path.
pub fn is_valid_path(expr: &str) -> bool {
    PATH.is_match(expr)
}

pub fn segments(expr: &str) -> Vec<&str> {
    expr.split('.').collect()
}

/// Walk into a JSON value by dotted segments. Numeric segments index arrays.
pub fn lookup<'a>(value: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(value, |cur, seg| match cur {
        Value::Object(map) => map.get(seg),
        Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Substitute every expression using `resolve`.
///
/// A string consisting of exactly one expression takes the resolved value's
/// JSON type; embedded expressions are rendered as text. Expressions the
/// resolver cannot answer stay verbatim and are reported in `unresolved`.
pub fn interpolate<F>(value: &Value, resolve: &mut F, unresolved: &mut Vec<String>) -> Value
where
    F: FnMut(&str) -> Option<Value>,
{
    match value {
        Value::String(s) => {
            if let Some(cap) = EXPRESSION.captures(s) {
                let whole = cap.get(0).map(|m| m.as_str().len()) == Some(s.len());
                if whole {
                    return match resolve(&cap[1]) {
                        Some(v) => v,
                        None => {
                            unresolved.push(cap[1].to_string());
                            value.clone()
                        }
                    };
                }
            }
            let replaced = EXPRESSION.replace_all(s, |cap: &regex::Captures| {
                match resolve(&cap[1]) {
                    Some(v) => render(&v),
                    None => {
                        unresolved.push(cap[1].to_string());
                        cap[0].to_string()
                    }
                }
            });
            Value::String(replaced.into_owned())
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| interpolate(v, resolve, unresolved))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), interpolate(v, resolve, unresolved)))
                .collect(),
        ),
        other => other.clone(),
    }
}
