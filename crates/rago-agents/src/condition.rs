//! Branch and loop predicates
//!
//! Grammar: `<path> <op> <literal>` where `op` is one of `==`, `!=`, `>=`,
//! `<=`, `>`, `<` or `contains`, or a bare `<path>` tested for truthiness.
//! Literals are JSON (`3`, `true`, `"text"`, `null`) or bare words taken
//! as strings. Paths may be wrapped in `{{ }}`.

use crate::template::Scope;
use rago_core::{Component, ErrorKind, RagoError, RagoResult};
use serde_json::Value;
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Contains,
}

impl Operator {
    /// Longer symbols first so `>=` is not read as `>`
    const SYMBOLS: [(&'static str, Operator); 7] = [
        (" contains ", Operator::Contains),
        ("==", Operator::Eq),
        ("!=", Operator::Ne),
        (">=", Operator::Ge),
        ("<=", Operator::Le),
        (">", Operator::Gt),
        ("<", Operator::Lt),
    ];
}

/// Parsed predicate
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Truthy(String),
    Compare {
        path: String,
        op: Operator,
        literal: Value,
    },
    Literal(bool),
}

impl Condition {
    pub fn parse(source: &str) -> RagoResult<Self> {
        let text = source.trim();
        if text.is_empty() {
            return Err(invalid(source, "empty condition"));
        }
        match text {
            "true" => return Ok(Condition::Literal(true)),
            "false" => return Ok(Condition::Literal(false)),
            _ => {}
        }

        for (symbol, op) in Operator::SYMBOLS {
            if let Some(at) = text.find(symbol) {
                let path = unwrap_braces(text[..at].trim());
                let literal = text[at + symbol.len()..].trim();
                if path.is_empty() || literal.is_empty() {
                    return Err(invalid(source, "operator needs a path and a value"));
                }
                validate_path(source, path)?;
                return Ok(Condition::Compare {
                    path: path.to_string(),
                    op,
                    literal: parse_literal(literal),
                });
            }
        }

        let path = unwrap_braces(text);
        validate_path(source, path)?;
        Ok(Condition::Truthy(path.to_string()))
    }

    pub fn evaluate(&self, scope: &Scope) -> bool {
        match self {
            Condition::Literal(b) => *b,
            Condition::Truthy(path) => scope.resolve(path).map(|v| truthy(&v)).unwrap_or(false),
            Condition::Compare { path, op, literal } => {
                let value = scope.resolve(path).unwrap_or(Value::Null);
                compare(&value, *op, literal)
            }
        }
    }
}

fn invalid(source: &str, reason: &str) -> RagoError {
    RagoError::new(
        ErrorKind::InvalidWorkflow,
        format!("invalid condition '{}': {}", source, reason),
    )
    .at(Component::Agents, "parse_condition")
}

fn unwrap_braces(text: &str) -> &str {
    text.strip_prefix("{{")
        .and_then(|t| t.strip_suffix("}}"))
        .map(str::trim)
        .unwrap_or(text)
}

fn validate_path(source: &str, path: &str) -> RagoResult<()> {
    let root = path.split('.').next().unwrap_or_default();
    if matches!(root, "inputs" | "steps" | "loop") && path.contains('.') {
        Ok(())
    } else {
        Err(invalid(
            source,
            "paths start with inputs., steps.<id>.output or loop.iteration",
        ))
    }
}

fn parse_literal(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| {
        Value::String(text.trim_matches(|c| c == '\'' || c == '"').to_string())
    })
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty() && s != "false",
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn ordering(left: &Value, right: &Value) -> Option<Ordering> {
    match (as_number(left), as_number(right)) {
        (Some(a), Some(b)) => a.partial_cmp(&b),
        _ => match (left, right) {
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            _ => None,
        },
    }
}

fn equals(left: &Value, right: &Value) -> bool {
    if left == right {
        return true;
    }
    match (as_number(left), as_number(right)) {
        (Some(a), Some(b)) => a == b,
        _ => match (left, right) {
            (Value::String(a), Value::Bool(b)) | (Value::Bool(b), Value::String(a)) => {
                a == &b.to_string()
            }
            _ => false,
        },
    }
}

fn compare(value: &Value, op: Operator, literal: &Value) -> bool {
    match op {
        Operator::Eq => equals(value, literal),
        Operator::Ne => !equals(value, literal),
        Operator::Gt => ordering(value, literal) == Some(Ordering::Greater),
        Operator::Ge => matches!(
            ordering(value, literal),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        Operator::Lt => ordering(value, literal) == Some(Ordering::Less),
        Operator::Le => matches!(
            ordering(value, literal),
            Some(Ordering::Less | Ordering::Equal)
        ),
        Operator::Contains => match value {
            Value::String(s) => match literal {
                Value::String(needle) => s.contains(needle.as_str()),
                other => s.contains(&other.to_string()),
            },
            Value::Array(items) => items.iter().any(|item| equals(item, literal)),
            Value::Object(map) => literal.as_str().map(|k| map.contains_key(k)).unwrap_or(false),
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rago_core::StepStatus;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn scope() -> Scope {
        let mut inputs = BTreeMap::new();
        inputs.insert("env".to_string(), json!("prod"));
        inputs.insert("retries".to_string(), json!(2));
        let mut scope = Scope::new(inputs);
        scope.record(
            "check",
            StepStatus::Completed,
            json!({"status": "ok", "count": 5, "tags": ["a", "b"], "empty": ""}),
        );
        scope
    }

    fn eval(source: &str) -> bool {
        Condition::parse(source).unwrap().evaluate(&scope())
    }

    #[test]
    fn test_comparisons() {
        assert!(eval("inputs.env == prod"));
        assert!(eval("inputs.env == \"prod\""));
        assert!(eval("inputs.env != staging"));
        assert!(eval("steps.check.output.count > 3"));
        assert!(eval("steps.check.output.count >= 5"));
        assert!(!eval("steps.check.output.count < 5"));
        assert!(eval("steps.check.output.count <= 5"));
        assert!(eval("inputs.retries == 2.0"));
        assert!(eval("{{steps.check.output.status}} == ok"));
    }

    #[test]
    fn test_contains_and_truthiness() {
        assert!(eval("steps.check.output.tags contains a"));
        assert!(!eval("steps.check.output.tags contains z"));
        assert!(eval("inputs.env contains ro"));
        assert!(eval("steps.check.output.count"));
        assert!(!eval("steps.check.output.empty"));
        assert!(!eval("steps.missing.output"));
        assert!(eval("true"));
    }

    #[test]
    fn test_loop_iteration() {
        let cond = Condition::parse("loop.iteration >= 2").unwrap();
        assert!(!cond.evaluate(&scope().with_iteration(1)));
        assert!(cond.evaluate(&scope().with_iteration(2)));
    }

    #[test]
    fn test_parse_errors() {
        assert!(Condition::parse("").is_err());
        assert!(Condition::parse("== 3").is_err());
        let err = Condition::parse("banana > 3").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidWorkflow);
    }
}
