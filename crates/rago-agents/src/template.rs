//! `{{path}}` placeholders in step parameters
//!
//! Paths resolve against the execution scope:
//!
//! - `inputs.<key>[.path]`
//! - `steps.<id>.output[.path]` and `steps.<id>.status`
//! - `loop.iteration` (zero-based, inside a loop body)
//!
//! A string that is exactly one placeholder is replaced by the referenced
//! JSON value; placeholders embedded in longer text are rendered as text.

use regex::Regex;
use rago_core::StepStatus;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;
use tracing::debug;

fn placeholder() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_.\-\[\]]+)\s*\}\}").expect("valid regex")
    })
}

/// Values visible to templates and conditions
#[derive(Debug, Clone, Default)]
pub struct Scope {
    inputs: BTreeMap<String, Value>,
    steps: HashMap<String, (StepStatus, Value)>,
    iteration: Option<u32>,
}

impl Scope {
    pub fn new(inputs: BTreeMap<String, Value>) -> Self {
        Self {
            inputs,
            ..Default::default()
        }
    }

    pub fn record(&mut self, step_id: impl Into<String>, status: StepStatus, output: Value) {
        self.steps.insert(step_id.into(), (status, output));
    }

    pub fn with_iteration(mut self, iteration: u32) -> Self {
        self.iteration = Some(iteration);
        self
    }

    pub fn set_iteration(&mut self, iteration: u32) {
        self.iteration = Some(iteration);
    }

    /// Looks up a dotted path; numeric segments index arrays
    pub fn resolve(&self, path: &str) -> Option<Value> {
        let mut segments = split_path(path);
        let root = segments.next()?;
        match root.as_str() {
            "inputs" => {
                let key = segments.next()?;
                descend(self.inputs.get(&key)?, segments)
            }
            "steps" => {
                let id = segments.next()?;
                let (status, output) = self.steps.get(&id)?;
                match segments.next()?.as_str() {
                    "output" => descend(output, segments),
                    "status" => Some(Value::String(step_status_name(*status).to_string())),
                    _ => None,
                }
            }
            "loop" => match segments.next()?.as_str() {
                "iteration" => self.iteration.map(Value::from),
                _ => None,
            },
            _ => None,
        }
    }

    /// Renders every string inside `value`
    pub fn render(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => self.render_value(s),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.render(v)).collect()),
            Value::Object(map) => {
                let mut out = Map::new();
                for (k, v) in map {
                    out.insert(k.clone(), self.render(v));
                }
                Value::Object(out)
            }
            other => other.clone(),
        }
    }

    /// Renders a template to text
    pub fn render_str(&self, template: &str) -> String {
        placeholder()
            .replace_all(template, |caps: &regex::Captures| match self.resolve(&caps[1]) {
                Some(Value::String(s)) => s,
                Some(Value::Null) | None => {
                    debug!(path = &caps[1], "Unresolved template reference");
                    String::new()
                }
                Some(other) => other.to_string(),
            })
            .into_owned()
    }

    fn render_value(&self, template: &str) -> Value {
        if let Some(caps) = placeholder().captures(template) {
            if caps.get(0).map(|m| m.as_str().len()) == Some(template.trim().len())
                && template.trim().starts_with("{{")
            {
                return self.resolve(&caps[1]).unwrap_or(Value::Null);
            }
        }
        Value::String(self.render_str(template))
    }
}

fn split_path(path: &str) -> impl Iterator<Item = String> + '_ {
    path.split(['.', '[', ']'])
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

fn descend(value: &Value, segments: impl Iterator<Item = String>) -> Option<Value> {
    let mut current = value;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(&segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}

fn step_status_name(status: StepStatus) -> &'static str {
    match status {
        StepStatus::Pending => "pending",
        StepStatus::Running => "running",
        StepStatus::Completed => "completed",
        StepStatus::Failed => "failed",
        StepStatus::Skipped => "skipped",
        StepStatus::Cancelled => "cancelled",
    }
}
