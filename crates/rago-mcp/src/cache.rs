//! TTL cache for tool responses

use parking_lot::Mutex;
use rago_core::ToolOutput;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Argument field that bypasses the cache; stripped before dispatch
pub const NO_CACHE_FIELD: &str = "_no_cache";

#[derive(Debug)]
pub(crate) struct ResponseCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, (Instant, ToolOutput)>>,
}

impl ResponseCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn key(tool: &str, args: &Value) -> String {
        format!("{}\u{0}{}", tool, canonical(args))
    }

    pub fn get(&self, key: &str) -> Option<ToolOutput> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((stored, output)) if stored.elapsed() < self.ttl => {
                let mut output = output.clone();
                output.cached = true;
                Some(output)
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, key: String, output: ToolOutput) {
        let mut entries = self.entries.lock();
        let ttl = self.ttl;
        entries.retain(|_, (stored, _)| stored.elapsed() < ttl);
        entries.insert(key, (Instant::now(), output));
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// True when the marker field appears anywhere in the arguments
pub(crate) fn wants_bypass(args: &Value) -> bool {
    match args {
        Value::Object(map) => {
            map.contains_key(NO_CACHE_FIELD) || map.values().any(wants_bypass)
        }
        Value::Array(items) => items.iter().any(wants_bypass),
        _ => false,
    }
}

/// Removes the marker at every depth
pub(crate) fn strip_marker(args: Value) -> Value {
    match args {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(key, _)| key != NO_CACHE_FIELD)
                .map(|(key, value)| (key, strip_marker(value)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(strip_marker).collect()),
        other => other,
    }
}

/// JSON rendering with object keys sorted at every depth
fn canonical(value: &Value) -> String {
    fn sorted(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                let mut out = Map::new();
                for key in keys {
                    out.insert(key.clone(), sorted(&map[key]));
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
            other => other.clone(),
        }
    }
    sorted(value).to_string()
}
