use crate::WaymarkError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

pub type ContextValues = BTreeMap<String, Value>;

const MAX_KEY_LENGTH: usize = 256;

/// Reserved keys: anything starting with `_` is engine-internal.
pub const WORKDIR_KEY: &str = "_workdir";
pub const FIDELITY_MODE_KEY: &str = "_fidelity_mode";
/// Always reflects the most recent surfaced outcome label.
pub const OUTCOME_KEY: &str = "outcome";
pub const LAST_STAGE_KEY: &str = "last_stage";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub values: ContextValues,
    pub logs: Vec<String>,
}

impl ContextSnapshot {
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }
}

/// The run context: a mutex-guarded key/value store plus an append-only log.
/// Handlers see snapshots; only the engine mutates the live store.
#[derive(Clone, Default)]
pub struct Context {
    inner: Arc<RwLock<ContextState>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
struct ContextState {
    values: ContextValues,
    logs: Vec<String>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_values(values: ContextValues) -> Self {
        Self {
            inner: Arc::new(RwLock::new(ContextState {
                values,
                logs: Vec::new(),
            })),
        }
    }

    pub fn set(&self, key: impl Into<String>, value: Value) -> Result<(), WaymarkError> {
        let key = key.into();
        validate_context_key(&key)?;
        let mut state = self
            .inner
            .write()
            .map_err(|_| WaymarkError::Runtime("context write lock poisoned".to_string()))?;
        state.values.insert(key, value);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Option<Value>, WaymarkError> {
        let state = self
            .inner
            .read()
            .map_err(|_| WaymarkError::Runtime("context read lock poisoned".to_string()))?;
        Ok(state.values.get(key).cloned())
    }

    /// String lookup with a default for missing or non-string values.
    pub fn get_string(&self, key: &str, default: &str) -> String {
        match self.get(key) {
            Ok(Some(Value::String(value))) => value,
            _ => default.to_string(),
        }
    }

    pub fn apply_updates(&self, updates: &ContextValues) -> Result<(), WaymarkError> {
        if updates.is_empty() {
            return Ok(());
        }

        let mut state = self
            .inner
            .write()
            .map_err(|_| WaymarkError::Runtime("context write lock poisoned".to_string()))?;
        for (key, value) in updates {
            validate_context_key(key)?;
            state.values.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<(), WaymarkError> {
        let mut state = self
            .inner
            .write()
            .map_err(|_| WaymarkError::Runtime("context write lock poisoned".to_string()))?;
        state.values.remove(key);
        Ok(())
    }

    pub fn append_log(&self, entry: impl Into<String>) -> Result<(), WaymarkError> {
        let mut state = self
            .inner
            .write()
            .map_err(|_| WaymarkError::Runtime("context write lock poisoned".to_string()))?;
        state.logs.push(entry.into());
        Ok(())
    }

    /// Deep-copied read view.
    pub fn snapshot(&self) -> Result<ContextSnapshot, WaymarkError> {
        let state = self
            .inner
            .read()
            .map_err(|_| WaymarkError::Runtime("context read lock poisoned".to_string()))?;
        Ok(ContextSnapshot {
            values: state.values.clone(),
            logs: state.logs.clone(),
        })
    }

    /// Deep-copied write target. Mutations on the clone never reach `self`.
    pub fn deep_clone(&self) -> Result<Self, WaymarkError> {
        let snapshot = self.snapshot()?;
        Ok(Self {
            inner: Arc::new(RwLock::new(ContextState {
                values: snapshot.values,
                logs: snapshot.logs,
            })),
        })
    }
}

pub fn validate_context_key(key: &str) -> Result<(), WaymarkError> {
    if key.is_empty() {
        return Err(WaymarkError::Runtime(
            "context key cannot be empty".to_string(),
        ));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(WaymarkError::Runtime(format!(
            "context key '{}' exceeds max length {}",
            key, MAX_KEY_LENGTH
        )));
    }

    for segment in key.split('.') {
        if segment.is_empty() {
            return Err(WaymarkError::Runtime(format!(
                "context key '{}' contains an empty namespace segment",
                key
            )));
        }
        validate_key_segment(segment, key)?;
    }

    Ok(())
}

fn validate_key_segment(segment: &str, full_key: &str) -> Result<(), WaymarkError> {
    let mut chars = segment.chars();
    let Some(first) = chars.next() else {
        return Err(WaymarkError::Runtime(format!(
            "context key '{}' contains an empty namespace segment",
            full_key
        )));
    };
    if !first.is_ascii_alphabetic() && first != '_' {
        return Err(WaymarkError::Runtime(format!(
            "context key '{}' has invalid segment '{}'",
            full_key, segment
        )));
    }

    if chars.any(|c| !(c.is_ascii_alphanumeric() || c == '_' || c == '-')) {
        return Err(WaymarkError::Runtime(format!(
            "context key '{}' has invalid segment '{}'",
            full_key, segment
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_and_snapshot_round_trip() {
        let context = Context::new();

        context
            .set("goal", Value::String("ship".to_string()))
            .expect("set goal should succeed");
        context
            .set("plan.status", Value::String("done".to_string()))
            .expect("set nested key should succeed");
        context
            .append_log("stage plan completed")
            .expect("append log should succeed");

        let snapshot = context.snapshot().expect("snapshot should succeed");
        assert_eq!(snapshot.values.get("goal"), Some(&json!("ship")));
        assert_eq!(snapshot.values.get("plan.status"), Some(&json!("done")));
        assert_eq!(snapshot.logs, vec!["stage plan completed".to_string()]);
    }

    #[test]
    fn apply_updates_merges_and_empty_is_noop() {
        let context = Context::from_values(BTreeMap::from([(
            "existing".to_string(),
            Value::String("yes".to_string()),
        )]));

        context
            .apply_updates(&ContextValues::new())
            .expect("empty updates should succeed");
        context
            .apply_updates(&BTreeMap::from([
                ("new".to_string(), json!(123)),
                (OUTCOME_KEY.to_string(), json!("success")),
            ]))
            .expect("apply updates should succeed");

        let snapshot = context.snapshot().expect("snapshot should succeed");
        assert_eq!(snapshot.values.get("existing"), Some(&json!("yes")));
        assert_eq!(snapshot.values.get("new"), Some(&json!(123)));
        assert_eq!(snapshot.values.get("outcome"), Some(&json!("success")));
    }

    #[test]
    fn deep_clone_creates_independent_copy() {
        let original = Context::new();
        original
            .set("key", Value::String("original".to_string()))
            .expect("set should succeed");

        let cloned = original.deep_clone().expect("deep clone should succeed");
        cloned
            .set("key", Value::String("clone".to_string()))
            .expect("set on clone should succeed");

        assert_eq!(
            original.get("key").expect("get should succeed"),
            Some(json!("original"))
        );
        assert_eq!(
            cloned.get("key").expect("get should succeed"),
            Some(json!("clone"))
        );
    }

    #[test]
    fn get_string_returns_default_for_missing_or_non_string() {
        let context = Context::new();
        context.set("count", json!(3)).expect("set should succeed");
        assert_eq!(context.get_string("missing", "fallback"), "fallback");
        assert_eq!(context.get_string("count", "fallback"), "fallback");
    }

    #[test]
    fn reserved_underscore_keys_are_accepted() {
        let context = Context::new();
        context
            .set(WORKDIR_KEY, json!("/tmp/run"))
            .expect("reserved key should be settable");
        assert_eq!(context.get_string(WORKDIR_KEY, ""), "/tmp/run");
    }

    #[test]
    fn reject_invalid_context_keys() {
        let context = Context::new();
        let error = context
            .set("bad key", Value::String("x".to_string()))
            .expect_err("invalid key should fail");
        assert!(
            matches!(error, WaymarkError::Runtime(message) if message.contains("invalid segment"))
        );
    }
}
