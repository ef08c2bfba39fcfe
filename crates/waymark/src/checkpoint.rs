use crate::clock::timestamp_now;
use crate::context::ContextValues;
use crate::outcome::{Outcome, OutcomeStatus};
use crate::WaymarkError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const CHECKPOINT_FILE_NAME: &str = "checkpoint.json";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredOutcome {
    pub status: String,
    pub notes: Option<String>,
    pub failure_reason: Option<String>,
}

impl StoredOutcome {
    pub fn from_runtime(outcome: &Outcome) -> Self {
        Self {
            status: outcome.status.as_str().to_string(),
            notes: outcome.notes.clone(),
            failure_reason: outcome.failure_reason.clone(),
        }
    }

    pub fn to_runtime(&self) -> Result<Outcome, WaymarkError> {
        let status = OutcomeStatus::try_from(self.status.as_str())?;
        Ok(Outcome {
            status,
            notes: self.notes.clone(),
            failure_reason: self.failure_reason.clone(),
            context_updates: ContextValues::new(),
        })
    }
}

/// Serialisable traversal snapshot. `current_node` is the last node whose
/// terminal outcome was recorded; `next_node` is the successor to execute
/// when resuming.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub timestamp: String,
    pub run_id: String,
    pub current_node: String,
    pub next_node: Option<String>,
    pub completed_nodes: Vec<String>,
    pub node_retries: BTreeMap<String, u32>,
    pub node_outcomes: BTreeMap<String, StoredOutcome>,
    pub context_values: ContextValues,
    pub logs: Vec<String>,
    #[serde(default)]
    pub terminal_status: Option<String>,
    #[serde(default)]
    pub terminal_failure_reason: Option<String>,
}

impl Checkpoint {
    pub fn new(run_id: impl Into<String>, current_node: impl Into<String>) -> Self {
        Self {
            timestamp: timestamp_now(),
            run_id: run_id.into(),
            current_node: current_node.into(),
            next_node: None,
            completed_nodes: Vec::new(),
            node_retries: BTreeMap::new(),
            node_outcomes: BTreeMap::new(),
            context_values: ContextValues::new(),
            logs: Vec::new(),
            terminal_status: None,
            terminal_failure_reason: None,
        }
    }

    /// Atomic save: serialize to a sibling temp file, then rename over the
    /// target so a reader never observes a half-written checkpoint.
    pub fn save_to_path(&self, path: &Path) -> Result<(), WaymarkError> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).map_err(|error| {
            WaymarkError::Runtime(format!(
                "failed to create checkpoint parent directory '{}': {}",
                parent.display(),
                error
            ))
        })?;

        let bytes = serde_json::to_vec_pretty(self).map_err(|error| {
            WaymarkError::Runtime(format!("failed to serialize checkpoint: {error}"))
        })?;

        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, bytes).map_err(|error| {
            WaymarkError::Runtime(format!(
                "failed writing checkpoint temp file '{}': {}",
                temp_path.display(),
                error
            ))
        })?;
        fs::rename(&temp_path, path).map_err(|error| {
            WaymarkError::Runtime(format!(
                "failed to move checkpoint into place at '{}': {}",
                path.display(),
                error
            ))
        })
    }

    pub fn load_from_path(path: &Path) -> Result<Self, WaymarkError> {
        let bytes = fs::read(path).map_err(|error| {
            WaymarkError::Runtime(format!(
                "failed reading checkpoint file '{}': {}",
                path.display(),
                error
            ))
        })?;
        serde_json::from_slice(&bytes).map_err(|error| {
            WaymarkError::Runtime(format!(
                "failed deserializing checkpoint file '{}': {}",
                path.display(),
                error
            ))
        })
    }
}

pub fn checkpoint_file_path(run_dir: &Path) -> PathBuf {
    run_dir.join(CHECKPOINT_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn checkpoint_round_trip_expected_fields_preserved() {
        let temp = TempDir::new().expect("temp dir should be created");
        let path = checkpoint_file_path(temp.path());

        let mut checkpoint = Checkpoint::new("run-1", "plan");
        checkpoint.next_node = Some("review".to_string());
        checkpoint.completed_nodes = vec!["start".to_string(), "plan".to_string()];
        checkpoint.node_retries = BTreeMap::from([("plan".to_string(), 1)]);
        checkpoint.node_outcomes = BTreeMap::from([(
            "plan".to_string(),
            StoredOutcome {
                status: "success".to_string(),
                notes: Some("ok".to_string()),
                failure_reason: None,
            },
        )]);
        checkpoint.context_values = BTreeMap::from([("outcome".to_string(), json!("success"))]);
        checkpoint.logs = vec!["checkpoint saved".to_string()];

        checkpoint.save_to_path(&path).expect("checkpoint should save");
        let loaded = Checkpoint::load_from_path(&path).expect("checkpoint should load");

        assert_eq!(loaded.current_node, checkpoint.current_node);
        assert_eq!(loaded.completed_nodes, checkpoint.completed_nodes);
        assert_eq!(loaded.context_values, checkpoint.context_values);
        assert_eq!(loaded, checkpoint);
    }

    #[test]
    fn save_overwrites_previous_checkpoint_in_place() {
        let temp = TempDir::new().expect("temp dir should be created");
        let path = checkpoint_file_path(temp.path());

        let first = Checkpoint::new("run-1", "plan");
        first.save_to_path(&path).expect("first save should succeed");

        let mut second = Checkpoint::new("run-1", "review");
        second.completed_nodes = vec!["start".to_string(), "plan".to_string()];
        second
            .save_to_path(&path)
            .expect("second save should succeed");

        let loaded = Checkpoint::load_from_path(&path).expect("checkpoint should load");
        assert_eq!(loaded.current_node, "review");
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn stored_outcome_to_runtime_expected_status_mapping() {
        let stored = StoredOutcome {
            status: "partial_success".to_string(),
            notes: Some("n".to_string()),
            failure_reason: None,
        };

        let runtime = stored.to_runtime().expect("conversion should succeed");
        assert_eq!(runtime.status, OutcomeStatus::PartialSuccess);
        assert_eq!(runtime.notes.as_deref(), Some("n"));
    }
}
