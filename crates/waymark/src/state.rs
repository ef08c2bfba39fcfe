//! Durable run catalogue: `<runs_base>/index.json` plus one
//! `<run_id>/state.json` per run. The index is rewritten synchronously on
//! every update so `find_resumable` works after a crash.

use crate::checkpoint::CHECKPOINT_FILE_NAME;
use crate::clock::now_ms;
use crate::context::ContextValues;
use crate::events::EngineEvent;
use crate::WaymarkError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const INDEX_FILE_NAME: &str = "index.json";
pub const STATE_FILE_NAME: &str = "state.json";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_resumable(self) -> bool {
        matches!(self, Self::Running | Self::Failed | Self::Cancelled)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub id: String,
    pub pipeline_file: Option<String>,
    pub status: RunStatus,
    pub started_at_ms: u64,
    pub completed_at_ms: Option<u64>,
    pub source: String,
    pub source_hash: String,
    pub current_node: Option<String>,
    pub completed_nodes: Vec<String>,
    pub context_values: ContextValues,
    pub events: Vec<EngineEvent>,
    pub last_error: Option<String>,
}

impl RunState {
    pub fn new(id: impl Into<String>, source: impl Into<String>) -> Self {
        let source = source.into();
        Self {
            id: id.into(),
            pipeline_file: None,
            status: RunStatus::Running,
            started_at_ms: now_ms(),
            completed_at_ms: None,
            source_hash: source_hash(&source),
            source,
            current_node: None,
            completed_nodes: Vec::new(),
            context_values: ContextValues::new(),
            events: Vec::new(),
            last_error: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunIndexEntry {
    pub status: RunStatus,
    pub started_at_ms: u64,
    pub source_hash: String,
    pub event_count: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
struct RunIndex {
    runs: BTreeMap<String, RunIndexEntry>,
}

/// SHA-256 of the raw source bytes; any byte-level change invalidates
/// resumability.
pub fn source_hash(source: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[derive(Clone, Debug)]
pub struct RunStateStore {
    base: PathBuf,
}

impl RunStateStore {
    pub fn new(base: impl Into<PathBuf>) -> Result<Self, WaymarkError> {
        let base = base.into();
        fs::create_dir_all(&base).map_err(|error| {
            WaymarkError::Runtime(format!(
                "failed to create runs base '{}': {}",
                base.display(),
                error
            ))
        })?;
        Ok(Self { base })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.base.join(run_id)
    }

    pub fn checkpoint_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join(CHECKPOINT_FILE_NAME)
    }

    pub fn create(&self, state: &RunState) -> Result<(), WaymarkError> {
        self.write_state(state)?;
        self.update_index(state)
    }

    pub fn update(&self, state: &RunState) -> Result<(), WaymarkError> {
        self.write_state(state)?;
        self.update_index(state)
    }

    pub fn get(&self, run_id: &str) -> Result<RunState, WaymarkError> {
        let path = self.run_dir(run_id).join(STATE_FILE_NAME);
        let bytes = fs::read(&path).map_err(|error| {
            WaymarkError::Runtime(format!(
                "failed reading run state '{}': {}",
                path.display(),
                error
            ))
        })?;
        serde_json::from_slice(&bytes).map_err(|error| {
            WaymarkError::Runtime(format!(
                "failed deserializing run state '{}': {}",
                path.display(),
                error
            ))
        })
    }

    pub fn list_runs(&self) -> Result<BTreeMap<String, RunIndexEntry>, WaymarkError> {
        Ok(self.load_index()?.runs)
    }

    /// The most recently started unfinished run with a matching source hash
    /// and an on-disk checkpoint. Completed runs are never resumable.
    pub fn find_resumable(&self, source_hash: &str) -> Result<Option<RunState>, WaymarkError> {
        let index = self.load_index()?;
        let mut best: Option<(u64, String)> = None;
        for (run_id, entry) in &index.runs {
            if !entry.status.is_resumable() || entry.source_hash != source_hash {
                continue;
            }
            if !self.checkpoint_path(run_id).exists() {
                continue;
            }
            let newer = best
                .as_ref()
                .map(|(started, _)| entry.started_at_ms > *started)
                .unwrap_or(true);
            if newer {
                best = Some((entry.started_at_ms, run_id.clone()));
            }
        }
        match best {
            Some((_, run_id)) => Ok(Some(self.get(&run_id)?)),
            None => Ok(None),
        }
    }

    fn write_state(&self, state: &RunState) -> Result<(), WaymarkError> {
        let dir = self.run_dir(&state.id);
        fs::create_dir_all(&dir).map_err(|error| {
            WaymarkError::Runtime(format!(
                "failed to create run dir '{}': {}",
                dir.display(),
                error
            ))
        })?;
        let path = dir.join(STATE_FILE_NAME);
        let bytes = serde_json::to_vec_pretty(state).map_err(|error| {
            WaymarkError::Runtime(format!("failed to serialize run state: {error}"))
        })?;
        write_atomic(&path, &bytes)
    }

    fn update_index(&self, state: &RunState) -> Result<(), WaymarkError> {
        let mut index = self.load_index()?;
        index.runs.insert(
            state.id.clone(),
            RunIndexEntry {
                status: state.status,
                started_at_ms: state.started_at_ms,
                source_hash: state.source_hash.clone(),
                event_count: state.events.len() as u64,
            },
        );
        self.save_index(&index)
    }

    pub(crate) fn remove_index_entry(&self, run_id: &str) -> Result<(), WaymarkError> {
        let mut index = self.load_index()?;
        index.runs.remove(run_id);
        self.save_index(&index)
    }

    fn load_index(&self) -> Result<RunIndex, WaymarkError> {
        let path = self.base.join(INDEX_FILE_NAME);
        if !path.exists() {
            return Ok(RunIndex::default());
        }
        let bytes = fs::read(&path).map_err(|error| {
            WaymarkError::Runtime(format!(
                "failed reading run index '{}': {}",
                path.display(),
                error
            ))
        })?;
        serde_json::from_slice(&bytes).map_err(|error| {
            WaymarkError::Runtime(format!(
                "failed deserializing run index '{}': {}",
                path.display(),
                error
            ))
        })
    }

    fn save_index(&self, index: &RunIndex) -> Result<(), WaymarkError> {
        let path = self.base.join(INDEX_FILE_NAME);
        let bytes = serde_json::to_vec_pretty(index).map_err(|error| {
            WaymarkError::Runtime(format!("failed to serialize run index: {error}"))
        })?;
        write_atomic(&path, &bytes)
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), WaymarkError> {
    let temp = path.with_extension("json.tmp");
    fs::write(&temp, bytes).map_err(|error| {
        WaymarkError::Runtime(format!(
            "failed writing temp file '{}': {}",
            temp.display(),
            error
        ))
    })?;
    fs::rename(&temp, path).map_err(|error| {
        WaymarkError::Runtime(format!(
            "failed moving '{}' into place: {}",
            path.display(),
            error
        ))
    })
}
