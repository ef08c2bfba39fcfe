use crate::clock::timestamp_now;
use crate::events::{EngineEvent, EventKind, EventObserver};
use crate::rundir::RunDirectory;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

#[derive(Clone, Debug, Default, Serialize)]
struct LiveState {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    active_node: Option<String>,
    completed: Vec<String>,
    failed: Vec<String>,
    started_at: String,
    updated_at: String,
    event_count: u64,
}

/// Event observer that appends one NDJSON line per event to
/// `progress.ndjson` and atomically rewrites `live.json` after each event.
/// `agent.text.delta` events are counted but their bodies are not persisted.
/// Write failures are logged and swallowed; observability must never take
/// down the run.
pub struct ProgressLogger {
    progress_path: PathBuf,
    live_path: PathBuf,
    state: Mutex<LiveState>,
    seen_nodes: Mutex<BTreeSet<String>>,
}

impl ProgressLogger {
    pub fn new(run_dir: &RunDirectory) -> Self {
        Self {
            progress_path: run_dir.progress_path(),
            live_path: run_dir.live_path(),
            state: Mutex::new(LiveState {
                status: "running".to_string(),
                started_at: timestamp_now(),
                updated_at: timestamp_now(),
                ..LiveState::default()
            }),
            seen_nodes: Mutex::new(BTreeSet::new()),
        }
    }

    fn append_line(&self, event: &EngineEvent) {
        let Ok(line) = serde_json::to_string(event) else {
            return;
        };
        let opened = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.progress_path);
        match opened {
            Ok(mut file) => {
                if let Err(error) = writeln!(file, "{line}") {
                    tracing::warn!(%error, "failed appending progress line");
                }
            }
            Err(error) => tracing::warn!(%error, "failed opening progress log"),
        }
    }

    fn rewrite_live(&self, state: &LiveState) {
        let Ok(bytes) = serde_json::to_vec_pretty(state) else {
            return;
        };
        let temp = self.live_path.with_extension("json.tmp");
        if let Err(error) = fs::write(&temp, bytes).and_then(|_| fs::rename(&temp, &self.live_path))
        {
            tracing::warn!(%error, "failed rewriting live snapshot");
        }
    }
}

impl EventObserver for ProgressLogger {
    fn on_event(&self, event: &EngineEvent) {
        if event.kind != EventKind::AgentTextDelta {
            self.append_line(event);
        }

        let Ok(mut state) = self.state.lock() else {
            return;
        };
        state.event_count += 1;
        state.updated_at = event.timestamp.clone();
        match event.kind {
            EventKind::StageStarted => {
                state.active_node = event.node_id.clone();
            }
            EventKind::StageCompleted => {
                if let Some(node_id) = event.node_id.as_ref() {
                    let mut seen = match self.seen_nodes.lock() {
                        Ok(seen) => seen,
                        Err(_) => return,
                    };
                    if seen.insert(node_id.clone()) {
                        state.completed.push(node_id.clone());
                    }
                }
                state.active_node = None;
            }
            EventKind::StageFailed => {
                if let Some(node_id) = event.node_id.as_ref() {
                    if !state.failed.iter().any(|failed| failed == node_id) {
                        state.failed.push(node_id.clone());
                    }
                }
                state.active_node = None;
            }
            EventKind::PipelineCompleted => {
                state.status = "completed".to_string();
                state.active_node = None;
            }
            EventKind::PipelineFailed => {
                state.status = "failed".to_string();
                state.active_node = None;
            }
            _ => {}
        }
        self.rewrite_live(&state);
    }
}
