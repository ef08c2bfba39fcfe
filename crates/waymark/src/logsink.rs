//! Filesystem event persistence: one NDJSON file per run plus an index that
//! survives restart and always reflects the last successful append.

use crate::clock::parse_stamp_ms;
use crate::events::{EngineEvent, EventKind, EventObserver};
use crate::WaymarkError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

pub const LOG_INDEX_FILE_NAME: &str = "index.json";

#[derive(Clone, Debug, Default, PartialEq)]
pub struct EventFilter {
    pub kinds: Option<BTreeSet<EventKind>>,
    pub node_id: Option<String>,
    pub since_ms: Option<u64>,
    pub until_ms: Option<u64>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl EventFilter {
    fn matches(&self, event: &EngineEvent) -> bool {
        if let Some(kinds) = self.kinds.as_ref() {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(node_id) = self.node_id.as_deref() {
            if event.node_id.as_deref() != Some(node_id) {
                return false;
            }
        }
        let stamp = parse_stamp_ms(&event.timestamp);
        if let (Some(since), Some(stamp)) = (self.since_ms, stamp) {
            if stamp < since {
                return false;
            }
        }
        if let (Some(until), Some(stamp)) = (self.until_ms, stamp) {
            if stamp > until {
                return false;
            }
        }
        true
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LogSummary {
    pub total: u64,
    pub by_kind: BTreeMap<String, u64>,
    pub by_node: BTreeMap<String, u64>,
    pub first_timestamp: Option<String>,
    pub last_timestamp: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogIndexEntry {
    pub event_count: u64,
    pub first_timestamp_ms: Option<u64>,
    pub last_timestamp_ms: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
struct LogIndex {
    runs: BTreeMap<String, LogIndexEntry>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PruneOptions {
    pub max_age_ms: Option<u64>,
    pub max_runs: Option<usize>,
}

#[derive(Clone, Debug)]
pub struct EventLogStore {
    base: PathBuf,
}

impl EventLogStore {
    pub fn new(base: impl Into<PathBuf>) -> Result<Self, WaymarkError> {
        let base = base.into();
        fs::create_dir_all(&base).map_err(|error| {
            WaymarkError::Runtime(format!(
                "failed to create event log base '{}': {}",
                base.display(),
                error
            ))
        })?;
        Ok(Self { base })
    }

    pub fn log_path(&self, run_id: &str) -> PathBuf {
        self.base.join(format!("{run_id}.ndjson"))
    }

    /// Append one event and synchronously update the index.
    pub fn append(&self, run_id: &str, event: &EngineEvent) -> Result<(), WaymarkError> {
        let line = serde_json::to_string(event).map_err(|error| {
            WaymarkError::Runtime(format!("failed to serialize event: {error}"))
        })?;
        let path = self.log_path(run_id);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|error| {
                WaymarkError::Runtime(format!(
                    "failed opening event log '{}': {}",
                    path.display(),
                    error
                ))
            })?;
        writeln!(file, "{line}").map_err(|error| {
            WaymarkError::Runtime(format!(
                "failed appending event to '{}': {}",
                path.display(),
                error
            ))
        })?;

        let stamp = parse_stamp_ms(&event.timestamp);
        let mut index = self.load_index()?;
        let entry = index.runs.entry(run_id.to_string()).or_insert(LogIndexEntry {
            event_count: 0,
            first_timestamp_ms: stamp,
            last_timestamp_ms: stamp,
        });
        entry.event_count += 1;
        if entry.first_timestamp_ms.is_none() {
            entry.first_timestamp_ms = stamp;
        }
        entry.last_timestamp_ms = stamp.or(entry.last_timestamp_ms);
        self.save_index(&index)
    }

    pub fn query(
        &self,
        run_id: &str,
        filter: &EventFilter,
    ) -> Result<Vec<EngineEvent>, WaymarkError> {
        let events = self.read_all(run_id)?;
        let mut matched: Vec<EngineEvent> = events
            .into_iter()
            .filter(|event| filter.matches(event))
            .collect();
        if filter.offset > 0 {
            matched = matched.into_iter().skip(filter.offset).collect();
        }
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    pub fn tail(&self, run_id: &str, count: usize) -> Result<Vec<EngineEvent>, WaymarkError> {
        let events = self.read_all(run_id)?;
        let skip = events.len().saturating_sub(count);
        Ok(events.into_iter().skip(skip).collect())
    }

    pub fn summarize(&self, run_id: &str) -> Result<LogSummary, WaymarkError> {
        let events = self.read_all(run_id)?;
        let mut summary = LogSummary {
            total: events.len() as u64,
            first_timestamp: events.first().map(|event| event.timestamp.clone()),
            last_timestamp: events.last().map(|event| event.timestamp.clone()),
            ..LogSummary::default()
        };
        for event in &events {
            *summary
                .by_kind
                .entry(event.kind.as_str().to_string())
                .or_insert(0) += 1;
            if let Some(node_id) = event.node_id.as_ref() {
                *summary.by_node.entry(node_id.clone()).or_insert(0) += 1;
            }
        }
        Ok(summary)
    }

    pub fn run_ids(&self) -> Result<Vec<String>, WaymarkError> {
        Ok(self.load_index()?.runs.keys().cloned().collect())
    }

    pub fn index_entry(&self, run_id: &str) -> Result<Option<LogIndexEntry>, WaymarkError> {
        Ok(self.load_index()?.runs.get(run_id).cloned())
    }

    /// Remove logs that fail the age bound or fall outside the newest
    /// `max_runs`. A run is kept if it satisfies both bounds. Returns the
    /// removed run ids.
    pub fn prune(&self, options: &PruneOptions, now_ms: u64) -> Result<Vec<String>, WaymarkError> {
        let mut index = self.load_index()?;

        let mut by_recency: Vec<(String, Option<u64>)> = index
            .runs
            .iter()
            .map(|(run_id, entry)| (run_id.clone(), entry.last_timestamp_ms))
            .collect();
        by_recency.sort_by_key(|(_, last)| std::cmp::Reverse(*last));
        let within_count: BTreeSet<String> = by_recency
            .into_iter()
            .take(options.max_runs.unwrap_or(usize::MAX))
            .map(|(run_id, _)| run_id)
            .collect();

        let mut removed = Vec::new();
        for (run_id, entry) in &index.runs {
            let too_old = match (options.max_age_ms, entry.last_timestamp_ms) {
                (Some(max_age), Some(last)) => now_ms.saturating_sub(last) > max_age,
                _ => false,
            };
            if too_old || !within_count.contains(run_id) {
                removed.push(run_id.clone());
            }
        }

        for run_id in &removed {
            index.runs.remove(run_id);
            let path = self.log_path(run_id);
            if path.exists() {
                fs::remove_file(&path).map_err(|error| {
                    WaymarkError::Runtime(format!(
                        "failed removing event log '{}': {}",
                        path.display(),
                        error
                    ))
                })?;
            }
        }
        self.save_index(&index)?;
        Ok(removed)
    }

    fn read_all(&self, run_id: &str) -> Result<Vec<EngineEvent>, WaymarkError> {
        let path = self.log_path(run_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&path).map_err(|error| {
            WaymarkError::Runtime(format!(
                "failed reading event log '{}': {}",
                path.display(),
                error
            ))
        })?;
        let mut events = Vec::new();
        for line in contents.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<EngineEvent>(line) {
                Ok(event) => events.push(event),
                Err(error) => {
                    tracing::warn!(%error, "skipping unparseable event log line");
                }
            }
        }
        Ok(events)
    }

    fn load_index(&self) -> Result<LogIndex, WaymarkError> {
        let path = self.index_path();
        if !path.exists() {
            return Ok(LogIndex::default());
        }
        let bytes = fs::read(&path).map_err(|error| {
            WaymarkError::Runtime(format!(
                "failed reading log index '{}': {}",
                path.display(),
                error
            ))
        })?;
        serde_json::from_slice(&bytes).map_err(|error| {
            WaymarkError::Runtime(format!(
                "failed deserializing log index '{}': {}",
                path.display(),
                error
            ))
        })
    }

    fn save_index(&self, index: &LogIndex) -> Result<(), WaymarkError> {
        let path = self.index_path();
        let bytes = serde_json::to_vec_pretty(index).map_err(|error| {
            WaymarkError::Runtime(format!("failed to serialize log index: {error}"))
        })?;
        let temp = path.with_extension("json.tmp");
        fs::write(&temp, bytes)
            .and_then(|_| fs::rename(&temp, &path))
            .map_err(|error| {
                WaymarkError::Runtime(format!(
                    "failed saving log index '{}': {}",
                    path.display(),
                    error
                ))
            })
    }

    fn index_path(&self) -> PathBuf {
        self.base.join(LOG_INDEX_FILE_NAME)
    }
}

/// Observer adapter: persists every event of one run, best-effort.
pub struct EventLogObserver {
    store: Arc<EventLogStore>,
    run_id: String,
    failed: Mutex<bool>,
}

impl EventLogObserver {
    pub fn new(store: Arc<EventLogStore>, run_id: impl Into<String>) -> Self {
        Self {
            store,
            run_id: run_id.into(),
            failed: Mutex::new(false),
        }
    }
}

impl EventObserver for EventLogObserver {
    fn on_event(&self, event: &EngineEvent) {
        if let Err(error) = self.store.append(&self.run_id, event) {
            let mut failed = self.failed.lock().unwrap_or_else(|e| e.into_inner());
            if !*failed {
                tracing::warn!(%error, run_id = %self.run_id, "event log append failed");
                *failed = true;
            }
        }
    }
}
