//! The pipeline execution engine: a five-phase run lifecycle (prepare,
//! preflight, traverse, finalise, result) around a per-node retry state
//! machine. Single writer: one worker advances the traversal; observers see
//! the run through the event sink and the watchdog.

use crate::artifacts::ArtifactStore;
use crate::backend::AgentBackend;
use crate::checkpoint::{Checkpoint, StoredOutcome};
use crate::clock::now_ms;
use crate::context::{
    Context, ContextSnapshot, ContextValues, FIDELITY_MODE_KEY, LAST_STAGE_KEY, OUTCOME_KEY,
    WORKDIR_KEY,
};
use crate::events::{EngineEvent, EventKind, EventRecorder, EventSink};
use crate::fidelity::{
    compact_snapshot, generate_preamble, graph_fidelity_default, resolve_fidelity,
    CompactionLimits,
};
use crate::graph::{is_terminal_node, AttrValue, Graph, Node};
use crate::handlers::registry::HandlerRegistry;
use crate::handlers::{core_registry, StageContext};
use crate::interviewer::{AutoInterviewer, Interviewer};
use crate::logsink::{EventLogObserver, EventLogStore};
use crate::outcome::{Outcome, OutcomeStatus};
use crate::preflight::{default_checks, run_preflight, PreflightCheck, PreflightInput};
use crate::progress::ProgressLogger;
use crate::resume::load_resume_seed;
use crate::retry::{delay_for_attempt_ms, resolve_retry_policy, RetryPolicy};
use crate::routing::{select_fail_edge, select_next_edge};
use crate::rundir::RunDirectory;
use crate::state::{RunState, RunStateStore, RunStatus};
use crate::validate::ensure_valid;
use crate::watchdog::{Watchdog, WatchdogConfig};
use crate::handlers::verify::run_shell_command;
use crate::WaymarkError;
use futures::FutureExt;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_MAX_NODE_VISITS: u32 = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineStatus {
    Success,
    Fail,
    Canceled,
}

impl PipelineStatus {
    fn run_status(self) -> RunStatus {
        match self {
            Self::Success => RunStatus::Completed,
            Self::Fail => RunStatus::Failed,
            Self::Canceled => RunStatus::Cancelled,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RunResult {
    pub run_id: String,
    pub status: PipelineStatus,
    pub failure_reason: Option<String>,
    pub completed_nodes: Vec<String>,
    pub node_outcomes: BTreeMap<String, Outcome>,
    pub context: ContextValues,
    pub events: Vec<EngineEvent>,
}

#[derive(Clone)]
pub struct EngineConfig {
    pub run_id: Option<String>,
    pub pipeline_file: Option<String>,
    pub artifacts_base: Option<PathBuf>,
    pub events: EventSink,
    pub backend: Option<Arc<dyn AgentBackend>>,
    pub interviewer: Arc<dyn Interviewer>,
    pub state_store: Option<RunStateStore>,
    pub event_log: Option<Arc<EventLogStore>>,
    pub retry: RetryPolicy,
    pub default_timeout: Option<Duration>,
    pub watchdog: WatchdogConfig,
    pub preflight: Vec<PreflightCheck>,
    pub resume_from: Option<PathBuf>,
    pub cancel: CancellationToken,
    pub compaction: CompactionLimits,
    pub max_node_visits: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            run_id: None,
            pipeline_file: None,
            artifacts_base: None,
            events: EventSink::new(),
            backend: None,
            interviewer: Arc::new(AutoInterviewer),
            state_store: None,
            event_log: None,
            retry: RetryPolicy::default(),
            default_timeout: None,
            watchdog: WatchdogConfig::default(),
            preflight: default_checks(),
            resume_from: None,
            cancel: CancellationToken::new(),
            compaction: CompactionLimits::default(),
            max_node_visits: DEFAULT_MAX_NODE_VISITS,
        }
    }
}

pub struct Engine {
    registry: HandlerRegistry,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

enum AttemptLoopEnd {
    Finished { outcome: Outcome, attempts: u32 },
    Canceled(String),
}

enum RawAttempt {
    Done(std::thread::Result<Result<Outcome, WaymarkError>>),
    TimedOut,
    Canceled,
}

impl Engine {
    pub fn new() -> Self {
        Self {
            registry: core_registry(),
        }
    }

    pub fn with_registry(registry: HandlerRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub async fn run(
        &self,
        graph: &Graph,
        mut config: EngineConfig,
    ) -> Result<RunResult, WaymarkError> {
        ensure_valid(graph)?;

        // Phase 1: prepare.
        let run_id = config.run_id.take().unwrap_or_else(random_run_id);
        let recorder = EventRecorder::new();
        let mut sink = config.events.clone();
        sink.add_observer(Arc::new(recorder.clone()));
        if let Some(event_log) = config.event_log.as_ref() {
            sink.add_observer(Arc::new(EventLogObserver::new(
                Arc::clone(event_log),
                run_id.clone(),
            )));
        }

        let run_dir = match config.artifacts_base.as_ref() {
            Some(base) => {
                let run_dir = RunDirectory::create(base, &run_id)?;
                sink.add_observer(Arc::new(ProgressLogger::new(&run_dir)));
                Some(run_dir)
            }
            None => None,
        };
        let artifacts = match run_dir.as_ref() {
            Some(run_dir) => ArtifactStore::new(Some(run_dir.root().to_path_buf()), 0)?,
            None => ArtifactStore::in_memory(),
        };

        let context = Context::new();
        for (key, value) in graph.attrs.values() {
            if context.set(key.clone(), attr_value_to_json(value)).is_err() {
                tracing::warn!(%key, "graph attribute not mirrorable into context");
            }
        }
        if let Some(mode) = graph_fidelity_default(graph) {
            context.set(FIDELITY_MODE_KEY, json!(mode))?;
        }
        if let Some(run_dir) = run_dir.as_ref() {
            context.set(WORKDIR_KEY, json!(run_dir.root().display().to_string()))?;
        }

        let mut completed_nodes: Vec<String> = Vec::new();
        let mut node_outcomes: BTreeMap<String, Outcome> = BTreeMap::new();
        let mut node_retries: BTreeMap<String, u32> = BTreeMap::new();
        let mut current_node_id: Option<String> = None;
        let mut resumed = false;
        let mut resumed_complete = false;

        if let Some(checkpoint_path) = config.resume_from.take() {
            let seed = load_resume_seed(graph, &checkpoint_path)?;
            context.apply_updates(&seed.context_values)?;
            for entry in &seed.logs {
                context.append_log(entry.clone())?;
            }
            completed_nodes = seed.completed_nodes;
            node_outcomes = seed.node_outcomes;
            node_retries = seed.node_retries;
            resumed = true;
            if seed.terminal_status.as_deref() == Some("completed") {
                resumed_complete = true;
            } else if seed.next_node.is_none() {
                return Err(WaymarkError::Runtime(
                    "resume checkpoint has no next node and is not complete".to_string(),
                ));
            }
            current_node_id = seed.next_node;
        }

        let mut run_state = match config.state_store.as_ref() {
            Some(store) => {
                let mut state = RunState::new(
                    run_id.clone(),
                    graph.source.clone().unwrap_or_default(),
                );
                state.pipeline_file = config.pipeline_file.clone();
                store.create(&state)?;
                Some(state)
            }
            None => None,
        };

        sink.emit(
            EngineEvent::new(EventKind::PipelineStarted)
                .with("graph", json!(graph.name.clone()))
                .with("run_id", json!(run_id.clone()))
                .with("resumed", json!(resumed)),
        );

        if resumed_complete {
            sink.emit(EngineEvent::new(EventKind::PipelineCompleted).with("resumed", json!(true)));
            let result = RunResult {
                run_id: run_id.clone(),
                status: PipelineStatus::Success,
                failure_reason: None,
                completed_nodes,
                node_outcomes,
                context: context.snapshot()?.values,
                events: recorder.events(),
            };
            finalize_state(config.state_store.as_ref(), run_state.as_mut(), &result)?;
            return Ok(result);
        }

        // Phase 2: preflight. Checks do not short-circuit; all failures are
        // reported in a single reason.
        let report = run_preflight(
            &config.preflight,
            &PreflightInput {
                graph,
                registry: &self.registry,
                has_backend: config.backend.is_some(),
                artifacts_base: config.artifacts_base.as_deref(),
            },
        );
        if !report.is_ok() {
            let reason = report.reason();
            sink.emit(EngineEvent::new(EventKind::PipelineFailed).with("error", json!(reason)));
            let result = RunResult {
                run_id: run_id.clone(),
                status: PipelineStatus::Fail,
                failure_reason: Some(reason),
                completed_nodes,
                node_outcomes,
                context: context.snapshot()?.values,
                events: recorder.events(),
            };
            finalize_state(config.state_store.as_ref(), run_state.as_mut(), &result)?;
            return Ok(result);
        }

        let watch_cancel = config.cancel.child_token();
        let watchdog = Watchdog::start(config.watchdog.clone(), sink.clone(), watch_cancel.clone());

        // Phase 3: traverse.
        let mut current = match current_node_id.take() {
            Some(node_id) => node_id,
            None => start_node(graph)?.id.clone(),
        };
        let mut visits: BTreeMap<String, u32> = BTreeMap::new();
        let max_visits = resolve_max_node_visits(graph, config.max_node_visits);
        let mut status = PipelineStatus::Success;
        let mut failure_reason: Option<String> = None;

        loop {
            if config.cancel.is_cancelled() {
                let reason = "pipeline canceled".to_string();
                write_checkpoint(
                    run_dir.as_ref(),
                    &run_id,
                    &context,
                    &completed_nodes,
                    &node_retries,
                    &node_outcomes,
                    Some(current.clone()),
                    None,
                    None,
                )?;
                sink.emit(
                    EngineEvent::new(EventKind::PipelineFailed).with("error", json!(reason)),
                );
                status = PipelineStatus::Canceled;
                failure_reason = Some(reason);
                break;
            }

            let node = graph.nodes.get(&current).ok_or_else(|| {
                WaymarkError::InvalidGraph(format!("traversal reached unknown node '{current}'"))
            })?;
            let visit_count = visits.entry(node.id.clone()).or_insert(0);
            *visit_count += 1;
            if *visit_count > max_visits {
                let reason = format!(
                    "node '{}' exceeded max_node_visits {}",
                    node.id, max_visits
                );
                sink.emit(
                    EngineEvent::new(EventKind::PipelineFailed).with("error", json!(reason)),
                );
                status = PipelineStatus::Fail;
                failure_reason = Some(reason);
                break;
            }

            let terminal = is_terminal_node(node);
            let handler_type = self.registry.resolve_handler_type(node);

            // Fidelity compaction happens on a snapshot; the live context is
            // never handed to a handler.
            let snapshot = context.snapshot()?;
            let (attempt_snapshot, preamble) = match resolve_fidelity(node, &snapshot) {
                Some(mode) => {
                    let compacted = compact_snapshot(&snapshot, mode, &config.compaction);
                    let preamble = generate_preamble(
                        completed_nodes.last().map(String::as_str),
                        mode,
                        compacted.removed_keys,
                    );
                    (compacted.snapshot, preamble)
                }
                None => (snapshot, None),
            };

            sink.emit(
                EngineEvent::for_node(EventKind::StageStarted, node.id.clone())
                    .with("handler", json!(handler_type))
                    .with("visit", json!(*visit_count)),
            );
            watchdog.node_started(&node.id);

            let attempt_end = self
                .execute_with_retry(
                    graph,
                    node,
                    attempt_snapshot,
                    preamble,
                    &artifacts,
                    run_dir.as_ref(),
                    &config,
                    &sink,
                    &run_id,
                )
                .await?;
            watchdog.node_finished(&node.id);

            let (mut outcome, attempts) = match attempt_end {
                AttemptLoopEnd::Finished { outcome, attempts } => (outcome, attempts),
                AttemptLoopEnd::Canceled(reason) => {
                    write_checkpoint(
                        run_dir.as_ref(),
                        &run_id,
                        &context,
                        &completed_nodes,
                        &node_retries,
                        &node_outcomes,
                        Some(current.clone()),
                        None,
                        None,
                    )?;
                    sink.emit(
                        EngineEvent::new(EventKind::PipelineFailed).with("error", json!(reason)),
                    );
                    status = PipelineStatus::Canceled;
                    failure_reason = Some(reason);
                    break;
                }
            };

            // A post-check can veto a success-like outcome.
            if outcome.status.is_success_like() {
                if let Some(veto) = self
                    .run_verify_command(node, &context, run_dir.as_ref(), &config.cancel)
                    .await?
                {
                    outcome = veto;
                }
            }

            completed_nodes.push(node.id.clone());
            node_outcomes.insert(node.id.clone(), outcome.clone());
            node_retries.insert(node.id.clone(), attempts.saturating_sub(1));
            context.apply_updates(&outcome.context_updates)?;
            context.set(OUTCOME_KEY, json!(outcome.status.as_str()))?;
            context.set(LAST_STAGE_KEY, json!(node.id.clone()))?;
            let values = context.snapshot()?.values;

            if outcome.status == OutcomeStatus::Fail {
                let reason = outcome
                    .failure_reason
                    .clone()
                    .or_else(|| outcome.notes.clone())
                    .unwrap_or_else(|| format!("stage '{}' failed", node.id));
                sink.emit(
                    EngineEvent::for_node(EventKind::StageFailed, node.id.clone())
                        .with("status", json!(outcome.status.as_str()))
                        .with("reason", json!(reason.clone()))
                        .with("attempts", json!(attempts)),
                );

                if let Some(edge) = select_fail_edge(graph, &node.id, &values) {
                    let next = edge.to.clone();
                    write_checkpoint(
                        run_dir.as_ref(),
                        &run_id,
                        &context,
                        &completed_nodes,
                        &node_retries,
                        &node_outcomes,
                        Some(next.clone()),
                        None,
                        None,
                    )?;
                    current = next;
                    continue;
                }
                if let Some(target) = resolve_node_retry_target(graph, node) {
                    node_retries.insert(target.clone(), 0);
                    write_checkpoint(
                        run_dir.as_ref(),
                        &run_id,
                        &context,
                        &completed_nodes,
                        &node_retries,
                        &node_outcomes,
                        Some(target.clone()),
                        None,
                        None,
                    )?;
                    current = target;
                    continue;
                }

                write_checkpoint(
                    run_dir.as_ref(),
                    &run_id,
                    &context,
                    &completed_nodes,
                    &node_retries,
                    &node_outcomes,
                    Some(node.id.clone()),
                    Some("failed".to_string()),
                    Some(reason.clone()),
                )?;
                sink.emit(
                    EngineEvent::new(EventKind::PipelineFailed).with("error", json!(reason.clone())),
                );
                status = PipelineStatus::Fail;
                failure_reason = Some(reason);
                break;
            }

            sink.emit(
                EngineEvent::for_node(EventKind::StageCompleted, node.id.clone())
                    .with("status", json!(outcome.status.as_str()))
                    .with("attempts", json!(attempts))
                    .with("notes", json!(outcome.notes.clone().unwrap_or_default())),
            );

            if terminal {
                write_checkpoint(
                    run_dir.as_ref(),
                    &run_id,
                    &context,
                    &completed_nodes,
                    &node_retries,
                    &node_outcomes,
                    None,
                    Some("completed".to_string()),
                    None,
                )?;
                sink.emit(EngineEvent::new(EventKind::PipelineCompleted));
                break;
            }

            // Goal gates: any visited gate whose latest outcome is not
            // success-like redirects the traversal or fails the run.
            if let Some(gate_id) = first_unsatisfied_goal_gate(graph, &node_outcomes) {
                let gate_target = graph
                    .nodes
                    .get(&gate_id)
                    .and_then(|gate| resolve_retry_target(graph, gate));
                if let Some(target) = gate_target {
                    node_retries.insert(target.clone(), 0);
                    write_checkpoint(
                        run_dir.as_ref(),
                        &run_id,
                        &context,
                        &completed_nodes,
                        &node_retries,
                        &node_outcomes,
                        Some(target.clone()),
                        None,
                        None,
                    )?;
                    current = target;
                    continue;
                }
                let reason = format!("goal gate not satisfied: {gate_id}");
                sink.emit(
                    EngineEvent::new(EventKind::PipelineFailed).with("error", json!(reason.clone())),
                );
                status = PipelineStatus::Fail;
                failure_reason = Some(reason);
                break;
            }

            match select_next_edge(graph, &node.id, &values) {
                Some(edge) => {
                    let next = edge.to.clone();
                    write_checkpoint(
                        run_dir.as_ref(),
                        &run_id,
                        &context,
                        &completed_nodes,
                        &node_retries,
                        &node_outcomes,
                        Some(next.clone()),
                        None,
                        None,
                    )?;
                    current = next;
                }
                None => {
                    // Dead-end success: the pipeline is done (validation
                    // warned about this shape at submit).
                    write_checkpoint(
                        run_dir.as_ref(),
                        &run_id,
                        &context,
                        &completed_nodes,
                        &node_retries,
                        &node_outcomes,
                        None,
                        Some("completed".to_string()),
                        None,
                    )?;
                    sink.emit(EngineEvent::new(EventKind::PipelineCompleted));
                    break;
                }
            }
        }
        watch_cancel.cancel();

        // Phases 4 and 5: finalise and return.
        let result = RunResult {
            run_id,
            status,
            failure_reason,
            completed_nodes,
            node_outcomes,
            context: context.snapshot()?.values,
            events: recorder.events(),
        };
        finalize_state(config.state_store.as_ref(), run_state.as_mut(), &result)?;
        Ok(result)
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_with_retry(
        &self,
        graph: &Graph,
        node: &Node,
        snapshot: ContextSnapshot,
        preamble: Option<String>,
        artifacts: &ArtifactStore,
        run_dir: Option<&RunDirectory>,
        config: &EngineConfig,
        sink: &EventSink,
        run_id: &str,
    ) -> Result<AttemptLoopEnd, WaymarkError> {
        let handler = self.registry.resolve_handler(node).ok_or_else(|| {
            WaymarkError::Runtime(format!(
                "no handler registered for type '{}'",
                self.registry.resolve_handler_type(node)
            ))
        })?;
        let policy = resolve_retry_policy(node, graph, &config.retry);
        let timeout = resolve_timeout(node, graph, config.default_timeout);
        let jitter_seed = hash_run_node(run_id, &node.id);

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let stage = StageContext {
                run_id: run_id.to_string(),
                attempt,
                values: snapshot.clone(),
                preamble: preamble.clone(),
                artifacts: artifacts.clone(),
                run_dir: run_dir.cloned(),
                interviewer: Arc::clone(&config.interviewer),
                backend: config.backend.clone(),
                events: sink.clone(),
                cancel: config.cancel.child_token(),
            };
            let attempt_cancel = stage.cancel.clone();

            let guarded = AssertUnwindSafe(handler.execute(&stage, node, graph)).catch_unwind();
            let raw = match timeout {
                Some(limit) => {
                    tokio::select! {
                        result = guarded => RawAttempt::Done(result),
                        _ = tokio::time::sleep(limit) => {
                            attempt_cancel.cancel();
                            RawAttempt::TimedOut
                        }
                        _ = config.cancel.cancelled() => RawAttempt::Canceled,
                    }
                }
                None => {
                    tokio::select! {
                        result = guarded => RawAttempt::Done(result),
                        _ = config.cancel.cancelled() => RawAttempt::Canceled,
                    }
                }
            };

            let transient_error = match raw {
                RawAttempt::Canceled => {
                    return Ok(AttemptLoopEnd::Canceled("pipeline canceled".to_string()));
                }
                RawAttempt::TimedOut => format!(
                    "node '{}' timed out after {}ms",
                    node.id,
                    timeout.map(|limit| limit.as_millis()).unwrap_or_default()
                ),
                RawAttempt::Done(Err(panic_payload)) => {
                    format!("panic in node {}: {}", node.id, panic_message(panic_payload))
                }
                RawAttempt::Done(Ok(Err(WaymarkError::Canceled(reason)))) => {
                    return Ok(AttemptLoopEnd::Canceled(reason));
                }
                RawAttempt::Done(Ok(Err(error))) => error.to_string(),
                RawAttempt::Done(Ok(Ok(outcome))) => match outcome.status {
                    OutcomeStatus::Success
                    | OutcomeStatus::PartialSuccess
                    | OutcomeStatus::Fail => {
                        return Ok(AttemptLoopEnd::Finished { outcome, attempts: attempt });
                    }
                    OutcomeStatus::Retry => outcome
                        .notes
                        .clone()
                        .unwrap_or_else(|| "handler requested retry".to_string()),
                },
            };

            if attempt < policy.max_attempts() && policy.should_retry(&transient_error) {
                let delay = delay_for_attempt_ms(attempt - 1, &policy.backoff, jitter_seed);
                if delay > 0 {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
                        _ = config.cancel.cancelled() => {
                            return Ok(AttemptLoopEnd::Canceled("pipeline canceled".to_string()));
                        }
                    }
                }
                continue;
            }

            let mut outcome = Outcome::fail(transient_error);
            outcome.notes = Some(format!(
                "failed after {attempt} attempt(s) (max_retries={})",
                policy.max_retries
            ));
            return Ok(AttemptLoopEnd::Finished { outcome, attempts: attempt });
        }
    }

    /// Post-check after a success-like outcome: a non-zero `verify_command`
    /// exit converts the visit into a failure.
    async fn run_verify_command(
        &self,
        node: &Node,
        context: &Context,
        run_dir: Option<&RunDirectory>,
        cancel: &CancellationToken,
    ) -> Result<Option<Outcome>, WaymarkError> {
        let Some(command) = node
            .attrs
            .get_str("verify_command")
            .map(str::trim)
            .filter(|command| !command.is_empty())
        else {
            return Ok(None);
        };

        let workdir = context.get_string(WORKDIR_KEY, "");
        let workdir = if workdir.is_empty() {
            None
        } else {
            Some(PathBuf::from(workdir))
        };
        let output = run_shell_command(command, workdir.as_deref(), cancel).await?;
        if let Some(run_dir) = run_dir {
            run_dir.write_node_file(&node.id, "verify_command.txt", &output.to_artifact_text())?;
        }
        if output.succeeded() {
            return Ok(None);
        }
        Ok(Some(Outcome::fail(format!(
            "verify_command '{}' exited with status {}",
            command, output.exit_code
        ))))
    }
}

fn start_node(graph: &Graph) -> Result<&Node, WaymarkError> {
    graph
        .start_candidates()
        .into_iter()
        .next()
        .ok_or_else(|| WaymarkError::InvalidGraph("graph does not have a start node".to_string()))
}

fn resolve_max_node_visits(graph: &Graph, default: u32) -> u32 {
    graph
        .attrs
        .get("max_node_visits")
        .and_then(|value| value.as_i64())
        .map(|value| value.max(1) as u32)
        .unwrap_or(default)
}

fn resolve_timeout(graph_node: &Node, graph: &Graph, default: Option<Duration>) -> Option<Duration> {
    let from_attr = graph_node
        .attrs
        .get("timeout")
        .and_then(AttrValue::as_duration_ms)
        .or_else(|| {
            graph
                .attrs
                .get("default_node_timeout")
                .and_then(AttrValue::as_duration_ms)
        });
    match from_attr {
        Some(0) => None,
        Some(millis) => Some(Duration::from_millis(millis)),
        None => default.filter(|limit| !limit.is_zero()),
    }
}

/// Node-level redirect for a failed node.
fn resolve_node_retry_target(graph: &Graph, node: &Node) -> Option<String> {
    for key in ["retry_target", "fallback_retry_target"] {
        let target = node.attrs.get_str(key).unwrap_or_default();
        if !target.is_empty() && graph.nodes.contains_key(target) {
            return Some(target.to_string());
        }
    }
    None
}

/// Goal-gate redirect: the gate's own target wins, then the graph-level one.
fn resolve_retry_target(graph: &Graph, node: &Node) -> Option<String> {
    if let Some(target) = resolve_node_retry_target(graph, node) {
        return Some(target);
    }
    for key in ["retry_target", "fallback_retry_target"] {
        let target = graph.attrs.get_str(key).unwrap_or_default();
        if !target.is_empty() && graph.nodes.contains_key(target) {
            return Some(target.to_string());
        }
    }
    None
}

fn first_unsatisfied_goal_gate(
    graph: &Graph,
    node_outcomes: &BTreeMap<String, Outcome>,
) -> Option<String> {
    for (node_id, outcome) in node_outcomes {
        let Some(node) = graph.nodes.get(node_id) else {
            continue;
        };
        if node.attrs.get_bool("goal_gate") == Some(true) && !outcome.status.is_success_like() {
            return Some(node_id.clone());
        }
    }
    None
}

#[allow(clippy::too_many_arguments)]
fn write_checkpoint(
    run_dir: Option<&RunDirectory>,
    run_id: &str,
    context: &Context,
    completed_nodes: &[String],
    node_retries: &BTreeMap<String, u32>,
    node_outcomes: &BTreeMap<String, Outcome>,
    next_node: Option<String>,
    terminal_status: Option<String>,
    terminal_failure_reason: Option<String>,
) -> Result<(), WaymarkError> {
    let Some(run_dir) = run_dir else {
        return Ok(());
    };
    let snapshot = context.snapshot()?;
    let checkpoint = Checkpoint {
        timestamp: crate::clock::timestamp_now(),
        run_id: run_id.to_string(),
        current_node: completed_nodes.last().cloned().unwrap_or_default(),
        next_node,
        completed_nodes: completed_nodes.to_vec(),
        node_retries: node_retries.clone(),
        node_outcomes: node_outcomes
            .iter()
            .map(|(node_id, outcome)| (node_id.clone(), StoredOutcome::from_runtime(outcome)))
            .collect(),
        context_values: snapshot.values,
        logs: snapshot.logs,
        terminal_status,
        terminal_failure_reason,
    };
    checkpoint.save_to_path(&run_dir.checkpoint_path())
}

fn finalize_state(
    store: Option<&RunStateStore>,
    run_state: Option<&mut RunState>,
    result: &RunResult,
) -> Result<(), WaymarkError> {
    let (Some(store), Some(state)) = (store, run_state) else {
        return Ok(());
    };
    state.status = result.status.run_status();
    state.completed_at_ms = Some(now_ms());
    state.current_node = result.completed_nodes.last().cloned();
    state.completed_nodes = result.completed_nodes.clone();
    state.context_values = result.context.clone();
    state.events = result.events.clone();
    state.last_error = result.failure_reason.clone();
    store.update(state)
}

fn attr_value_to_json(value: &AttrValue) -> Value {
    match value {
        AttrValue::String(inner) => Value::String(inner.clone()),
        AttrValue::Integer(inner) => json!(inner),
        AttrValue::Float(inner) => json!(inner),
        AttrValue::Boolean(inner) => json!(inner),
        AttrValue::Duration(inner) => Value::String(inner.raw.clone()),
    }
}

fn random_run_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn hash_run_node(run_id: &str, node_id: &str) -> u64 {
    let mut hash = 0xcbf29ce484222325u64;
    for byte in run_id.bytes().chain(node_id.bytes()) {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}
