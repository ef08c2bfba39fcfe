//! Translates agent session events into engine events.
//!
//! Each session event maps to zero or one engine event. Tool calls are timed
//! via a stash keyed by call id, output snippets are truncated, and token
//! counters are aggregated across turns for the node.

use crate::backend::{SessionEvent, SessionEventKind, SessionObserver, TokenUsage};
use crate::events::{EngineEvent, EventKind, EventSink};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Instant;

const OUTPUT_SNIPPET_MAX_CHARS: usize = 500;

struct OpenCall {
    started_at: Instant,
    tool_name: String,
}

#[derive(Default)]
struct BridgeState {
    open_calls: BTreeMap<String, OpenCall>,
    tool_log: Vec<String>,
    usage: TokenUsage,
}

pub struct AgentBridge {
    node_id: String,
    sink: EventSink,
    state: Mutex<BridgeState>,
}

impl AgentBridge {
    pub fn new(node_id: impl Into<String>, sink: EventSink) -> Self {
        Self {
            node_id: node_id.into(),
            sink,
            state: Mutex::new(BridgeState::default()),
        }
    }

    /// One line per finished tool call, for the node's tool log artifact.
    pub fn tool_log(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|state| state.tool_log.clone())
            .unwrap_or_default()
    }

    /// Token counters aggregated across every turn seen by this bridge.
    pub fn usage(&self) -> TokenUsage {
        self.state
            .lock()
            .map(|state| state.usage)
            .unwrap_or_default()
    }

    fn emit(&self, kind: EventKind, data: Vec<(&str, Value)>) {
        let mut event = EngineEvent::for_node(kind, self.node_id.clone());
        for (key, value) in data {
            event.data.insert(key.to_string(), value);
        }
        self.sink.emit(event);
    }
}

impl SessionObserver for AgentBridge {
    fn on_session_event(&self, event: &SessionEvent) {
        match event.kind {
            SessionEventKind::ToolCallStart => {
                let call_id = str_field(event, "call_id");
                let tool_name = str_field(event, "tool_name");
                if let Ok(mut state) = self.state.lock() {
                    state.open_calls.insert(
                        call_id.clone(),
                        OpenCall {
                            started_at: Instant::now(),
                            tool_name: tool_name.clone(),
                        },
                    );
                }
                self.emit(
                    EventKind::AgentToolCallStart,
                    vec![("call_id", json!(call_id)), ("tool_name", json!(tool_name))],
                );
            }
            SessionEventKind::ToolCallEnd => {
                let call_id = str_field(event, "call_id");
                let snippet = truncate_chars(&str_field(event, "output"), OUTPUT_SNIPPET_MAX_CHARS);
                let (tool_name, duration_ms) = match self.state.lock() {
                    Ok(mut state) => {
                        let open = state.open_calls.remove(&call_id);
                        let tool_name = open
                            .as_ref()
                            .map(|call| call.tool_name.clone())
                            .unwrap_or_else(|| str_field(event, "tool_name"));
                        let duration_ms = open
                            .map(|call| call.started_at.elapsed().as_millis() as u64)
                            .unwrap_or(0);
                        state
                            .tool_log
                            .push(format!("{tool_name} ({duration_ms}ms): {snippet}"));
                        (tool_name, duration_ms)
                    }
                    Err(_) => (str_field(event, "tool_name"), 0),
                };
                self.emit(
                    EventKind::AgentToolCallEnd,
                    vec![
                        ("call_id", json!(call_id)),
                        ("tool_name", json!(tool_name)),
                        ("duration_ms", json!(duration_ms)),
                        ("output_snippet", json!(snippet)),
                    ],
                );
            }
            SessionEventKind::AssistantTextStart => {
                self.emit(EventKind::AgentTextStart, Vec::new());
            }
            SessionEventKind::AssistantTextDelta => {
                self.emit(
                    EventKind::AgentTextDelta,
                    vec![("text", json!(str_field(event, "text")))],
                );
            }
            SessionEventKind::AssistantTextEnd => {
                let usage = usage_from_event(event);
                if let Ok(mut state) = self.state.lock() {
                    state.usage.add(&usage);
                }
                self.emit(
                    EventKind::AgentLlmTurn,
                    vec![
                        (
                            "text_length",
                            event.data.get("text_length").cloned().unwrap_or(json!(0)),
                        ),
                        (
                            "has_reasoning",
                            event
                                .data
                                .get("has_reasoning")
                                .cloned()
                                .unwrap_or(json!(false)),
                        ),
                        ("input_tokens", json!(usage.input)),
                        ("output_tokens", json!(usage.output)),
                        ("total_tokens", json!(usage.total)),
                        ("reasoning_tokens", json!(usage.reasoning)),
                        ("cache_read_tokens", json!(usage.cache_read)),
                        ("cache_write_tokens", json!(usage.cache_write)),
                    ],
                );
            }
            SessionEventKind::SteeringInjected => {
                self.emit(
                    EventKind::AgentSteering,
                    vec![("message", json!(str_field(event, "message")))],
                );
            }
            SessionEventKind::LoopDetection => {
                self.emit(
                    EventKind::AgentLoopDetected,
                    vec![("detail", json!(str_field(event, "detail")))],
                );
            }
            SessionEventKind::SessionStart
            | SessionEventKind::SessionEnd
            | SessionEventKind::UserInput
            | SessionEventKind::ToolCallOutputDelta
            | SessionEventKind::TurnLimit
            | SessionEventKind::Error => {}
        }
    }
}

fn str_field(event: &SessionEvent, key: &str) -> String {
    event
        .data
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn usage_from_event(event: &SessionEvent) -> TokenUsage {
    let field = |key: &str| event.data.get(key).and_then(Value::as_u64).unwrap_or(0);
    TokenUsage {
        input: field("input_tokens"),
        output: field("output_tokens"),
        total: field("total_tokens"),
        reasoning: field("reasoning_tokens"),
        cache_read: field("cache_read_tokens"),
        cache_write: field("cache_write_tokens"),
    }
}

fn truncate_chars(input: &str, max_chars: usize) -> String {
    input.chars().take(max_chars).collect()
}
