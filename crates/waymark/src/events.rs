use crate::clock::timestamp_now;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

pub type EventData = BTreeMap<String, Value>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventKind {
    PipelineStarted,
    PipelineCompleted,
    PipelineFailed,
    StageStarted,
    StageCompleted,
    StageFailed,
    StageStalled,
    AgentToolCallStart,
    AgentToolCallEnd,
    AgentLlmTurn,
    AgentTextStart,
    AgentTextDelta,
    AgentSteering,
    AgentLoopDetected,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PipelineStarted => "pipeline.started",
            Self::PipelineCompleted => "pipeline.completed",
            Self::PipelineFailed => "pipeline.failed",
            Self::StageStarted => "stage.started",
            Self::StageCompleted => "stage.completed",
            Self::StageFailed => "stage.failed",
            Self::StageStalled => "stage.stalled",
            Self::AgentToolCallStart => "agent.tool_call.start",
            Self::AgentToolCallEnd => "agent.tool_call.end",
            Self::AgentLlmTurn => "agent.llm_turn",
            Self::AgentTextStart => "agent.text.start",
            Self::AgentTextDelta => "agent.text.delta",
            Self::AgentSteering => "agent.steering",
            Self::AgentLoopDetected => "agent.loop_detected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pipeline.started" => Some(Self::PipelineStarted),
            "pipeline.completed" => Some(Self::PipelineCompleted),
            "pipeline.failed" => Some(Self::PipelineFailed),
            "stage.started" => Some(Self::StageStarted),
            "stage.completed" => Some(Self::StageCompleted),
            "stage.failed" => Some(Self::StageFailed),
            "stage.stalled" => Some(Self::StageStalled),
            "agent.tool_call.start" => Some(Self::AgentToolCallStart),
            "agent.tool_call.end" => Some(Self::AgentToolCallEnd),
            "agent.llm_turn" => Some(Self::AgentLlmTurn),
            "agent.text.start" => Some(Self::AgentTextStart),
            "agent.text.delta" => Some(Self::AgentTextDelta),
            "agent.steering" => Some(Self::AgentSteering),
            "agent.loop_detected" => Some(Self::AgentLoopDetected),
            _ => None,
        }
    }
}

impl Serialize for EventKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown event type '{raw}'")))
    }
}

/// One structured observation emitted during a run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "EventData::is_empty")]
    pub data: EventData,
}

impl EngineEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            node_id: None,
            timestamp: timestamp_now(),
            data: EventData::new(),
        }
    }

    pub fn for_node(kind: EventKind, node_id: impl Into<String>) -> Self {
        Self {
            kind,
            node_id: Some(node_id.into()),
            timestamp: timestamp_now(),
            data: EventData::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }
}

pub trait EventObserver: Send + Sync {
    fn on_event(&self, event: &EngineEvent);
}

impl<F> EventObserver for F
where
    F: Fn(&EngineEvent) + Send + Sync,
{
    fn on_event(&self, event: &EngineEvent) {
        self(event);
    }
}

pub type SharedEventObserver = Arc<dyn EventObserver>;
pub type EventSender = mpsc::UnboundedSender<EngineEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<EngineEvent>;

/// Fan-out point for engine events: zero or more synchronous observers plus
/// an optional channel sender. Emission happens on the engine worker, so
/// observer panics are contained here rather than allowed to kill the run.
#[derive(Clone, Default)]
pub struct EventSink {
    observers: Vec<SharedEventObserver>,
    sender: Option<EventSender>,
}

impl EventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_observer(observer: SharedEventObserver) -> Self {
        Self {
            observers: vec![observer],
            sender: None,
        }
    }

    pub fn with_sender(sender: EventSender) -> Self {
        Self {
            observers: Vec::new(),
            sender: Some(sender),
        }
    }

    pub fn observer(mut self, observer: SharedEventObserver) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn sender(mut self, sender: EventSender) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn add_observer(&mut self, observer: SharedEventObserver) {
        self.observers.push(observer);
    }

    pub fn emit(&self, event: EngineEvent) {
        for observer in &self.observers {
            let result = catch_unwind(AssertUnwindSafe(|| observer.on_event(&event)));
            if result.is_err() {
                tracing::warn!(
                    event_kind = event.kind.as_str(),
                    "event observer panicked; continuing"
                );
            }
        }
        if let Some(sender) = self.sender.as_ref() {
            let _ = sender.send(event);
        }
    }
}

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// In-memory recorder; the engine attaches one so `RunResult` can carry the
/// full event sequence.
#[derive(Clone, Default)]
pub struct EventRecorder {
    events: Arc<Mutex<Vec<EngineEvent>>>,
}

impl EventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl EventObserver for EventRecorder {
    fn on_event(&self, event: &EngineEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
