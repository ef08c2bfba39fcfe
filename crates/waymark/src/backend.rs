//! The seam between the engine and whatever actually runs an agent turn.
//!
//! Backends are external collaborators: the engine only sees this interface
//! plus the stream of session events a backend emits while working.

use crate::clock::timestamp_now;
use crate::WaymarkError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub type SessionEventData = BTreeMap<String, Value>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEventKind {
    SessionStart,
    SessionEnd,
    UserInput,
    AssistantTextStart,
    AssistantTextDelta,
    AssistantTextEnd,
    ToolCallStart,
    ToolCallOutputDelta,
    ToolCallEnd,
    SteeringInjected,
    TurnLimit,
    LoopDetection,
    Error,
}

/// Low-level event from an agent session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub kind: SessionEventKind,
    pub timestamp: String,
    pub data: SessionEventData,
}

impl SessionEvent {
    pub fn new(kind: SessionEventKind) -> Self {
        Self {
            kind,
            timestamp: timestamp_now(),
            data: SessionEventData::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }
}

pub trait SessionObserver: Send + Sync {
    fn on_session_event(&self, event: &SessionEvent);
}

/// Token counters reported by a backend; absent counters read as zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub total: u64,
    #[serde(default)]
    pub reasoning: u64,
    #[serde(default)]
    pub cache_read: u64,
    #[serde(default)]
    pub cache_write: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.input += other.input;
        self.output += other.output;
        self.total += other.total;
        self.reasoning += other.reasoning;
        self.cache_read += other.cache_read;
        self.cache_write += other.cache_write;
    }
}

/// One unit of agent work derived from a node's attributes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AgentTask {
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub base_url: Option<String>,
    pub working_dir: Option<String>,
    pub max_turns: Option<u32>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AgentReply {
    pub text: String,
    pub usage: Option<TokenUsage>,
}

#[async_trait]
pub trait AgentBackend: Send + Sync {
    async fn run_task(
        &self,
        task: AgentTask,
        observer: &dyn SessionObserver,
    ) -> Result<AgentReply, WaymarkError>;
}

/// Test and demo backend: replays a canned event script, then answers with a
/// fixed reply.
pub struct ScriptedBackend {
    pub reply: AgentReply,
    pub script: Vec<SessionEvent>,
}

impl ScriptedBackend {
    pub fn replying(text: impl Into<String>) -> Self {
        Self {
            reply: AgentReply {
                text: text.into(),
                usage: None,
            },
            script: Vec::new(),
        }
    }

    pub fn with_script(mut self, script: Vec<SessionEvent>) -> Self {
        self.script = script;
        self
    }
}

#[async_trait]
impl AgentBackend for ScriptedBackend {
    async fn run_task(
        &self,
        _task: AgentTask,
        observer: &dyn SessionObserver,
    ) -> Result<AgentReply, WaymarkError> {
        for event in &self.script {
            observer.on_session_event(event);
        }
        Ok(self.reply.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    struct Collecting(Mutex<Vec<SessionEventKind>>);

    impl SessionObserver for Collecting {
        fn on_session_event(&self, event: &SessionEvent) {
            self.0.lock().expect("mutex should lock").push(event.kind);
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn scripted_backend_replays_script_then_replies() {
        let backend = ScriptedBackend::replying("done").with_script(vec![
            SessionEvent::new(SessionEventKind::SessionStart),
            SessionEvent::new(SessionEventKind::AssistantTextEnd).with("text_length", json!(4)),
        ]);
        let observer = Collecting(Mutex::new(Vec::new()));

        let reply = backend
            .run_task(AgentTask::default(), &observer)
            .await
            .expect("run should succeed");

        assert_eq!(reply.text, "done");
        assert_eq!(
            observer.0.lock().expect("mutex should lock").as_slice(),
            &[
                SessionEventKind::SessionStart,
                SessionEventKind::AssistantTextEnd
            ]
        );
    }

    #[test]
    fn token_usage_add_accumulates_all_counters() {
        let mut total = TokenUsage::default();
        total.add(&TokenUsage {
            input: 10,
            output: 5,
            total: 15,
            reasoning: 2,
            cache_read: 1,
            cache_write: 0,
        });
        total.add(&TokenUsage {
            input: 1,
            output: 1,
            total: 2,
            ..TokenUsage::default()
        });
        assert_eq!(total.input, 11);
        assert_eq!(total.total, 17);
        assert_eq!(total.reasoning, 2);
    }
}
