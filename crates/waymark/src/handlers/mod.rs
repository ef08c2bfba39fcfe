use crate::artifacts::ArtifactStore;
use crate::backend::AgentBackend;
use crate::context::ContextSnapshot;
use crate::events::EventSink;
use crate::graph::{Graph, Node};
use crate::interviewer::Interviewer;
use crate::outcome::Outcome;
use crate::rundir::RunDirectory;
use crate::WaymarkError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub mod codergen;
pub mod conditional;
pub mod exit;
pub mod parallel_fan_in;
pub mod registry;
pub mod start;
pub mod verify;
pub mod wait_human;

/// Everything one node execution may touch. `values` is the (possibly
/// compacted) context snapshot; writes go back through
/// `Outcome::context_updates`, never through shared state.
#[derive(Clone)]
pub struct StageContext {
    pub run_id: String,
    pub attempt: u32,
    pub values: ContextSnapshot,
    pub preamble: Option<String>,
    pub artifacts: ArtifactStore,
    pub run_dir: Option<RunDirectory>,
    pub interviewer: Arc<dyn Interviewer>,
    pub backend: Option<Arc<dyn AgentBackend>>,
    pub events: EventSink,
    pub cancel: CancellationToken,
}

#[async_trait]
pub trait NodeHandler: Send + Sync {
    async fn execute(
        &self,
        stage: &StageContext,
        node: &Node,
        graph: &Graph,
    ) -> Result<Outcome, WaymarkError>;

    /// Transparent wrappers report the handler they delegate to, so wrapper
    /// chains stay introspectable.
    fn inner_handler(&self) -> Option<&dyn NodeHandler> {
        None
    }
}

pub type SharedNodeHandler = Arc<dyn NodeHandler>;

/// Follow `inner_handler` links to the handler that does the actual work.
pub fn innermost(handler: &dyn NodeHandler) -> &dyn NodeHandler {
    let mut current = handler;
    while let Some(inner) = current.inner_handler() {
        current = inner;
    }
    current
}

pub fn core_registry() -> registry::HandlerRegistry {
    let mut registry = registry::HandlerRegistry::new();
    registry.register_type("start", Arc::new(start::StartHandler));
    registry.register_type("exit", Arc::new(exit::ExitHandler));
    registry.register_type("codergen", Arc::new(codergen::CodergenHandler));
    registry.register_type("conditional", Arc::new(conditional::ConditionalHandler));
    registry.register_type("verify", Arc::new(verify::VerifyHandler));
    registry.register_type("wait.human", Arc::new(wait_human::WaitHumanHandler));
    registry.register_type(
        "parallel.fan_in",
        Arc::new(parallel_fan_in::ParallelFanInHandler),
    );
    registry
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::interviewer::AutoInterviewer;

    /// A bare stage context for handler unit tests.
    pub fn stage_context() -> StageContext {
        StageContext {
            run_id: "run-test".to_string(),
            attempt: 1,
            values: ContextSnapshot::default(),
            preamble: None,
            artifacts: ArtifactStore::in_memory(),
            run_dir: None,
            interviewer: Arc::new(AutoInterviewer),
            backend: None,
            events: EventSink::new(),
            cancel: CancellationToken::new(),
        }
    }
}
