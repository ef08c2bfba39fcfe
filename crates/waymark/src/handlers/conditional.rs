use crate::graph::{Graph, Node};
use crate::handlers::{NodeHandler, StageContext};
use crate::outcome::Outcome;
use crate::WaymarkError;
use async_trait::async_trait;

/// A routing point. The node itself does no work; the decision lives in its
/// outgoing edge conditions, evaluated against the updated context.
#[derive(Debug, Default)]
pub struct ConditionalHandler;

#[async_trait]
impl NodeHandler for ConditionalHandler {
    async fn execute(
        &self,
        _stage: &StageContext,
        node: &Node,
        _graph: &Graph,
    ) -> Result<Outcome, WaymarkError> {
        let mut outcome = Outcome::success();
        outcome.notes = Some(format!("Conditional node evaluated: {}", node.id));
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_support::stage_context;
    use crate::outcome::OutcomeStatus;
    use crate::parse::parse_dot;

    #[tokio::test(flavor = "current_thread")]
    async fn conditional_handler_succeeds_with_note() {
        let graph = parse_dot("digraph G { gate [shape=diamond] }").expect("graph should parse");
        let node = graph.nodes.get("gate").expect("gate node should exist");

        let outcome = ConditionalHandler
            .execute(&stage_context(), node, &graph)
            .await
            .expect("execution should succeed");

        assert_eq!(outcome.status, OutcomeStatus::Success);
        assert!(outcome.notes.as_deref().unwrap_or_default().contains("gate"));
    }
}
