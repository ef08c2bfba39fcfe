use crate::graph::{Graph, Node};
use crate::handlers::{NodeHandler, StageContext};
use crate::outcome::Outcome;
use crate::WaymarkError;
use async_trait::async_trait;

#[derive(Debug, Default)]
pub struct ExitHandler;

#[async_trait]
impl NodeHandler for ExitHandler {
    async fn execute(
        &self,
        _stage: &StageContext,
        node: &Node,
        _graph: &Graph,
    ) -> Result<Outcome, WaymarkError> {
        let mut outcome = Outcome::success();
        outcome.notes = Some(format!("Pipeline exit: {}", node.id));
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
    async fn exit_handler_returns_success() {
        let graph = parse_dot("digraph G { exit [shape=Msquare] }").expect("graph should parse");
        let node = graph.nodes.get("exit").expect("exit node should exist");

        let outcome = ExitHandler
            .execute(&stage_context(), node, &graph)
            .await
            .expect("execution should succeed");
        assert_eq!(outcome.status, OutcomeStatus::Success);
    }
}
