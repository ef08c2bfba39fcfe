use crate::graph::{Graph, Node};
use crate::handlers::{NodeHandler, StageContext};
use crate::outcome::Outcome;
use crate::WaymarkError;
use async_trait::async_trait;
use serde_json::Value;

#[derive(Debug, Default)]
pub struct StartHandler;

#[async_trait]
impl NodeHandler for StartHandler {
    async fn execute(
        &self,
        _stage: &StageContext,
        node: &Node,
        graph: &Graph,
    ) -> Result<Outcome, WaymarkError> {
        let mut outcome = Outcome::success();
        outcome.notes = Some(format!("Pipeline entry: {}", node.id));
        if let Some(goal) = graph.attrs.get_str("goal") {
            outcome = outcome.with_update("goal", Value::String(goal.to_string()));
        }
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
    async fn start_handler_seeds_goal_from_graph_attrs() {
        let graph = parse_dot(
            r#"
            digraph G {
                graph [goal="ship the release"]
                start [shape=Mdiamond]
            }
            "#,
        )
        .expect("graph should parse");
        let node = graph.nodes.get("start").expect("start node should exist");

        let outcome = StartHandler
            .execute(&stage_context(), node, &graph)
            .await
            .expect("execution should succeed");

        assert_eq!(outcome.status, OutcomeStatus::Success);
        assert_eq!(
            outcome.context_updates.get("goal"),
            Some(&serde_json::json!("ship the release"))
        );
    }
}
