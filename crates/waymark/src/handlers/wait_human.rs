use crate::graph::{Graph, Node};
use crate::handlers::{NodeHandler, StageContext};
use crate::interviewer::Question;
use crate::outcome::Outcome;
use crate::WaymarkError;
use async_trait::async_trait;
use serde_json::Value;

/// Human gate. The question's options come from the labels of the node's
/// outgoing edges; the selected option lands in `human.selected`, which edge
/// conditions can route on.
#[derive(Debug, Default)]
pub struct WaitHumanHandler;

#[async_trait]
impl NodeHandler for WaitHumanHandler {
    async fn execute(
        &self,
        stage: &StageContext,
        node: &Node,
        graph: &Graph,
    ) -> Result<Outcome, WaymarkError> {
        let options = derive_options(node, graph);
        if options.is_empty() {
            return Ok(Outcome::fail(format!(
                "human gate '{}' has no outgoing edges to choose from",
                node.id
            )));
        }

        let question = Question {
            id: String::new(),
            node_id: node.id.clone(),
            text: node
                .attrs
                .get_str("label")
                .filter(|label| !label.trim().is_empty())
                .unwrap_or("Select an option:")
                .to_string(),
            options: options.clone(),
        };

        let answer = match stage.interviewer.ask(&stage.cancel, question).await {
            Ok(answer) => answer,
            Err(WaymarkError::Canceled(reason)) => return Err(WaymarkError::Canceled(reason)),
            Err(error) => return Ok(Outcome::fail(error.to_string())),
        };

        let selected = options
            .iter()
            .find(|option| option.eq_ignore_ascii_case(answer.trim()))
            .cloned()
            .unwrap_or(answer);

        let mut outcome = Outcome::success()
            .with_update("human.selected", Value::String(selected.clone()));
        outcome.notes = Some(format!("human selected '{selected}'"));
        Ok(outcome)
    }
}

fn derive_options(node: &Node, graph: &Graph) -> Vec<String> {
    graph
        .outgoing_edges(&node.id)
        .map(|edge| {
            edge.attrs
                .get_str("label")
                .map(str::trim)
                .filter(|label| !label.is_empty())
                .unwrap_or(edge.to.as_str())
                .to_string()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_support::stage_context;
    use crate::interviewer::QueueInterviewer;
    use crate::outcome::OutcomeStatus;
    use crate::parse::parse_dot;
    use std::sync::Arc;

    fn gate_graph() -> Graph {
        parse_dot(
            r#"
            digraph G {
                gate [shape=hexagon, label="Ship it?"]
                ship
                fix
                gate -> ship [label="Approve"]
                gate -> fix [label="Revise"]
            }
            "#,
        )
        .expect("graph should parse")
    }

    #[tokio::test(flavor = "current_thread")]
    async fn answer_matched_to_edge_label_case_insensitively() {
        let graph = gate_graph();
        let node = graph.nodes.get("gate").expect("gate node should exist");
        let mut stage = stage_context();
        stage.interviewer = Arc::new(QueueInterviewer::with_answers(["revise"]));

        let outcome = WaitHumanHandler
            .execute(&stage, node, &graph)
            .await
            .expect("execution should succeed");

        assert_eq!(outcome.status, OutcomeStatus::Success);
        assert_eq!(
            outcome.context_updates.get("human.selected"),
            Some(&serde_json::json!("Revise"))
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn default_auto_interviewer_picks_first_option() {
        let graph = gate_graph();
        let node = graph.nodes.get("gate").expect("gate node should exist");

        let outcome = WaitHumanHandler
            .execute(&stage_context(), node, &graph)
            .await
            .expect("execution should succeed");

        assert_eq!(
            outcome.context_updates.get("human.selected"),
            Some(&serde_json::json!("Approve"))
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn gate_without_edges_expected_failure() {
        let graph = parse_dot("digraph G { gate [shape=hexagon] }").expect("graph should parse");
        let node = graph.nodes.get("gate").expect("gate node should exist");

        let outcome = WaitHumanHandler
            .execute(&stage_context(), node, &graph)
            .await
            .expect("execution should succeed");
        assert_eq!(outcome.status, OutcomeStatus::Fail);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn interviewer_error_becomes_durable_failure() {
        let graph = gate_graph();
        let node = graph.nodes.get("gate").expect("gate node should exist");
        let mut stage = stage_context();
        stage.interviewer = Arc::new(crate::interviewer::NullInterviewer);

        let outcome = WaitHumanHandler
            .execute(&stage, node, &graph)
            .await
            .expect("execution should succeed");
        assert_eq!(outcome.status, OutcomeStatus::Fail);
    }
}
