use crate::backend::{AgentReply, AgentTask};
use crate::bridge::AgentBridge;
use crate::context::{LAST_STAGE_KEY, WORKDIR_KEY};
use crate::graph::{Graph, Node};
use crate::handlers::{NodeHandler, StageContext};
use crate::outcome::Outcome;
use crate::WaymarkError;
use async_trait::async_trait;
use serde_json::{json, Value};

const RESPONSE_SNIPPET_MAX_CHARS: usize = 200;

/// The default node type: hand the node's prompt to the agent backend and
/// record what came back. Without a backend the handler simulates a reply so
/// pipelines stay runnable in dry-run and test environments.
#[derive(Debug, Default)]
pub struct CodergenHandler;

impl CodergenHandler {
    fn build_prompt(&self, stage: &StageContext, node: &Node, graph: &Graph) -> String {
        let mut prompt = node.attrs.get_str("prompt").unwrap_or_default().to_string();
        if prompt.trim().is_empty() {
            prompt = node
                .attrs
                .get_str("label")
                .filter(|label| !label.trim().is_empty())
                .unwrap_or(node.id.as_str())
                .to_string();
        }
        if let Some(goal) = graph.attrs.get_str("goal") {
            prompt = prompt.replace("$goal", goal);
        }
        match stage.preamble.as_deref() {
            Some(preamble) => format!("{preamble}\n\n{prompt}"),
            None => prompt,
        }
    }

    fn task_for_node(&self, stage: &StageContext, node: &Node, prompt: String) -> AgentTask {
        let attr = |key: &str| {
            node.attrs
                .get_str(key)
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(ToOwned::to_owned)
        };
        let working_dir = attr("working_dir").or_else(|| {
            stage
                .values
                .get_str(WORKDIR_KEY)
                .map(ToOwned::to_owned)
        });
        AgentTask {
            prompt,
            system_prompt: attr("system_prompt"),
            model: attr("llm_model"),
            provider: attr("llm_provider"),
            base_url: attr("base_url"),
            working_dir,
            max_turns: node
                .attrs
                .get("max_turns")
                .and_then(|value| value.as_i64())
                .map(|value| value.max(0) as u32),
        }
    }
}

#[async_trait]
impl NodeHandler for CodergenHandler {
    async fn execute(
        &self,
        stage: &StageContext,
        node: &Node,
        graph: &Graph,
    ) -> Result<Outcome, WaymarkError> {
        let prompt = self.build_prompt(stage, node, graph);
        if let Some(run_dir) = stage.run_dir.as_ref() {
            run_dir.write_node_file(&node.id, "prompt.md", &prompt)?;
        }

        let Some(backend) = stage.backend.as_ref() else {
            let response = format!("[Simulated] Response for stage: {}", node.id);
            if let Some(run_dir) = stage.run_dir.as_ref() {
                run_dir.write_node_file(&node.id, "response.md", &response)?;
            }
            return Ok(stage_success(node, &response, None));
        };

        let bridge = AgentBridge::new(node.id.clone(), stage.events.clone());
        let task = self.task_for_node(stage, node, prompt);
        let reply = match backend.run_task(task, &bridge).await {
            Ok(reply) => reply,
            Err(error) => return Ok(Outcome::fail(error.to_string())),
        };

        if let Some(run_dir) = stage.run_dir.as_ref() {
            run_dir.write_node_file(&node.id, "response.md", &reply.text)?;
            let tool_log = bridge.tool_log();
            if !tool_log.is_empty() {
                run_dir.write_node_file(&node.id, "tool_calls.log", &tool_log.join("\n"))?;
            }
        }

        Ok(stage_success(node, &reply.text, Some(&reply)))
    }
}

fn stage_success(node: &Node, response_text: &str, reply: Option<&AgentReply>) -> Outcome {
    let mut outcome = Outcome::success()
        .with_update(LAST_STAGE_KEY, Value::String(node.id.clone()))
        .with_update(
            "last_response",
            Value::String(truncate_chars(response_text, RESPONSE_SNIPPET_MAX_CHARS)),
        );
    if let Some(usage) = reply.and_then(|reply| reply.usage.as_ref()) {
        outcome = outcome
            .with_update("agent.tokens.input", json!(usage.input))
            .with_update("agent.tokens.output", json!(usage.output))
            .with_update("agent.tokens.total", json!(usage.total));
    }
    outcome.notes = Some(format!("Stage completed: {}", node.id));
    outcome
}

fn truncate_chars(input: &str, max_chars: usize) -> String {
    input.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ScriptedBackend, TokenUsage};
    use crate::handlers::test_support::stage_context;
    use crate::outcome::OutcomeStatus;
    use crate::parse::parse_dot;
    use std::sync::Arc;

    #[tokio::test(flavor = "current_thread")]
    async fn without_backend_expected_simulated_success() {
        let graph = parse_dot("digraph G { n1 [shape=box, label=\"plan\"] }")
            .expect("graph should parse");
        let node = graph.nodes.get("n1").expect("node should exist");

        let outcome = CodergenHandler
            .execute(&stage_context(), node, &graph)
            .await
            .expect("execution should succeed");

        assert_eq!(outcome.status, OutcomeStatus::Success);
        assert_eq!(
            outcome.context_updates.get("last_stage"),
            Some(&serde_json::json!("n1"))
        );
        assert!(
            outcome
                .context_updates
                .get("last_response")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .contains("Simulated")
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn goal_placeholder_expanded_and_preamble_prepended() {
        let graph = parse_dot(
            r#"
            digraph G {
                graph [goal="ship"]
                n1 [shape=box, prompt="achieve $goal"]
            }
            "#,
        )
        .expect("graph should parse");
        let node = graph.nodes.get("n1").expect("node should exist");
        let mut stage = stage_context();
        stage.preamble = Some("Context was reduced.".to_string());

        let prompt = CodergenHandler.build_prompt(&stage, node, &graph);
        assert!(prompt.starts_with("Context was reduced."));
        assert!(prompt.ends_with("achieve ship"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn backend_reply_recorded_with_token_updates() {
        let graph = parse_dot("digraph G { n1 [shape=box, prompt=\"work\"] }")
            .expect("graph should parse");
        let node = graph.nodes.get("n1").expect("node should exist");
        let mut stage = stage_context();
        stage.backend = Some(Arc::new(ScriptedBackend {
            reply: AgentReply {
                text: "all done".to_string(),
                usage: Some(TokenUsage {
                    input: 10,
                    output: 5,
                    total: 15,
                    ..TokenUsage::default()
                }),
            },
            script: Vec::new(),
        }));

        let outcome = CodergenHandler
            .execute(&stage, node, &graph)
            .await
            .expect("execution should succeed");

        assert_eq!(outcome.status, OutcomeStatus::Success);
        assert_eq!(
            outcome.context_updates.get("agent.tokens.total"),
            Some(&serde_json::json!(15))
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn backend_error_becomes_durable_failure() {
        struct FailingBackend;

        #[async_trait]
        impl crate::backend::AgentBackend for FailingBackend {
            async fn run_task(
                &self,
                _task: AgentTask,
                _observer: &dyn crate::backend::SessionObserver,
            ) -> Result<AgentReply, WaymarkError> {
                Err(WaymarkError::Runtime("provider unreachable".to_string()))
            }
        }

        let graph =
            parse_dot("digraph G { n1 [shape=box] }").expect("graph should parse");
        let node = graph.nodes.get("n1").expect("node should exist");
        let mut stage = stage_context();
        stage.backend = Some(Arc::new(FailingBackend));

        let outcome = CodergenHandler
            .execute(&stage, node, &graph)
            .await
            .expect("execution should succeed");
        assert_eq!(outcome.status, OutcomeStatus::Fail);
        assert!(
            outcome
                .failure_reason
                .as_deref()
                .unwrap_or_default()
                .contains("provider unreachable")
        );
    }
}
