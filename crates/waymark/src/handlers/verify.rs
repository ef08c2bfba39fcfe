use crate::context::WORKDIR_KEY;
use crate::graph::{Graph, Node};
use crate::handlers::{NodeHandler, StageContext};
use crate::outcome::Outcome;
use crate::WaymarkError;
use async_trait::async_trait;
use serde_json::json;
use std::path::Path;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

const FAILURE_TAIL_MAX_CHARS: usize = 400;

#[derive(Clone, Debug, PartialEq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }

    /// Artifact encoding shared by verify nodes and post-check commands.
    pub fn to_artifact_text(&self) -> String {
        format!(
            "exit_code={}\nstdout:\n{}\nstderr:\n{}",
            self.exit_code, self.stdout, self.stderr
        )
    }
}

/// Run a shell command, observing cancellation. A killed process reports
/// exit code -1.
pub async fn run_shell_command(
    command: &str,
    working_dir: Option<&Path>,
    cancel: &CancellationToken,
) -> Result<CommandOutput, WaymarkError> {
    let mut invocation = Command::new("sh");
    invocation.arg("-c").arg(command);
    if let Some(dir) = working_dir {
        invocation.current_dir(dir);
    }
    invocation.kill_on_drop(true);

    let pending = invocation.output();
    let output = tokio::select! {
        output = pending => output.map_err(|error| {
            WaymarkError::Runtime(format!("failed to spawn command '{command}': {error}"))
        })?,
        _ = cancel.cancelled() => {
            return Err(WaymarkError::Canceled(format!(
                "cancelled while running command '{command}'"
            )));
        }
    };

    Ok(CommandOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Deterministic verification node: run the `command` attribute and map its
/// exit code onto the outcome.
#[derive(Debug, Default)]
pub struct VerifyHandler;

#[async_trait]
impl NodeHandler for VerifyHandler {
    async fn execute(
        &self,
        stage: &StageContext,
        node: &Node,
        _graph: &Graph,
    ) -> Result<Outcome, WaymarkError> {
        let command = node.attrs.get_str("command").unwrap_or_default().trim();
        if command.is_empty() {
            return Ok(Outcome::fail(format!(
                "verify node '{}' has no command attribute",
                node.id
            )));
        }

        let working_dir = node
            .attrs
            .get_str("working_dir")
            .map(str::trim)
            .filter(|dir| !dir.is_empty())
            .map(ToOwned::to_owned)
            .or_else(|| stage.values.get_str(WORKDIR_KEY).map(ToOwned::to_owned));

        let output = run_shell_command(
            command,
            working_dir.as_deref().map(Path::new),
            &stage.cancel,
        )
        .await?;

        let artifact_text = output.to_artifact_text();
        stage
            .artifacts
            .store_text(format!("{}.verify", node.id), &artifact_text)?;
        if let Some(run_dir) = stage.run_dir.as_ref() {
            run_dir.write_node_file(&node.id, "verify_output.txt", &artifact_text)?;
        }

        if output.succeeded() {
            let mut outcome = Outcome::success()
                .with_update("verify.exit_code", json!(0))
                .with_update("last_stage", json!(node.id.clone()));
            outcome.notes = Some(format!("Verification passed: {command}"));
            Ok(outcome)
        } else {
            let mut outcome = Outcome::fail(format!(
                "command '{}' exited with status {}: {}",
                command,
                output.exit_code,
                tail_chars(&output.stderr, FAILURE_TAIL_MAX_CHARS)
            ));
            outcome
                .context_updates
                .insert("verify.exit_code".to_string(), json!(output.exit_code));
            Ok(outcome)
        }
    }
}

fn tail_chars(input: &str, max_chars: usize) -> String {
    let trimmed = input.trim();
    let count = trimmed.chars().count();
    if count <= max_chars {
        return trimmed.to_string();
    }
    trimmed.chars().skip(count - max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_support::stage_context;
    use crate::outcome::OutcomeStatus;
    use crate::parse::parse_dot;

    #[tokio::test(flavor = "current_thread")]
    async fn passing_command_expected_success_and_artifact() {
        let graph = parse_dot(
            r#"
            digraph G {
                check [shape=octagon, command="echo all-good"]
            }
            "#,
        )
        .expect("graph should parse");
        let node = graph.nodes.get("check").expect("node should exist");
        let stage = stage_context();

        let outcome = VerifyHandler
            .execute(&stage, node, &graph)
            .await
            .expect("execution should succeed");

        assert_eq!(outcome.status, OutcomeStatus::Success);
        let artifact = stage
            .artifacts
            .retrieve_text("check.verify")
            .expect("artifact should exist");
        assert!(artifact.starts_with("exit_code=0\nstdout:\n"));
        assert!(artifact.contains("all-good"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn failing_command_expected_fail_with_exit_code() {
        let graph = parse_dot(
            r#"
            digraph G {
                check [shape=octagon, command="echo broken >&2; exit 3"]
            }
            "#,
        )
        .expect("graph should parse");
        let node = graph.nodes.get("check").expect("node should exist");
        let stage = stage_context();

        let outcome = VerifyHandler
            .execute(&stage, node, &graph)
            .await
            .expect("execution should succeed");

        assert_eq!(outcome.status, OutcomeStatus::Fail);
        assert_eq!(
            outcome.context_updates.get("verify.exit_code"),
            Some(&json!(3))
        );
        assert!(
            outcome
                .failure_reason
                .as_deref()
                .unwrap_or_default()
                .contains("broken")
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn missing_command_expected_durable_failure() {
        let graph = parse_dot("digraph G { check [shape=octagon] }").expect("graph should parse");
        let node = graph.nodes.get("check").expect("node should exist");

        let outcome = VerifyHandler
            .execute(&stage_context(), node, &graph)
            .await
            .expect("execution should succeed");
        assert_eq!(outcome.status, OutcomeStatus::Fail);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn cancelled_command_expected_canceled_error() {
        let graph = parse_dot(
            r#"
            digraph G {
                check [shape=octagon, command="sleep 30"]
            }
            "#,
        )
        .expect("graph should parse");
        let node = graph.nodes.get("check").expect("node should exist").clone();
        let mut stage = stage_context();
        let cancel = CancellationToken::new();
        stage.cancel = cancel.clone();

        let handle =
            tokio::spawn(async move { VerifyHandler.execute(&stage, &node, &graph).await });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancel.cancel();

        let result = handle.await.expect("task should join");
        assert!(matches!(result, Err(WaymarkError::Canceled(_))));
    }
}
