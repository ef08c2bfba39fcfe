//! Structural validation. Errors make a graph unrunnable; warnings flag
//! suspicious authoring (unknown attributes, dead ends) without blocking.

use crate::condition::validate_condition;
use crate::errors::ValidationError;
use crate::fidelity::is_valid_fidelity_mode;
use crate::graph::{is_start_node, is_terminal_node, Graph};
use crate::WaymarkError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub node_id: Option<String>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>, node_id: Option<String>) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
            node_id,
        }
    }

    pub fn warning(message: impl Into<String>, node_id: Option<String>) -> Self {
        Self {
            severity: Severity::Warning,
            message: message.into(),
            node_id,
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

const KNOWN_NODE_ATTRS: [&str; 24] = [
    "shape", "type", "node_type", "prompt", "label", "goal", "goal_gate", "retry_target",
    "fallback_retry_target", "max_retries", "timeout", "command", "verify_command", "fidelity",
    "env_required", "base_url", "llm_model", "llm_provider", "system_prompt", "working_dir",
    "max_turns", "class", "style", "fillcolor",
];

pub fn validate_graph(graph: &Graph) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();

    let starts = graph.start_candidates();
    match starts.len() {
        0 => diagnostics.push(Diagnostic::error("graph has no start node", None)),
        1 => {}
        _ => diagnostics.push(Diagnostic::error(
            format!(
                "graph has {} start nodes; exactly one is required",
                starts.len()
            ),
            None,
        )),
    }

    if graph.terminal_candidates().is_empty() {
        diagnostics.push(Diagnostic::error("graph has no terminal node", None));
    }

    for edge in &graph.edges {
        for endpoint in [&edge.from, &edge.to] {
            if !graph.nodes.contains_key(endpoint) {
                diagnostics.push(Diagnostic::error(
                    format!("edge references unknown node '{endpoint}'"),
                    None,
                ));
            }
        }
        if let Some(condition) = edge.condition() {
            if let Err(reason) = validate_condition(condition) {
                diagnostics.push(Diagnostic::error(
                    format!(
                        "edge {} -> {} has invalid condition: {}",
                        edge.from, edge.to, reason
                    ),
                    None,
                ));
            }
        }
    }

    for node in graph.nodes.values() {
        if let Some(fidelity) = node.attrs.get_str("fidelity") {
            if !is_valid_fidelity_mode(fidelity) {
                diagnostics.push(Diagnostic::error(
                    format!("unknown fidelity mode '{fidelity}'"),
                    Some(node.id.clone()),
                ));
            }
        }
        if node.attrs.get("max_retries").is_some()
            && node
                .attrs
                .get("max_retries")
                .and_then(|value| value.as_i64())
                .is_none()
        {
            diagnostics.push(Diagnostic::error(
                "max_retries must be an integer",
                Some(node.id.clone()),
            ));
        }
        for key in ["retry_target", "fallback_retry_target"] {
            if let Some(target) = node.attrs.get_str(key) {
                if !target.is_empty() && !graph.nodes.contains_key(target) {
                    diagnostics.push(Diagnostic::error(
                        format!("{key} '{target}' does not name a node"),
                        Some(node.id.clone()),
                    ));
                }
            }
        }
        for key in node.attrs.values().keys() {
            if !KNOWN_NODE_ATTRS.contains(&key.as_str()) {
                diagnostics.push(Diagnostic::warning(
                    format!("unknown attribute '{key}'"),
                    Some(node.id.clone()),
                ));
            }
        }
        if !is_terminal_node(node)
            && !is_start_node(node)
            && graph.outgoing_edges(&node.id).next().is_none()
        {
            diagnostics.push(Diagnostic::warning(
                "non-terminal node has no outgoing edges; a success here ends the pipeline",
                Some(node.id.clone()),
            ));
        }
    }

    diagnostics
}

/// Errors become a `ValidationError`; warnings are returned for reporting.
pub fn ensure_valid(graph: &Graph) -> Result<Vec<Diagnostic>, WaymarkError> {
    let diagnostics = validate_graph(graph);
    if diagnostics.iter().any(Diagnostic::is_error) {
        return Err(WaymarkError::Validation(ValidationError::new(diagnostics)));
    }
    Ok(diagnostics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse_dot;

    #[test]
    fn valid_linear_graph_expected_no_errors() {
        let graph = parse_dot(
            r#"
            digraph G {
                start [shape=Mdiamond]
                work [shape=box, prompt="do"]
                exit [shape=Msquare]
                start -> work -> exit
            }
            "#,
        )
        .expect("graph should parse");

        let diagnostics = ensure_valid(&graph).expect("graph should validate");
        assert!(diagnostics.iter().all(|d| !d.is_error()));
    }

    #[test]
    fn missing_start_node_expected_error() {
        let graph = parse_dot(
            r#"
            digraph G {
                work
                exit [shape=Msquare]
                work -> exit
            }
            "#,
        )
        .expect("graph should parse");

        let error = ensure_valid(&graph).expect_err("validation should fail");
        assert!(error.to_string().contains("1 error"));
    }

    #[test]
    fn two_start_nodes_expected_error() {
        let graph = parse_dot(
            r#"
            digraph G {
                a [shape=Mdiamond]
                b [shape=Mdiamond]
                exit [shape=Msquare]
                a -> exit
                b -> exit
            }
            "#,
        )
        .expect("graph should parse");

        assert!(ensure_valid(&graph).is_err());
    }

    #[test]
    fn bad_condition_and_retry_target_expected_errors() {
        let graph = parse_dot(
            r#"
            digraph G {
                start [shape=Mdiamond]
                work [retry_target="missing"]
                exit [shape=Msquare]
                start -> work
                work -> exit [condition="outcome="]
            }
            "#,
        )
        .expect("graph should parse");

        let diagnostics = validate_graph(&graph);
        let errors: Vec<_> = diagnostics.iter().filter(|d| d.is_error()).collect();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn unknown_attribute_expected_warning_not_error() {
        let graph = parse_dot(
            r#"
            digraph G {
                start [shape=Mdiamond]
                work [surprise="value"]
                exit [shape=Msquare]
                start -> work -> exit
            }
            "#,
        )
        .expect("graph should parse");

        let diagnostics = ensure_valid(&graph).expect("warnings must not fail validation");
        assert!(diagnostics
            .iter()
            .any(|d| d.severity == Severity::Warning && d.message.contains("surprise")));
    }

    #[test]
    fn dead_end_node_expected_warning() {
        let graph = parse_dot(
            r#"
            digraph G {
                start [shape=Mdiamond]
                stranded
                exit [shape=Msquare]
                start -> stranded
                start -> exit
            }
            "#,
        )
        .expect("graph should parse");

        let diagnostics = ensure_valid(&graph).expect("graph should validate");
        assert!(diagnostics
            .iter()
            .any(|d| d.node_id.as_deref() == Some("stranded")));
    }
}
