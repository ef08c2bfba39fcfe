//! Checkpoint-based resume. A resumed run never re-executes the node the
//! checkpoint recorded; it seeds the traversal at that node's successor.

use crate::checkpoint::Checkpoint;
use crate::context::ContextValues;
use crate::graph::Graph;
use crate::outcome::Outcome;
use crate::routing::select_next_edge;
use crate::WaymarkError;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Clone, Debug)]
pub struct ResumeSeed {
    pub checkpoint_run_id: String,
    pub next_node: Option<String>,
    pub completed_nodes: Vec<String>,
    pub node_retries: BTreeMap<String, u32>,
    pub node_outcomes: BTreeMap<String, Outcome>,
    pub context_values: ContextValues,
    pub logs: Vec<String>,
    pub terminal_status: Option<String>,
    pub terminal_failure_reason: Option<String>,
}

pub fn load_resume_seed(graph: &Graph, checkpoint_path: &Path) -> Result<ResumeSeed, WaymarkError> {
    let checkpoint = Checkpoint::load_from_path(checkpoint_path)?;

    let next_node = if checkpoint.terminal_status.as_deref() == Some("completed") {
        None
    } else {
        checkpoint
            .next_node
            .clone()
            .or_else(|| infer_next_node(graph, &checkpoint))
    };

    if let Some(next) = next_node.as_deref() {
        if !graph.nodes.contains_key(next) {
            return Err(WaymarkError::Runtime(format!(
                "resume checkpoint points to unknown node '{next}'"
            )));
        }
    }

    let mut node_outcomes = BTreeMap::new();
    for (node_id, stored) in &checkpoint.node_outcomes {
        node_outcomes.insert(node_id.clone(), stored.to_runtime()?);
    }

    Ok(ResumeSeed {
        checkpoint_run_id: checkpoint.run_id.clone(),
        next_node,
        completed_nodes: checkpoint.completed_nodes.clone(),
        node_retries: checkpoint.node_retries.clone(),
        node_outcomes,
        context_values: checkpoint.context_values.clone(),
        logs: checkpoint.logs.clone(),
        terminal_status: checkpoint.terminal_status.clone(),
        terminal_failure_reason: checkpoint.terminal_failure_reason.clone(),
    })
}

fn infer_next_node(graph: &Graph, checkpoint: &Checkpoint) -> Option<String> {
    if checkpoint.current_node.is_empty() {
        return None;
    }
    select_next_edge(graph, &checkpoint.current_node, &checkpoint.context_values)
        .map(|edge| edge.to.clone())
}
