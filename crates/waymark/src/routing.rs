//! Outgoing-edge selection.
//!
//! Conditions are evaluated against the updated context (the `outcome` key is
//! already current). Among matching conditional edges, edges whose condition
//! tests `outcome` win over those that do not, more clauses beat fewer, and
//! remaining ties resolve in declaration order. With no conditional match the
//! first unconditional edge is taken; after a failed node there is no
//! unconditional fallback.

use crate::condition::{
    condition_clause_count, condition_mentions_outcome, evaluate_condition,
};
use crate::context::ContextValues;
use crate::graph::{Edge, Graph};

pub fn select_next_edge<'a>(
    graph: &'a Graph,
    from_node_id: &'a str,
    context: &ContextValues,
) -> Option<&'a Edge> {
    let edges: Vec<&Edge> = graph.outgoing_edges(from_node_id).collect();
    if edges.is_empty() {
        return None;
    }

    if let Some(edge) = best_condition_match(&edges, context) {
        return Some(edge);
    }

    edges.iter().copied().find(|edge| edge.condition().is_none())
}

/// Routing after a failed node: only a matching condition counts.
pub fn select_fail_edge<'a>(
    graph: &'a Graph,
    from_node_id: &'a str,
    context: &ContextValues,
) -> Option<&'a Edge> {
    let edges: Vec<&Edge> = graph.outgoing_edges(from_node_id).collect();
    best_condition_match(&edges, context)
}

fn best_condition_match<'a>(edges: &[&'a Edge], context: &ContextValues) -> Option<&'a Edge> {
    let mut best: Option<(&Edge, bool, usize)> = None;
    for edge in edges {
        let Some(condition) = edge.condition() else {
            continue;
        };
        if !evaluate_condition(condition, context).unwrap_or(false) {
            continue;
        }
        let outcome_specific = condition_mentions_outcome(condition);
        let clauses = condition_clause_count(condition);
        let better = match best {
            None => true,
            Some((_, best_outcome, best_clauses)) => {
                (outcome_specific, clauses) > (best_outcome, best_clauses)
            }
        };
        if better {
            best = Some((edge, outcome_specific, clauses));
        }
    }
    best.map(|(edge, _, _)| edge)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse_dot;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn context(outcome: &str) -> ContextValues {
        BTreeMap::from([("outcome".to_string(), json!(outcome))])
    }

    #[test]
    fn condition_match_expected_over_unconditional() {
        let graph = parse_dot(
            r#"
            digraph G {
                n1
                a
                b
                n1 -> a
                n1 -> b [condition="outcome=success"]
            }
            "#,
        )
        .expect("graph should parse");

        let selected =
            select_next_edge(&graph, "n1", &context("success")).expect("edge expected");
        assert_eq!(selected.to, "b");
    }

    #[test]
    fn outcome_specific_condition_beats_generic_match() {
        let mut ctx = context("success");
        ctx.insert("ready".to_string(), json!(true));
        let graph = parse_dot(
            r#"
            digraph G {
                n1
                a
                b
                n1 -> a [condition="ready=true"]
                n1 -> b [condition="outcome=success"]
            }
            "#,
        )
        .expect("graph should parse");

        let selected = select_next_edge(&graph, "n1", &ctx).expect("edge expected");
        assert_eq!(selected.to, "b");
    }

    #[test]
    fn equally_specific_conditions_expected_declaration_order() {
        let graph = parse_dot(
            r#"
            digraph G {
                n1
                a
                b
                n1 -> b [condition="outcome=success"]
                n1 -> a [condition="outcome=success"]
            }
            "#,
        )
        .expect("graph should parse");

        let selected =
            select_next_edge(&graph, "n1", &context("success")).expect("edge expected");
        assert_eq!(selected.to, "b");
    }

    #[test]
    fn more_clauses_expected_more_specific() {
        let mut ctx = context("success");
        ctx.insert("ready".to_string(), json!(true));
        let graph = parse_dot(
            r#"
            digraph G {
                n1
                a
                b
                n1 -> a [condition="outcome=success"]
                n1 -> b [condition="outcome=success and ready=true"]
            }
            "#,
        )
        .expect("graph should parse");

        let selected = select_next_edge(&graph, "n1", &ctx).expect("edge expected");
        assert_eq!(selected.to, "b");
    }

    #[test]
    fn no_condition_match_expected_first_unconditional() {
        let graph = parse_dot(
            r#"
            digraph G {
                n1
                a
                b
                n1 -> b
                n1 -> a
                n1 -> a [condition="outcome=fail"]
            }
            "#,
        )
        .expect("graph should parse");

        let selected =
            select_next_edge(&graph, "n1", &context("success")).expect("edge expected");
        assert_eq!(selected.to, "b");
    }

    #[test]
    fn fail_edge_selection_ignores_unconditional_edges() {
        let graph = parse_dot(
            r#"
            digraph G {
                n1
                a
                b
                n1 -> a
                n1 -> b [condition="outcome=fail"]
            }
            "#,
        )
        .expect("graph should parse");

        let selected = select_fail_edge(&graph, "n1", &context("fail")).expect("edge expected");
        assert_eq!(selected.to, "b");
        assert!(select_fail_edge(&graph, "n1", &context("success")).is_none());
    }

    #[test]
    fn no_outgoing_edges_expected_none() {
        let graph = parse_dot("digraph G { n1 }").expect("graph should parse");
        assert!(select_next_edge(&graph, "n1", &context("success")).is_none());
    }
}
