//! Context compaction for LLM-driven handlers.
//!
//! A node opts in via its `fidelity` attribute; a run opts in globally via
//! the `_fidelity_mode` context key (mirrored from the graph's
//! `default_fidelity` attribute at prepare time). Compaction always produces
//! a new snapshot; the live context is never touched.

use crate::context::{ContextSnapshot, FIDELITY_MODE_KEY, LAST_STAGE_KEY, OUTCOME_KEY};
use crate::graph::{Graph, Node};
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FidelityMode {
    Full,
    Truncate,
    Compact,
    SummaryLow,
    SummaryMedium,
    SummaryHigh,
}

impl FidelityMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "full" => Some(Self::Full),
            "truncate" => Some(Self::Truncate),
            "compact" => Some(Self::Compact),
            "summary:low" => Some(Self::SummaryLow),
            "summary:medium" => Some(Self::SummaryMedium),
            "summary:high" => Some(Self::SummaryHigh),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Truncate => "truncate",
            Self::Compact => "compact",
            Self::SummaryLow => "summary:low",
            Self::SummaryMedium => "summary:medium",
            Self::SummaryHigh => "summary:high",
        }
    }
}

pub fn is_valid_fidelity_mode(raw: &str) -> bool {
    FidelityMode::parse(raw).is_some()
}

#[derive(Clone, Debug, PartialEq)]
pub struct CompactionLimits {
    pub max_keys: usize,
    pub max_value_length: usize,
    pub max_logs: usize,
    pub summary_value_length: usize,
    pub summary_whitelist: Vec<String>,
}

impl Default for CompactionLimits {
    fn default() -> Self {
        Self {
            max_keys: 50,
            max_value_length: 1000,
            max_logs: 20,
            summary_value_length: 500,
            summary_whitelist: vec![
                LAST_STAGE_KEY.to_string(),
                OUTCOME_KEY.to_string(),
                "goal".to_string(),
                "error".to_string(),
            ],
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Compacted {
    pub snapshot: ContextSnapshot,
    pub removed_keys: usize,
}

/// Resolve the effective mode: node attribute first, then the run-wide
/// `_fidelity_mode` key. `None` means no compaction (full fidelity).
pub fn resolve_fidelity(node: &Node, snapshot: &ContextSnapshot) -> Option<FidelityMode> {
    if let Some(raw) = node.attrs.get_str("fidelity") {
        if let Some(mode) = FidelityMode::parse(raw) {
            return Some(mode);
        }
    }
    snapshot
        .get_str(FIDELITY_MODE_KEY)
        .and_then(FidelityMode::parse)
}

/// Graph-level default, mirrored into `_fidelity_mode` at run start.
pub fn graph_fidelity_default(graph: &Graph) -> Option<&str> {
    graph
        .attrs
        .get_str("default_fidelity")
        .map(str::trim)
        .filter(|raw| !raw.is_empty())
}

pub fn compact_snapshot(
    snapshot: &ContextSnapshot,
    mode: FidelityMode,
    limits: &CompactionLimits,
) -> Compacted {
    match mode {
        FidelityMode::Full => Compacted {
            snapshot: snapshot.clone(),
            removed_keys: 0,
        },
        FidelityMode::Truncate => {
            let total = snapshot.values.len();
            let values = snapshot
                .values
                .iter()
                .take(limits.max_keys)
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            Compacted {
                snapshot: ContextSnapshot {
                    values,
                    logs: snapshot.logs.clone(),
                },
                removed_keys: total.saturating_sub(limits.max_keys),
            }
        }
        FidelityMode::Compact => {
            let mut removed = 0usize;
            let values = snapshot
                .values
                .iter()
                .filter(|(key, _)| {
                    if key.starts_with('_') {
                        removed += 1;
                        false
                    } else {
                        true
                    }
                })
                .map(|(key, value)| {
                    (
                        key.clone(),
                        clip_string_value(value, limits.max_value_length, "[truncated]"),
                    )
                })
                .collect();
            let logs = snapshot
                .logs
                .iter()
                .rev()
                .take(limits.max_logs)
                .rev()
                .cloned()
                .collect();
            Compacted {
                snapshot: ContextSnapshot { values, logs },
                removed_keys: removed,
            }
        }
        FidelityMode::SummaryLow => retain_keys(snapshot, |key| {
            limits.summary_whitelist.iter().any(|kept| kept == key)
        }),
        FidelityMode::SummaryMedium => retain_keys(snapshot, |key| {
            limits.summary_whitelist.iter().any(|kept| kept == key)
                || key.contains("result")
                || key.contains("output")
                || key.contains("status")
        }),
        FidelityMode::SummaryHigh => {
            let values = snapshot
                .values
                .iter()
                .map(|(key, value)| {
                    (
                        key.clone(),
                        shorten_string_value(value, limits.summary_value_length),
                    )
                })
                .collect();
            Compacted {
                snapshot: ContextSnapshot {
                    values,
                    logs: snapshot.logs.clone(),
                },
                removed_keys: 0,
            }
        }
    }
}

/// Short natural-language block prepended to the node prompt so the agent
/// knows the context was reduced and what to ask for.
pub fn generate_preamble(
    prev_node: Option<&str>,
    mode: FidelityMode,
    removed_keys: usize,
) -> Option<String> {
    if mode == FidelityMode::Full {
        return None;
    }
    let mut preamble = format!(
        "Context fidelity is '{}': the pipeline context handed to you has been reduced.",
        mode.as_str()
    );
    if removed_keys > 0 {
        preamble.push_str(&format!(" {removed_keys} context key(s) were hidden."));
    }
    if let Some(prev) = prev_node {
        preamble.push_str(&format!(
            " The previous stage was '{prev}'; ask for any hidden detail you need."
        ));
    } else {
        preamble.push_str(" Ask for any hidden detail you need.");
    }
    Some(preamble)
}

fn retain_keys(snapshot: &ContextSnapshot, keep: impl Fn(&str) -> bool) -> Compacted {
    let mut removed = 0usize;
    let values = snapshot
        .values
        .iter()
        .filter(|(key, _)| {
            if keep(key) {
                true
            } else {
                removed += 1;
                false
            }
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    Compacted {
        snapshot: ContextSnapshot {
            values,
            logs: snapshot.logs.clone(),
        },
        removed_keys: removed,
    }
}

fn clip_string_value(value: &Value, max_len: usize, replacement: &str) -> Value {
    match value {
        Value::String(inner) if inner.chars().count() > max_len => {
            Value::String(replacement.to_string())
        }
        other => other.clone(),
    }
}

fn shorten_string_value(value: &Value, max_len: usize) -> Value {
    match value {
        Value::String(inner) if inner.chars().count() > max_len => {
            Value::String(inner.chars().take(max_len).collect())
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn snapshot(values: &[(&str, Value)], logs: &[&str]) -> ContextSnapshot {
        ContextSnapshot {
            values: values
                .iter()
                .map(|(key, value)| (key.to_string(), value.clone()))
                .collect::<BTreeMap<_, _>>(),
            logs: logs.iter().map(|entry| entry.to_string()).collect(),
        }
    }

    #[test]
    fn full_mode_is_identity_with_no_preamble() {
        let input = snapshot(&[("a", json!(1))], &["log"]);
        let compacted = compact_snapshot(&input, FidelityMode::Full, &CompactionLimits::default());
        assert_eq!(compacted.snapshot, input);
        assert_eq!(compacted.removed_keys, 0);
        assert!(generate_preamble(None, FidelityMode::Full, 0).is_none());
    }

    #[test]
    fn truncate_keeps_first_n_keys_and_counts_removed() {
        let input = snapshot(&[("a", json!(1)), ("b", json!(2)), ("c", json!(3))], &[]);
        let limits = CompactionLimits {
            max_keys: 2,
            ..CompactionLimits::default()
        };
        let compacted = compact_snapshot(&input, FidelityMode::Truncate, &limits);
        assert_eq!(compacted.snapshot.values.len(), 2);
        assert_eq!(compacted.removed_keys, 1);
    }

    #[test]
    fn compact_drops_internal_keys_and_clips_long_strings() {
        let long = "x".repeat(2000);
        let input = snapshot(
            &[
                ("_workdir", json!("/tmp")),
                ("notes", json!(long)),
                ("short", json!("ok")),
            ],
            &["1", "2", "3"],
        );
        let limits = CompactionLimits {
            max_logs: 2,
            ..CompactionLimits::default()
        };
        let compacted = compact_snapshot(&input, FidelityMode::Compact, &limits);
        assert!(!compacted.snapshot.values.contains_key("_workdir"));
        assert_eq!(compacted.snapshot.values.get("notes"), Some(&json!("[truncated]")));
        assert_eq!(compacted.snapshot.values.get("short"), Some(&json!("ok")));
        assert_eq!(compacted.snapshot.logs, vec!["2".to_string(), "3".to_string()]);
        assert_eq!(compacted.removed_keys, 1);
    }

    #[test]
    fn summary_low_retains_only_whitelist() {
        let input = snapshot(
            &[
                ("outcome", json!("success")),
                ("goal", json!("ship")),
                ("scratch", json!("noise")),
            ],
            &[],
        );
        let compacted =
            compact_snapshot(&input, FidelityMode::SummaryLow, &CompactionLimits::default());
        assert_eq!(compacted.snapshot.values.len(), 2);
        assert_eq!(compacted.removed_keys, 1);
    }

    #[test]
    fn summary_medium_adds_result_output_status_keys() {
        let input = snapshot(
            &[
                ("outcome", json!("success")),
                ("build.status", json!("green")),
                ("test_output", json!("42 passed")),
                ("scratch", json!("noise")),
            ],
            &[],
        );
        let compacted = compact_snapshot(
            &input,
            FidelityMode::SummaryMedium,
            &CompactionLimits::default(),
        );
        assert!(compacted.snapshot.values.contains_key("build.status"));
        assert!(compacted.snapshot.values.contains_key("test_output"));
        assert!(!compacted.snapshot.values.contains_key("scratch"));
    }

    #[test]
    fn summary_high_shortens_values_but_keeps_all_keys() {
        let long = "y".repeat(800);
        let input = snapshot(&[("notes", json!(long)), ("n", json!(7))], &[]);
        let compacted = compact_snapshot(
            &input,
            FidelityMode::SummaryHigh,
            &CompactionLimits::default(),
        );
        assert_eq!(compacted.snapshot.values.len(), 2);
        let shortened = compacted
            .snapshot
            .values
            .get("notes")
            .and_then(Value::as_str)
            .expect("notes should remain a string");
        assert_eq!(shortened.len(), 500);
    }

    #[test]
    fn preamble_names_mode_and_previous_stage() {
        let preamble = generate_preamble(Some("plan"), FidelityMode::Compact, 3)
            .expect("preamble expected for non-full mode");
        assert!(preamble.contains("compact"));
        assert!(preamble.contains("3 context key(s)"));
        assert!(preamble.contains("plan"));
    }
}
