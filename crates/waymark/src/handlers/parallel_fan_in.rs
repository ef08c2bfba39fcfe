use crate::graph::{Graph, Node};
use crate::handlers::{NodeHandler, StageContext};
use crate::outcome::{Outcome, OutcomeStatus};
use crate::WaymarkError;
use async_trait::async_trait;
use serde_json::{json, Value};

#[derive(Clone, Debug)]
struct Candidate {
    id: String,
    status: OutcomeStatus,
    score: f64,
}

/// Aggregates branch results recorded under `parallel.results` and picks the
/// best candidate: best status rank, then highest score, then id.
#[derive(Debug, Default)]
pub struct ParallelFanInHandler;

#[async_trait]
impl NodeHandler for ParallelFanInHandler {
    async fn execute(
        &self,
        stage: &StageContext,
        _node: &Node,
        _graph: &Graph,
    ) -> Result<Outcome, WaymarkError> {
        let results = stage
            .values
            .values
            .get("parallel.results")
            .and_then(Value::as_array)
            .filter(|results| !results.is_empty())
            .cloned()
            .unwrap_or_default();
        if results.is_empty() {
            return Ok(Outcome::fail("no parallel results to evaluate"));
        }

        let mut candidates: Vec<Candidate> =
            results.iter().filter_map(candidate_from_value).collect();
        if candidates.is_empty() {
            return Ok(Outcome::fail("no parseable parallel results to evaluate"));
        }

        candidates.sort_by(|left, right| {
            rank_status(left.status)
                .cmp(&rank_status(right.status))
                .then_with(|| {
                    right
                        .score
                        .partial_cmp(&left.score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| left.id.cmp(&right.id))
        });
        let best = candidates[0].clone();

        let all_failed = candidates
            .iter()
            .all(|candidate| candidate.status == OutcomeStatus::Fail);
        if all_failed {
            let mut outcome = Outcome::fail("all parallel branches failed");
            outcome.context_updates.insert(
                "parallel.fan_in.candidate_count".to_string(),
                json!(candidates.len()),
            );
            return Ok(outcome);
        }

        let mut outcome = Outcome::success()
            .with_update("parallel.fan_in.best_id", json!(best.id.clone()))
            .with_update("parallel.fan_in.best_outcome", json!(best.status.as_str()))
            .with_update("parallel.fan_in.best_score", json!(best.score))
            .with_update(
                "parallel.fan_in.candidate_count",
                json!(candidates.len()),
            );
        outcome.notes = Some(format!(
            "selected best candidate: {} ({})",
            best.id,
            best.status.as_str()
        ));
        Ok(outcome)
    }
}

fn candidate_from_value(value: &Value) -> Option<Candidate> {
    let object = value.as_object()?;
    let id = object
        .get("branch_id")
        .and_then(Value::as_str)
        .or_else(|| object.get("target_node").and_then(Value::as_str))?
        .to_string();
    let status = object
        .get("status")
        .and_then(Value::as_str)
        .and_then(|raw| OutcomeStatus::try_from(raw).ok())
        .unwrap_or(OutcomeStatus::Fail);
    let score = object.get("score").and_then(Value::as_f64).unwrap_or(0.0);

    Some(Candidate { id, status, score })
}

fn rank_status(status: OutcomeStatus) -> u8 {
    match status {
        OutcomeStatus::Success => 0,
        OutcomeStatus::PartialSuccess => 1,
        OutcomeStatus::Retry => 2,
        OutcomeStatus::Fail => 3,
    }
}
