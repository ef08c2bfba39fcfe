use crate::graph::{Graph, Node};

#[derive(Clone, Debug, PartialEq)]
pub struct BackoffConfig {
    pub initial_delay_ms: u64,
    pub factor: f64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 200,
            factor: 2.0,
            max_delay_ms: 60_000,
            jitter: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    pub name: &'static str,
    pub max_retries: u32,
    pub backoff: BackoffConfig,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            name: "default",
            max_retries: 0,
            backoff: BackoffConfig::default(),
        }
    }
}

impl RetryPolicy {
    /// Look up a named policy (`none`, `default`, `aggressive`, `patient`).
    pub fn named(name: &str) -> Option<Self> {
        match name {
            "none" => Some(Self {
                name: "none",
                max_retries: 0,
                backoff: BackoffConfig {
                    initial_delay_ms: 0,
                    factor: 1.0,
                    max_delay_ms: 0,
                    jitter: false,
                },
            }),
            "default" => Some(Self::default()),
            "aggressive" => Some(Self {
                name: "aggressive",
                max_retries: 5,
                backoff: BackoffConfig {
                    initial_delay_ms: 100,
                    factor: 1.5,
                    max_delay_ms: 10_000,
                    jitter: true,
                },
            }),
            "patient" => Some(Self {
                name: "patient",
                max_retries: 3,
                backoff: BackoffConfig {
                    initial_delay_ms: 1_000,
                    factor: 2.0,
                    max_delay_ms: 120_000,
                    jitter: true,
                },
            }),
            _ => None,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Whether a transient error is worth another attempt. Cancellation and
    /// structural problems never are.
    pub fn should_retry(&self, error: &str) -> bool {
        let lowered = error.to_ascii_lowercase();
        !(lowered.contains("canceled")
            || lowered.contains("invalid graph")
            || lowered.contains("no handler registered"))
    }
}

/// Resolve the effective policy for one node: node `max_retries` attribute,
/// then graph `default_max_retry`, then the engine default.
pub fn resolve_retry_policy(node: &Node, graph: &Graph, default: &RetryPolicy) -> RetryPolicy {
    let max_retries = node
        .attrs
        .get("max_retries")
        .and_then(|value| value.as_i64())
        .or_else(|| {
            graph
                .attrs
                .get("default_max_retry")
                .and_then(|value| value.as_i64())
        })
        .map(|value| value.max(0) as u32)
        .unwrap_or(default.max_retries);

    RetryPolicy {
        name: default.name,
        max_retries,
        backoff: default.backoff.clone(),
    }
}

/// Backoff delay before attempt `attempt + 1` (attempts are zero-based).
/// With jitter on, the delay is scaled by a seeded unit factor in `[0, 1]`.
pub fn delay_for_attempt_ms(attempt: u32, config: &BackoffConfig, jitter_seed: u64) -> u64 {
    let base = (config.initial_delay_ms as f64) * config.factor.powi(attempt as i32);
    let mut delay = base.min(config.max_delay_ms as f64);
    if config.jitter {
        delay *= jitter_unit(attempt, jitter_seed);
    }
    delay.round().max(0.0) as u64
}

fn jitter_unit(attempt: u32, jitter_seed: u64) -> f64 {
    let mut x = jitter_seed ^ ((attempt as u64 + 1) << 32) ^ 0x9E3779B97F4A7C15;
    x ^= x >> 12;
    x ^= x << 25;
    x ^= x >> 27;
    let r = x.wrapping_mul(0x2545F4914F6CDD1D);
    (r as f64) / (u64::MAX as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse_dot;

    #[test]
    fn resolve_retry_policy_node_attr_expected_attempts_plus_one() {
        let graph = parse_dot(
            r#"
            digraph G {
                start [shape=Mdiamond]
                work [max_retries=3]
                exit [shape=Msquare]
                start -> work -> exit
            }
            "#,
        )
        .expect("graph should parse");
        let node = graph.nodes.get("work").expect("work node should exist");

        let policy = resolve_retry_policy(node, &graph, &RetryPolicy::default());
        assert_eq!(policy.max_attempts(), 4);
    }

    #[test]
    fn resolve_retry_policy_graph_default_expected_fallback_used() {
        let graph = parse_dot(
            r#"
            digraph G {
                graph [default_max_retry=2]
                start [shape=Mdiamond]
                work
                exit [shape=Msquare]
                start -> work -> exit
            }
            "#,
        )
        .expect("graph should parse");
        let node = graph.nodes.get("work").expect("work node should exist");

        let policy = resolve_retry_policy(node, &graph, &RetryPolicy::default());
        assert_eq!(policy.max_attempts(), 3);
    }

    #[test]
    fn named_policies_expected_known_set() {
        assert_eq!(RetryPolicy::named("none").map(|p| p.max_retries), Some(0));
        assert_eq!(
            RetryPolicy::named("aggressive").map(|p| p.max_retries),
            Some(5)
        );
        assert!(RetryPolicy::named("bogus").is_none());
    }

    #[test]
    fn delay_for_attempt_ms_no_jitter_expected_exponential_capped() {
        let config = BackoffConfig {
            initial_delay_ms: 200,
            factor: 2.0,
            max_delay_ms: 500,
            jitter: false,
        };
        assert_eq!(delay_for_attempt_ms(0, &config, 0), 200);
        assert_eq!(delay_for_attempt_ms(1, &config, 0), 400);
        assert_eq!(delay_for_attempt_ms(2, &config, 0), 500);
    }

    #[test]
    fn delay_for_attempt_ms_with_jitter_expected_within_zero_to_delay() {
        let config = BackoffConfig {
            initial_delay_ms: 200,
            factor: 2.0,
            max_delay_ms: 60_000,
            jitter: true,
        };
        for seed in [1u64, 42, 977] {
            let delay = delay_for_attempt_ms(1, &config, seed);
            assert!(delay <= 400, "delay {delay} exceeds un-jittered bound");
        }
    }

    #[test]
    fn should_retry_rejects_cancellation_and_structural_errors() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry("connection reset"));
        assert!(!policy.should_retry("run canceled: shutdown"));
        assert!(!policy.should_retry("invalid graph: unknown node"));
    }
}
