//! Pre-run checks. Checks never short-circuit: every failure is collected so
//! the operator sees the whole list at once.

use crate::graph::Graph;
use crate::handlers::registry::HandlerRegistry;
use std::path::Path;

/// Provider keys accepted as evidence that an agent backend can run.
pub const PROVIDER_ENV_KEYS: [&str; 3] =
    ["ANTHROPIC_API_KEY", "OPENAI_API_KEY", "GEMINI_API_KEY"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PreflightCheck {
    /// Agentic nodes need a configured backend or a provider key in the
    /// environment.
    BackendAvailable,
    /// Every `env_required` attribute names variables that must be set.
    EnvRequired,
    /// The artifacts base must be creatable/writable.
    ArtifactsWritable,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PreflightReport {
    pub failures: Vec<String>,
}

impl PreflightReport {
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn reason(&self) -> String {
        self.failures.join("; ")
    }
}

pub struct PreflightInput<'a> {
    pub graph: &'a Graph,
    pub registry: &'a HandlerRegistry,
    pub has_backend: bool,
    pub artifacts_base: Option<&'a Path>,
}

pub fn run_preflight(checks: &[PreflightCheck], input: &PreflightInput<'_>) -> PreflightReport {
    let mut report = PreflightReport::default();
    for check in checks {
        match check {
            PreflightCheck::BackendAvailable => check_backend(input, &mut report),
            PreflightCheck::EnvRequired => check_env_required(input, &mut report),
            PreflightCheck::ArtifactsWritable => check_artifacts(input, &mut report),
        }
    }
    report
}

pub fn default_checks() -> Vec<PreflightCheck> {
    vec![PreflightCheck::EnvRequired, PreflightCheck::ArtifactsWritable]
}

fn check_backend(input: &PreflightInput<'_>, report: &mut PreflightReport) {
    let agentic: Vec<&str> = input
        .graph
        .nodes
        .values()
        .filter(|node| input.registry.resolve_handler_type(node) == "codergen")
        .map(|node| node.id.as_str())
        .collect();
    if agentic.is_empty() || input.has_backend {
        return;
    }
    let has_provider_key = PROVIDER_ENV_KEYS.iter().any(|key| {
        std::env::var(key)
            .map(|value| !value.trim().is_empty())
            .unwrap_or(false)
    });
    if !has_provider_key {
        report.failures.push(format!(
            "agentic node(s) {} need an agent backend: none configured and no provider key ({}) is set",
            agentic.join(", "),
            PROVIDER_ENV_KEYS.join("/")
        ));
    }
}

fn check_env_required(input: &PreflightInput<'_>, report: &mut PreflightReport) {
    for node in input.graph.nodes.values() {
        let Some(required) = node.attrs.get_str("env_required") else {
            continue;
        };
        for var in required.split(',').map(str::trim).filter(|var| !var.is_empty()) {
            let present = std::env::var(var)
                .map(|value| !value.trim().is_empty())
                .unwrap_or(false);
            if !present {
                report.failures.push(format!(
                    "node '{}' requires environment variable '{}'",
                    node.id, var
                ));
            }
        }
    }
}

fn check_artifacts(input: &PreflightInput<'_>, report: &mut PreflightReport) {
    let Some(base) = input.artifacts_base else {
        return;
    };
    if let Err(error) = std::fs::create_dir_all(base) {
        report.failures.push(format!(
            "artifacts base '{}' is not writable: {}",
            base.display(),
            error
        ));
    }
}
