use crate::context::ContextValues;
use crate::WaymarkError;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    PartialSuccess,
    Fail,
    Retry,
}

impl OutcomeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::PartialSuccess => "partial_success",
            Self::Fail => "fail",
            Self::Retry => "retry",
        }
    }

    pub fn is_success_like(self) -> bool {
        matches!(self, Self::Success | Self::PartialSuccess)
    }
}

impl TryFrom<&str> for OutcomeStatus {
    type Error = WaymarkError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "success" => Ok(Self::Success),
            "partial_success" => Ok(Self::PartialSuccess),
            "fail" => Ok(Self::Fail),
            "retry" => Ok(Self::Retry),
            other => Err(WaymarkError::Runtime(format!(
                "unknown outcome status '{other}'"
            ))),
        }
    }
}

/// A handler's result for one attempt. `context_updates` are merged into the
/// live context by the engine once the outcome is surfaced.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub status: OutcomeStatus,
    pub notes: Option<String>,
    pub failure_reason: Option<String>,
    pub context_updates: ContextValues,
}

impl Outcome {
    pub fn success() -> Self {
        Self {
            status: OutcomeStatus::Success,
            notes: None,
            failure_reason: None,
            context_updates: ContextValues::new(),
        }
    }

    pub fn partial(notes: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::PartialSuccess,
            notes: Some(notes.into()),
            failure_reason: None,
            context_updates: ContextValues::new(),
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Fail,
            notes: None,
            failure_reason: Some(reason.into()),
            context_updates: ContextValues::new(),
        }
    }

    pub fn retry(notes: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Retry,
            notes: Some(notes.into()),
            failure_reason: None,
            context_updates: ContextValues::new(),
        }
    }

    pub fn with_update(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context_updates.insert(key.into(), value);
        self
    }
}
