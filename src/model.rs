//! Metadata of a backup job and the outcome of a run.

use derive_more::Display;

/// Identifies a backup job.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Model {
    /// Short machine name. Names the package and its storage namespace.
    pub trigger: String,
    /// Human readable description used in notifications.
    pub label: String,
}

impl Model {
    pub fn new(trigger: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            trigger: trigger.into(),
            label: label.into(),
        }
    }
}

/// Aggregated outcome of a run.
///
/// Variants are ordered from best to worst, so combining the outcomes of
/// independent steps is [`max`](Ord::max) and doesn't depend on order.
#[derive(
    Debug,
    Display,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    #[display("Success")]
    Success,
    #[display("Warning")]
    Warning,
    #[display("Failure")]
    Failure,
}

impl Status {
    /// Process exit code reporting this status.
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Warning => 1,
            Self::Failure => 2,
        }
    }

    /// Status reported by a process exit code. Unknown codes are failures.
    pub fn from_exit_code(code: i32) -> Self {
        match code {
            0 => Self::Success,
            1 => Self::Warning,
            _ => Self::Failure,
        }
    }

    /// The worse of both.
    pub fn worst(self, other: Self) -> Self {
        self.max(other)
    }
}
