//! Run and stage-execution status enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a pipeline run.
///
/// The non-failed statuses form a strict linear order:
/// `pending → analyzing → designing → generating → building → deploying → completed`.
/// `failed` is reachable from every non-terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, not yet started.
    Pending,
    /// Interpreting the free-text request.
    Analyzing,
    /// Designing architecture, API and data schema.
    Designing,
    /// Generating backend, frontend and infrastructure.
    Generating,
    /// Building the generated project.
    Building,
    /// Deploying and smoke-testing the build.
    Deploying,
    /// Terminal: the run finished.
    Completed,
    /// Terminal: the run failed.
    Failed,
}

impl Default for RunStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl RunStatus {
    /// Every status in declaration order.
    pub const ALL: [Self; 8] = [
        Self::Pending,
        Self::Analyzing,
        Self::Designing,
        Self::Generating,
        Self::Building,
        Self::Deploying,
        Self::Completed,
        Self::Failed,
    ];

    /// Returns the wire name of the status.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Analyzing => "analyzing",
            Self::Designing => "designing",
            Self::Generating => "generating",
            Self::Building => "building",
            Self::Deploying => "deploying",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Position in the linear success path. `None` for `Failed`.
    #[must_use]
    pub const fn ordinal(&self) -> Option<u8> {
        match self {
            Self::Pending => Some(0),
            Self::Analyzing => Some(1),
            Self::Designing => Some(2),
            Self::Generating => Some(3),
            Self::Building => Some(4),
            Self::Deploying => Some(5),
            Self::Completed => Some(6),
            Self::Failed => None,
        }
    }

    /// Returns true if the status represents a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns the status that directly follows this one on the success path.
    #[must_use]
    pub const fn next(&self) -> Option<Self> {
        match self {
            Self::Pending => Some(Self::Analyzing),
            Self::Analyzing => Some(Self::Designing),
            Self::Designing => Some(Self::Generating),
            Self::Generating => Some(Self::Building),
            Self::Building => Some(Self::Deploying),
            Self::Deploying => Some(Self::Completed),
            Self::Completed | Self::Failed => None,
        }
    }

    /// Returns true if the state machine allows moving from `self` to `target`.
    ///
    /// Only single forward steps and `→ failed` from a non-terminal status are
    /// legal. Terminal statuses have no outgoing transitions.
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        target == Self::Failed || self.next() == Some(target)
    }
}

/// Status of a single stage execution record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Record created, capability not yet invoked.
    Queued,
    /// Capability is executing.
    Running,
    /// Capability returned a valid output.
    Completed,
    /// Validation, capability or timeout failure.
    Failed,
}

impl Default for ExecutionStatus {
    fn default() -> Self {
        Self::Queued
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl ExecutionStatus {
    /// Returns true if the record will not change again.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns true if moving from `self` to `target` is a legal record update.
    #[must_use]
    pub const fn can_transition_to(&self, target: Self) -> bool {
        matches!(
            (self, target),
            (Self::Queued, Self::Running | Self::Failed)
                | (Self::Running, Self::Completed | Self::Failed)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_display() {
        assert_eq!(RunStatus::Pending.to_string(), "pending");
        assert_eq!(RunStatus::Generating.to_string(), "generating");
        assert_eq!(RunStatus::Failed.to_string(), "failed");
    }

    #[test]
    fn test_run_status_forward_path() {
        let mut status = RunStatus::Pending;
        let mut visited = vec![status];
        while let Some(next) = status.next() {
            assert!(status.can_transition_to(next));
            visited.push(next);
            status = next;
        }
        assert_eq!(visited.len(), 7);
        assert_eq!(status, RunStatus::Completed);
    }

    #[test]
    fn test_run_status_no_skips_or_revisits() {
        assert!(!RunStatus::Pending.can_transition_to(RunStatus::Designing));
        assert!(!RunStatus::Building.can_transition_to(RunStatus::Generating));
        assert!(!RunStatus::Analyzing.can_transition_to(RunStatus::Analyzing));
    }

    #[test]
    fn test_failed_reachable_from_every_non_terminal() {
        for status in RunStatus::ALL {
            assert_eq!(
                status.can_transition_to(RunStatus::Failed),
                !status.is_terminal(),
                "{status}"
            );
        }
    }

    #[test]
    fn test_terminal_statuses_are_final() {
        for target in RunStatus::ALL {
            assert!(!RunStatus::Completed.can_transition_to(target));
            assert!(!RunStatus::Failed.can_transition_to(target));
        }
    }

    #[test]
    fn test_run_status_serialize() {
        let json = serde_json::to_string(&RunStatus::Deploying).unwrap();
        assert_eq!(json, r#""deploying""#);
    }

    #[test]
    fn test_execution_status_transitions() {
        assert!(ExecutionStatus::Queued.can_transition_to(ExecutionStatus::Running));
        assert!(ExecutionStatus::Queued.can_transition_to(ExecutionStatus::Failed));
        assert!(ExecutionStatus::Running.can_transition_to(ExecutionStatus::Completed));
        assert!(!ExecutionStatus::Completed.can_transition_to(ExecutionStatus::Running));
        assert!(!ExecutionStatus::Queued.can_transition_to(ExecutionStatus::Completed));
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
    }
}
