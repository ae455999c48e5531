//! Shared deterministic types for the plan engine.
//!
//! These define the on-disk vocabulary (status strings, change tags) and must
//! stay stable: they are serialized into session records and manifests.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AutorunError;

/// Plan layout on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    /// One markdown file carries the header and every stage.
    Single,
    /// A directory with `README.md` (or `EXECUTION_PLAN.md`) plus `stages/NN-*.md`.
    Split,
}

impl Architecture {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Split => "split",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution status of a task's session record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Paused,
    Failed,
    Completed,
    Aborted,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Failed => "failed",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of the plan metadata record (distinct vocabulary from the session).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanStatus {
    Running,
    Paused,
    Completed,
    Aborted,
}

impl PlanStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a snapshotted file differs from the previous stage's manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    New,
    Modified,
    /// Reserved: deletions are not content-tracked yet.
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotStatus {
    Available,
    Compressed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryPointStatus {
    Available,
    Corrupted,
    Missing,
}

/// The four ways out of a failed (or paused) session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryStrategy {
    Retry,
    Skip,
    Rollback,
    Abort,
}

impl RecoveryStrategy {
    pub const ALL: [RecoveryStrategy; 4] = [Self::Retry, Self::Skip, Self::Rollback, Self::Abort];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Retry => "retry",
            Self::Skip => "skip",
            Self::Rollback => "rollback",
            Self::Abort => "abort",
        }
    }
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecoveryStrategy {
    type Err = AutorunError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == normalized)
            .ok_or_else(|| AutorunError::invalid_argument("strategy", "retry|skip|rollback|abort", s))
    }
}

/// Why a plan was paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    UserRequest,
    SignalInterrupt,
    Error,
    SafetyLimit,
    Manual,
}

impl PauseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserRequest => "user_request",
            Self::SignalInterrupt => "signal_interrupt",
            Self::Error => "error",
            Self::SafetyLimit => "safety_limit",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for PauseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PauseReason {
    type Err = AutorunError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        [
            Self::UserRequest,
            Self::SignalInterrupt,
            Self::Error,
            Self::SafetyLimit,
            Self::Manual,
        ]
        .into_iter()
        .find(|reason| reason.as_str() == normalized)
        .ok_or_else(|| {
            AutorunError::invalid_argument(
                "reason",
                "user_request|signal_interrupt|error|safety_limit|manual",
                s,
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_parses_case_insensitively() {
        assert_eq!(
            "Rollback".parse::<RecoveryStrategy>().expect("parse"),
            RecoveryStrategy::Rollback
        );
    }

    #[test]
    fn unknown_strategy_is_invalid_argument() {
        let err = "undo".parse::<RecoveryStrategy>().unwrap_err();
        assert!(matches!(err, AutorunError::InvalidArgument { ref argument, .. } if argument == "strategy"));
    }

    #[test]
    fn pause_reason_accepts_dashes() {
        assert_eq!(
            "user-request".parse::<PauseReason>().expect("parse"),
            PauseReason::UserRequest
        );
        assert!("nap".parse::<PauseReason>().is_err());
    }

    #[test]
    fn statuses_serialize_lowercase() {
        let json = serde_json::to_string(&SessionStatus::Aborted).expect("serialize");
        assert_eq!(json, "\"aborted\"");
        let reason = serde_json::to_string(&PauseReason::SafetyLimit).expect("serialize");
        assert_eq!(reason, "\"safety_limit\"");
    }
}
