//! Typed failures surfaced by the plan engine.
//!
//! Library functions return `anyhow::Result`; these variants travel inside
//! `anyhow::Error` and are recovered with `downcast_ref` where the caller needs
//! to branch on the kind (exit codes, recovery hints).

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AutorunError {
    /// Missing or invalid header, missing stage file, duplicate stage numbers.
    #[error("plan parse error: {0}")]
    PlanParse(String),

    #[error("session not found: {task}")]
    SessionNotFound { task: String },

    #[error("recovery point not found for plan '{plan_id}' stage {stage}")]
    RecoveryPointNotFound { plan_id: String, stage: u32 },

    #[error("invalid argument '{argument}': expected {expected}, received {received}")]
    InvalidArgument {
        argument: String,
        expected: String,
        received: String,
    },

    /// Soft stop. The session is paused, not failed.
    #[error("{message}")]
    SafetyLimitExceeded {
        count: u32,
        limit: u32,
        message: String,
    },

    /// Agent-reported error detected in the transcript.
    #[error("execution failure: {0}")]
    ExecutionFailure(String),
}

impl AutorunError {
    pub fn plan_parse(message: impl Into<String>) -> Self {
        Self::PlanParse(message.into())
    }

    pub fn session_not_found(task: impl Into<String>) -> Self {
        Self::SessionNotFound { task: task.into() }
    }

    pub fn invalid_argument(
        argument: impl Into<String>,
        expected: impl Into<String>,
        received: impl ToString,
    ) -> Self {
        Self::InvalidArgument {
            argument: argument.into(),
            expected: expected.into(),
            received: received.to_string(),
        }
    }

    /// Short recommendation printed under the error message.
    pub fn next_action(&self) -> String {
        match self {
            Self::PlanParse(_) => "run `autorun validate <plan>` to inspect the plan".to_string(),
            Self::SessionNotFound { .. } => "run `autorun list` to see known tasks".to_string(),
            Self::RecoveryPointNotFound { plan_id, .. } => {
                format!("run `autorun snapshot list {plan_id}` to see available stages")
            }
            Self::InvalidArgument { .. } => "check the command arguments (see --help)".to_string(),
            Self::SafetyLimitExceeded { .. } => {
                "run `autorun resume <task>` or raise safety_limit in the plan header".to_string()
            }
            Self::ExecutionFailure(_) => "run `autorun recover <task>`".to_string(),
        }
    }
}

/// Find a typed error anywhere in an `anyhow` chain.
pub fn find_autorun_error(err: &anyhow::Error) -> Option<&AutorunError> {
    err.chain().find_map(|cause| cause.downcast_ref::<AutorunError>())
}
