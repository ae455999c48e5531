//! Failure recovery: retry, skip, rollback and abort.
//!
//! Retry, skip and rollback require a `failed` or `paused` session unless
//! forced. Abort is allowed from any non-terminal status. Each strategy
//! rewrites the session in one atomic save and keeps the plan header and
//! metadata in step where they can be found.

use std::path::PathBuf;

use anyhow::Result;
use serde::Serialize;
use tracing::{info, warn};

use crate::context::RunContext;
use crate::core::types::{PlanStatus, RecoveryStrategy, SessionStatus};
use crate::error::AutorunError;
use crate::io::execution_state::clear_execution_state;
use crate::io::recovery_points::{self, RecoveryPoint, load_recovery_point};
use crate::io::session_store::{Session, ensure_transition};

pub const DEFAULT_SKIP_REASON: &str = "User requested skip";
pub const DEFAULT_ABORT_REASON: &str = "User requested abort";

#[derive(Debug, Clone, Default)]
pub struct RecoveryOptions {
    /// Rollback target; defaults to the stage before the current one.
    pub target_stage: Option<u32>,
    pub reason: Option<String>,
    pub force: bool,
    /// Rollback only: copy the target stage's snapshot back into the project.
    pub restore_files: bool,
    /// Restore destination; defaults to the directory the snapshot was taken from.
    pub project_root: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryOutcome {
    pub strategy: RecoveryStrategy,
    pub task: String,
    pub message: String,
    pub current_stage: u32,
    pub status: SessionStatus,
    pub next_action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restored_files: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureDetails {
    pub session: Session,
    pub recovery_points: Vec<RecoveryPoint>,
    pub strategies: Vec<RecoveryStrategy>,
}

pub struct RecoveryManager<'a> {
    ctx: RunContext<'a>,
}

impl<'a> RecoveryManager<'a> {
    pub fn new(ctx: RunContext<'a>) -> Self {
        Self { ctx }
    }

    /// Apply a strategy by name (`retry`, `skip`, `rollback`, `abort`).
    pub fn recover(
        &self,
        task: &str,
        strategy: &str,
        options: &RecoveryOptions,
    ) -> Result<RecoveryOutcome> {
        let strategy: RecoveryStrategy = strategy.parse()?;
        match strategy {
            RecoveryStrategy::Retry => self.retry(task, options.force),
            RecoveryStrategy::Skip => self.skip(task, options.reason.as_deref(), options.force),
            RecoveryStrategy::Rollback => self.rollback(task, options),
            RecoveryStrategy::Abort => self.abort(task, options.reason.as_deref(), options.force),
        }
    }

    pub fn retry(&self, task: &str, force: bool) -> Result<RecoveryOutcome> {
        let session = self.ctx.sessions().require(task)?;
        ensure_recoverable(&session, RecoveryStrategy::Retry, force)?;

        let stage = session.current_stage;
        let session = self.ctx.sessions().update(task, |session| {
            session.status = SessionStatus::Active;
            session.last_error = None;
            session.count = 0;
            *session.retry_count.entry(stage).or_insert(0) += 1;
        })?;
        self.mark_running(task)?;

        let attempt = session.retry_count.get(&stage).copied().unwrap_or_default();
        info!(task, stage, attempt, "retrying stage");
        Ok(RecoveryOutcome {
            strategy: RecoveryStrategy::Retry,
            task: task.to_string(),
            message: format!("Retrying stage {stage} (retry #{attempt})"),
            current_stage: stage,
            status: session.status,
            next_action: format!("run `autorun trigger {task}` to restart stage {stage}"),
            restored_files: None,
        })
    }

    /// Mark the current stage skipped and move on. Skipping the last stage
    /// completes the plan.
    pub fn skip(&self, task: &str, reason: Option<&str>, force: bool) -> Result<RecoveryOutcome> {
        let session = self.ctx.sessions().require(task)?;
        ensure_recoverable(&session, RecoveryStrategy::Skip, force)?;

        let skipped = session.current_stage;
        let finished = session.total_stages > 0 && skipped >= session.total_stages;
        let reason = reason.unwrap_or(DEFAULT_SKIP_REASON).to_string();
        let session = self.ctx.sessions().update(task, |session| {
            if !session.skipped_stages.contains(&skipped) {
                session.skipped_stages.push(skipped);
            }
            if finished {
                session.status = SessionStatus::Completed;
            } else {
                session.current_stage = skipped + 1;
                session.status = SessionStatus::Active;
            }
            session.count = 0;
            session.last_error = None;
            session.skip_reason = Some(reason.clone());
        })?;

        if finished {
            let now = self.ctx.clock.now();
            self.ctx.metadata().update(task, |metadata| {
                metadata.status = PlanStatus::Completed;
                metadata.completed_stages = metadata.total_stages;
                metadata.completed_at = Some(now);
            })?;
            clear_execution_state(self.ctx.paths, task)?;
        } else {
            self.sync_header(task, session.current_stage)?;
            self.mark_running(task)?;
        }

        info!(task, skipped, reason = %reason, "stage skipped");
        let (message, next_action) = if finished {
            (
                format!("Skipped stage {skipped}; plan complete"),
                format!("run `autorun archive {task}` to archive the plan"),
            )
        } else {
            (
                format!("Skipped stage {skipped}; continuing at stage {}", session.current_stage),
                format!("run `autorun trigger {task}` to start stage {}", session.current_stage),
            )
        };
        Ok(RecoveryOutcome {
            strategy: RecoveryStrategy::Skip,
            task: task.to_string(),
            message,
            current_stage: session.current_stage,
            status: session.status,
            next_action,
            restored_files: None,
        })
    }

    pub fn rollback(&self, task: &str, options: &RecoveryOptions) -> Result<RecoveryOutcome> {
        let session = self.ctx.sessions().require(task)?;
        ensure_recoverable(&session, RecoveryStrategy::Rollback, options.force)?;

        let from = session.current_stage;
        let target = options.target_stage.unwrap_or(from.saturating_sub(1));
        if target < 1 || target > session.total_stages {
            return Err(AutorunError::invalid_argument(
                "target_stage",
                format!("a stage between 1 and {}", session.total_stages),
                target,
            )
            .into());
        }
        if load_recovery_point(self.ctx.paths, task, target)?.is_none() {
            return Err(AutorunError::RecoveryPointNotFound {
                plan_id: task.to_string(),
                stage: target,
            }
            .into());
        }

        let restored_files = if options.restore_files {
            let report = self.ctx.snapshots().restore_snapshot(
                task,
                target,
                options.project_root.as_deref(),
            )?;
            Some(report.restored.len())
        } else {
            None
        };

        let session = self.ctx.sessions().update(task, |session| {
            session.current_stage = target;
            session.rolled_back_from = Some(from);
            session.status = SessionStatus::Active;
            session.count = 0;
            session.last_error = None;
        })?;
        self.sync_header(task, target)?;
        self.mark_running(task)?;

        info!(task, from, target, restored = ?restored_files, "rolled back");
        let message = match restored_files {
            Some(count) => format!("Rolled back from stage {from} to stage {target} ({count} files restored)"),
            None => format!("Rolled back from stage {from} to stage {target}"),
        };
        Ok(RecoveryOutcome {
            strategy: RecoveryStrategy::Rollback,
            task: task.to_string(),
            message,
            current_stage: session.current_stage,
            status: session.status,
            next_action: format!("run `autorun trigger {task}` to restart stage {target}"),
            restored_files,
        })
    }

    /// Stop the plan for good. Stage and history are left as they are.
    pub fn abort(&self, task: &str, reason: Option<&str>, force: bool) -> Result<RecoveryOutcome> {
        let session = self.ctx.sessions().require(task)?;
        ensure_transition(&session, SessionStatus::Aborted, force)?;

        let now = self.ctx.clock.now();
        let reason = reason.unwrap_or(DEFAULT_ABORT_REASON).to_string();
        let session = self.ctx.sessions().update(task, |session| {
            session.status = SessionStatus::Aborted;
            session.abort_reason = Some(reason.clone());
            session.aborted_at = Some(now);
        })?;
        self.ctx.metadata().update(task, |metadata| {
            metadata.status = PlanStatus::Aborted;
        })?;

        info!(task, reason = %reason, "plan aborted");
        Ok(RecoveryOutcome {
            strategy: RecoveryStrategy::Abort,
            task: task.to_string(),
            message: format!("Aborted: {reason}"),
            current_stage: session.current_stage,
            status: session.status,
            next_action: format!("run `autorun archive {task} --force` to archive the plan"),
            restored_files: None,
        })
    }

    /// Rewind a task to `stage`, whatever its status.
    pub fn reset(&self, task: &str, stage: u32) -> Result<Session> {
        let session = self.ctx.sessions().require(task)?;
        if stage < 1 || (session.total_stages > 0 && stage > session.total_stages) {
            return Err(AutorunError::invalid_argument(
                "stage",
                format!("a stage between 1 and {}", session.total_stages),
                stage,
            )
            .into());
        }
        let session = self.ctx.sessions().update(task, |session| {
            session.current_stage = stage;
            session.status = SessionStatus::Active;
            session.count = 0;
            session.last_error = None;
        })?;
        self.sync_header(task, stage)?;
        self.mark_running(task)?;
        info!(task, stage, "task reset");
        Ok(session)
    }

    /// The recorded error when the session is failed.
    pub fn detect_failure(&self, task: &str) -> Result<Option<String>> {
        let session = self.ctx.sessions().require(task)?;
        if session.status != SessionStatus::Failed {
            return Ok(None);
        }
        Ok(Some(
            session
                .last_error
                .unwrap_or_else(|| "unknown error".to_string()),
        ))
    }

    pub fn failure_details(&self, task: &str) -> Result<FailureDetails> {
        let session = self.ctx.sessions().require(task)?;
        let recovery_points = recovery_points::list_recovery_points(self.ctx.paths, task)?;
        let strategies = RecoveryStrategy::ALL
            .into_iter()
            .filter(|strategy| match strategy {
                RecoveryStrategy::Abort => ensure_transition(&session, SessionStatus::Aborted, false).is_ok(),
                RecoveryStrategy::Rollback => {
                    is_recoverable(&session) && recovery_points.iter().any(|p| p.stage <= session.current_stage)
                }
                RecoveryStrategy::Retry | RecoveryStrategy::Skip => is_recoverable(&session),
            })
            .collect();
        Ok(FailureDetails {
            session,
            recovery_points,
            strategies,
        })
    }

    /// Record a recovery point for `stage`, counting files from its snapshot
    /// when one exists.
    pub fn create_recovery_point(&self, task: &str, stage: u32) -> Result<RecoveryPoint> {
        let file_count = self
            .ctx
            .snapshots()
            .load_manifest(task, stage)?
            .map(|manifest| manifest.file_count);
        if file_count.is_none() {
            warn!(task, stage, "recovery point has no snapshot behind it");
        }
        recovery_points::create_recovery_point(
            self.ctx.paths,
            task,
            stage,
            self.ctx.clock.now(),
            file_count,
        )
    }

    pub fn list_recovery_points(&self, task: &str) -> Result<Vec<RecoveryPoint>> {
        recovery_points::list_recovery_points(self.ctx.paths, task)
    }

    pub fn cleanup_recovery_points(&self, task: &str) -> Result<bool> {
        recovery_points::cleanup_recovery_points(self.ctx.paths, task)
    }

    fn sync_header(&self, task: &str, stage: u32) -> Result<()> {
        match self.ctx.recorded_plan_path(task)? {
            Some(plan) => self.ctx.write_current_stage(task, &plan, stage),
            None => {
                warn!(task, stage, "plan location unknown; header not updated");
                Ok(())
            }
        }
    }

    fn mark_running(&self, task: &str) -> Result<()> {
        self.ctx.metadata().update(task, |metadata| {
            metadata.status = PlanStatus::Running;
            metadata.paused_at = None;
            metadata.pause_reason = None;
        })?;
        clear_execution_state(self.ctx.paths, task)?;
        Ok(())
    }
}

fn is_recoverable(session: &Session) -> bool {
    matches!(session.status, SessionStatus::Failed | SessionStatus::Paused)
}

fn ensure_recoverable(session: &Session, strategy: RecoveryStrategy, force: bool) -> Result<()> {
    if !force && !is_recoverable(session) {
        return Err(AutorunError::invalid_argument(
            "status",
            format!("failed or paused session for {strategy} (or --force)"),
            session.status,
        )
        .into());
    }
    ensure_transition(session, SessionStatus::Active, force)
}
