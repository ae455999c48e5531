//! Pause and resume of plan execution.
//!
//! Pausing captures an [`ExecutionState`] so a later resume knows which stage
//! and agent conversation to pick up. Resuming consumes that state.

use anyhow::Result;
use serde::Serialize;
use tracing::info;

use crate::context::RunContext;
use crate::core::types::{PauseReason, PlanStatus, SessionStatus};
use crate::error::AutorunError;
use crate::io::execution_state::{
    ExecutionState, clear_execution_state, load_execution_state, save_execution_state,
};
use crate::io::metadata::PlanMetadata;
use crate::io::recovery_points::{RecoveryPoint, list_recovery_points};
use crate::io::session_store::Session;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PauseOutcome {
    pub plan_id: String,
    pub already_paused: bool,
    pub state: Option<ExecutionState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResumeCheck {
    pub can_resume: bool,
    pub reason: Option<String>,
}

impl ResumeCheck {
    fn no(reason: impl Into<String>) -> Self {
        Self {
            can_resume: false,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResumeOutcome {
    pub plan_id: String,
    pub stage: u32,
    pub agent_session_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanHistory {
    pub plan_id: String,
    pub session: Option<Session>,
    pub metadata: Option<PlanMetadata>,
    pub execution_state: Option<ExecutionState>,
    pub recovery_points: Vec<RecoveryPoint>,
    pub snapshot_stages: Vec<u32>,
}

pub struct PauseResumeManager<'a> {
    ctx: RunContext<'a>,
}

impl<'a> PauseResumeManager<'a> {
    pub fn new(ctx: RunContext<'a>) -> Self {
        Self { ctx }
    }

    pub fn pause(&self, plan_id: &str, reason: PauseReason) -> Result<PauseOutcome> {
        self.pause_with_message(plan_id, reason, None)
    }

    /// Pause, recording `message` as the session's `last_error` when given.
    pub fn pause_with_message(
        &self,
        plan_id: &str,
        reason: PauseReason,
        message: Option<&str>,
    ) -> Result<PauseOutcome> {
        let sessions = self.ctx.sessions();
        let session = sessions.require(plan_id)?;
        if session.status == SessionStatus::Paused {
            info!(plan_id, "plan already paused");
            return Ok(PauseOutcome {
                plan_id: plan_id.to_string(),
                already_paused: true,
                state: None,
            });
        }

        let now = self.ctx.clock.now();
        let metadata = self.ctx.metadata().load(plan_id)?;
        let completed_stages = (1..session.current_stage)
            .filter(|stage| !session.skipped_stages.contains(stage))
            .collect();
        let state = ExecutionState {
            plan_id: plan_id.to_string(),
            current_stage: session.current_stage,
            total_stages: session.total_stages,
            session_id: session.task_name.clone(),
            agent_session_id: session.last_session_id.clone(),
            started_at: metadata.map_or(session.last_executed, |m| m.created_at),
            paused_at: now,
            completed_stages,
            skipped_stages: session.skipped_stages.clone(),
        };

        sessions.set_status(plan_id, SessionStatus::Paused, message, false)?;
        save_execution_state(self.ctx.paths, &state)?;
        self.ctx.metadata().update(plan_id, |metadata| {
            metadata.status = PlanStatus::Paused;
            metadata.paused_at = Some(now);
            metadata.pause_reason = Some(reason);
        })?;
        info!(plan_id, stage = state.current_stage, reason = %reason, "plan paused");
        Ok(PauseOutcome {
            plan_id: plan_id.to_string(),
            already_paused: false,
            state: Some(state),
        })
    }

    /// Whether a plan has everything a resume needs.
    pub fn can_resume(&self, plan_id: &str) -> Result<ResumeCheck> {
        let Some(session) = self.ctx.sessions().load(plan_id)? else {
            return Ok(ResumeCheck::no(format!("no session found for {plan_id}")));
        };
        if !matches!(session.status, SessionStatus::Paused | SessionStatus::Failed) {
            return Ok(ResumeCheck::no(format!(
                "session status is {}, expected paused or failed",
                session.status
            )));
        }
        if load_execution_state(self.ctx.paths, plan_id)?.is_none() {
            return Ok(ResumeCheck::no("no saved execution state"));
        }
        if !self.ctx.metadata().exists(plan_id) {
            return Ok(ResumeCheck::no("no plan metadata"));
        }
        Ok(ResumeCheck {
            can_resume: true,
            reason: None,
        })
    }

    pub fn resume(&self, plan_id: &str) -> Result<ResumeOutcome> {
        let sessions = self.ctx.sessions();
        sessions.require(plan_id)?;
        let check = self.can_resume(plan_id)?;
        if !check.can_resume {
            return Err(AutorunError::invalid_argument(
                "plan",
                "a paused plan with saved execution state",
                format!("{plan_id} ({})", check.reason.unwrap_or_default()),
            )
            .into());
        }
        let state = load_execution_state(self.ctx.paths, plan_id)?
            .ok_or_else(|| anyhow::anyhow!("execution state vanished for {plan_id}"))?;
        let paused_by_limit = self
            .ctx
            .metadata()
            .load(plan_id)?
            .is_some_and(|m| m.pause_reason == Some(PauseReason::SafetyLimit));

        let now = self.ctx.clock.now();
        sessions.set_status(plan_id, SessionStatus::Active, None, false)?;
        if paused_by_limit {
            sessions.reset_count(plan_id)?;
        }
        self.ctx.metadata().update(plan_id, |metadata| {
            metadata.status = PlanStatus::Running;
            metadata.resumed_at = Some(now);
            metadata.paused_at = None;
            metadata.pause_reason = None;
        })?;
        clear_execution_state(self.ctx.paths, plan_id)?;

        info!(plan_id, stage = state.current_stage, "plan resumed");
        Ok(ResumeOutcome {
            plan_id: plan_id.to_string(),
            stage: state.current_stage,
            agent_session_id: state.agent_session_id,
            message: format!("Resuming from stage {}", state.current_stage),
        })
    }

    pub fn history(&self, plan_id: &str) -> Result<PlanHistory> {
        let session = self.ctx.sessions().load(plan_id)?;
        let metadata = self.ctx.metadata().load(plan_id)?;
        if session.is_none() && metadata.is_none() {
            return Err(AutorunError::session_not_found(plan_id).into());
        }
        Ok(PlanHistory {
            plan_id: plan_id.to_string(),
            session,
            metadata,
            execution_state: load_execution_state(self.ctx.paths, plan_id)?,
            recovery_points: list_recovery_points(self.ctx.paths, plan_id)?,
            snapshot_stages: self.ctx.snapshots().snapshot_stages(plan_id)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestEnv;

    #[test]
    fn pause_saves_state_and_marks_records() {
        let env = TestEnv::with_split_plan("demo", 4, 2);
        env.track_plan();
        let ctx = env.ctx();
        let manager = PauseResumeManager::new(ctx);

        let outcome = manager.pause("demo", PauseReason::UserRequest).expect("pause");
        assert!(!outcome.already_paused);
        let state = outcome.state.expect("state");
        assert_eq!(state.current_stage, 2);
        assert_eq!(state.completed_stages, vec![1]);

        let session = ctx.sessions().require("demo").expect("session");
        assert_eq!(session.status, SessionStatus::Paused);
        let metadata = ctx.metadata().load("demo").expect("load").expect("metadata");
        assert_eq!(metadata.status, PlanStatus::Paused);
        assert_eq!(metadata.pause_reason, Some(PauseReason::UserRequest));
        assert_eq!(metadata.paused_at, Some(env.clock.0));
    }

    #[test]
    fn second_pause_reports_already_paused() {
        let env = TestEnv::with_split_plan("demo", 3, 1);
        env.track_plan();
        let manager = PauseResumeManager::new(env.ctx());
        manager.pause("demo", PauseReason::Manual).expect("pause");
        let again = manager.pause("demo", PauseReason::Manual).expect("pause again");
        assert!(again.already_paused);
        assert!(again.state.is_none());
    }

    #[test]
    fn pause_unknown_plan_is_session_not_found() {
        let env = TestEnv::with_split_plan("demo", 3, 1);
        let err = PauseResumeManager::new(env.ctx())
            .pause("ghost", PauseReason::Manual)
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<AutorunError>(),
            Some(&AutorunError::session_not_found("ghost"))
        );
    }

    #[test]
    fn can_resume_explains_refusals() {
        let env = TestEnv::with_split_plan("demo", 3, 1);
        let manager = PauseResumeManager::new(env.ctx());
        let check = manager.can_resume("demo").expect("check");
        assert!(!check.can_resume);
        assert!(check.reason.expect("reason").contains("no session"));

        env.track_plan();
        let check = manager.can_resume("demo").expect("check");
        assert!(check.reason.expect("reason").contains("status is active"));
    }

    #[test]
    fn resume_restores_active_and_clears_state() {
        let env = TestEnv::with_split_plan("demo", 4, 3);
        env.track_plan();
        let ctx = env.ctx();
        ctx.sessions()
            .update("demo", |s| s.last_session_id = Some("sess-9".to_string()))
            .expect("update");
        let manager = PauseResumeManager::new(ctx);
        manager.pause("demo", PauseReason::SignalInterrupt).expect("pause");

        let outcome = manager.resume("demo").expect("resume");
        assert_eq!(outcome.stage, 3);
        assert_eq!(outcome.agent_session_id.as_deref(), Some("sess-9"));

        let session = ctx.sessions().require("demo").expect("session");
        assert_eq!(session.status, SessionStatus::Active);
        let metadata = ctx.metadata().load("demo").expect("load").expect("metadata");
        assert_eq!(metadata.status, PlanStatus::Running);
        assert!(metadata.paused_at.is_none());
        assert_eq!(metadata.resumed_at, Some(env.clock.0));
        assert!(load_execution_state(ctx.paths, "demo").expect("load").is_none());

        let err = manager.resume("demo").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AutorunError>(),
            Some(AutorunError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn resume_after_safety_limit_resets_count() {
        let env = TestEnv::with_split_plan("demo", 4, 2);
        env.track_plan();
        let ctx = env.ctx();
        ctx.sessions().update("demo", |s| s.count = 10).expect("update");
        let manager = PauseResumeManager::new(ctx);
        manager
            .pause_with_message("demo", PauseReason::SafetyLimit, Some("Safety limit reached"))
            .expect("pause");
        assert_eq!(
            ctx.sessions().require("demo").expect("session").last_error.as_deref(),
            Some("Safety limit reached")
        );
        manager.resume("demo").expect("resume");
        assert_eq!(ctx.sessions().require("demo").expect("session").count, 0);
    }

    #[test]
    fn history_collects_records() {
        let env = TestEnv::with_split_plan("demo", 3, 1);
        env.track_plan();
        let history = PauseResumeManager::new(env.ctx()).history("demo").expect("history");
        assert!(history.session.is_some());
        assert!(history.metadata.is_some());
        assert_eq!(history.snapshot_stages, vec![1]);
        assert_eq!(history.recovery_points.len(), 1);
    }
}
