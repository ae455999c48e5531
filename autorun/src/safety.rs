//! Session-backed safety limiter.

use anyhow::Result;
use tracing::{debug, warn};

use crate::context::RunContext;
use crate::core::limiter::{self, LimitCheck, WarningStatus};
use crate::core::types::PauseReason;
use crate::pause::PauseResumeManager;

pub struct SafetyLimiter<'a> {
    ctx: RunContext<'a>,
}

impl<'a> SafetyLimiter<'a> {
    pub fn new(ctx: RunContext<'a>) -> Self {
        Self { ctx }
    }

    /// Evaluate the stored count against `limit` without changing anything.
    pub fn check_limit(&self, task: &str, limit: u32) -> Result<LimitCheck> {
        let session = self.ctx.sessions().require(task)?;
        Ok(limiter::check_limit(session.count, limit))
    }

    /// Count one more auto-continuation, then re-evaluate.
    ///
    /// Reaching the limit pauses the session with the limiting message in
    /// `last_error`.
    pub fn increment_and_check(&self, task: &str, limit: u32) -> Result<LimitCheck> {
        let session = self.ctx.sessions().increment_count(task)?;
        let check = limiter::check_limit(session.count, limit);
        if !check.should_continue {
            warn!(task, count = check.count, limit, "safety limit reached");
            PauseResumeManager::new(self.ctx).pause_with_message(
                task,
                PauseReason::SafetyLimit,
                Some(&check.message),
            )?;
            return Ok(check);
        }

        let warning = limiter::warning_status(session.count, limit);
        if warning.is_warning {
            warn!(task, count = session.count, limit, "{}", warning.message);
        } else {
            debug!(task, count = session.count, limit, "auto-continuation counted");
        }
        Ok(check)
    }

    pub fn warning_status(&self, task: &str, limit: u32) -> Result<WarningStatus> {
        let session = self.ctx.sessions().require(task)?;
        Ok(limiter::warning_status(session.count, limit))
    }
}
