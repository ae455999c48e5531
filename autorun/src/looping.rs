//! Foreground loop for `autorun run`.
//!
//! Each iteration runs the agent on the current stage to completion, tees its
//! output into `transcripts/<task>.log`, and feeds the tail of that output to
//! [`process_stage_end`].

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tracing::{info, warn};

use crate::advance::{StageEnd, process_stage_end};
use crate::context::RunContext;
use crate::core::completion::tail_lines;
use crate::core::types::SessionStatus;
use crate::error::AutorunError;
use crate::io::agent::{AgentInvocation, AgentLauncher};
use crate::io::plan::{parse_plan, resolve_plan};

/// Reason why [`run_plan`] stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum LoopStop {
    /// The last stage finished.
    Complete,
    /// The safety limit paused the session.
    Paused { message: String },
    /// The agent failed, timed out or reported an error.
    Failed { stage: u32, error: String },
    /// The agent exited cleanly but the stage was not marked complete.
    NotDetected { stage: u32 },
    /// The session was not active when the loop reached it.
    Inactive { status: SessionStatus },
    MaxIterations { max_iterations: u32 },
}

impl LoopStop {
    /// The failure behind a `Failed` stop, as a typed error.
    pub fn failure(&self) -> Option<AutorunError> {
        match self {
            Self::Failed { stage, error } => {
                Some(AutorunError::ExecutionFailure(format!("stage {stage}: {error}")))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoopOutcome {
    pub task: String,
    pub iterations: u32,
    pub stop: LoopStop,
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Plan path or task name.
    pub plan: String,
    pub cwd: PathBuf,
    /// Agent conversation to resume on the first iteration.
    pub resume: Option<String>,
    /// Stop after this many agent runs.
    pub max_iterations: Option<u32>,
}

/// Run the agent stage after stage until the plan completes or something stops it.
///
/// `on_stage` is called after every agent run with the stage that ran and how
/// it ended.
pub fn run_plan<F: FnMut(u32, &StageEnd)>(
    ctx: RunContext<'_>,
    launcher: &dyn AgentLauncher,
    options: &RunOptions,
    mut on_stage: F,
) -> Result<LoopOutcome> {
    let root = resolve_plan(&options.plan, std::slice::from_ref(&options.cwd))?;
    let agent = &ctx.config.agent;
    let timeout = Duration::from_secs(agent.timeout_secs);
    let mut resume = options.resume.clone();
    let mut iterations = 0u32;

    loop {
        let plan = parse_plan(&root)?;
        let task = plan.task_name();
        let outcome = |stop| LoopOutcome {
            task: task.clone(),
            iterations,
            stop,
        };

        let session = ctx.ensure_session(&plan, &options.cwd)?;
        if session.status != SessionStatus::Active {
            return Ok(outcome(LoopStop::Inactive {
                status: session.status,
            }));
        }
        if let Some(max_iterations) = options.max_iterations
            && iterations >= max_iterations
        {
            return Ok(outcome(LoopStop::MaxIterations { max_iterations }));
        }

        let stage = plan.config.current;
        let invocation = AgentInvocation::build(
            agent,
            &task,
            stage,
            &plan.current_stage_file,
            resume.take().as_deref(),
            &options.cwd,
        )?;
        let transcript = ctx.paths.transcript_log_path(&task);
        let run = launcher.run_to_completion(
            &invocation,
            timeout,
            agent.output_limit_bytes,
            &transcript,
        )?;
        iterations += 1;

        if run.timed_out {
            let error = format!("agent timed out after {}s", timeout.as_secs());
            warn!(task = %task, stage, "{error}");
            ctx.sessions()
                .set_status(&task, SessionStatus::Failed, Some(&error), false)?;
            let end = StageEnd::Failed {
                stage,
                error: error.clone(),
            };
            on_stage(stage, &end);
            return Ok(LoopOutcome {
                task,
                iterations,
                stop: LoopStop::Failed { stage, error },
            });
        }

        let window = tail_lines(&run.output, ctx.config.transcript_tail_lines);
        let mut end = process_stage_end(ctx, &plan, window, &options.cwd, None)?;
        if end == (StageEnd::NotDetected { stage }) && !run.success() {
            let error = match run.exit_code {
                Some(code) => format!("agent exited with status {code}"),
                None => "agent terminated by signal".to_string(),
            };
            ctx.sessions()
                .set_status(&task, SessionStatus::Failed, Some(&error), false)?;
            end = StageEnd::Failed { stage, error };
        }
        on_stage(stage, &end);

        let stop = match end {
            StageEnd::Advanced { from, to, .. } => {
                info!(task = %task, from, to, iterations, "continuing with next stage");
                continue;
            }
            StageEnd::Completed { .. } => LoopStop::Complete,
            StageEnd::Failed { stage, error } => LoopStop::Failed { stage, error },
            StageEnd::LimitReached { message, .. } => LoopStop::Paused { message },
            StageEnd::NotDetected { stage } => LoopStop::NotDetected { stage },
            StageEnd::Inactive { status } => LoopStop::Inactive { status },
        };
        return Ok(LoopOutcome {
            task,
            iterations,
            stop,
        });
    }
}
