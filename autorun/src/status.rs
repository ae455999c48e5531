//! `autorun status` and `autorun list` reports.

use std::fmt::Write as _;
use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::context::RunContext;
use crate::core::limiter::{WarningStatus, warning_status};
use crate::core::types::{PlanStatus, SessionStatus};
use crate::io::plan::{Progress, parse_plan};

#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    pub task: String,
    pub status: SessionStatus,
    pub current_stage: u32,
    pub total_stages: u32,
    pub progress: Progress,
    pub count: u32,
    /// Safety limit from the plan header, when the plan can still be read.
    pub safety: Option<WarningStatus>,
    pub last_error: Option<String>,
    pub last_session_id: Option<String>,
    pub skipped_stages: Vec<u32>,
    pub last_executed: DateTime<Utc>,
    pub plan_path: Option<PathBuf>,
    pub plan_status: Option<PlanStatus>,
    pub snapshot_stages: Vec<u32>,
    pub next_action: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskSummary {
    pub task: String,
    pub status: SessionStatus,
    pub current_stage: u32,
    pub total_stages: u32,
    pub count: u32,
    pub last_executed: DateTime<Utc>,
}

pub fn next_action_for(task: &str, status: SessionStatus) -> String {
    match status {
        SessionStatus::Active => format!("wait for the agent, or run `autorun trigger {task}`"),
        SessionStatus::Paused => format!("run `autorun resume {task}`"),
        SessionStatus::Failed => format!("run `autorun recover {task} <retry|skip|rollback|abort>`"),
        SessionStatus::Completed => format!("run `autorun archive {task}`"),
        SessionStatus::Aborted => format!("run `autorun archive {task} --force`"),
    }
}

pub fn task_status(ctx: RunContext<'_>, task: &str) -> Result<TaskStatus> {
    let session = ctx.sessions().require(task)?;
    let metadata = ctx.metadata().load(task)?;
    let safety = match ctx.recorded_plan_path(task)? {
        Some(path) => match parse_plan(&path) {
            Ok(plan) => Some(warning_status(session.count, plan.config.safety_limit)),
            Err(err) => {
                debug!(task, error = %format!("{err:#}"), "plan unreadable for status");
                None
            }
        },
        None => None,
    };
    let mut progress = Progress::new(session.current_stage, session.total_stages);
    if session.status == SessionStatus::Completed {
        progress.completed = progress.total;
        progress.percentage = 100;
    }
    Ok(TaskStatus {
        task: task.to_string(),
        status: session.status,
        current_stage: session.current_stage,
        total_stages: session.total_stages,
        progress,
        count: session.count,
        safety,
        next_action: next_action_for(task, session.status),
        last_error: session.last_error,
        last_session_id: session.last_session_id,
        skipped_stages: session.skipped_stages,
        last_executed: session.last_executed,
        plan_path: metadata.as_ref().map(|m| m.plan_path.clone()),
        plan_status: metadata.map(|m| m.status),
        snapshot_stages: ctx.snapshots().snapshot_stages(task)?,
    })
}

pub fn list_tasks(ctx: RunContext<'_>) -> Result<Vec<TaskSummary>> {
    Ok(ctx
        .sessions()
        .list()?
        .into_iter()
        .map(|session| TaskSummary {
            task: session.task_name,
            status: session.status,
            current_stage: session.current_stage,
            total_stages: session.total_stages,
            count: session.count,
            last_executed: session.last_executed,
        })
        .collect())
}

pub fn render_status(status: &TaskStatus) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Task:     {}", status.task);
    let _ = writeln!(out, "Status:   {}", status.status);
    let _ = writeln!(
        out,
        "Stage:    {}/{} ({}% complete)",
        status.current_stage, status.total_stages, status.progress.percentage
    );
    match &status.safety {
        Some(safety) => {
            let _ = writeln!(out, "Safety:   {}", safety.message);
        }
        None => {
            let _ = writeln!(out, "Count:    {}", status.count);
        }
    }
    if !status.skipped_stages.is_empty() {
        let skipped: Vec<String> = status.skipped_stages.iter().map(u32::to_string).collect();
        let _ = writeln!(out, "Skipped:  {}", skipped.join(", "));
    }
    if let Some(error) = &status.last_error {
        let _ = writeln!(out, "Error:    {error}");
    }
    if let Some(path) = &status.plan_path {
        let _ = writeln!(out, "Plan:     {}", path.display());
    }
    if !status.snapshot_stages.is_empty() {
        let stages: Vec<String> = status.snapshot_stages.iter().map(u32::to_string).collect();
        let _ = writeln!(out, "Snapshots: stages {}", stages.join(", "));
    }
    let _ = writeln!(
        out,
        "Updated:  {}",
        status.last_executed.format("%Y-%m-%d %H:%M:%S UTC")
    );
    let _ = writeln!(out, "next: {}", status.next_action);
    out
}

pub fn render_list(tasks: &[TaskSummary]) -> String {
    if tasks.is_empty() {
        return "No tasks\n".to_string();
    }
    let width = tasks.iter().map(|t| t.task.len()).max().unwrap_or(4).max(4);
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<width$}  {:<9}  {:>7}  {:>5}  UPDATED",
        "TASK", "STATUS", "STAGE", "COUNT"
    );
    for task in tasks {
        let _ = writeln!(
            out,
            "{:<width$}  {:<9}  {:>7}  {:>5}  {}",
            task.task,
            task.status.as_str(),
            format!("{}/{}", task.current_stage, task.total_stages),
            task.count,
            task.last_executed.format("%Y-%m-%d %H:%M"),
        );
    }
    out
}
