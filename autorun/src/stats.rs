//! `autorun stats`: aggregates over plan metadata, or one plan's numbers.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::context::RunContext;
use crate::core::types::{PlanStatus, SessionStatus};
use crate::error::AutorunError;
use crate::io::metadata::PlanMetadata;
use crate::io::session_store::Session;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GlobalStats {
    pub total: usize,
    pub running: usize,
    pub paused: usize,
    pub completed: usize,
    pub aborted: usize,
    /// Sessions currently in `failed`, whatever their metadata says.
    pub failed: usize,
    /// Mean of `completed_at - created_at` over completed plans that carry both.
    pub average_completion_secs: Option<i64>,
    pub stages: Option<StageStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageStats {
    pub total: u32,
    pub completed: u32,
    pub skipped: u32,
    pub successful: u32,
    /// Percentage of completed stages that were not skipped, one decimal.
    pub success_rate: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanStats {
    pub plan_id: String,
    pub status: PlanStatus,
    pub session_status: Option<SessionStatus>,
    pub current_stage: Option<u32>,
    pub completed_stages: u32,
    pub total_stages: u32,
    /// Until completion, or until now for unfinished plans.
    pub duration_secs: i64,
    pub total_retries: u32,
    pub skipped_stages: usize,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

pub fn global_stats(ctx: RunContext<'_>) -> Result<GlobalStats> {
    let plans = ctx.metadata().list()?;
    let sessions: BTreeMap<String, Session> = ctx
        .sessions()
        .list()?
        .into_iter()
        .map(|session| (session.task_name.clone(), session))
        .collect();

    let count = |status: PlanStatus| plans.iter().filter(|plan| plan.status == status).count();
    Ok(GlobalStats {
        total: plans.len(),
        running: count(PlanStatus::Running),
        paused: count(PlanStatus::Paused),
        completed: count(PlanStatus::Completed),
        aborted: count(PlanStatus::Aborted),
        failed: plans
            .iter()
            .filter(|plan| {
                sessions
                    .get(&plan.plan_id)
                    .is_some_and(|session| session.status == SessionStatus::Failed)
            })
            .count(),
        average_completion_secs: average_completion_secs(&plans),
        stages: stage_stats(&plans, &sessions),
    })
}

fn average_completion_secs(plans: &[PlanMetadata]) -> Option<i64> {
    let spans: Vec<i64> = plans
        .iter()
        .filter(|plan| plan.status == PlanStatus::Completed)
        .filter_map(|plan| plan.completed_at.map(|done| (done - plan.created_at).num_seconds()))
        .collect();
    if spans.is_empty() {
        return None;
    }
    Some(spans.iter().sum::<i64>() / spans.len() as i64)
}

fn stage_stats(plans: &[PlanMetadata], sessions: &BTreeMap<String, Session>) -> Option<StageStats> {
    let total: u32 = plans.iter().map(|plan| plan.total_stages).sum();
    if total == 0 {
        return None;
    }
    let completed: u32 = plans.iter().map(|plan| plan.completed_stages).sum();
    let skipped: u32 = plans
        .iter()
        .filter_map(|plan| sessions.get(&plan.plan_id))
        .map(|session| session.skipped_stages.len() as u32)
        .sum();
    let successful = completed.saturating_sub(skipped);
    let success_rate = (completed > 0)
        .then(|| (f64::from(successful) * 1000.0 / f64::from(completed)).round() / 10.0);
    Some(StageStats {
        total,
        completed,
        skipped,
        successful,
        success_rate,
    })
}

pub fn plan_stats(ctx: RunContext<'_>, plan_id: &str) -> Result<PlanStats> {
    let metadata = ctx
        .metadata()
        .load(plan_id)?
        .ok_or_else(|| AutorunError::session_not_found(plan_id))?;
    let session = ctx.sessions().load(plan_id)?;
    let end = metadata.completed_at.unwrap_or_else(|| ctx.clock.now());
    Ok(PlanStats {
        plan_id: metadata.plan_id,
        status: metadata.status,
        session_status: session.as_ref().map(|s| s.status),
        current_stage: session.as_ref().map(|s| s.current_stage),
        completed_stages: metadata.completed_stages,
        total_stages: metadata.total_stages,
        duration_secs: (end - metadata.created_at).num_seconds().max(0),
        total_retries: session
            .as_ref()
            .map(|s| s.retry_count.values().sum())
            .unwrap_or(0),
        skipped_stages: session.as_ref().map_or(0, |s| s.skipped_stages.len()),
        created_at: metadata.created_at,
        completed_at: metadata.completed_at,
    })
}

/// `2h 5m` or `5m`.
pub fn format_span(secs: i64) -> String {
    let span = Duration::seconds(secs.max(0));
    let (hours, minutes) = (span.num_hours(), span.num_minutes() % 60);
    if hours > 0 {
        format!("{hours}h {minutes}m")
    } else {
        format!("{minutes}m")
    }
}

pub fn render_global_stats(stats: &GlobalStats) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Plans:      {}", stats.total);
    let _ = writeln!(out, "  running:   {}", stats.running);
    let _ = writeln!(out, "  paused:    {}", stats.paused);
    let _ = writeln!(out, "  completed: {}", stats.completed);
    let _ = writeln!(out, "  aborted:   {}", stats.aborted);
    let _ = writeln!(out, "  failed:    {}", stats.failed);
    if let Some(secs) = stats.average_completion_secs {
        let _ = writeln!(out, "Average completion time: {}", format_span(secs));
    }
    if let Some(stages) = &stats.stages {
        let _ = writeln!(
            out,
            "Stages:     {} total, {} completed, {} skipped",
            stages.total, stages.completed, stages.skipped
        );
        if let Some(rate) = stages.success_rate {
            let _ = writeln!(out, "Success rate: {rate:.1}%");
        }
    }
    out
}

pub fn render_plan_stats(stats: &PlanStats) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Plan:     {}", stats.plan_id);
    let _ = writeln!(out, "Status:   {}", stats.status.as_str());
    let _ = writeln!(
        out,
        "Progress: {}/{} stages completed",
        stats.completed_stages, stats.total_stages
    );
    let _ = writeln!(out, "Duration: {}", format_span(stats.duration_secs));
    let _ = writeln!(out, "Retries:  {}", stats.total_retries);
    let _ = writeln!(out, "Skipped:  {}", stats.skipped_stages);
    let _ = writeln!(
        out,
        "Created:  {}",
        stats.created_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    if let Some(done) = stats.completed_at {
        let _ = writeln!(out, "Completed: {}", done.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::FixedClock;
    use crate::test_support::{TestEnv, later_clock};
    use std::path::Path;

    #[test]
    fn empty_home_has_no_stage_stats() {
        let env = TestEnv::with_split_plan("demo", 3, 1);
        let stats = global_stats(env.ctx()).expect("stats");
        assert_eq!(stats.total, 0);
        assert_eq!(stats.average_completion_secs, None);
        assert_eq!(stats.stages, None);
    }

    #[test]
    fn counts_statuses_and_averages_completion() {
        let env = TestEnv::with_split_plan("demo", 3, 1);
        let ctx = env.ctx();
        let metadata = ctx.metadata();
        for (plan, stages) in [("alpha", 4), ("beta", 2), ("gamma", 5)] {
            metadata
                .ensure(plan, Path::new("/work").join(plan).as_path(), stages, 0)
                .expect("ensure");
        }
        let created = env.clock.0;
        metadata
            .update("alpha", |m| {
                m.status = PlanStatus::Completed;
                m.completed_stages = 4;
                m.completed_at = Some(created + Duration::minutes(30));
            })
            .expect("alpha");
        metadata
            .update("beta", |m| {
                m.status = PlanStatus::Completed;
                m.completed_stages = 2;
                m.completed_at = Some(created + Duration::minutes(90));
            })
            .expect("beta");
        ctx.sessions().create("gamma", 2, 5).expect("session");
        ctx.sessions()
            .update("gamma", |s| {
                s.status = SessionStatus::Failed;
                s.skipped_stages = vec![1];
            })
            .expect("gamma");
        metadata.update("gamma", |m| m.completed_stages = 1).expect("gamma");

        let stats = global_stats(ctx).expect("stats");
        assert_eq!(stats.total, 3);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.running, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.average_completion_secs, Some(60 * 60));
        let stages = stats.stages.as_ref().expect("stages");
        assert_eq!((stages.total, stages.completed, stages.skipped), (11, 7, 1));
        assert_eq!(stages.success_rate, Some(85.7));

        let text = render_global_stats(&stats);
        assert!(text.contains("Average completion time: 1h 0m"));
        assert!(text.contains("Success rate: 85.7%"));
    }

    #[test]
    fn plan_stats_for_unfinished_plan_run_until_now() {
        let env = TestEnv::with_split_plan("demo", 4, 2);
        env.track_plan();
        env.ctx()
            .sessions()
            .update("demo", |s| {
                s.retry_count.insert(1, 2);
                s.retry_count.insert(2, 1);
            })
            .expect("update");

        let later: FixedClock = later_clock(125 * 60);
        let ctx = RunContext::new(&env.paths, &env.config, &later);
        let stats = plan_stats(ctx, "demo").expect("stats");
        assert_eq!(stats.total_retries, 3);
        assert_eq!(stats.current_stage, Some(2));
        assert_eq!(stats.completed_at, None);
        assert_eq!(format_span(stats.duration_secs), "2h 5m");
        assert!(render_plan_stats(&stats).contains("Progress: 1/4 stages completed"));
    }

    #[test]
    fn unknown_plan_is_not_found() {
        let env = TestEnv::with_split_plan("demo", 3, 1);
        let err = plan_stats(env.ctx(), "ghost").unwrap_err();
        assert_eq!(
            crate::error::find_autorun_error(&err),
            Some(&AutorunError::session_not_found("ghost"))
        );
    }
}
