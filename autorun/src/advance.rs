//! One progression step: the stop hook and manual triggers.
//!
//! [`process_stage_end`] is shared by the hook and the foreground loop. It
//! scans for agent errors, detects completion, gates on the safety limit, and
//! moves the plan to its next stage (snapshot, header, session, metadata).

use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::context::RunContext;
use crate::core::completion::extract_plan_reference;
use crate::core::types::{PlanStatus, SessionStatus};
use crate::detect::{CompletionDetector, Detection};
use crate::error::AutorunError;
use crate::io::agent::{AgentInvocation, AgentLauncher};
use crate::io::hook_input::HookInput;
use crate::io::plan::{
    PlanData, detect_architecture, parse_plan, plan_root_for, resolve_plan, stage_file_for,
};
use crate::safety::SafetyLimiter;

/// What happened at the end of an agent turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StageEnd {
    /// The plan moved on; the agent should start `stage_file`.
    Advanced { from: u32, to: u32, stage_file: PathBuf },
    /// The final stage finished.
    Completed { stage: u32 },
    /// An error pattern matched; the session is now failed.
    Failed { stage: u32, error: String },
    /// The safety limit stopped auto-continuation; the session is now paused.
    LimitReached { stage: u32, message: String },
    NotDetected { stage: u32 },
    /// The session is not active, so nothing was touched.
    Inactive { status: SessionStatus },
}

impl StageEnd {
    pub fn next_action(&self, task: &str) -> String {
        match self {
            Self::Advanced { to, .. } => format!("agent continues with stage {to}"),
            Self::Completed { .. } => format!("run `autorun archive {task}` to archive the plan"),
            Self::Failed { .. } => format!("run `autorun recover {task} <retry|skip|rollback|abort>`"),
            Self::LimitReached { .. } => format!("run `autorun resume {task}` to continue"),
            Self::NotDetected { .. } => format!("run `autorun trigger {task}` to continue manually"),
            Self::Inactive { status } => match status {
                SessionStatus::Paused => format!("run `autorun resume {task}`"),
                SessionStatus::Failed => format!("run `autorun recover {task} <strategy>`"),
                _ => "nothing to do".to_string(),
            },
        }
    }
}

/// Outcome of a stop-hook invocation for a recognized plan.
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub task: String,
    pub end: StageEnd,
    pub next_action: String,
    /// Agent started for the next stage, if any.
    pub launched: Option<AgentInvocation>,
}

/// Evaluate the end of an agent turn for `plan`.
///
/// `project_root` is the directory snapshots are taken from; `agent_session`
/// is recorded as the session's `last_session_id` when the plan advances.
pub fn process_stage_end(
    ctx: RunContext<'_>,
    plan: &PlanData,
    window: &str,
    project_root: &Path,
    agent_session: Option<&str>,
) -> Result<StageEnd> {
    let task = plan.task_name();
    let session = ctx.ensure_session(plan, project_root)?;
    let stage = plan.config.current;
    if session.status != SessionStatus::Active {
        debug!(task = %task, status = %session.status, "session not active; leaving plan alone");
        return Ok(StageEnd::Inactive {
            status: session.status,
        });
    }

    let detector = CompletionDetector::new(ctx);
    if let Some(found) = detector.scan_errors(window) {
        warn!(task = %task, stage, pattern = %found.pattern, "agent reported an error");
        ctx.sessions()
            .set_status(&task, SessionStatus::Failed, Some(&found.line), false)?;
        return Ok(StageEnd::Failed {
            stage,
            error: found.line,
        });
    }

    let detection = detector.detect(plan, window)?;
    if detection == Detection::NotDetected {
        warn!(task = %task, stage, "stage completion not detected");
        return Ok(StageEnd::NotDetected { stage });
    }
    if !matches!(detection, Detection::TranscriptMarker(_)) {
        debug!(task = %task, source = detection.source(), "completion from fallback source");
    }

    if stage >= plan.config.stages {
        let now = ctx.clock.now();
        ctx.sessions().update(&task, |session| {
            session.status = SessionStatus::Completed;
            session.current_stage = plan.config.stages;
            if let Some(id) = agent_session {
                session.last_session_id = Some(id.to_string());
            }
        })?;
        ctx.metadata().update(&task, |metadata| {
            metadata.status = PlanStatus::Completed;
            metadata.completed_stages = metadata.total_stages;
            metadata.completed_at = Some(now);
        })?;
        info!(task = %task, stages = plan.config.stages, "plan completed");
        return Ok(StageEnd::Completed { stage });
    }

    let check = SafetyLimiter::new(ctx).increment_and_check(&task, plan.config.safety_limit)?;
    if !check.should_continue {
        return Ok(StageEnd::LimitReached {
            stage,
            message: check.message,
        });
    }

    let next = stage + 1;
    let stage_file = stage_file_for(plan, next).ok_or_else(|| {
        AutorunError::plan_parse(format!("Stage file not found for stage {next}"))
    })?;

    let snapshots = ctx.snapshots();
    snapshots.create_snapshot(&task, next, project_root, &ctx.snapshot_include())?;
    snapshots.cleanup_snapshots(&task, ctx.config.snapshot.retention)?;
    snapshots.compress_old_snapshots(&task)?;

    ctx.write_current_stage(&task, &plan.root, next)?;
    ctx.sessions().update(&task, |session| {
        session.current_stage = next;
        session.total_stages = plan.config.stages;
        if let Some(id) = agent_session {
            session.last_session_id = Some(id.to_string());
        }
    })?;
    ctx.metadata()
        .ensure(&task, &plan.root, plan.config.stages, stage)?;

    info!(task = %task, from = stage, to = next, "stage advanced");
    Ok(StageEnd::Advanced {
        from: stage,
        to: next,
        stage_file,
    })
}

/// Handle an agent stop event.
///
/// Returns `Ok(None)` when the transcript does not reference a plan.
pub fn handle_stop(
    ctx: RunContext<'_>,
    launcher: &dyn AgentLauncher,
    input: &HookInput,
) -> Result<Option<StepReport>> {
    let detector = CompletionDetector::new(ctx);
    let window = detector.read_window(input.transcript_path.as_deref())?;
    let cwd = match &input.cwd {
        Some(cwd) => cwd.clone(),
        None => std::env::current_dir()?,
    };
    let Some(reference) = extract_plan_reference(&window, &cwd) else {
        debug!("no plan reference in transcript");
        return Ok(None);
    };
    let root = plan_root_for(&reference);
    if detect_architecture(&root).is_none() {
        debug!(reference = %reference.display(), "referenced file is not a plan");
        return Ok(None);
    }

    let plan = parse_plan(&root)?;
    let task = plan.task_name();
    let agent_session = input.session_id.as_deref();
    let end = process_stage_end(ctx, &plan, &window, &cwd, agent_session)?;

    let launched = match &end {
        StageEnd::Advanced { to, stage_file, .. } => {
            let invocation =
                AgentInvocation::build(&ctx.config.agent, &task, *to, stage_file, agent_session, &cwd)?;
            launcher.spawn_detached(&invocation)?;
            Some(invocation)
        }
        _ => None,
    };
    Ok(Some(StepReport {
        next_action: end.next_action(&task),
        task,
        end,
        launched,
    }))
}

#[derive(Debug, Clone, Default)]
pub struct TriggerOptions {
    /// Plan path or task name.
    pub plan: String,
    pub cwd: PathBuf,
    /// Agent conversation to resume.
    pub resume: Option<String>,
    /// Reactivate a non-active session and ignore the safety limit.
    pub force: bool,
    /// Build the invocation without launching it.
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TriggerReport {
    pub task: String,
    pub stage: u32,
    pub invocation: AgentInvocation,
    pub launched: bool,
}

/// Start the agent on the plan's current stage.
pub fn trigger(
    ctx: RunContext<'_>,
    launcher: &dyn AgentLauncher,
    options: &TriggerOptions,
) -> Result<TriggerReport> {
    let root = resolve_plan(&options.plan, std::slice::from_ref(&options.cwd))?;
    let plan = parse_plan(&root)?;
    let task = plan.task_name();
    let session = ctx.ensure_session(&plan, &options.cwd)?;

    if session.status != SessionStatus::Active {
        if !options.force {
            return Err(AutorunError::invalid_argument(
                "status",
                "an active session (or --force)",
                session.status,
            )
            .into());
        }
        ctx.sessions()
            .set_status(&task, SessionStatus::Active, None, true)?;
        ctx.metadata().update(&task, |metadata| {
            metadata.status = PlanStatus::Running;
        })?;
    }

    let check = SafetyLimiter::new(ctx).check_limit(&task, plan.config.safety_limit)?;
    if !check.should_continue && !options.force {
        return Err(AutorunError::SafetyLimitExceeded {
            count: check.count,
            limit: check.limit,
            message: check.message,
        }
        .into());
    }

    let stage = plan.config.current;
    if session.current_stage != stage {
        debug!(task = %task, session_stage = session.current_stage, plan_stage = stage, "syncing session to plan header");
    }
    ctx.sessions().update(&task, |session| {
        session.current_stage = stage;
        session.total_stages = plan.config.stages;
    })?;

    let invocation = AgentInvocation::build(
        &ctx.config.agent,
        &task,
        stage,
        &plan.current_stage_file,
        options.resume.as_deref(),
        &options.cwd,
    )?;
    if options.dry_run {
        info!(task = %task, stage, command = %invocation.command_line(), "dry run; agent not launched");
    } else {
        launcher.spawn_detached(&invocation)?;
    }
    Ok(TriggerReport {
        task,
        stage,
        invocation,
        launched: !options.dry_run,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::PauseReason;
    use crate::io::transcript::write_marker;
    use crate::test_support::{ScriptedLauncher, TestEnv};
    use std::fs;

    #[test]
    fn marker_advances_plan_and_relaunches_agent() {
        let env = TestEnv::with_split_plan("demo", 3, 1);
        let transcript = env.write_transcript(&format!(
            "@{}/stages/01-stage-1.md Start executing Stage 1\nall good\n[STAGE_COMPLETE:1]\n",
            env.plan.display()
        ));
        let launcher = ScriptedLauncher::default();

        let report = handle_stop(env.ctx(), &launcher, &env.hook_input(&transcript))
            .expect("hook")
            .expect("plan found");
        assert_eq!(report.task, "demo");
        assert_eq!(
            report.end,
            StageEnd::Advanced {
                from: 1,
                to: 2,
                stage_file: env.plan.join("stages/02-stage-2.md"),
            }
        );

        let launched = launcher.spawned();
        assert_eq!(launched.len(), 1);
        assert_eq!(launched[0].stage, 2);
        assert!(launched[0].args.contains(&"sess-1".to_string()));

        let session = env.ctx().sessions().require("demo").expect("session");
        assert_eq!(session.current_stage, 2);
        assert_eq!(session.count, 1);
        assert_eq!(session.last_session_id.as_deref(), Some("sess-1"));
        assert_eq!(parse_plan(&env.plan).expect("parse").config.current, 2);
        assert_eq!(env.ctx().snapshots().snapshot_stages("demo").expect("stages"), vec![1, 2]);
        let metadata = env.ctx().metadata().load("demo").expect("load").expect("metadata");
        assert_eq!(metadata.completed_stages, 1);
    }

    #[test]
    fn transcript_without_plan_is_ignored() {
        let env = TestEnv::with_split_plan("demo", 3, 1);
        let transcript = env.write_transcript("just chatting\n");
        let launcher = ScriptedLauncher::default();
        let report = handle_stop(env.ctx(), &launcher, &env.hook_input(&transcript)).expect("hook");
        assert!(report.is_none());
        assert!(!env.ctx().sessions().exists("demo"));
    }

    #[test]
    fn error_pattern_fails_session_without_advancing() {
        let env = TestEnv::with_split_plan("demo", 3, 1);
        let transcript = env.write_transcript(&format!(
            "@{}/README.md\nCompilation failed: missing semicolon\n[STAGE_COMPLETE:1]\n",
            env.plan.display()
        ));
        let launcher = ScriptedLauncher::default();
        let report = handle_stop(env.ctx(), &launcher, &env.hook_input(&transcript))
            .expect("hook")
            .expect("plan found");
        assert!(matches!(report.end, StageEnd::Failed { stage: 1, .. }));
        assert!(launcher.spawned().is_empty());

        let session = env.ctx().sessions().require("demo").expect("session");
        assert_eq!(session.status, SessionStatus::Failed);
        assert_eq!(
            session.last_error.as_deref(),
            Some("Compilation failed: missing semicolon")
        );
        assert_eq!(parse_plan(&env.plan).expect("parse").config.current, 1);
    }

    #[test]
    fn final_stage_completes_plan() {
        let env = TestEnv::with_split_plan("demo", 2, 2);
        let transcript = env.write_transcript(&format!(
            "@{}/stages/02-stage-2.md\n[STAGE_COMPLETE:2]\n",
            env.plan.display()
        ));
        let launcher = ScriptedLauncher::default();
        let report = handle_stop(env.ctx(), &launcher, &env.hook_input(&transcript))
            .expect("hook")
            .expect("plan found");
        assert_eq!(report.end, StageEnd::Completed { stage: 2 });
        assert!(launcher.spawned().is_empty());
        let session = env.ctx().sessions().require("demo").expect("session");
        assert_eq!(session.status, SessionStatus::Completed);
        let metadata = env.ctx().metadata().load("demo").expect("load").expect("metadata");
        assert_eq!(metadata.status, PlanStatus::Completed);
        assert_eq!(metadata.completed_at, Some(env.clock.0));
    }

    #[test]
    fn marker_ahead_of_plan_does_not_skip_stages() {
        let env = TestEnv::with_split_plan("demo", 5, 2);
        let transcript = env.write_transcript(&format!(
            "@{}/stages/02-stage-2.md\n[STAGE_COMPLETE:4]\n",
            env.plan.display()
        ));
        let launcher = ScriptedLauncher::default();
        let report = handle_stop(env.ctx(), &launcher, &env.hook_input(&transcript))
            .expect("hook")
            .expect("plan found");
        assert_eq!(report.end, StageEnd::NotDetected { stage: 2 });
        assert!(launcher.spawned().is_empty());
        assert_eq!(parse_plan(&env.plan).expect("parse").config.current, 2);
        let session = env.ctx().sessions().require("demo").expect("session");
        assert_eq!(session.current_stage, 2);
        assert!(session.skipped_stages.is_empty());
    }

    #[test]
    fn marker_beyond_last_stage_does_not_complete_plan() {
        let env = TestEnv::with_split_plan("demo", 3, 1);
        let transcript = env.write_transcript(&format!(
            "@{}/README.md\n[STAGE_COMPLETE:9]\n",
            env.plan.display()
        ));
        let report = handle_stop(env.ctx(), &ScriptedLauncher::default(), &env.hook_input(&transcript))
            .expect("hook")
            .expect("plan found");
        assert_eq!(report.end, StageEnd::NotDetected { stage: 1 });
        let session = env.ctx().sessions().require("demo").expect("session");
        assert_eq!(session.status, SessionStatus::Active);
        let metadata = env.ctx().metadata().load("demo").expect("load").expect("metadata");
        assert_eq!(metadata.status, PlanStatus::Running);
        assert_eq!(metadata.completed_at, None);
    }

    #[test]
    fn safety_limit_pauses_instead_of_advancing() {
        let env = TestEnv::with_split_plan_limit("demo", 5, 2, 10);
        env.track_plan();
        env.ctx().sessions().update("demo", |s| s.count = 9).expect("update");
        let transcript = env.write_transcript(&format!(
            "@{}/stages/02-stage-2.md\n[STAGE_COMPLETE:2]\n",
            env.plan.display()
        ));
        let launcher = ScriptedLauncher::default();
        let report = handle_stop(env.ctx(), &launcher, &env.hook_input(&transcript))
            .expect("hook")
            .expect("plan found");
        assert!(matches!(report.end, StageEnd::LimitReached { stage: 2, .. }));
        assert!(launcher.spawned().is_empty());

        let session = env.ctx().sessions().require("demo").expect("session");
        assert_eq!(session.status, SessionStatus::Paused);
        assert_eq!(session.count, 10);
        assert_eq!(session.current_stage, 2);
        let metadata = env.ctx().metadata().load("demo").expect("load").expect("metadata");
        assert_eq!(metadata.pause_reason, Some(PauseReason::SafetyLimit));
    }

    #[test]
    fn paused_session_leaves_marker_in_place() {
        let env = TestEnv::with_split_plan("demo", 3, 1);
        env.track_plan();
        env.ctx()
            .sessions()
            .set_status("demo", SessionStatus::Paused, None, false)
            .expect("pause");
        write_marker(&env.paths, "demo", 1).expect("marker");
        let transcript = env.write_transcript(&format!("@{}/README.md\n", env.plan.display()));

        let report = handle_stop(env.ctx(), &ScriptedLauncher::default(), &env.hook_input(&transcript))
            .expect("hook")
            .expect("plan found");
        assert_eq!(
            report.end,
            StageEnd::Inactive {
                status: SessionStatus::Paused
            }
        );
        assert!(env.paths.marker_path("demo").exists());
    }

    #[test]
    fn undetected_completion_changes_nothing() {
        let env = TestEnv::with_split_plan("demo", 3, 1);
        let transcript = env.write_transcript(&format!("@{}/README.md\nstill going\n", env.plan.display()));
        let report = handle_stop(env.ctx(), &ScriptedLauncher::default(), &env.hook_input(&transcript))
            .expect("hook")
            .expect("plan found");
        assert_eq!(report.end, StageEnd::NotDetected { stage: 1 });
        assert!(report.next_action.contains("autorun trigger demo"));
        let session = env.ctx().sessions().require("demo").expect("session");
        assert_eq!(session.count, 0);
    }

    #[test]
    fn trigger_launches_current_stage() {
        let env = TestEnv::with_split_plan("demo", 3, 2);
        let launcher = ScriptedLauncher::default();
        let report = trigger(
            env.ctx(),
            &launcher,
            &TriggerOptions {
                plan: "demo".to_string(),
                cwd: env.project.clone(),
                ..TriggerOptions::default()
            },
        )
        .expect("trigger");
        assert!(report.launched);
        assert_eq!(report.stage, 2);
        assert_eq!(report.invocation.stage_file, env.plan.join("stages/02-stage-2.md"));
        assert_eq!(launcher.spawned().len(), 1);
    }

    #[test]
    fn trigger_dry_run_does_not_launch() {
        let env = TestEnv::with_split_plan("demo", 3, 1);
        let launcher = ScriptedLauncher::default();
        let report = trigger(
            env.ctx(),
            &launcher,
            &TriggerOptions {
                plan: env.plan.display().to_string(),
                cwd: env.project.clone(),
                dry_run: true,
                ..TriggerOptions::default()
            },
        )
        .expect("trigger");
        assert!(!report.launched);
        assert!(launcher.spawned().is_empty());
    }

    #[test]
    fn trigger_refuses_inactive_session_without_force() {
        let env = TestEnv::with_split_plan("demo", 3, 1);
        env.track_plan();
        env.ctx()
            .sessions()
            .set_status("demo", SessionStatus::Failed, Some("error: x"), false)
            .expect("fail");
        let launcher = ScriptedLauncher::default();
        let mut options = TriggerOptions {
            plan: "demo".to_string(),
            cwd: env.project.clone(),
            ..TriggerOptions::default()
        };
        assert!(trigger(env.ctx(), &launcher, &options).is_err());

        options.force = true;
        trigger(env.ctx(), &launcher, &options).expect("forced trigger");
        let session = env.ctx().sessions().require("demo").expect("session");
        assert_eq!(session.status, SessionStatus::Active);
    }

    #[test]
    fn trigger_respects_safety_limit() {
        let env = TestEnv::with_split_plan_limit("demo", 3, 1, 2);
        env.track_plan();
        env.ctx().sessions().update("demo", |s| s.count = 2).expect("update");
        let err = trigger(
            env.ctx(),
            &ScriptedLauncher::default(),
            &TriggerOptions {
                plan: "demo".to_string(),
                cwd: env.project.clone(),
                ..TriggerOptions::default()
            },
        )
        .unwrap_err();
        assert!(matches!(
            crate::error::find_autorun_error(&err),
            Some(AutorunError::SafetyLimitExceeded { count: 2, limit: 2, .. })
        ));
    }

    #[test]
    fn single_file_plan_advances_in_place() {
        let env = TestEnv::with_single_plan("solo", 2, 1);
        let transcript = env.write_transcript(&format!(
            "@{}\n[STAGE_COMPLETE:1]\n",
            env.plan.display()
        ));
        let launcher = ScriptedLauncher::default();
        let report = handle_stop(env.ctx(), &launcher, &env.hook_input(&transcript))
            .expect("hook")
            .expect("plan found");
        assert_eq!(
            report.end,
            StageEnd::Advanced {
                from: 1,
                to: 2,
                stage_file: env.plan.clone(),
            }
        );
        let content = fs::read_to_string(&env.plan).expect("read");
        assert!(content.contains("current: 2"));
    }
}
