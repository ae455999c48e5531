//! `autorun`: drive a staged plan through an external coding agent.
//!
//! The `hook` command is wired to the agent's stop event; everything else is
//! for people (and scripts) managing tasks. Results go to stdout as text or,
//! with `--json`, as pretty JSON.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, anyhow};
use autorun::advance::{StageEnd, TriggerOptions, handle_stop, trigger};
use autorun::archive::{ArchiveOptions, archive_task};
use autorun::context::RunContext;
use autorun::core::clock::SystemClock;
use autorun::core::types::{PauseReason, SessionStatus};
use autorun::error::{AutorunError, find_autorun_error};
use autorun::exit_codes;
use autorun::io::agent::ProcessLauncher;
use autorun::io::config::{AutorunConfig, load_config, write_config};
use autorun::io::hook_input::read_hook_input;
use autorun::io::paths::AutorunPaths;
use autorun::io::plan::{resolve_plan, validate_plan};
use autorun::io::snapshot::parse_include_list;
use autorun::io::transcript::write_marker;
use autorun::logging;
use autorun::looping::{LoopStop, RunOptions, run_plan};
use autorun::pause::PauseResumeManager;
use autorun::recovery::{RecoveryManager, RecoveryOptions};
use autorun::stats::{global_stats, plan_stats, render_global_stats, render_plan_stats};
use autorun::status::{list_tasks, render_list, render_status, task_status};
use clap::{Parser, Subcommand};
use serde::Serialize;

#[derive(Parser)]
#[command(
    name = "autorun",
    version,
    about = "Plan progression and recovery for long-running agent tasks"
)]
struct Cli {
    /// State directory (default: ~/.autorun).
    #[arg(long, global = true, env = "AUTORUN_HOME")]
    home: Option<PathBuf>,
    /// Debug-level tracing on stderr.
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Print results as JSON.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Handle the agent's stop event (reads the hook payload from stdin).
    Hook,
    /// Launch the agent on the plan's current stage.
    Trigger {
        /// Plan path or task name.
        plan: String,
        /// Agent conversation to resume.
        #[arg(long)]
        resume: Option<String>,
        /// Reactivate a non-active task and ignore the safety limit.
        #[arg(short, long)]
        force: bool,
        /// Print the agent command without running it.
        #[arg(long)]
        dry_run: bool,
    },
    /// Run the agent in the foreground, stage after stage.
    Run {
        /// Plan path or task name.
        plan: String,
        #[arg(long)]
        resume: Option<String>,
        /// Stop after this many agent runs.
        #[arg(long)]
        max_iterations: Option<u32>,
    },
    /// Show one task.
    Status { task: String },
    /// List every known task.
    List,
    /// Aggregate numbers over all plans, or one plan's numbers.
    Stats { task: Option<String> },
    /// Pause a task and save its execution state.
    Pause {
        task: String,
        /// user_request, signal_interrupt, error, safety_limit or manual.
        #[arg(long, default_value = "user_request")]
        reason: PauseReason,
    },
    /// Resume a paused or failed task.
    Resume {
        task: String,
        /// Launch the agent on the resumed stage.
        #[arg(long)]
        launch: bool,
    },
    /// Apply a recovery strategy, or show failure details when none is given.
    Recover {
        task: String,
        /// retry, skip, rollback or abort.
        strategy: Option<String>,
        /// Rollback target stage (default: previous stage).
        #[arg(long)]
        target: Option<u32>,
        #[arg(long)]
        reason: Option<String>,
        #[arg(short, long)]
        force: bool,
        /// Rollback: restore the target stage's files into the project.
        #[arg(long)]
        restore_files: bool,
        /// Restore destination (default: where the snapshot was taken).
        #[arg(long)]
        project_root: Option<PathBuf>,
    },
    /// Shorthand for `recover <task> retry`.
    Retry {
        task: String,
        #[arg(short, long)]
        force: bool,
    },
    /// Shorthand for `recover <task> skip`.
    Skip {
        task: String,
        #[arg(long)]
        reason: Option<String>,
        #[arg(short, long)]
        force: bool,
    },
    /// Move a task back to `stage` and reactivate it.
    Reset { task: String, stage: u32 },
    /// Session, metadata, saved state and recovery points of a task.
    History { task: String },
    /// Move a finished task into the archive.
    Archive {
        task: String,
        #[arg(short, long)]
        force: bool,
        /// Move the plan files into the archive too.
        #[arg(long)]
        include_plan: bool,
    },
    /// Check a plan's header and stage files.
    Validate {
        /// Plan path or task name.
        plan: String,
    },
    /// Record that `stage` of `task` is complete (consumed by the next hook).
    Mark { task: String, stage: u32 },
    /// Manage stage snapshots.
    #[command(subcommand)]
    Snapshot(SnapshotCommand),
    /// Show the effective configuration.
    Config {
        /// Write the defaults to config.toml if it does not exist.
        #[arg(long)]
        init: bool,
    },
}

#[derive(Subcommand)]
enum SnapshotCommand {
    /// Snapshot the project for a stage.
    Create {
        task: String,
        stage: u32,
        /// Comma-separated paths relative to the project root.
        #[arg(long, value_delimiter = ',')]
        paths: Vec<String>,
        #[arg(long)]
        project_root: Option<PathBuf>,
    },
    List {
        task: String,
    },
    /// Copy a stage's files back into the project.
    Restore {
        task: String,
        stage: u32,
        #[arg(long)]
        target: Option<PathBuf>,
    },
    /// Delete old snapshots, keeping the first, the last and the most recent.
    Cleanup {
        task: String,
        #[arg(long)]
        retention: Option<usize>,
    },
    /// Pack snapshots older than the configured age.
    Compress {
        task: String,
    },
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            match find_autorun_error(&err) {
                Some(typed) => {
                    eprintln!("next: {}", typed.next_action());
                    exit_code_for_error(typed)
                }
                None => exit_codes::INVALID,
            }
        }
    };
    std::process::exit(code);
}

fn exit_code_for_error(err: &AutorunError) -> i32 {
    match err {
        AutorunError::SessionNotFound { .. } => exit_codes::NOT_FOUND,
        AutorunError::SafetyLimitExceeded { .. } => exit_codes::PAUSED,
        AutorunError::ExecutionFailure(_) => exit_codes::FAILED,
        AutorunError::PlanParse(_)
        | AutorunError::RecoveryPointNotFound { .. }
        | AutorunError::InvalidArgument { .. } => exit_codes::INVALID,
    }
}

fn exit_code_for_status(status: SessionStatus) -> i32 {
    match status {
        SessionStatus::Active => exit_codes::OK,
        SessionStatus::Paused => exit_codes::PAUSED,
        SessionStatus::Failed | SessionStatus::Aborted => exit_codes::FAILED,
        SessionStatus::Completed => exit_codes::COMPLETE,
    }
}

struct App {
    paths: AutorunPaths,
    config: AutorunConfig,
    clock: SystemClock,
    json: bool,
}

impl App {
    fn ctx(&self) -> RunContext<'_> {
        RunContext::new(&self.paths, &self.config, &self.clock)
    }

    /// Print `value` as JSON, or the text rendering otherwise.
    fn emit<T: Serialize>(&self, value: &T, text: impl FnOnce() -> String) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            print!("{}", text());
        }
        Ok(())
    }
}

fn run(cli: Cli) -> Result<i32> {
    let paths = AutorunPaths::resolve(cli.home)?;
    let config = load_config(&paths.config_path)?;
    let app = App {
        paths,
        config,
        clock: SystemClock,
        json: cli.json,
    };

    match cli.command {
        Command::Hook => cmd_hook(&app),
        Command::Trigger {
            plan,
            resume,
            force,
            dry_run,
        } => cmd_trigger(
            &app,
            TriggerOptions {
                plan,
                cwd: std::env::current_dir()?,
                resume,
                force,
                dry_run,
            },
        ),
        Command::Run {
            plan,
            resume,
            max_iterations,
        } => cmd_run(
            &app,
            RunOptions {
                plan,
                cwd: std::env::current_dir()?,
                resume,
                max_iterations,
            },
        ),
        Command::Status { task } => {
            let status = task_status(app.ctx(), &task)?;
            app.emit(&status, || render_status(&status))?;
            Ok(exit_code_for_status(status.status))
        }
        Command::List => {
            let tasks = list_tasks(app.ctx())?;
            app.emit(&tasks, || render_list(&tasks))?;
            Ok(exit_codes::OK)
        }
        Command::Stats { task: Some(task) } => {
            let stats = plan_stats(app.ctx(), &task)?;
            app.emit(&stats, || render_plan_stats(&stats))?;
            Ok(exit_codes::OK)
        }
        Command::Stats { task: None } => {
            let stats = global_stats(app.ctx())?;
            app.emit(&stats, || render_global_stats(&stats))?;
            Ok(exit_codes::OK)
        }
        Command::Pause { task, reason } => {
            let outcome = PauseResumeManager::new(app.ctx()).pause(&task, reason)?;
            app.emit(&outcome, || match &outcome.state {
                Some(state) => format!("Paused {task} at stage {}\n", state.current_stage),
                None => format!("{task} is already paused\n"),
            })?;
            Ok(exit_codes::PAUSED)
        }
        Command::Resume { task, launch } => cmd_resume(&app, &task, launch),
        Command::Recover {
            task,
            strategy,
            target,
            reason,
            force,
            restore_files,
            project_root,
        } => {
            let options = RecoveryOptions {
                target_stage: target,
                reason,
                force,
                restore_files,
                project_root,
            };
            match strategy {
                Some(strategy) => cmd_recover(&app, &task, &strategy, &options),
                None => cmd_failure_details(&app, &task),
            }
        }
        Command::Retry { task, force } => cmd_recover(
            &app,
            &task,
            "retry",
            &RecoveryOptions {
                force,
                ..RecoveryOptions::default()
            },
        ),
        Command::Skip {
            task,
            reason,
            force,
        } => cmd_recover(
            &app,
            &task,
            "skip",
            &RecoveryOptions {
                reason,
                force,
                ..RecoveryOptions::default()
            },
        ),
        Command::Reset { task, stage } => {
            let session = RecoveryManager::new(app.ctx()).reset(&task, stage)?;
            app.emit(&session, || format!("Reset {task} to stage {stage}\n"))?;
            Ok(exit_codes::OK)
        }
        Command::History { task } => {
            let history = PauseResumeManager::new(app.ctx()).history(&task)?;
            // History is structured data; text mode prints it as JSON too.
            println!("{}", serde_json::to_string_pretty(&history)?);
            Ok(exit_codes::OK)
        }
        Command::Archive {
            task,
            force,
            include_plan,
        } => {
            let report = archive_task(app.ctx(), &task, ArchiveOptions { force, include_plan })?;
            app.emit(&report, || {
                format!("Archived {task} to {}\n", report.archive_dir.display())
            })?;
            Ok(exit_codes::OK)
        }
        Command::Validate { plan } => cmd_validate(&app, &plan),
        Command::Mark { task, stage } => {
            write_marker(&app.paths, &task, stage)?;
            app.emit(&serde_json::json!({ "task": task, "stage": stage }), || {
                format!("Marked stage {stage} of {task} complete\n")
            })?;
            Ok(exit_codes::OK)
        }
        Command::Snapshot(command) => cmd_snapshot(&app, command),
        Command::Config { init } => {
            if init && !app.paths.config_path.exists() {
                write_config(&app.paths.config_path, &app.config)?;
            }
            let rendered = toml::to_string_pretty(&app.config)?;
            app.emit(&app.config, || rendered.clone())?;
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_hook(app: &App) -> Result<i32> {
    let timeout = Duration::from_secs(app.config.hook_stdin_timeout_secs);
    let input = read_hook_input(timeout)?;
    let report = handle_stop(app.ctx(), &ProcessLauncher, &input)?;
    match report {
        Some(report) => app.emit(&report, || {
            let summary = match &report.end {
                StageEnd::Advanced { from, to, .. } => format!("Stage {from} complete; started stage {to}"),
                StageEnd::Completed { stage } => format!("Stage {stage} complete; plan finished"),
                StageEnd::Failed { stage, error } => format!("Stage {stage} failed: {error}"),
                StageEnd::LimitReached { message, .. } => format!("Paused: {message}"),
                StageEnd::NotDetected { stage } => format!("Stage {stage} completion not detected"),
                StageEnd::Inactive { status } => format!("Task is {status}; nothing to do"),
            };
            format!("{}: {summary}\nnext: {}\n", report.task, report.next_action)
        })?,
        None => app.emit(&serde_json::Value::Null, || "No plan referenced\n".to_string())?,
    }
    // The hook never blocks the agent: outcomes live in the session record.
    Ok(exit_codes::OK)
}

fn cmd_trigger(app: &App, options: TriggerOptions) -> Result<i32> {
    let report = trigger(app.ctx(), &ProcessLauncher, &options)?;
    app.emit(&report, || {
        let verb = if report.launched { "Launched" } else { "Would run" };
        format!(
            "{verb} stage {} of {}\n{}\n",
            report.stage,
            report.task,
            report.invocation.command_line()
        )
    })?;
    Ok(exit_codes::OK)
}

fn cmd_run(app: &App, options: RunOptions) -> Result<i32> {
    let json = app.json;
    let outcome = run_plan(app.ctx(), &ProcessLauncher, &options, |stage, end| {
        if !json {
            eprintln!("stage {stage}: {}", serde_json::to_string(end).unwrap_or_default());
        }
    })?;
    let failure = outcome.stop.failure();
    let code = match &outcome.stop {
        LoopStop::Complete => exit_codes::COMPLETE,
        LoopStop::Paused { .. } => exit_codes::PAUSED,
        LoopStop::Failed { .. } => failure.as_ref().map_or(exit_codes::FAILED, exit_code_for_error),
        LoopStop::Inactive { status } => exit_code_for_status(*status),
        LoopStop::NotDetected { .. } | LoopStop::MaxIterations { .. } => exit_codes::OK,
    };
    app.emit(&outcome, || {
        let reason = match &outcome.stop {
            LoopStop::Complete => "plan complete".to_string(),
            LoopStop::Paused { message } => format!("paused: {message}"),
            LoopStop::Failed { stage, error } => format!("stage {stage} failed: {error}"),
            LoopStop::NotDetected { stage } => format!("stage {stage} completion not detected"),
            LoopStop::Inactive { status } => format!("task is {status}"),
            LoopStop::MaxIterations { max_iterations } => {
                format!("stopped after {max_iterations} iterations")
            }
        };
        format!("{}: {} ({} agent runs)\n", outcome.task, reason, outcome.iterations)
    })?;
    if let Some(err) = failure {
        eprintln!("error: {err}");
        eprintln!("next: {}", err.next_action());
    }
    Ok(code)
}

fn cmd_resume(app: &App, task: &str, launch: bool) -> Result<i32> {
    let outcome = PauseResumeManager::new(app.ctx()).resume(task)?;
    app.emit(&outcome, || format!("{}\n", outcome.message))?;
    if launch {
        let plan = app
            .ctx()
            .recorded_plan_path(task)?
            .ok_or_else(|| anyhow!("plan location for {task} is unknown; use `autorun trigger <plan>`"))?;
        cmd_trigger(
            app,
            TriggerOptions {
                plan: plan.display().to_string(),
                cwd: std::env::current_dir()?,
                resume: outcome.agent_session_id.clone(),
                force: false,
                dry_run: false,
            },
        )?;
    }
    Ok(exit_codes::OK)
}

fn cmd_recover(app: &App, task: &str, strategy: &str, options: &RecoveryOptions) -> Result<i32> {
    let outcome = RecoveryManager::new(app.ctx()).recover(task, strategy, options)?;
    app.emit(&outcome, || format!("{}\nnext: {}\n", outcome.message, outcome.next_action))?;
    Ok(exit_code_for_status(outcome.status))
}

fn cmd_failure_details(app: &App, task: &str) -> Result<i32> {
    let manager = RecoveryManager::new(app.ctx());
    let details = manager.failure_details(task)?;
    let error = manager.detect_failure(task)?;
    app.emit(&details, || {
        let mut out = format!(
            "{task}: {} at stage {}\n",
            details.session.status, details.session.current_stage
        );
        if let Some(error) = &error {
            out.push_str(&format!("Error: {error}\n"));
        }
        let points: Vec<String> = details
            .recovery_points
            .iter()
            .map(|point| format!("{} ({:?})", point.stage, point.status).to_lowercase())
            .collect();
        if !points.is_empty() {
            out.push_str(&format!("Recovery points: {}\n", points.join(", ")));
        }
        let strategies: Vec<&str> = details.strategies.iter().map(|s| s.as_str()).collect();
        out.push_str(&format!("Strategies: {}\n", strategies.join(", ")));
        out
    })?;
    Ok(exit_code_for_status(details.session.status))
}

fn cmd_validate(app: &App, plan: &str) -> Result<i32> {
    let cwd = std::env::current_dir()?;
    let root = resolve_plan(plan, &[cwd])?;
    let report = validate_plan(&root);
    app.emit(&report, || {
        let mut out = String::new();
        for error in &report.errors {
            out.push_str(&format!("error: {error}\n"));
        }
        for warning in &report.warnings {
            out.push_str(&format!("warning: {warning}\n"));
        }
        if report.is_valid() {
            out.push_str(&format!("{} is valid\n", root.display()));
        }
        out
    })?;
    Ok(if report.is_valid() {
        exit_codes::OK
    } else {
        exit_codes::INVALID
    })
}

fn cmd_snapshot(app: &App, command: SnapshotCommand) -> Result<i32> {
    let ctx = app.ctx();
    let snapshots = ctx.snapshots();
    match command {
        SnapshotCommand::Create {
            task,
            stage,
            paths,
            project_root,
        } => {
            let include = if paths.is_empty() {
                ctx.snapshot_include()
            } else {
                parse_include_list(&paths)?
            };
            let root = match project_root {
                Some(root) => root,
                None => std::env::current_dir()?,
            };
            let manifest = snapshots.create_snapshot(&task, stage, &root, &include)?;
            app.emit(&manifest, || {
                format!(
                    "Snapshot of {task} stage {stage}: {} files, {} bytes\n",
                    manifest.file_count, manifest.total_size
                )
            })?;
        }
        SnapshotCommand::List { task } => {
            let manifests = snapshots.list_snapshots(&task)?;
            app.emit(&manifests, || {
                if manifests.is_empty() {
                    return format!("No snapshots for {task}\n");
                }
                manifests
                    .iter()
                    .map(|m| {
                        format!(
                            "stage {:>3}  {:>5} files  {:>10} bytes  {:<10}  {}\n",
                            m.stage,
                            m.file_count,
                            m.total_size,
                            format!("{:?}", m.status).to_lowercase(),
                            m.created_at.format("%Y-%m-%d %H:%M")
                        )
                    })
                    .collect()
            })?;
        }
        SnapshotCommand::Restore {
            task,
            stage,
            target,
        } => {
            let report = snapshots.restore_snapshot(&task, stage, target.as_deref())?;
            app.emit(&report, || {
                format!(
                    "Restored {} files from stage {stage} into {}\n",
                    report.restored.len(),
                    report.target.display()
                )
            })?;
        }
        SnapshotCommand::Cleanup { task, retention } => {
            let retention = retention.unwrap_or(app.config.snapshot.retention);
            let report = snapshots.cleanup_snapshots(&task, retention)?;
            app.emit(&report, || {
                format!("Kept {:?}, deleted {:?}\n", report.kept, report.deleted)
            })?;
        }
        SnapshotCommand::Compress { task } => {
            let compressed = snapshots.compress_old_snapshots(&task)?;
            app.emit(&compressed, || format!("Compressed stages {compressed:?}\n"))?;
        }
    }
    Ok(exit_codes::OK)
}
