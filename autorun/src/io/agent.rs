//! Agent invocation.
//!
//! The [`AgentLauncher`] trait decouples plan progression from the actual
//! agent process. Tests use a scripted launcher that records invocations and
//! plays back canned transcripts without spawning anything.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use super::config::AgentConfig;
use super::process::{run_command_with_timeout, spawn_detached};

/// A fully-resolved agent command line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentInvocation {
    pub program: String,
    pub args: Vec<String>,
    /// Working directory for the agent (the project root).
    pub workdir: PathBuf,
    pub task: String,
    pub stage: u32,
    pub stage_file: PathBuf,
    pub instruction: String,
}

impl AgentInvocation {
    /// `<command> [--dangerously-skip-permissions] [--resume <id>] "@<file>" "<instruction>"`.
    pub fn build(
        config: &AgentConfig,
        task: &str,
        stage: u32,
        stage_file: &Path,
        resume_session: Option<&str>,
        workdir: &Path,
    ) -> Result<Self> {
        let instruction = render_instruction(&config.instruction_template, task, stage, stage_file)?;
        let mut args = Vec::new();
        if config.skip_permissions {
            args.push("--dangerously-skip-permissions".to_string());
        }
        if let Some(session) = resume_session.filter(|id| !id.trim().is_empty()) {
            args.push("--resume".to_string());
            args.push(session.to_string());
        }
        args.push(format!("@{}", stage_file.display()));
        args.push(instruction.clone());

        Ok(Self {
            program: config.command.clone(),
            args,
            workdir: workdir.to_path_buf(),
            task: task.to_string(),
            stage,
            stage_file: stage_file.to_path_buf(),
            instruction,
        })
    }

    /// Shell-quoted rendering for display and dry runs.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(shell_quote)
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).current_dir(&self.workdir);
        cmd
    }
}

fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./@:=".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("\"{}\"", arg.replace('\\', "\\\\").replace('"', "\\\""))
    }
}

/// Render the stage instruction. `stage`, `task` and `stage_file` are in scope.
pub fn render_instruction(template: &str, task: &str, stage: u32, stage_file: &Path) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("instruction", template)
        .context("parse agent.instruction_template")?;
    let rendered = env
        .get_template("instruction")?
        .render(context! {
            stage => stage,
            task => task,
            stage_file => stage_file.display().to_string(),
        })
        .context("render agent.instruction_template")?;
    Ok(rendered.trim().to_string())
}

/// Result of a foreground agent run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRun {
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    /// Captured stdout (bounded).
    pub output: String,
}

impl AgentRun {
    /// Clean exit with `output`.
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            timed_out: false,
            output: output.into(),
        }
    }

    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Abstraction over how the agent process is started.
pub trait AgentLauncher {
    /// Start the agent and return immediately.
    fn spawn_detached(&self, invocation: &AgentInvocation) -> Result<()>;

    /// Run the agent in the foreground, appending its stdout to `transcript_path`.
    fn run_to_completion(
        &self,
        invocation: &AgentInvocation,
        timeout: Duration,
        output_limit_bytes: usize,
        transcript_path: &Path,
    ) -> Result<AgentRun>;
}

/// Launcher that spawns real processes.
pub struct ProcessLauncher;

impl AgentLauncher for ProcessLauncher {
    #[instrument(skip_all, fields(task = %invocation.task, stage = invocation.stage))]
    fn spawn_detached(&self, invocation: &AgentInvocation) -> Result<()> {
        info!(command = %invocation.command_line(), "launching agent");
        let pid = spawn_detached(invocation.to_command())
            .with_context(|| format!("launch agent `{}`", invocation.program))?;
        debug!(pid, "agent launched");
        Ok(())
    }

    #[instrument(skip_all, fields(task = %invocation.task, stage = invocation.stage, timeout_secs = timeout.as_secs()))]
    fn run_to_completion(
        &self,
        invocation: &AgentInvocation,
        timeout: Duration,
        output_limit_bytes: usize,
        transcript_path: &Path,
    ) -> Result<AgentRun> {
        info!(command = %invocation.command_line(), "running agent");
        let output = run_command_with_timeout(
            invocation.to_command(),
            timeout,
            output_limit_bytes,
            Some(transcript_path),
        )
        .with_context(|| format!("run agent `{}`", invocation.program))?;
        if output.timed_out {
            warn!(timeout_secs = timeout.as_secs(), "agent timed out");
        } else if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "agent exited with failure");
        }
        Ok(AgentRun {
            exit_code: output.status.code(),
            timed_out: output.timed_out,
            output: String::from_utf8_lossy(&output.stdout).into_owned(),
        })
    }
}
