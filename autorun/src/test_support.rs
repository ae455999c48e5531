//! Test-only fixtures: plan writers, frozen clocks, a scripted agent launcher
//! and a throwaway home/project environment.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::{TimeZone, Utc};
use tempfile::TempDir;

use crate::context::RunContext;
use crate::core::clock::FixedClock;
use crate::io::agent::{AgentInvocation, AgentLauncher, AgentRun};
use crate::io::config::AutorunConfig;
use crate::io::hook_input::HookInput;
use crate::io::paths::AutorunPaths;
use crate::io::plan::parse_plan;
use crate::io::session_store::Session;

/// 2025-01-15 09:30:00 UTC.
pub fn fixed_clock() -> FixedClock {
    FixedClock(
        Utc.with_ymd_and_hms(2025, 1, 15, 9, 30, 0)
            .single()
            .expect("valid fixed time"),
    )
}

/// [`fixed_clock`] moved forward by `secs`.
pub fn later_clock(secs: i64) -> FixedClock {
    FixedClock(fixed_clock().0 + chrono::Duration::seconds(secs))
}

fn header(stages: u32, current: u32, architecture: &str, safety_limit: u32) -> String {
    format!(
        "<!-- AUTO-RUN-CONFIG\n\
         stages: {stages}\n\
         current: {current}\n\
         task_type: feature\n\
         estimated_time: 2h\n\
         architecture: {architecture}\n\
         safety_limit: {safety_limit}\n\
         -->\n"
    )
}

/// Split plan `<dir>/<name>/` with `README.md` and `stages/NN-stage-N.md`.
pub fn write_split_plan(dir: &Path, name: &str, stages: u32, current: u32) -> PathBuf {
    write_split_plan_with_limit(dir, name, stages, current, 0)
}

pub fn write_split_plan_with_limit(
    dir: &Path,
    name: &str,
    stages: u32,
    current: u32,
    safety_limit: u32,
) -> PathBuf {
    let root = dir.join(name);
    fs::create_dir_all(root.join("stages")).expect("create stages dir");
    fs::write(
        root.join("README.md"),
        format!("# {name}\n\n{}\nPlan overview.\n", header(stages, current, "split", safety_limit)),
    )
    .expect("write README.md");
    for stage in 1..=stages {
        fs::write(
            root.join(format!("stages/{stage:02}-stage-{stage}.md")),
            format!("# Stage {stage}\n\nDo the work for stage {stage}.\n"),
        )
        .expect("write stage file");
    }
    root
}

/// Single-file plan `<dir>/<name>.md`.
pub fn write_single_plan(dir: &Path, name: &str, stages: u32, current: u32) -> PathBuf {
    fs::create_dir_all(dir).expect("create plan dir");
    let path = dir.join(format!("{name}.md"));
    let mut body = format!("# {name}\n\n{}\n", header(stages, current, "single", 0));
    for stage in 1..=stages {
        body.push_str(&format!("## Stage {stage}\n\nDo the work for stage {stage}.\n\n"));
    }
    fs::write(&path, body).expect("write single plan");
    path
}

/// Launcher that records invocations instead of starting processes.
///
/// Foreground runs replay queued [`AgentRun`]s in order and append their
/// output to the transcript path, as the real launcher does.
#[derive(Default)]
pub struct ScriptedLauncher {
    runs: RefCell<VecDeque<AgentRun>>,
    spawned: RefCell<Vec<AgentInvocation>>,
    ran: RefCell<Vec<AgentInvocation>>,
}

impl ScriptedLauncher {
    pub fn with_runs(runs: Vec<AgentRun>) -> Self {
        Self {
            runs: RefCell::new(runs.into()),
            ..Self::default()
        }
    }

    pub fn spawned(&self) -> Vec<AgentInvocation> {
        self.spawned.borrow().clone()
    }

    pub fn ran(&self) -> Vec<AgentInvocation> {
        self.ran.borrow().clone()
    }
}

impl AgentLauncher for ScriptedLauncher {
    fn spawn_detached(&self, invocation: &AgentInvocation) -> Result<()> {
        self.spawned.borrow_mut().push(invocation.clone());
        Ok(())
    }

    fn run_to_completion(
        &self,
        invocation: &AgentInvocation,
        _timeout: Duration,
        _output_limit_bytes: usize,
        transcript_path: &Path,
    ) -> Result<AgentRun> {
        self.ran.borrow_mut().push(invocation.clone());
        let run = self
            .runs
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("no scripted agent run left for stage {}", invocation.stage))?;
        if let Some(parent) = transcript_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(transcript_path)?;
        log.write_all(run.output.as_bytes())?;
        Ok(run)
    }
}

/// Temporary autorun home plus a project directory holding one plan.
pub struct TestEnv {
    pub temp: TempDir,
    pub paths: AutorunPaths,
    pub config: AutorunConfig,
    pub clock: FixedClock,
    /// Project root; also the hook's `cwd`.
    pub project: PathBuf,
    pub plan: PathBuf,
}

impl TestEnv {
    fn with_plan<F>(write: F) -> Self
    where
        F: FnOnce(&Path) -> PathBuf,
    {
        let temp = tempfile::tempdir().expect("tempdir");
        let project = temp.path().join("project");
        fs::create_dir_all(project.join("src")).expect("create project");
        fs::write(project.join("src/main.rs"), "fn main() {}\n").expect("write main.rs");
        let plan = write(&project);
        Self {
            paths: AutorunPaths::new(temp.path().join("home")),
            config: AutorunConfig::default(),
            clock: fixed_clock(),
            project,
            plan,
            temp,
        }
    }

    pub fn with_split_plan(name: &str, stages: u32, current: u32) -> Self {
        Self::with_plan(|project| write_split_plan(project, name, stages, current))
    }

    pub fn with_split_plan_limit(name: &str, stages: u32, current: u32, safety_limit: u32) -> Self {
        Self::with_plan(|project| {
            write_split_plan_with_limit(project, name, stages, current, safety_limit)
        })
    }

    pub fn with_single_plan(name: &str, stages: u32, current: u32) -> Self {
        Self::with_plan(|project| write_single_plan(project, name, stages, current))
    }

    pub fn ctx(&self) -> RunContext<'_> {
        RunContext::new(&self.paths, &self.config, &self.clock)
    }

    /// Register the plan the way the first hook run would.
    pub fn track_plan(&self) -> Session {
        let plan = parse_plan(&self.plan).expect("parse plan");
        self.ctx()
            .ensure_session(&plan, &self.project)
            .expect("ensure session")
    }

    pub fn write_transcript(&self, contents: &str) -> PathBuf {
        let path = self.temp.path().join("transcript.jsonl");
        fs::write(&path, contents).expect("write transcript");
        path
    }

    pub fn hook_input(&self, transcript: &Path) -> HookInput {
        HookInput {
            session_id: Some("sess-1".to_string()),
            transcript_path: Some(transcript.to_path_buf()),
            cwd: Some(self.project.clone()),
        }
    }

    /// Set the plan header's mtime to `secs_ago` before the frozen clock.
    pub fn touch_header(&self, secs_ago: i64) {
        let header = parse_plan(&self.plan).expect("parse plan").header_path;
        let mtime = self.clock.0 - chrono::Duration::seconds(secs_ago);
        let file = OpenOptions::new()
            .write(true)
            .open(&header)
            .expect("open header");
        file.set_modified(mtime.into()).expect("set mtime");
    }
}
