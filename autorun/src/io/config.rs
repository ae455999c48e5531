//! Autorun configuration stored at `<home>/config.toml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::atomic::write_atomic;

/// Autorun configuration (TOML).
///
/// Hand-edited. Missing fields fall back to the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AutorunConfig {
    /// Lines from the end of the transcript scanned for markers and errors.
    pub transcript_tail_lines: usize,

    /// A plan document modified this recently counts as a completed stage.
    pub completion_window_secs: u64,

    /// Upper bound on waiting for hook input on stdin.
    pub hook_stdin_timeout_secs: u64,

    pub snapshot: SnapshotConfig,
    pub agent: AgentConfig,
    pub watch: WatchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Most recent snapshots kept by cleanup (first and last are always kept).
    pub retention: usize,
    pub compression_age_days: u64,
    /// Exceeding this only logs a warning.
    pub max_snapshot_bytes: u64,
    /// Paths (relative to the project directory) captured at each stage.
    pub include: Vec<String>,
    /// Directory or file names skipped while walking `include`.
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Program used to launch the coding agent.
    pub command: String,
    pub skip_permissions: bool,
    /// minijinja template; `stage`, `task` and `stage_file` are in scope.
    pub instruction_template: String,
    /// Wall-clock budget for foreground (`autorun run`) invocations.
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WatchConfig {
    pub interval_secs: u64,
}

impl Default for AutorunConfig {
    fn default() -> Self {
        Self {
            transcript_tail_lines: 100,
            completion_window_secs: 15,
            hook_stdin_timeout_secs: 10,
            snapshot: SnapshotConfig::default(),
            agent: AgentConfig::default(),
            watch: WatchConfig::default(),
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            retention: 5,
            compression_age_days: 7,
            max_snapshot_bytes: 500 * 1024 * 1024,
            include: vec![".".to_string()],
            exclude: [".git", "target", "node_modules", ".autorun"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            skip_permissions: true,
            instruction_template: "Start executing Stage {{ stage }}".to_string(),
            timeout_secs: 60 * 60,
            output_limit_bytes: 100_000,
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self { interval_secs: 2 }
    }
}

impl AutorunConfig {
    pub fn validate(&self) -> Result<()> {
        if self.transcript_tail_lines == 0 {
            return Err(anyhow!("transcript_tail_lines must be > 0"));
        }
        if self.hook_stdin_timeout_secs == 0 {
            return Err(anyhow!("hook_stdin_timeout_secs must be > 0"));
        }
        if self.agent.command.trim().is_empty() {
            return Err(anyhow!("agent.command must not be empty"));
        }
        if self.agent.instruction_template.trim().is_empty() {
            return Err(anyhow!("agent.instruction_template must not be empty"));
        }
        if self.agent.timeout_secs == 0 {
            return Err(anyhow!("agent.timeout_secs must be > 0"));
        }
        if self.agent.output_limit_bytes == 0 {
            return Err(anyhow!("agent.output_limit_bytes must be > 0"));
        }
        if self.watch.interval_secs == 0 {
            return Err(anyhow!("watch.interval_secs must be > 0"));
        }
        if self.snapshot.include.is_empty() {
            return Err(anyhow!("snapshot.include must list at least one path"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `AutorunConfig::default()`.
pub fn load_config(path: &Path) -> Result<AutorunConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "config missing, using defaults");
        let cfg = AutorunConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: AutorunConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

pub fn write_config(path: &Path, cfg: &AutorunConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}
