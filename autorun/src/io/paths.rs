//! Canonical locations under the autorun home directory.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::error::AutorunError;

/// Directory name used under the user's home when no override is given.
pub const DEFAULT_HOME_DIR: &str = ".autorun";

/// All canonical paths within the autorun home (default `~/.autorun`).
#[derive(Debug, Clone)]
pub struct AutorunPaths {
    pub home: PathBuf,
    pub config_path: PathBuf,
    pub sessions_dir: PathBuf,
    pub snapshots_dir: PathBuf,
    pub recovery_dir: PathBuf,
    pub state_dir: PathBuf,
    pub plans_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub transcripts_dir: PathBuf,
}

impl AutorunPaths {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        Self {
            config_path: home.join("config.toml"),
            sessions_dir: home.join("sessions"),
            snapshots_dir: home.join("snapshots"),
            recovery_dir: home.join("recovery"),
            state_dir: home.join("state"),
            plans_dir: home.join("plans"),
            archive_dir: home.join("archive"),
            transcripts_dir: home.join("transcripts"),
            home,
        }
    }

    /// `--home`/`AUTORUN_HOME` when given, else `~/.autorun`.
    pub fn resolve(explicit: Option<PathBuf>) -> Result<Self> {
        let home = match explicit {
            Some(home) => home,
            None => dirs::home_dir()
                .context("cannot determine home directory; pass --home")?
                .join(DEFAULT_HOME_DIR),
        };
        Ok(Self::new(home))
    }

    pub fn session_path(&self, task: &str) -> PathBuf {
        self.sessions_dir.join(format!("{task}.json"))
    }

    pub fn marker_path(&self, task: &str) -> PathBuf {
        self.sessions_dir.join(format!("{task}.stage-complete"))
    }

    pub fn plan_snapshots_dir(&self, plan_id: &str) -> PathBuf {
        self.snapshots_dir.join(plan_id)
    }

    pub fn snapshot_dir(&self, plan_id: &str, stage: u32) -> PathBuf {
        self.plan_snapshots_dir(plan_id).join(format!("stage-{stage}"))
    }

    pub fn manifest_path(&self, plan_id: &str, stage: u32) -> PathBuf {
        self.snapshot_dir(plan_id, stage).join("manifest.json")
    }

    pub fn plan_recovery_dir(&self, plan_id: &str) -> PathBuf {
        self.recovery_dir.join(plan_id)
    }

    pub fn recovery_point_path(&self, plan_id: &str, stage: u32) -> PathBuf {
        self.plan_recovery_dir(plan_id)
            .join(format!("stage-{stage}.json"))
    }

    pub fn execution_state_path(&self, plan_id: &str) -> PathBuf {
        self.state_dir.join(format!("{plan_id}.json"))
    }

    pub fn plan_dir(&self, plan_id: &str) -> PathBuf {
        self.plans_dir.join(plan_id)
    }

    pub fn metadata_path(&self, plan_id: &str) -> PathBuf {
        self.plan_dir(plan_id).join("metadata.json")
    }

    pub fn transcript_log_path(&self, task: &str) -> PathBuf {
        self.transcripts_dir.join(format!("{task}.log"))
    }
}

/// Task names become file names, so they are restricted to `[A-Za-z0-9._-]`.
pub fn validate_task_name(task: &str) -> Result<(), AutorunError> {
    let invalid = |reason: &str| {
        Err(AutorunError::invalid_argument(
            "task",
            format!("a name of [A-Za-z0-9._-] ({reason})"),
            task,
        ))
    };
    if task.is_empty() {
        return invalid("must not be empty");
    }
    if task == "." || task == ".." {
        return invalid("must not be a relative path component");
    }
    if task
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'))
    {
        return invalid("unsupported character");
    }
    Ok(())
}

/// Strip a leading `stage-` directory name to its number.
pub fn parse_stage_dir_name(name: &str) -> Option<u32> {
    name.strip_prefix("stage-")?.parse().ok()
}

/// Stage number from a `stage-<n>.json` recovery point file name.
pub fn parse_stage_file_name(path: &Path) -> Option<u32> {
    if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
        return None;
    }
    parse_stage_dir_name(path.file_stem()?.to_str()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_stable() {
        let paths = AutorunPaths::new("/h");
        assert_eq!(paths.session_path("demo"), PathBuf::from("/h/sessions/demo.json"));
        assert_eq!(
            paths.marker_path("demo"),
            PathBuf::from("/h/sessions/demo.stage-complete")
        );
        assert_eq!(
            paths.manifest_path("demo", 3),
            PathBuf::from("/h/snapshots/demo/stage-3/manifest.json")
        );
        assert_eq!(
            paths.recovery_point_path("demo", 2),
            PathBuf::from("/h/recovery/demo/stage-2.json")
        );
        assert_eq!(paths.execution_state_path("demo"), PathBuf::from("/h/state/demo.json"));
        assert_eq!(
            paths.metadata_path("demo"),
            PathBuf::from("/h/plans/demo/metadata.json")
        );
    }

    #[test]
    fn task_names_reject_path_tricks() {
        assert!(validate_task_name("my-plan_2.v1").is_ok());
        assert!(validate_task_name("").is_err());
        assert!(validate_task_name("..").is_err());
        assert!(validate_task_name("a/b").is_err());
        assert!(validate_task_name("a b").is_err());
    }

    #[test]
    fn parses_stage_names() {
        assert_eq!(parse_stage_dir_name("stage-12"), Some(12));
        assert_eq!(parse_stage_dir_name("stage-x"), None);
        assert_eq!(parse_stage_file_name(Path::new("stage-4.json")), Some(4));
        assert_eq!(parse_stage_file_name(Path::new("stage-4.json.tmp")), None);
    }
}
