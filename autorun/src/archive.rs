//! Archiving finished tasks.
//!
//! `archive/<task>-<timestamp>/` receives the session record, the plan
//! metadata directory, the foreground transcript and (optionally) the plan
//! itself. Snapshots, recovery points and execution state are deleted.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::context::RunContext;
use crate::core::types::SessionStatus;
use crate::error::AutorunError;
use crate::io::atomic::{remove_dir_if_exists, remove_file_if_exists};
use crate::io::execution_state::clear_execution_state;
use crate::io::recovery_points::cleanup_recovery_points;

#[derive(Debug, Clone, Copy, Default)]
pub struct ArchiveOptions {
    /// Archive a task that has not completed.
    pub force: bool,
    /// Move the plan file or directory into the archive too.
    pub include_plan: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveReport {
    pub task: String,
    pub archive_dir: PathBuf,
    /// Archive-relative names of what was moved in.
    pub archived: Vec<String>,
}

pub fn archive_task(ctx: RunContext<'_>, task: &str, options: ArchiveOptions) -> Result<ArchiveReport> {
    let session = ctx.sessions().require(task)?;
    if session.status != SessionStatus::Completed && !options.force {
        return Err(AutorunError::invalid_argument(
            "status",
            "a completed task (or --force)",
            session.status,
        )
        .into());
    }
    let plan_path = ctx.recorded_plan_path(task)?;

    let stamp = ctx.clock.now().format("%Y%m%dT%H%M%SZ");
    let archive_dir = ctx.paths.archive_dir.join(format!("{task}-{stamp}"));
    fs::create_dir_all(&archive_dir)
        .with_context(|| format!("create directory {}", archive_dir.display()))?;

    let mut archived = Vec::new();
    let mut archive = |source: &Path, name: &str| -> Result<()> {
        if !source.exists() {
            return Ok(());
        }
        move_path(source, &archive_dir.join(name))?;
        archived.push(name.to_string());
        Ok(())
    };
    archive(&ctx.paths.session_path(task), "session.json")?;
    archive(&ctx.paths.plan_dir(task), "plan-metadata")?;
    archive(&ctx.paths.transcript_log_path(task), "transcript.log")?;
    if options.include_plan
        && let Some(plan) = &plan_path
        && let Some(name) = plan.file_name().and_then(|name| name.to_str())
    {
        archive(plan, &format!("plan/{name}"))?;
    }

    remove_file_if_exists(&ctx.paths.marker_path(task))?;
    clear_execution_state(ctx.paths, task)?;
    cleanup_recovery_points(ctx.paths, task)?;
    ctx.snapshots().delete_all(task)?;

    info!(task, archive = %archive_dir.display(), items = archived.len(), "task archived");
    Ok(ArchiveReport {
        task: task.to_string(),
        archive_dir,
        archived,
    })
}

/// Rename, falling back to copy and delete across filesystems.
fn move_path(source: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    }
    if fs::rename(source, dest).is_ok() {
        return Ok(());
    }
    debug!(source = %source.display(), "rename failed; copying instead");
    if source.is_dir() {
        for entry in WalkDir::new(source) {
            let entry = entry.with_context(|| format!("walk {}", source.display()))?;
            let relative = entry
                .path()
                .strip_prefix(source)
                .with_context(|| format!("relativize {}", entry.path().display()))?;
            let target = dest.join(relative);
            if entry.file_type().is_dir() {
                fs::create_dir_all(&target)
                    .with_context(|| format!("create directory {}", target.display()))?;
            } else {
                fs::copy(entry.path(), &target)
                    .with_context(|| format!("copy {}", entry.path().display()))?;
            }
        }
        remove_dir_if_exists(source)?;
    } else {
        fs::copy(source, dest).with_context(|| format!("copy {}", source.display()))?;
        remove_file_if_exists(source)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestEnv;

    #[test]
    fn completed_task_is_moved_into_archive() {
        let env = TestEnv::with_split_plan("demo", 2, 1);
        env.track_plan();
        let ctx = env.ctx();
        ctx.sessions()
            .set_status("demo", SessionStatus::Completed, None, false)
            .expect("complete");

        let report = archive_task(ctx, "demo", ArchiveOptions::default()).expect("archive");
        assert!(report.archive_dir.starts_with(&env.paths.archive_dir));
        assert!(report.archive_dir.join("session.json").is_file());
        assert!(report.archive_dir.join("plan-metadata/metadata.json").is_file());
        assert_eq!(report.archived, vec!["session.json", "plan-metadata"]);

        assert!(!ctx.sessions().exists("demo"));
        assert!(!env.paths.plan_snapshots_dir("demo").exists());
        assert!(!env.paths.plan_recovery_dir("demo").exists());
        // Plan stays where it was.
        assert!(env.plan.join("README.md").is_file());
    }

    #[test]
    fn unfinished_task_needs_force() {
        let env = TestEnv::with_split_plan("demo", 2, 1);
        env.track_plan();
        let err = archive_task(env.ctx(), "demo", ArchiveOptions::default()).unwrap_err();
        assert!(matches!(
            crate::error::find_autorun_error(&err),
            Some(AutorunError::InvalidArgument { .. })
        ));

        let report = archive_task(
            env.ctx(),
            "demo",
            ArchiveOptions {
                force: true,
                include_plan: true,
            },
        )
        .expect("forced archive");
        assert!(report.archive_dir.join("plan/demo/README.md").is_file());
        assert!(!env.plan.exists());
    }
}
