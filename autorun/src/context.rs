//! Injected dependencies shared by the orchestration modules.

use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::{debug, info};

use crate::core::clock::Clock;
use crate::io::config::AutorunConfig;
use crate::io::metadata::MetadataStore;
use crate::io::paths::AutorunPaths;
use crate::io::plan::{PlanData, detect_architecture, header_path, update_progress};
use crate::io::session_store::{Session, SessionStore};
use crate::io::snapshot::SnapshotManager;
use crate::io::transcript::modified_at;

/// Paths, configuration and time source for one CLI invocation.
#[derive(Clone, Copy)]
pub struct RunContext<'a> {
    pub paths: &'a AutorunPaths,
    pub config: &'a AutorunConfig,
    pub clock: &'a dyn Clock,
}

impl<'a> RunContext<'a> {
    pub fn new(paths: &'a AutorunPaths, config: &'a AutorunConfig, clock: &'a dyn Clock) -> Self {
        Self {
            paths,
            config,
            clock,
        }
    }

    pub fn sessions(&self) -> SessionStore<'a> {
        SessionStore::new(self.paths, self.clock)
    }

    pub fn metadata(&self) -> MetadataStore<'a> {
        MetadataStore::new(self.paths, self.clock)
    }

    pub fn snapshots(&self) -> SnapshotManager<'a> {
        SnapshotManager::new(self.paths, &self.config.snapshot, self.clock)
    }

    /// Load the task's session, creating it (with metadata and a stage
    /// snapshot) on first sight of the plan.
    pub fn ensure_session(&self, plan: &PlanData, project_root: &Path) -> Result<Session> {
        let task = plan.task_name();
        let sessions = self.sessions();
        let session = match sessions.load(&task)? {
            Some(session) => session,
            None => {
                let session =
                    sessions.create(&task, plan.config.current, plan.config.stages)?;
                let include = self.snapshot_include();
                self.snapshots()
                    .create_snapshot(&task, plan.config.current, project_root, &include)?;
                info!(task = %task, stage = plan.config.current, "tracking new plan");
                session
            }
        };
        self.metadata().ensure(
            &task,
            &plan.root,
            plan.config.stages,
            plan.progress.completed,
        )?;
        Ok(session)
    }

    /// Rewrite the plan header's `current` stage and record the mtime this
    /// write left, so later header edits can be told apart from it.
    pub fn write_current_stage(&self, task: &str, plan_root: &Path, stage: u32) -> Result<()> {
        update_progress(plan_root, stage)?;
        let written = modified_at(&header_path(plan_root)?)?;
        self.metadata().update(task, |metadata| {
            metadata.header_written_at = Some(written);
        })?;
        Ok(())
    }

    pub fn snapshot_include(&self) -> Vec<PathBuf> {
        self.config
            .snapshot
            .include
            .iter()
            .map(PathBuf::from)
            .collect()
    }

    /// Plan location recorded for a task, if it still exists on disk.
    pub fn recorded_plan_path(&self, task: &str) -> Result<Option<PathBuf>> {
        let Some(metadata) = self.metadata().load(task)? else {
            return Ok(None);
        };
        if detect_architecture(&metadata.plan_path).is_some() {
            Ok(Some(metadata.plan_path))
        } else {
            debug!(task, plan = %metadata.plan_path.display(), "recorded plan path is gone");
            Ok(None)
        }
    }
}
