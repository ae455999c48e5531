//! Plan metadata (`<home>/plans/<plan>/metadata.json`).

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::atomic::{read_json_if_exists, write_json_atomic};
use super::paths::{AutorunPaths, validate_task_name};
use crate::core::clock::Clock;
use crate::core::types::{PauseReason, PlanStatus};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PlanMetadata {
    pub plan_id: String,
    /// Plan file or directory the task was started from.
    pub plan_path: PathBuf,
    pub status: PlanStatus,
    pub total_stages: u32,
    pub completed_stages: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub paused_at: Option<DateTime<Utc>>,
    pub resumed_at: Option<DateTime<Utc>>,
    pub pause_reason: Option<PauseReason>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Header modification time left by autorun's last write of `current`.
    #[serde(default)]
    pub header_written_at: Option<DateTime<Utc>>,
}

pub struct MetadataStore<'a> {
    paths: &'a AutorunPaths,
    clock: &'a dyn Clock,
}

impl<'a> MetadataStore<'a> {
    pub fn new(paths: &'a AutorunPaths, clock: &'a dyn Clock) -> Self {
        Self { paths, clock }
    }

    pub fn load(&self, plan_id: &str) -> Result<Option<PlanMetadata>> {
        validate_task_name(plan_id)?;
        read_json_if_exists(&self.paths.metadata_path(plan_id))
    }

    pub fn exists(&self, plan_id: &str) -> bool {
        self.paths.metadata_path(plan_id).is_file()
    }

    /// Create the record on first sight of a plan; otherwise refresh progress fields.
    pub fn ensure(
        &self,
        plan_id: &str,
        plan_path: &Path,
        total_stages: u32,
        completed_stages: u32,
    ) -> Result<PlanMetadata> {
        let now = self.clock.now();
        let mut metadata = match self.load(plan_id)? {
            Some(existing) => existing,
            None => {
                debug!(plan_id, plan = %plan_path.display(), "creating plan metadata");
                PlanMetadata {
                    plan_id: plan_id.to_string(),
                    plan_path: plan_path.to_path_buf(),
                    status: PlanStatus::Running,
                    total_stages,
                    completed_stages,
                    created_at: now,
                    updated_at: now,
                    paused_at: None,
                    resumed_at: None,
                    pause_reason: None,
                    completed_at: None,
                    header_written_at: None,
                }
            }
        };
        metadata.plan_path = plan_path.to_path_buf();
        metadata.total_stages = total_stages;
        metadata.completed_stages = completed_stages;
        metadata.updated_at = now;
        write_json_atomic(&self.paths.metadata_path(plan_id), &metadata)?;
        Ok(metadata)
    }

    /// Every readable record under `plans/`, sorted by plan id.
    pub fn list(&self) -> Result<Vec<PlanMetadata>> {
        let dir = &self.paths.plans_dir;
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        for entry in fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
            let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
            let Some(plan_id) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if !entry.path().is_dir() || validate_task_name(&plan_id).is_err() {
                continue;
            }
            if let Some(metadata) = self.load(&plan_id)? {
                records.push(metadata);
            }
        }
        records.sort_by(|a, b| a.plan_id.cmp(&b.plan_id));
        Ok(records)
    }

    /// Load, mutate, save. `Ok(None)` when there is no record to update.
    pub fn update<F>(&self, plan_id: &str, mutate: F) -> Result<Option<PlanMetadata>>
    where
        F: FnOnce(&mut PlanMetadata),
    {
        let Some(mut metadata) = self.load(plan_id)? else {
            return Ok(None);
        };
        mutate(&mut metadata);
        metadata.updated_at = self.clock.now();
        write_json_atomic(&self.paths.metadata_path(plan_id), &metadata)?;
        Ok(Some(metadata))
    }
}
