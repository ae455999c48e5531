//! Recovery point records (`<home>/recovery/<plan>/stage-<n>.json`).

use std::fs;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::atomic::{read_json, remove_dir_if_exists, remove_file_if_exists, write_json_atomic};
use super::paths::{AutorunPaths, parse_stage_file_name, validate_task_name};
use crate::core::types::RecoveryPointStatus;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryPoint {
    pub plan_id: String,
    pub stage: u32,
    pub created_at: DateTime<Utc>,
    pub status: RecoveryPointStatus,
    /// Files captured by the stage snapshot, when one was taken.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_count: Option<usize>,
}

pub fn create_recovery_point(
    paths: &AutorunPaths,
    plan_id: &str,
    stage: u32,
    created_at: DateTime<Utc>,
    file_count: Option<usize>,
) -> Result<RecoveryPoint> {
    validate_task_name(plan_id)?;
    let point = RecoveryPoint {
        plan_id: plan_id.to_string(),
        stage,
        created_at,
        status: RecoveryPointStatus::Available,
        file_count,
    };
    write_json_atomic(&paths.recovery_point_path(plan_id, stage), &point)?;
    debug!(plan_id, stage, "recovery point created");
    Ok(point)
}

/// `Ok(None)` when no record exists for `(plan_id, stage)`.
pub fn load_recovery_point(
    paths: &AutorunPaths,
    plan_id: &str,
    stage: u32,
) -> Result<Option<RecoveryPoint>> {
    validate_task_name(plan_id)?;
    let path = paths.recovery_point_path(plan_id, stage);
    if !path.is_file() {
        return Ok(None);
    }
    read_json(&path).map(Some)
}

/// All recovery points for a plan, sorted by stage.
///
/// Unreadable records are reported as `corrupted`; records whose stage
/// snapshot has been pruned are reported as `missing`.
pub fn list_recovery_points(paths: &AutorunPaths, plan_id: &str) -> Result<Vec<RecoveryPoint>> {
    validate_task_name(plan_id)?;
    let dir = paths.plan_recovery_dir(plan_id);
    if !dir.is_dir() {
        debug!(plan_id, "no recovery points");
        return Ok(Vec::new());
    }

    let mut points = Vec::new();
    for entry in fs::read_dir(&dir).with_context(|| format!("read {}", dir.display()))? {
        let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
        let path = entry.path();
        let Some(stage) = parse_stage_file_name(&path) else {
            continue;
        };
        match read_json::<RecoveryPoint>(&path) {
            Ok(mut point) => {
                if point.status == RecoveryPointStatus::Available
                    && !paths.manifest_path(plan_id, stage).is_file()
                {
                    point.status = RecoveryPointStatus::Missing;
                }
                points.push(point);
            }
            Err(err) => {
                warn!(plan_id, stage, error = %format!("{err:#}"), "unreadable recovery point");
                let created_at = entry
                    .metadata()
                    .and_then(|meta| meta.modified())
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_default();
                points.push(RecoveryPoint {
                    plan_id: plan_id.to_string(),
                    stage,
                    created_at,
                    status: RecoveryPointStatus::Corrupted,
                    file_count: None,
                });
            }
        }
    }
    points.sort_by_key(|point| point.stage);
    Ok(points)
}

pub fn remove_recovery_point(paths: &AutorunPaths, plan_id: &str, stage: u32) -> Result<bool> {
    validate_task_name(plan_id)?;
    remove_file_if_exists(&paths.recovery_point_path(plan_id, stage))
}

/// Remove every recovery point for a plan.
pub fn cleanup_recovery_points(paths: &AutorunPaths, plan_id: &str) -> Result<bool> {
    validate_task_name(plan_id)?;
    let removed = remove_dir_if_exists(&paths.plan_recovery_dir(plan_id))?;
    if removed {
        debug!(plan_id, "recovery points removed");
    }
    Ok(removed)
}
