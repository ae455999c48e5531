//! Execution state captured across a pause/resume window (`<home>/state/<plan>.json`).

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::atomic::{read_json_if_exists, remove_file_if_exists, write_json_atomic};
use super::paths::{AutorunPaths, validate_task_name};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionState {
    pub plan_id: String,
    pub current_stage: u32,
    pub total_stages: u32,
    /// Task whose session record this state was captured from.
    pub session_id: String,
    /// Agent conversation to resume, if one was recorded.
    pub agent_session_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub paused_at: DateTime<Utc>,
    pub completed_stages: Vec<u32>,
    pub skipped_stages: Vec<u32>,
}

pub fn load_execution_state(paths: &AutorunPaths, plan_id: &str) -> Result<Option<ExecutionState>> {
    validate_task_name(plan_id)?;
    read_json_if_exists(&paths.execution_state_path(plan_id))
}

pub fn save_execution_state(paths: &AutorunPaths, state: &ExecutionState) -> Result<()> {
    validate_task_name(&state.plan_id)?;
    debug!(plan_id = %state.plan_id, stage = state.current_stage, "saving execution state");
    write_json_atomic(&paths.execution_state_path(&state.plan_id), state)
}

pub fn clear_execution_state(paths: &AutorunPaths, plan_id: &str) -> Result<bool> {
    validate_task_name(plan_id)?;
    remove_file_if_exists(&paths.execution_state_path(plan_id))
}
