//! Per-task session records (`<home>/sessions/<task>.json`).
//!
//! The store is the only writer of session files. Every mutation stamps
//! `last_executed` and replaces the file atomically.

use std::collections::BTreeMap;
use std::fs;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::atomic::{read_json_if_exists, remove_file_if_exists, write_json_atomic};
use super::paths::{AutorunPaths, validate_task_name};
use crate::core::clock::Clock;
use crate::core::transitions::{allowed_targets, can_transition};
use crate::core::types::SessionStatus;
use crate::error::AutorunError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub task_name: String,
    pub status: SessionStatus,
    pub current_stage: u32,
    #[serde(default)]
    pub total_stages: u32,
    /// Auto-continuations since the last reset; compared against the safety limit.
    pub count: u32,
    pub last_session_id: Option<String>,
    pub last_error: Option<String>,
    #[serde(default)]
    pub skipped_stages: Vec<u32>,
    #[serde(default)]
    pub retry_count: BTreeMap<u32, u32>,
    pub last_executed: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rolled_back_from: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aborted_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(task_name: &str, current_stage: u32, total_stages: u32, now: DateTime<Utc>) -> Self {
        Self {
            task_name: task_name.to_string(),
            status: SessionStatus::Active,
            current_stage,
            total_stages,
            count: 0,
            last_session_id: None,
            last_error: None,
            skipped_stages: Vec::new(),
            retry_count: BTreeMap::new(),
            last_executed: now,
            rolled_back_from: None,
            skip_reason: None,
            abort_reason: None,
            aborted_at: None,
        }
    }
}

pub struct SessionStore<'a> {
    paths: &'a AutorunPaths,
    clock: &'a dyn Clock,
}

impl<'a> SessionStore<'a> {
    pub fn new(paths: &'a AutorunPaths, clock: &'a dyn Clock) -> Self {
        Self { paths, clock }
    }

    pub fn exists(&self, task: &str) -> bool {
        self.paths.session_path(task).is_file()
    }

    pub fn load(&self, task: &str) -> Result<Option<Session>> {
        validate_task_name(task)?;
        let path = self.paths.session_path(task);
        let session: Option<Session> = read_json_if_exists(&path)?;
        if let Some(session) = &session {
            debug!(task, status = %session.status, stage = session.current_stage, count = session.count, "session loaded");
        }
        Ok(session)
    }

    /// Load a session or fail with [`AutorunError::SessionNotFound`].
    pub fn require(&self, task: &str) -> Result<Session> {
        self.load(task)?
            .ok_or_else(|| AutorunError::session_not_found(task).into())
    }

    pub fn create(&self, task: &str, current_stage: u32, total_stages: u32) -> Result<Session> {
        validate_task_name(task)?;
        let session = Session::new(task, current_stage, total_stages, self.clock.now());
        write_json_atomic(&self.paths.session_path(task), &session)?;
        info!(task, current_stage, total_stages, "session created");
        Ok(session)
    }

    /// Write a full record, stamping `last_executed`.
    pub fn save(&self, session: &mut Session) -> Result<()> {
        validate_task_name(&session.task_name)?;
        session.last_executed = self.clock.now();
        write_json_atomic(&self.paths.session_path(&session.task_name), session)
    }

    /// Load, mutate, save. Fails if the session does not exist.
    pub fn update<F>(&self, task: &str, mutate: F) -> Result<Session>
    where
        F: FnOnce(&mut Session),
    {
        let mut session = self.require(task)?;
        mutate(&mut session);
        self.save(&mut session)?;
        Ok(session)
    }

    pub fn increment_count(&self, task: &str) -> Result<Session> {
        let session = self.update(task, |session| session.count = session.count.saturating_add(1))?;
        debug!(task, count = session.count, "session count incremented");
        Ok(session)
    }

    pub fn reset_count(&self, task: &str) -> Result<Session> {
        self.update(task, |session| session.count = 0)
    }

    /// Move to `status`, rejecting transitions the state machine forbids.
    ///
    /// `error` is recorded as `last_error` when given; it is cleared when the
    /// session goes back to `active`.
    pub fn set_status(
        &self,
        task: &str,
        status: SessionStatus,
        error: Option<&str>,
        force: bool,
    ) -> Result<Session> {
        let mut session = self.require(task)?;
        ensure_transition(&session, status, force)?;
        let from = session.status;
        session.status = status;
        match error {
            Some(message) => session.last_error = Some(message.to_string()),
            None if status == SessionStatus::Active => session.last_error = None,
            None => {}
        }
        self.save(&mut session)?;
        info!(task, from = %from, to = %status, "session status changed");
        Ok(session)
    }

    /// All sessions, sorted by task name.
    pub fn list(&self) -> Result<Vec<Session>> {
        let dir = &self.paths.sessions_dir;
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut sessions = Vec::new();
        for entry in fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
            let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let Some(task) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            if let Some(session) = self.load(task)? {
                sessions.push(session);
            }
        }
        sessions.sort_by(|a, b| a.task_name.cmp(&b.task_name));
        Ok(sessions)
    }

    pub fn delete(&self, task: &str) -> Result<bool> {
        validate_task_name(task)?;
        let removed = remove_file_if_exists(&self.paths.session_path(task))?;
        if removed {
            info!(task, "session deleted");
        }
        Ok(removed)
    }
}

/// Check the session state machine for `session.status -> to`.
pub fn ensure_transition(session: &Session, to: SessionStatus, force: bool) -> Result<()> {
    if can_transition(session.status, to, force) {
        return Ok(());
    }
    let allowed: Vec<&str> = allowed_targets(session.status)
        .into_iter()
        .map(SessionStatus::as_str)
        .collect();
    let expected = if allowed.is_empty() {
        format!("no transition from {} without --force", session.status)
    } else {
        format!("one of {}", allowed.join("|"))
    };
    Err(AutorunError::invalid_argument("status", expected, format!("{} -> {to}", session.status)).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fixed_clock, later_clock};

    #[test]
    fn create_writes_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = AutorunPaths::new(temp.path());
        let clock = fixed_clock();
        let store = SessionStore::new(&paths, &clock);

        let session = store.create("demo", 1, 3).expect("create");
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.count, 0);
        assert_eq!(session.current_stage, 1);
        assert!(session.last_session_id.is_none());
        assert!(session.last_error.is_none());

        let contents = fs::read_to_string(paths.session_path("demo")).expect("read");
        assert!(contents.contains("\"taskName\": \"demo\""));
        assert!(contents.contains("\"lastExecuted\""));
        assert!(!contents.contains("abortReason"));
        assert_eq!(store.require("demo").expect("load"), session);
    }

    #[test]
    fn missing_session_is_typed_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = AutorunPaths::new(temp.path());
        let clock = fixed_clock();
        let store = SessionStore::new(&paths, &clock);

        assert!(store.load("ghost").expect("load").is_none());
        let err = store.require("ghost").unwrap_err();
        assert_eq!(
            err.downcast_ref::<AutorunError>(),
            Some(&AutorunError::session_not_found("ghost"))
        );
    }

    #[test]
    fn updates_stamp_last_executed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = AutorunPaths::new(temp.path());
        let clock = fixed_clock();
        SessionStore::new(&paths, &clock).create("demo", 1, 3).expect("create");

        let later = later_clock(60);
        let store = SessionStore::new(&paths, &later);
        let session = store.increment_count("demo").expect("increment");
        assert_eq!(session.count, 1);
        assert_eq!(session.last_executed, later.0);
    }

    #[test]
    fn failed_status_records_error_and_active_clears_it() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = AutorunPaths::new(temp.path());
        let clock = fixed_clock();
        let store = SessionStore::new(&paths, &clock);
        store.create("demo", 2, 3).expect("create");

        let failed = store
            .set_status("demo", SessionStatus::Failed, Some("error: boom"), false)
            .expect("fail");
        assert_eq!(failed.last_error.as_deref(), Some("error: boom"));

        let active = store
            .set_status("demo", SessionStatus::Active, None, false)
            .expect("activate");
        assert!(active.last_error.is_none());
    }

    #[test]
    fn aborted_requires_force_to_reactivate() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = AutorunPaths::new(temp.path());
        let clock = fixed_clock();
        let store = SessionStore::new(&paths, &clock);
        store.create("demo", 1, 3).expect("create");
        store
            .set_status("demo", SessionStatus::Aborted, None, false)
            .expect("abort");

        let err = store
            .set_status("demo", SessionStatus::Active, None, false)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AutorunError>(),
            Some(AutorunError::InvalidArgument { .. })
        ));
        store
            .set_status("demo", SessionStatus::Active, None, true)
            .expect("forced");
    }

    #[test]
    fn list_skips_markers_and_sorts() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = AutorunPaths::new(temp.path());
        let clock = fixed_clock();
        let store = SessionStore::new(&paths, &clock);
        store.create("zeta", 1, 2).expect("create");
        store.create("alpha", 1, 2).expect("create");
        fs::write(paths.marker_path("alpha"), "1").expect("marker");

        let names: Vec<String> = store
            .list()
            .expect("list")
            .into_iter()
            .map(|s| s.task_name)
            .collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        assert!(store.delete("zeta").expect("delete"));
        assert!(!store.exists("zeta"));
    }
}
