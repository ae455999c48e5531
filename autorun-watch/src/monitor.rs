//! Session monitor event loop.
//!
//! A `PollWatcher` on the sessions directory and a fixed interval tick feed a
//! single consumer. Each event re-reads the task's status and emits a frame
//! when something visible changed. A `watch` channel carries shutdown.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use autorun::context::RunContext;
use autorun::core::types::SessionStatus;
use autorun::error::{AutorunError, find_autorun_error};
use autorun::status::{TaskStatus, task_status};
use notify::{Event as NotifyEvent, EventKind, PollWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct MonitorOptions {
    pub interval: Duration,
    /// Stop once the task is paused or failed, not only when it is finished.
    pub exit_on_stop: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorExit {
    Shutdown,
    Finished(SessionStatus),
}

/// What one loop iteration observed.
#[derive(Debug, Clone)]
pub enum Observation {
    Waiting,
    Status(Box<TaskStatus>),
}

enum Trigger {
    SessionFile,
    Tick,
}

/// Fields whose change is worth a new frame.
type FrameKey = (SessionStatus, u32, u32, u32, Option<String>);

fn frame_key(status: &TaskStatus) -> FrameKey {
    (
        status.status,
        status.current_stage,
        status.total_stages,
        status.count,
        status.last_error.clone(),
    )
}

/// Read the task's status; a missing session is `Waiting`, not an error.
pub fn observe(ctx: RunContext<'_>, task: &str) -> Result<Observation> {
    match task_status(ctx, task) {
        Ok(status) => Ok(Observation::Status(Box::new(status))),
        Err(err) if matches!(find_autorun_error(&err), Some(AutorunError::SessionNotFound { .. })) => {
            Ok(Observation::Waiting)
        }
        Err(err) => Err(err),
    }
}

fn is_final(status: SessionStatus, exit_on_stop: bool) -> bool {
    match status {
        SessionStatus::Completed | SessionStatus::Aborted => true,
        SessionStatus::Paused | SessionStatus::Failed => exit_on_stop,
        SessionStatus::Active => false,
    }
}

/// Watch `task` until it finishes or `shutdown` flips to `true`.
///
/// `on_change` receives the first observation and every visible change after.
pub async fn run_monitor<F>(
    ctx: RunContext<'_>,
    task: &str,
    options: MonitorOptions,
    mut shutdown: watch::Receiver<bool>,
    mut on_change: F,
) -> Result<MonitorExit>
where
    F: FnMut(&Observation),
{
    let sessions_dir = ctx.paths.sessions_dir.clone();
    fs::create_dir_all(&sessions_dir)
        .with_context(|| format!("create directory {}", sessions_dir.display()))?;
    let session_path = ctx.paths.session_path(task);

    let (tx, mut rx) = mpsc::channel::<NotifyEvent>(64);
    let mut watcher = PollWatcher::new(
        move |res: Result<NotifyEvent, notify::Error>| match res {
            Ok(event) => {
                let _ = tx.try_send(event);
            }
            Err(err) => warn!(error = %err, "session watcher error"),
        },
        notify::Config::default().with_poll_interval(options.interval),
    )?;
    watcher.watch(&sessions_dir, RecursiveMode::NonRecursive)?;
    info!(task, dir = %sessions_dir.display(), "watching session");

    let mut tick = tokio::time::interval(options.interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut last: Option<Option<FrameKey>> = None;
    loop {
        if *shutdown.borrow() {
            return Ok(MonitorExit::Shutdown);
        }
        let trigger = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return Ok(MonitorExit::Shutdown);
                }
                continue;
            }
            Some(event) = rx.recv() => {
                if !touches(&event, &session_path) {
                    continue;
                }
                Trigger::SessionFile
            }
            _ = tick.tick() => Trigger::Tick,
        };

        let observation = observe(ctx, task)?;
        let key = match &observation {
            Observation::Waiting => None,
            Observation::Status(status) => Some(frame_key(status)),
        };
        if last.as_ref() != Some(&key) {
            if matches!(trigger, Trigger::SessionFile) {
                debug!(task, "session file changed");
            }
            on_change(&observation);
            last = Some(key);
        }
        if let Observation::Status(status) = &observation
            && is_final(status.status, options.exit_on_stop)
        {
            info!(task, status = %status.status, "monitor finished");
            return Ok(MonitorExit::Finished(status.status));
        }
    }
}

fn touches(event: &NotifyEvent, session_path: &Path) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) && event.paths.iter().any(|path| path == session_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use autorun::test_support::TestEnv;

    fn options() -> MonitorOptions {
        MonitorOptions {
            interval: Duration::from_millis(20),
            exit_on_stop: false,
        }
    }

    #[test]
    fn missing_session_is_waiting() {
        let env = TestEnv::with_split_plan("demo", 3, 1);
        assert!(matches!(
            observe(env.ctx(), "demo").expect("observe"),
            Observation::Waiting
        ));
        env.track_plan();
        assert!(matches!(
            observe(env.ctx(), "demo").expect("observe"),
            Observation::Status(_)
        ));
    }

    #[tokio::test]
    async fn stops_when_task_completes() {
        let env = TestEnv::with_split_plan("demo", 3, 1);
        env.track_plan();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut seen = Vec::new();

        let monitor = run_monitor(env.ctx(), "demo", options(), shutdown_rx, |obs| {
            if let Observation::Status(status) = obs {
                seen.push(status.status);
            }
        });
        let complete = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            env.ctx()
                .sessions()
                .set_status("demo", SessionStatus::Completed, None, false)
                .expect("complete");
        };
        let (exit, ()) = tokio::time::timeout(Duration::from_secs(10), async {
            tokio::join!(monitor, complete)
        })
        .await
        .expect("monitor finished in time");

        assert_eq!(exit.expect("monitor"), MonitorExit::Finished(SessionStatus::Completed));
        assert_eq!(seen.first(), Some(&SessionStatus::Active));
        assert_eq!(seen.last(), Some(&SessionStatus::Completed));
    }

    #[tokio::test]
    async fn shutdown_signal_ends_loop() {
        let env = TestEnv::with_split_plan("demo", 3, 1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut waits = 0;

        let monitor = run_monitor(env.ctx(), "demo", options(), shutdown_rx, |obs| {
            if matches!(obs, Observation::Waiting) {
                waits += 1;
            }
        });
        let stop = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            shutdown_tx.send(true).expect("send shutdown");
        };
        let (exit, ()) = tokio::time::timeout(Duration::from_secs(10), async {
            tokio::join!(monitor, stop)
        })
        .await
        .expect("monitor stopped in time");

        assert_eq!(exit.expect("monitor"), MonitorExit::Shutdown);
        assert_eq!(waits, 1);
    }
}
