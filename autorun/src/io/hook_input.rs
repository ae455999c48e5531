//! Stop-hook payload read from stdin.

use std::io::Read;
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct HookInput {
    pub session_id: Option<String>,
    pub transcript_path: Option<PathBuf>,
    pub cwd: Option<PathBuf>,
}

pub fn parse_hook_input(raw: &str) -> Result<HookInput> {
    if raw.trim().is_empty() {
        return Ok(HookInput::default());
    }
    serde_json::from_str(raw).context("parse hook input json")
}

/// Read all of `reader` on a helper thread, giving up after `timeout`.
pub fn read_with_timeout<R>(reader: R, timeout: Duration) -> Result<String>
where
    R: Read + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut reader = reader;
        let mut buf = String::new();
        let result = reader.read_to_string(&mut buf).map(|_| buf);
        // Receiver may have timed out already.
        let _ = tx.send(result);
    });
    match rx.recv_timeout(timeout) {
        Ok(result) => result.context("read hook input"),
        Err(mpsc::RecvTimeoutError::Timeout) => Err(anyhow!(
            "timed out after {}s waiting for hook input on stdin",
            timeout.as_secs()
        )),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(anyhow!("hook input reader stopped")),
    }
}

pub fn read_hook_input(timeout: Duration) -> Result<HookInput> {
    let raw = read_with_timeout(std::io::stdin(), timeout)?;
    let input = parse_hook_input(&raw)?;
    debug!(session_id = ?input.session_id, transcript = ?input.transcript_path, "hook input read");
    Ok(input)
}
