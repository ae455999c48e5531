//! Child process helpers: bounded foreground runs and detached launches.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

/// Run a command to completion with a wall-clock timeout.
///
/// stdout and stderr are drained on reader threads so a chatty child cannot
/// block on a full pipe. At most `output_limit_bytes` of each stream is kept in
/// memory. When `tee_path` is given every stdout line is also appended to
/// that file as it arrives.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes, tee = tee_path.is_some()))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
    tee_path: Option<&Path>,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let tee = match tee_path {
        Some(path) => Some(open_append(path)?),
        None => None,
    };

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            error!(err = %err, "failed to spawn command");
            return Err(err).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_lines_limited(stdout, output_limit_bytes, tee));
    let stderr_handle =
        thread::spawn(move || read_lines_limited(stderr, output_limit_bytes, None));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(timeout_secs = timeout.as_secs(), "command timed out, killing");
            timed_out = true;
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;
    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

/// Start a command without waiting for it. Output is discarded.
pub fn spawn_detached(mut cmd: Command) -> Result<u32> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    let child = cmd.spawn().context("spawn detached command")?;
    let pid = child.id();
    debug!(pid, "detached child started");
    // Dropping `Child` does not kill or wait on the process.
    drop(child);
    Ok(pid)
}

fn open_append(path: &Path) -> Result<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    Ok(BufWriter::new(file))
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_lines_limited<R: Read>(
    reader: R,
    limit: usize,
    mut tee: Option<BufWriter<File>>,
) -> Result<(Vec<u8>, usize)> {
    let mut reader = BufReader::new(reader);
    let mut collected = Vec::new();
    let mut truncated = 0usize;

    loop {
        let mut line = Vec::new();
        let n = reader.read_until(b'\n', &mut line).context("read line")?;
        if n == 0 {
            break;
        }
        if let Some(writer) = tee.as_mut()
            && let Err(err) = writer.write_all(&line).and_then(|()| writer.flush())
        {
            warn!(err = %err, "failed to write tee file");
        }

        let remaining = limit.saturating_sub(collected.len());
        let keep = n.min(remaining);
        collected.extend_from_slice(&line[..keep]);
        truncated += n - keep;
    }

    Ok((collected, truncated))
}
