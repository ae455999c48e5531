//! Agent transcript and completion marker file access.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::atomic::write_atomic;
use super::paths::{AutorunPaths, validate_task_name};
use crate::core::completion::tail_lines;

/// Last `lines` lines of the transcript; empty when the file is missing.
pub fn read_tail(path: &Path, lines: usize) -> Result<String> {
    if !path.exists() {
        debug!(path = %path.display(), "transcript missing");
        return Ok(String::new());
    }
    let bytes = fs::read(path).with_context(|| format!("read transcript {}", path.display()))?;
    let content = String::from_utf8_lossy(&bytes);
    Ok(tail_lines(&content, lines).to_string())
}

/// Read and delete `sessions/<task>.stage-complete`.
///
/// The file is removed even when its contents do not parse, so a marker is
/// observed at most once.
pub fn consume_marker(paths: &AutorunPaths, task: &str) -> Result<Option<u32>> {
    validate_task_name(task)?;
    let path = paths.marker_path(task);
    let contents = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("read marker {}", path.display())),
    };
    fs::remove_file(&path).with_context(|| format!("remove marker {}", path.display()))?;
    let stage = contents.trim().parse::<u32>().ok();
    if stage.is_none() {
        warn!(task, contents = contents.trim(), "marker file did not contain a stage number");
    }
    Ok(stage)
}

pub fn write_marker(paths: &AutorunPaths, task: &str, stage: u32) -> Result<()> {
    validate_task_name(task)?;
    write_atomic(&paths.marker_path(task), &format!("{stage}\n"))
}

pub fn modified_at(path: &Path) -> Result<DateTime<Utc>> {
    let modified = fs::metadata(path)
        .and_then(|meta| meta.modified())
        .with_context(|| format!("stat {}", path.display()))?;
    Ok(DateTime::<Utc>::from(modified))
}

/// Whether `path` was modified no more than `window` before `now`.
///
/// Modification times later than `now` do not count.
pub fn modified_within(path: &Path, now: DateTime<Utc>, window: Duration) -> Result<bool> {
    if !path.exists() {
        return Ok(false);
    }
    let age = now.signed_duration_since(modified_at(path)?);
    let window = chrono::Duration::from_std(window).context("completion window out of range")?;
    Ok(age >= chrono::Duration::zero() && age <= window)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_transcript_reads_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert_eq!(read_tail(&temp.path().join("none.jsonl"), 10).expect("read"), "");
    }

    #[test]
    fn tail_window_is_bounded() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("t.jsonl");
        let body: String = (1..=200).map(|i| format!("line {i}\n")).collect();
        fs::write(&path, body).expect("write");
        let tail = read_tail(&path, 100).expect("read");
        assert!(tail.starts_with("line 101\n"));
        assert!(tail.ends_with("line 200\n"));
    }

    #[test]
    fn marker_is_consumed_at_most_once() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = AutorunPaths::new(temp.path());
        write_marker(&paths, "demo", 3).expect("write");

        assert_eq!(consume_marker(&paths, "demo").expect("first"), Some(3));
        assert!(!paths.marker_path("demo").exists());
        assert_eq!(consume_marker(&paths, "demo").expect("second"), None);
    }

    #[test]
    fn unparsable_marker_is_still_removed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = AutorunPaths::new(temp.path());
        fs::create_dir_all(&paths.sessions_dir).expect("mkdir");
        fs::write(paths.marker_path("demo"), "not-a-number").expect("write");

        assert_eq!(consume_marker(&paths, "demo").expect("consume"), None);
        assert!(!paths.marker_path("demo").exists());
    }

    #[test]
    fn recent_modification_is_within_window() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("README.md");
        fs::write(&path, "x").expect("write");
        let mtime = modified_at(&path).expect("mtime");

        let window = Duration::from_secs(15);
        assert!(modified_within(&path, mtime + chrono::Duration::seconds(5), window).expect("check"));
        assert!(!modified_within(&path, mtime + chrono::Duration::seconds(60), window).expect("check"));
        assert!(!modified_within(&path, mtime - chrono::Duration::seconds(5), window).expect("check"));
        assert!(!modified_within(&temp.path().join("gone.md"), mtime, window).expect("check"));
    }
}
