//! Stage completion detection.
//!
//! Three sources are consulted in order and the first hit wins:
//! 1. a `[STAGE_COMPLETE:N]` marker in the transcript window,
//! 2. the `sessions/<task>.stage-complete` marker file (consumed on read),
//! 3. a recent modification of the plan header, which reports the header's
//!    `current` stage. Autorun's own header writes do not count.
//!
//! A hit naming any stage other than the plan's current one is ignored and
//! the next source is consulted.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::context::RunContext;
use crate::core::completion::{ErrorMatch, find_stage_marker, scan_errors};
use crate::io::plan::PlanData;
use crate::io::transcript::{consume_marker, modified_at, modified_within, read_tail};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "source", content = "stage", rename_all = "snake_case")]
pub enum Detection {
    TranscriptMarker(u32),
    MarkerFile(u32),
    RecentModification(u32),
    NotDetected,
}

impl Detection {
    pub fn stage(self) -> Option<u32> {
        match self {
            Self::TranscriptMarker(stage)
            | Self::MarkerFile(stage)
            | Self::RecentModification(stage) => Some(stage),
            Self::NotDetected => None,
        }
    }

    pub fn source(self) -> &'static str {
        match self {
            Self::TranscriptMarker(_) => "transcript marker",
            Self::MarkerFile(_) => "marker file",
            Self::RecentModification(_) => "recent modification",
            Self::NotDetected => "none",
        }
    }
}

pub struct CompletionDetector<'a> {
    ctx: RunContext<'a>,
}

impl<'a> CompletionDetector<'a> {
    pub fn new(ctx: RunContext<'a>) -> Self {
        Self { ctx }
    }

    /// The transcript tail that markers and errors are searched in.
    pub fn read_window(&self, transcript: Option<&Path>) -> Result<String> {
        match transcript {
            Some(path) => read_tail(path, self.ctx.config.transcript_tail_lines),
            None => Ok(String::new()),
        }
    }

    pub fn scan_errors(&self, window: &str) -> Option<ErrorMatch> {
        scan_errors(window)
    }

    pub fn detect(&self, plan: &PlanData, window: &str) -> Result<Detection> {
        let task = plan.task_name();
        let current = plan.config.current;
        let accept = |detection: Detection| match detection.stage() {
            Some(stage) if stage < current => {
                debug!(task = %task, stage, current, source = detection.source(), "ignoring stale completion");
                None
            }
            Some(stage) if stage > current => {
                warn!(task = %task, stage, current, source = detection.source(), "ignoring completion for a stage ahead of the plan");
                None
            }
            _ => Some(detection),
        };

        if let Some(detection) = find_stage_marker(window)
            .map(Detection::TranscriptMarker)
            .and_then(accept)
        {
            info!(task = %task, stage = detection.stage(), source = detection.source(), "stage completion detected");
            return Ok(detection);
        }

        if let Some(detection) = consume_marker(self.ctx.paths, &task)?
            .map(Detection::MarkerFile)
            .and_then(accept)
        {
            info!(task = %task, stage = detection.stage(), source = detection.source(), "stage completion detected");
            return Ok(detection);
        }

        let window_secs = Duration::from_secs(self.ctx.config.completion_window_secs);
        if modified_within(&plan.header_path, self.ctx.clock.now(), window_secs)?
            && !self.header_is_own_write(&task, &plan.header_path)?
        {
            let detection = Detection::RecentModification(current);
            info!(task = %task, stage = current, source = detection.source(), "stage completion detected");
            return Ok(detection);
        }

        debug!(task = %task, current, "no stage completion detected");
        Ok(Detection::NotDetected)
    }

    /// Whether the header is unchanged since autorun last rewrote `current`.
    fn header_is_own_write(&self, task: &str, header: &Path) -> Result<bool> {
        let Some(written) = self
            .ctx
            .metadata()
            .load(task)?
            .and_then(|metadata| metadata.header_written_at)
        else {
            return Ok(false);
        };
        let own = modified_at(header)? <= written;
        if own {
            debug!(task, "plan header last written by autorun; not a completion signal");
        }
        Ok(own)
    }
}
