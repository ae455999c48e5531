//! Transcript scanning: stage markers, agent error patterns, plan references.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

static STAGE_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[STAGE_COMPLETE:(\d+)\]").expect("stage marker regex"));

static PLAN_REFERENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"@([^\s"']+\.md)"#).expect("plan reference regex"));

/// Checked in order; the first pattern that matches anywhere wins.
const ERROR_PATTERNS: [&str; 8] = [
    "error:",
    "exception:",
    "failed:",
    "compilation failed",
    "test failed",
    "command not found",
    "cannot find module",
    "syntax error",
];

static ERROR_REGEXES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    ERROR_PATTERNS
        .iter()
        .map(|pattern| {
            Regex::new(&format!("(?i){}", regex::escape(pattern))).expect("error pattern regex")
        })
        .collect()
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorMatch {
    /// Pattern source, e.g. `compilation failed`.
    pub pattern: String,
    /// Text as it appears in the transcript.
    pub matched: String,
    /// Full (trimmed) line containing the match.
    pub line: String,
}

/// Last `n` lines of `content`.
pub fn tail_lines(content: &str, n: usize) -> &str {
    if n == 0 {
        return "";
    }
    let mut newlines = content.trim_end_matches('\n').rmatch_indices('\n');
    match newlines.nth(n - 1) {
        Some((idx, _)) => &content[idx + 1..],
        None => content,
    }
}

/// Stage number from the last `[STAGE_COMPLETE:N]` marker in the window.
pub fn find_stage_marker(window: &str) -> Option<u32> {
    STAGE_MARKER
        .captures_iter(window)
        .filter_map(|caps| caps[1].parse().ok())
        .last()
}

pub fn scan_errors(window: &str) -> Option<ErrorMatch> {
    ERROR_PATTERNS
        .iter()
        .zip(ERROR_REGEXES.iter())
        .find_map(|(pattern, regex)| {
            let found = regex.find(window)?;
            let line_start = window[..found.start()].rfind('\n').map_or(0, |idx| idx + 1);
            let line_end = window[found.end()..]
                .find('\n')
                .map_or(window.len(), |idx| found.end() + idx);
            Some(ErrorMatch {
                pattern: (*pattern).to_string(),
                matched: found.as_str().to_string(),
                line: window[line_start..line_end].trim().to_string(),
            })
        })
}

/// Last `@path.md` reference, resolved against `cwd` when relative.
pub fn extract_plan_reference(window: &str, cwd: &Path) -> Option<PathBuf> {
    let reference = PLAN_REFERENCE
        .captures_iter(window)
        .last()
        .map(|caps| caps[1].to_string())?;
    let path = PathBuf::from(reference);
    if path.is_absolute() {
        Some(path)
    } else {
        Some(cwd.join(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_returns_last_lines() {
        let content = "a\nb\nc\nd\n";
        assert_eq!(tail_lines(content, 2), "c\nd\n");
        assert_eq!(tail_lines(content, 10), content);
        assert_eq!(tail_lines(content, 0), "");
        assert_eq!(tail_lines("single", 3), "single");
    }

    #[test]
    fn last_marker_wins() {
        let window = "did stage [STAGE_COMPLETE:1]\nlater [STAGE_COMPLETE:2]\n";
        assert_eq!(find_stage_marker(window), Some(2));
        assert_eq!(find_stage_marker("nothing here"), None);
    }

    #[test]
    fn error_patterns_are_case_insensitive_and_ordered() {
        let window = "building...\nCompilation FAILED: 3 errors\nTest failed\n";
        let found = scan_errors(window).expect("match");
        // `failed:` precedes `compilation failed` in the pattern list.
        assert_eq!(found.pattern, "failed:");
        assert_eq!(found.matched, "FAILED:");
        assert_eq!(found.line, "Compilation FAILED: 3 errors");
    }

    #[test]
    fn clean_transcript_has_no_errors() {
        assert!(scan_errors("all good\n[STAGE_COMPLETE:1]\n").is_none());
    }

    #[test]
    fn plan_reference_uses_last_mention() {
        let cwd = Path::new("/work");
        let window = "read @docs/old.md then @plans/demo/stages/02-api.md please";
        assert_eq!(
            extract_plan_reference(window, cwd),
            Some(PathBuf::from("/work/plans/demo/stages/02-api.md"))
        );
        assert_eq!(
            extract_plan_reference("see @/abs/plan.md", cwd),
            Some(PathBuf::from("/abs/plan.md"))
        );
        assert_eq!(extract_plan_reference("no refs", cwd), None);
    }
}
