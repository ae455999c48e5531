//! Stage file naming rules for split plans (`stages/NN-name.md`).

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::AutorunError;

static STAGE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{2})-.+\.md$").expect("stage name regex"));

const IGNORED_SUFFIXES: [&str; 5] = [".backup", ".old", ".draft", ".bak", ".tmp"];

/// Stage number encoded in a file name, if the name is a stage candidate.
pub fn stage_number(file_name: &str) -> Option<u32> {
    if IGNORED_SUFFIXES
        .iter()
        .any(|suffix| file_name.ends_with(suffix))
    {
        return None;
    }
    STAGE_NAME
        .captures(file_name)
        .and_then(|caps| caps[1].parse().ok())
}

/// File name prefix for a stage (`7` -> `07-`).
pub fn stage_prefix(stage: u32) -> String {
    format!("{stage:02}-")
}

/// Filter candidates, sort by name, and reject duplicate stage numbers.
pub fn collect_stage_files<I, S>(names: I) -> Result<Vec<String>, AutorunError>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut candidates: Vec<String> = names
        .into_iter()
        .map(Into::into)
        .filter(|name| stage_number(name).is_some())
        .collect();
    candidates.sort();

    let mut by_number: BTreeMap<u32, Vec<&str>> = BTreeMap::new();
    for name in &candidates {
        if let Some(number) = stage_number(name) {
            by_number.entry(number).or_default().push(name);
        }
    }
    if let Some((number, dupes)) = by_number.iter().find(|(_, dupes)| dupes.len() > 1) {
        return Err(AutorunError::plan_parse(format!(
            "Duplicate stage number {number} found: {}",
            dupes.join(", ")
        )));
    }
    Ok(candidates)
}

/// First file whose name starts with the zero-padded stage prefix.
pub fn find_stage_file(files: &[String], stage: u32) -> Option<&str> {
    let prefix = stage_prefix(stage);
    files
        .iter()
        .find(|name| name.starts_with(&prefix))
        .map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_stage_candidates() {
        assert_eq!(stage_number("01-setup.md"), Some(1));
        assert_eq!(stage_number("12-api-layer.md"), Some(12));
        assert_eq!(stage_number("1-setup.md"), None);
        assert_eq!(stage_number("01-setup.txt"), None);
        assert_eq!(stage_number("01-setup.md.bak"), None);
        assert_eq!(stage_number("README.md"), None);
    }

    #[test]
    fn sorts_and_filters() {
        let files =
            collect_stage_files(["03-c.md", "notes.md", "01-a.md", "02-b.md"]).expect("collect");
        assert_eq!(files, vec!["01-a.md", "02-b.md", "03-c.md"]);
    }

    #[test]
    fn backup_named_markdown_collides_with_original() {
        let err = collect_stage_files(["01-foo.md", "01-foo.backup.md", "02-bar.md"]).unwrap_err();
        let AutorunError::PlanParse(message) = err else {
            panic!("expected plan parse error");
        };
        assert!(message.contains("Duplicate stage number 1"));
    }

    #[test]
    fn finds_file_by_padded_prefix() {
        let files = vec!["01-a.md".to_string(), "02-b.md".to_string()];
        assert_eq!(find_stage_file(&files, 2), Some("02-b.md"));
        assert_eq!(find_stage_file(&files, 3), None);
    }
}
