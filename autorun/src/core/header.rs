//! `AUTO-RUN-CONFIG` header block grammar.
//!
//! The block lives inside an HTML comment at the top of a plan document:
//!
//! ```text
//! <!-- AUTO-RUN-CONFIG
//! stages: 5
//! current: 2
//! # comments survive rewrites
//! architecture: split
//! -->
//! ```
//!
//! The body is kept as an ordered list of lines so that parse + render is a
//! byte-for-byte identity and updates only touch the value of listed keys.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::core::types::Architecture;
use crate::error::AutorunError;

static HEADER_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*AUTO-RUN-CONFIG\s*\n((?s:.*?))-->").expect("header block regex")
});

static DIGITS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d+$").expect("digits regex"));

/// Typed header value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Bool(bool),
    Int(u64),
    Text(String),
}

impl HeaderValue {
    /// `true`/`false` become booleans, digit-only strings become integers.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "true" => Self::Bool(true),
            "false" => Self::Bool(false),
            _ if DIGITS.is_match(raw) => match raw.parse::<u64>() {
                Ok(value) => Self::Int(value),
                Err(_) => Self::Text(raw.to_string()),
            },
            _ => Self::Text(raw.to_string()),
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Self::Int(value) => u32::try_from(*value).ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            _ => None,
        }
    }
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(value) => write!(f, "{value}"),
            Self::Int(value) => write!(f, "{value}"),
            Self::Text(value) => f.write_str(value),
        }
    }
}

impl From<u32> for HeaderValue {
    fn from(value: u32) -> Self {
        Self::Int(u64::from(value))
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        Self::parse(value)
    }
}

/// One line of the header body. `raw` is the exact source text (without `\n`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderLine {
    Blank { raw: String },
    Comment { raw: String },
    Entry {
        raw: String,
        indent: String,
        key: String,
        value: HeaderValue,
    },
    Other { raw: String },
}

impl HeaderLine {
    fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Self::Blank { raw: raw.to_string() };
        }
        if trimmed.starts_with('#') {
            return Self::Comment { raw: raw.to_string() };
        }
        let Some((key, value)) = trimmed.split_once(':') else {
            return Self::Other { raw: raw.to_string() };
        };
        let key = key.trim();
        if key.is_empty() {
            return Self::Other { raw: raw.to_string() };
        }
        let indent_len = raw.len() - raw.trim_start().len();
        Self::Entry {
            raw: raw.to_string(),
            indent: raw[..indent_len].to_string(),
            key: key.to_string(),
            value: HeaderValue::parse(value.trim()),
        }
    }

    fn raw(&self) -> &str {
        match self {
            Self::Blank { raw } | Self::Comment { raw } | Self::Other { raw } => raw,
            Self::Entry { raw, .. } => raw,
        }
    }

    fn entry(indent: &str, key: &str, value: &HeaderValue, line_end: &str) -> Self {
        Self::Entry {
            raw: format!("{indent}{key}: {value}{line_end}"),
            indent: indent.to_string(),
            key: key.to_string(),
            value: value.clone(),
        }
    }
}

/// Parsed header body. Rendering reproduces the source exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigHeader {
    lines: Vec<HeaderLine>,
}

impl ConfigHeader {
    pub fn parse(body: &str) -> Self {
        Self {
            lines: body.split('\n').map(HeaderLine::parse).collect(),
        }
    }

    pub fn render(&self) -> String {
        self.lines
            .iter()
            .map(HeaderLine::raw)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn lines(&self) -> &[HeaderLine] {
        &self.lines
    }

    /// Key/value pairs in document order. Later duplicates win in [`Self::values`].
    pub fn entries(&self) -> impl Iterator<Item = (&str, &HeaderValue)> {
        self.lines.iter().filter_map(|line| match line {
            HeaderLine::Entry { key, value, .. } => Some((key.as_str(), value)),
            _ => None,
        })
    }

    pub fn values(&self) -> BTreeMap<String, HeaderValue> {
        self.entries()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect()
    }

    /// Replace the value of every entry named `key`, or append one if absent.
    pub fn set(&mut self, key: &str, value: &HeaderValue) {
        let mut found = false;
        for line in &mut self.lines {
            if let HeaderLine::Entry {
                raw,
                indent,
                key: existing,
                ..
            } = line
                && existing == key
            {
                let line_end = if raw.ends_with('\r') { "\r" } else { "" };
                *line = HeaderLine::entry(indent, key, value, line_end);
                found = true;
            }
        }
        if found {
            return;
        }

        let template = self.lines.iter().rev().find_map(|line| match line {
            HeaderLine::Entry { raw, indent, .. } => Some((
                indent.clone(),
                if raw.ends_with('\r') { "\r" } else { "" },
            )),
            _ => None,
        });
        let (indent, line_end) = template.unwrap_or_default();
        let new_line = HeaderLine::entry(&indent, key, value, line_end);
        // The final segment is whatever precedes `-->` on its line.
        let insert_at = self.lines.len().saturating_sub(1);
        self.lines.insert(insert_at, new_line);
    }
}

/// Typed view of the header with every key retained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanConfig {
    pub stages: u32,
    pub current: u32,
    pub safety_limit: u32,
    pub architecture: Option<Architecture>,
    pub values: BTreeMap<String, HeaderValue>,
}

impl PlanConfig {
    pub fn from_values(values: BTreeMap<String, HeaderValue>) -> Self {
        let number = |key: &str| values.get(key).and_then(HeaderValue::as_u32);
        let architecture = match values.get("architecture").and_then(HeaderValue::as_str) {
            Some("single") => Some(Architecture::Single),
            Some("split") => Some(Architecture::Split),
            _ => None,
        };
        Self {
            stages: number("stages").unwrap_or(0),
            current: number("current").unwrap_or(1),
            safety_limit: number("safety_limit").unwrap_or(0),
            architecture,
            values,
        }
    }

    pub fn get(&self, key: &str) -> Option<&HeaderValue> {
        self.values.get(key)
    }
}

/// Locate the header block and parse it. `None` when the block is absent.
pub fn parse_config_header(content: &str) -> Option<PlanConfig> {
    let body = HEADER_BLOCK.captures(content)?.get(1)?.as_str();
    Some(PlanConfig::from_values(ConfigHeader::parse(body).values()))
}

/// Rewrite the listed keys inside the header block, leaving every other byte alone.
pub fn update_config_header(
    content: &str,
    updates: &[(&str, HeaderValue)],
) -> Result<String, AutorunError> {
    let body = HEADER_BLOCK
        .captures(content)
        .and_then(|caps| caps.get(1))
        .ok_or_else(|| AutorunError::plan_parse("AUTO-RUN-CONFIG header block not found"))?;

    let mut header = ConfigHeader::parse(body.as_str());
    for (key, value) in updates {
        header.set(key, value);
    }

    let mut out = String::with_capacity(content.len() + 16);
    out.push_str(&content[..body.start()]);
    out.push_str(&header.render());
    out.push_str(&content[body.end()..]);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAN: &str = "# Demo plan\n\n<!-- AUTO-RUN-CONFIG\nstages: 5\ncurrent: 2\n# keep me\n  safety_limit: 10\narchitecture: split\ntask_type: refactor\nauto_continue: true\nnote: a: b\n-->\n\nBody text\n";

    #[test]
    fn parses_typed_values() {
        let config = parse_config_header(PLAN).expect("header");
        assert_eq!(config.stages, 5);
        assert_eq!(config.current, 2);
        assert_eq!(config.safety_limit, 10);
        assert_eq!(config.architecture, Some(Architecture::Split));
        assert_eq!(config.get("auto_continue"), Some(&HeaderValue::Bool(true)));
        assert_eq!(
            config.get("task_type"),
            Some(&HeaderValue::Text("refactor".to_string()))
        );
        assert_eq!(
            config.get("note"),
            Some(&HeaderValue::Text("a: b".to_string()))
        );
    }

    #[test]
    fn missing_block_is_none() {
        assert!(parse_config_header("# no header here\n").is_none());
    }

    #[test]
    fn defaults_apply_for_absent_keys() {
        let config = parse_config_header("<!-- AUTO-RUN-CONFIG\nstages: 3\n-->\n").expect("header");
        assert_eq!(config.current, 1);
        assert_eq!(config.safety_limit, 0);
        assert_eq!(config.architecture, None);
    }

    #[test]
    fn header_body_round_trips_byte_for_byte() {
        let body = "stages: 5\n\n  # comment\n\tcurrent:   2  \nfree text line\r\n";
        assert_eq!(ConfigHeader::parse(body).render(), body);
    }

    #[test]
    fn update_rewrites_only_listed_keys() {
        let updated = update_config_header(PLAN, &[("safety_limit", HeaderValue::from(20))])
            .expect("update");
        assert_eq!(updated, PLAN.replace("  safety_limit: 10", "  safety_limit: 20"));
    }

    #[test]
    fn update_then_parse_returns_new_value() {
        let updated =
            update_config_header(PLAN, &[("current", HeaderValue::from(3))]).expect("update");
        let config = parse_config_header(&updated).expect("header");
        assert_eq!(config.current, 3);
        assert_eq!(config.stages, 5);
        assert!(updated.contains("# keep me"));
    }

    #[test]
    fn update_appends_absent_key_inside_block() {
        let content = "<!-- AUTO-RUN-CONFIG\nstages: 3\ncurrent: 1\n-->\nbody\n";
        let updated =
            update_config_header(content, &[("safety_limit", HeaderValue::from(4))]).expect("update");
        assert_eq!(
            updated,
            "<!-- AUTO-RUN-CONFIG\nstages: 3\ncurrent: 1\nsafety_limit: 4\n-->\nbody\n"
        );
    }

    #[test]
    fn update_without_block_is_plan_parse_error() {
        let err = update_config_header("plain", &[("current", HeaderValue::from(2))]).unwrap_err();
        assert!(matches!(err, AutorunError::PlanParse(_)));
    }
}
