//! Plan documents on disk: architecture detection, parsing, progress updates.

use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::debug;

use super::atomic::write_atomic;
use crate::core::header::{HeaderValue, PlanConfig, parse_config_header, update_config_header};
use crate::core::stage_files::{collect_stage_files, find_stage_file, stage_number, stage_prefix};
use crate::core::types::Architecture;
use crate::error::AutorunError;

/// Header documents probed (in order) inside a split plan directory.
pub const HEADER_FILES: [&str; 2] = ["README.md", "EXECUTION_PLAN.md"];
pub const STAGES_DIR: &str = "stages";
/// Header keys every plan must declare.
pub const REQUIRED_KEYS: [&str; 5] = ["stages", "current", "task_type", "estimated_time", "architecture"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub completed: u32,
    pub total: u32,
    pub percentage: u32,
    pub current: u32,
}

impl Progress {
    pub fn new(current: u32, total: u32) -> Self {
        let completed = current.saturating_sub(1);
        let percentage = if total > 0 {
            (f64::from(completed) / f64::from(total) * 100.0).round() as u32
        } else {
            0
        };
        Self {
            completed,
            total,
            percentage,
            current,
        }
    }
}

/// Parsed plan.
#[derive(Debug, Clone, Serialize)]
pub struct PlanData {
    /// The plan file (single) or plan directory (split).
    pub root: PathBuf,
    pub architecture: Architecture,
    pub config: PlanConfig,
    /// Document holding the `AUTO-RUN-CONFIG` block.
    pub header_path: PathBuf,
    pub current_stage_file: PathBuf,
    /// Sorted stage files; empty for single-file plans.
    pub stage_files: Vec<PathBuf>,
    pub progress: Progress,
}

impl PlanData {
    pub fn task_name(&self) -> String {
        extract_task_name(&self.root)
    }

    pub fn is_last_stage(&self) -> bool {
        self.config.current >= self.config.stages
    }
}

/// Split when `path` is a directory holding a header document, single when it
/// is an existing `.md` file.
pub fn detect_architecture(path: &Path) -> Option<Architecture> {
    let meta = fs::metadata(path).ok()?;
    if meta.is_dir() {
        HEADER_FILES
            .iter()
            .any(|name| path.join(name).is_file())
            .then_some(Architecture::Split)
    } else if meta.is_file() && path.extension().is_some_and(|ext| ext == "md") {
        Some(Architecture::Single)
    } else {
        None
    }
}

/// Header document for a plan path (the file itself for single plans).
pub fn header_path(path: &Path) -> Result<PathBuf> {
    match detect_architecture(path) {
        Some(Architecture::Single) => Ok(path.to_path_buf()),
        Some(Architecture::Split) => HEADER_FILES
            .iter()
            .map(|name| path.join(name))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| {
                anyhow::Error::from(AutorunError::plan_parse(format!(
                    "Plan README not found in {}",
                    path.display()
                )))
            }),
        None => Err(AutorunError::plan_parse(format!("Invalid plan path: {}", path.display())).into()),
    }
}

fn read_config(header_path: &Path) -> Result<PlanConfig> {
    let content = fs::read_to_string(header_path)
        .with_context(|| format!("read plan header {}", header_path.display()))?;
    let config = parse_config_header(&content).ok_or_else(|| {
        AutorunError::plan_parse(format!(
            "Configuration header not found in {}",
            header_path.display()
        ))
    })?;
    Ok(config)
}

/// Stage file names in `<plan>/stages`, sorted, duplicates rejected.
pub fn list_stage_files(plan_dir: &Path) -> Result<Vec<String>> {
    let stages_dir = plan_dir.join(STAGES_DIR);
    if !stages_dir.is_dir() {
        return Err(AutorunError::plan_parse(format!(
            "Stages directory not found: {}",
            stages_dir.display()
        ))
        .into());
    }
    let mut names = Vec::new();
    for entry in fs::read_dir(&stages_dir)
        .with_context(|| format!("read stages directory {}", stages_dir.display()))?
    {
        let entry = entry.with_context(|| format!("read entry in {}", stages_dir.display()))?;
        if entry.file_type().map(|ty| ty.is_file()).unwrap_or(false) {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    Ok(collect_stage_files(names)?)
}

pub fn parse_plan(path: &Path) -> Result<PlanData> {
    let architecture = detect_architecture(path).ok_or_else(|| {
        AutorunError::plan_parse(format!("Invalid plan path: {}", path.display()))
    })?;
    let header_path = header_path(path)?;
    let config = read_config(&header_path)?;
    let progress = Progress::new(config.current, config.stages);

    let (current_stage_file, stage_files) = match architecture {
        Architecture::Single => (path.to_path_buf(), Vec::new()),
        Architecture::Split => {
            let stages_dir = path.join(STAGES_DIR);
            let names = list_stage_files(path)?;
            let current = find_stage_file(&names, config.current)
                .map(|name| stages_dir.join(name))
                .ok_or_else(|| {
                    AutorunError::plan_parse(format!(
                        "Current stage file not found: {}*.md in {}",
                        stage_prefix(config.current),
                        stages_dir.display()
                    ))
                })?;
            let files = names.iter().map(|name| stages_dir.join(name)).collect();
            (current, files)
        }
    };

    debug!(
        plan = %path.display(),
        architecture = %architecture,
        current = config.current,
        stages = config.stages,
        "plan parsed"
    );
    Ok(PlanData {
        root: path.to_path_buf(),
        architecture,
        config,
        header_path,
        current_stage_file,
        stage_files,
        progress,
    })
}

/// File the agent should work on after the current stage, `None` when done.
pub fn next_stage_file(plan: &PlanData) -> Option<PathBuf> {
    stage_file_for(plan, plan.config.current.checked_add(1)?)
        .filter(|_| plan.config.current < plan.config.stages)
}

/// File holding `stage` (the plan file itself for single plans).
pub fn stage_file_for(plan: &PlanData, stage: u32) -> Option<PathBuf> {
    match plan.architecture {
        Architecture::Single => Some(plan.current_stage_file.clone()),
        Architecture::Split => plan
            .stage_files
            .iter()
            .find(|file| {
                file.file_name()
                    .and_then(|name| name.to_str())
                    .and_then(stage_number)
                    == Some(stage)
            })
            .cloned(),
    }
}

/// Rewrite the header's `current` key (temp file + rename).
pub fn update_progress(path: &Path, new_stage: u32) -> Result<()> {
    update_header_values(path, &[("current", HeaderValue::from(new_stage))])
}

pub fn update_header_values(path: &Path, updates: &[(&str, HeaderValue)]) -> Result<()> {
    let header = header_path(path)?;
    let content =
        fs::read_to_string(&header).with_context(|| format!("read plan header {}", header.display()))?;
    let updated = update_config_header(&content, updates)?;
    debug!(header = %header.display(), keys = updates.len(), "updating plan header");
    write_atomic(&header, &updated)
}

/// `x/stages/02-api.md` -> `x`, `x/README.md` -> `x`, `x.md` -> `x`, `x/` -> `x`.
pub fn extract_task_name(path: &Path) -> String {
    let root = plan_root_for(path);
    let name = if root.extension().is_some_and(|ext| ext == "md") {
        root.file_stem()
    } else {
        root.file_name()
    };
    name.map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Plan root for any path inside a plan (stage file, header document, plan itself).
pub fn plan_root_for(path: &Path) -> PathBuf {
    let components: Vec<Component<'_>> = path.components().collect();
    if let Some(idx) = components
        .iter()
        .rposition(|c| c.as_os_str() == STAGES_DIR)
        && idx > 0
        && idx + 1 < components.len()
    {
        return components[..idx].iter().collect();
    }
    let is_header = path
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| HEADER_FILES.contains(&name));
    if is_header && let Some(parent) = path.parent() {
        return parent.to_path_buf();
    }
    path.to_path_buf()
}

/// Locate a plan from a path or a bare task name.
///
/// A bare name is probed in each search root as `<name>.md`, `<name>/`,
/// `.autorun/plans/<name>/` and `.autorun/plans/<name>.md`.
pub fn resolve_plan(task_or_path: &str, search_roots: &[PathBuf]) -> Result<PathBuf> {
    let direct = PathBuf::from(task_or_path);
    if detect_architecture(&direct).is_some() {
        return Ok(plan_root_for(&direct));
    }
    let mut probed = Vec::new();
    for root in search_roots {
        let candidates = [
            root.join(format!("{task_or_path}.md")),
            root.join(task_or_path),
            root.join(".autorun/plans").join(task_or_path),
            root.join(".autorun/plans").join(format!("{task_or_path}.md")),
        ];
        for candidate in candidates {
            if detect_architecture(&candidate).is_some() {
                debug!(plan = %candidate.display(), "plan resolved");
                return Ok(candidate);
            }
            probed.push(candidate.display().to_string());
        }
    }
    Err(AutorunError::plan_parse(format!(
        "Plan not found: {task_or_path} (searched {})",
        probed.join(", ")
    ))
    .into())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Structural checks on a plan. Problems are reported, never raised.
pub fn validate_plan(path: &Path) -> ValidationReport {
    let mut report = ValidationReport::default();
    let Some(architecture) = detect_architecture(path) else {
        report
            .errors
            .push(format!("Invalid plan path: {}", path.display()));
        return report;
    };

    let config = match header_path(path).and_then(|header| read_config(&header)) {
        Ok(config) => config,
        Err(err) => {
            report.errors.push(format!("{err:#}"));
            return report;
        }
    };

    for key in REQUIRED_KEYS {
        if config.get(key).is_none() {
            report
                .errors
                .push(format!("AUTO-RUN-CONFIG is missing required field: {key}"));
        }
    }
    if let Some(declared) = config.architecture
        && declared != architecture
    {
        report.errors.push(format!(
            "Expected architecture: {architecture}, found: {declared}"
        ));
    }
    if config.stages == 0 {
        report.errors.push("stages must be a positive integer".to_string());
    } else if config.current < 1 || config.current > config.stages {
        report.errors.push(format!(
            "current ({}) must be between 1 and stages ({})",
            config.current, config.stages
        ));
    }

    if architecture == Architecture::Split {
        validate_stage_files(path, &config, &mut report);
    }
    report
}

fn validate_stage_files(path: &Path, config: &PlanConfig, report: &mut ValidationReport) {
    let names = match list_stage_files(path) {
        Ok(names) => names,
        Err(err) => {
            report.errors.push(format!("{err:#}"));
            return;
        }
    };
    if names.is_empty() {
        report
            .errors
            .push("No stage files found in stages/ directory".to_string());
        return;
    }

    if let Ok(entries) = fs::read_dir(path.join(STAGES_DIR)) {
        let mut misnamed: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".md") && stage_number(name).is_none())
            .collect();
        misnamed.sort();
        for name in misnamed {
            report.warnings.push(format!(
                "Stage file has incorrect naming: {name} (expected format: 01-name.md)"
            ));
        }
    }

    let numbers: Vec<u32> = names.iter().filter_map(|name| stage_number(name)).collect();
    for (idx, number) in numbers.iter().enumerate() {
        let expected = idx as u32 + 1;
        if *number != expected {
            report.warnings.push(format!(
                "Stage numbering gap detected: expected stage {expected}, found {number}"
            ));
            break;
        }
    }
    if config.stages as usize != names.len() {
        report.warnings.push(format!(
            "Header declares {} stages but {} stage files were found",
            config.stages,
            names.len()
        ));
    }
}
