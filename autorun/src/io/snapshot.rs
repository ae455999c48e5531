//! Incremental per-stage snapshots of the project tree.
//!
//! Layout: `<home>/snapshots/<plan>/stage-<n>/{manifest.json, files/…}`.
//! Each stage stores only files whose SHA-256 differs from the previous
//! stage's manifest. Old stages can be packed into `files.tar.gz`.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::atomic::{read_json_if_exists, remove_dir_if_exists, write_json_atomic};
use super::config::SnapshotConfig;
use super::paths::{AutorunPaths, parse_stage_dir_name, validate_task_name};
use super::recovery_points::{create_recovery_point, remove_recovery_point};
use crate::core::clock::Clock;
use crate::core::retention::select_retained;
use crate::core::types::{ChangeType, SnapshotStatus};
use crate::error::AutorunError;

const FILES_DIR: &str = "files";
const ARCHIVE_NAME: &str = "files.tar.gz";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotFile {
    /// Path relative to the project root, `/`-separated.
    pub path: String,
    pub hash: String,
    pub size: u64,
    pub mtime: Option<DateTime<Utc>>,
    #[serde(rename = "type")]
    pub change: ChangeType,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotManifest {
    pub plan_id: String,
    pub stage: u32,
    pub created_at: DateTime<Utc>,
    pub status: SnapshotStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compressed_at: Option<DateTime<Utc>>,
    /// Directory the recorded paths are relative to.
    pub project_root: PathBuf,
    pub total_size: u64,
    pub file_count: usize,
    pub files: Vec<SnapshotFile>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub stage: u32,
    pub target: PathBuf,
    /// Restored paths mapped to the stage whose copy was used.
    pub restored: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub kept: Vec<u32>,
    pub deleted: Vec<u32>,
}

pub struct SnapshotManager<'a> {
    paths: &'a AutorunPaths,
    config: &'a SnapshotConfig,
    clock: &'a dyn Clock,
}

impl<'a> SnapshotManager<'a> {
    pub fn new(paths: &'a AutorunPaths, config: &'a SnapshotConfig, clock: &'a dyn Clock) -> Self {
        Self {
            paths,
            config,
            clock,
        }
    }

    /// Capture `include` (relative to `project_root`) as the snapshot of `stage`.
    ///
    /// Replaces an existing snapshot of the same stage and records a recovery
    /// point for it.
    pub fn create_snapshot(
        &self,
        plan_id: &str,
        stage: u32,
        project_root: &Path,
        include: &[PathBuf],
    ) -> Result<SnapshotManifest> {
        validate_task_name(plan_id)?;
        let previous: HashMap<String, String> = match stage.checked_sub(1) {
            Some(prev) if prev >= 1 => self
                .load_manifest(plan_id, prev)?
                .map(|manifest| {
                    manifest
                        .files
                        .into_iter()
                        .map(|file| (file.path, file.hash))
                        .collect()
                })
                .unwrap_or_default(),
            _ => HashMap::new(),
        };

        let stage_dir = self.paths.snapshot_dir(plan_id, stage);
        remove_dir_if_exists(&stage_dir)?;
        let files_dir = stage_dir.join(FILES_DIR);
        fs::create_dir_all(&files_dir)
            .with_context(|| format!("create directory {}", files_dir.display()))?;

        let mut files = Vec::new();
        let mut total_size = 0u64;
        for (relative, source) in self.collect_files(project_root, include)? {
            let hash = match file_sha256(&source) {
                Ok(hash) => hash,
                Err(err) => {
                    // Vanished between the walk and the read.
                    debug!(path = %source.display(), error = %format!("{err:#}"), "skipping unreadable file");
                    continue;
                }
            };
            let change = match previous.get(&relative) {
                Some(prev_hash) if *prev_hash == hash => continue,
                Some(_) => ChangeType::Modified,
                None => ChangeType::New,
            };
            let meta =
                fs::metadata(&source).with_context(|| format!("stat {}", source.display()))?;
            let dest = files_dir.join(&relative);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create directory {}", parent.display()))?;
            }
            fs::copy(&source, &dest).with_context(|| {
                format!("copy {} to {}", source.display(), dest.display())
            })?;
            total_size += meta.len();
            files.push(SnapshotFile {
                path: relative,
                hash,
                size: meta.len(),
                mtime: meta.modified().ok().map(DateTime::<Utc>::from),
                change,
            });
        }

        if total_size > self.config.max_snapshot_bytes {
            warn!(
                plan_id,
                stage,
                total_size,
                max = self.config.max_snapshot_bytes,
                "snapshot exceeds configured size"
            );
        }

        let now = self.clock.now();
        let manifest = SnapshotManifest {
            plan_id: plan_id.to_string(),
            stage,
            created_at: now,
            status: SnapshotStatus::Available,
            compressed_at: None,
            project_root: project_root.to_path_buf(),
            total_size,
            file_count: files.len(),
            files,
        };
        write_json_atomic(&self.paths.manifest_path(plan_id, stage), &manifest)?;
        create_recovery_point(self.paths, plan_id, stage, now, Some(manifest.file_count))?;
        info!(plan_id, stage, files = manifest.file_count, total_size, "snapshot created");
        Ok(manifest)
    }

    /// `(relative path, absolute source)` for every file under `include`, sorted.
    fn collect_files(&self, project_root: &Path, include: &[PathBuf]) -> Result<Vec<(String, PathBuf)>> {
        let mut found = BTreeMap::new();
        for entry in include {
            let start = if entry.is_absolute() {
                entry.clone()
            } else {
                project_root.join(entry)
            };
            if !start.exists() {
                debug!(path = %start.display(), "snapshot path missing, skipping");
                continue;
            }
            let walker = WalkDir::new(&start)
                .follow_links(false)
                .into_iter()
                .filter_entry(|e| {
                    e.depth() == 0
                        || !self
                            .config
                            .exclude
                            .iter()
                            .any(|name| e.file_name().to_str() == Some(name.as_str()))
                });
            for item in walker {
                let item = item.with_context(|| format!("walk {}", start.display()))?;
                if !item.file_type().is_file() {
                    continue;
                }
                let Some(relative) = relative_key(project_root, item.path()) else {
                    warn!(path = %item.path().display(), "outside project root, skipping");
                    continue;
                };
                found.insert(relative, item.path().to_path_buf());
            }
        }
        Ok(found.into_iter().collect())
    }

    pub fn load_manifest(&self, plan_id: &str, stage: u32) -> Result<Option<SnapshotManifest>> {
        validate_task_name(plan_id)?;
        read_json_if_exists(&self.paths.manifest_path(plan_id, stage))
    }

    fn require_manifest(&self, plan_id: &str, stage: u32) -> Result<SnapshotManifest> {
        self.load_manifest(plan_id, stage)?.ok_or_else(|| {
            anyhow::Error::from(AutorunError::RecoveryPointNotFound {
                plan_id: plan_id.to_string(),
                stage,
            })
        })
    }

    /// Stage numbers with a snapshot directory, ascending.
    pub fn snapshot_stages(&self, plan_id: &str) -> Result<Vec<u32>> {
        validate_task_name(plan_id)?;
        let dir = self.paths.plan_snapshots_dir(plan_id);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut stages = Vec::new();
        for entry in fs::read_dir(&dir).with_context(|| format!("read {}", dir.display()))? {
            let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
            if let Some(stage) = entry.file_name().to_str().and_then(parse_stage_dir_name) {
                stages.push(stage);
            }
        }
        stages.sort_unstable();
        Ok(stages)
    }

    pub fn list_snapshots(&self, plan_id: &str) -> Result<Vec<SnapshotManifest>> {
        let mut manifests = Vec::new();
        for stage in self.snapshot_stages(plan_id)? {
            match self.load_manifest(plan_id, stage) {
                Ok(Some(manifest)) => manifests.push(manifest),
                Ok(None) => debug!(plan_id, stage, "snapshot directory without manifest"),
                Err(err) => warn!(plan_id, stage, error = %format!("{err:#}"), "unreadable manifest"),
            }
        }
        Ok(manifests)
    }

    /// Copy the project files recorded up to `stage` back into `target`
    /// (default: the manifest's project root), overwriting.
    pub fn restore_snapshot(
        &self,
        plan_id: &str,
        stage: u32,
        target: Option<&Path>,
    ) -> Result<RestoreReport> {
        let manifest = self.require_manifest(plan_id, stage)?;
        let target = target
            .map(Path::to_path_buf)
            .unwrap_or_else(|| manifest.project_root.clone());

        let mut report = RestoreReport {
            stage,
            target: target.clone(),
            restored: BTreeMap::new(),
        };
        // Nearest manifest first; earlier stages fill paths unchanged since.
        let mut chain = vec![manifest];
        for earlier in (1..stage).rev() {
            if let Some(manifest) = self.load_manifest(plan_id, earlier)? {
                chain.push(manifest);
            }
        }

        for manifest in chain {
            let pending: Vec<&SnapshotFile> = manifest
                .files
                .iter()
                .filter(|file| !report.restored.contains_key(&file.path))
                .collect();
            if pending.is_empty() {
                continue;
            }
            let files_dir = self.ensure_decompressed(&manifest)?;
            for file in pending {
                let source = files_dir.join(&file.path);
                let dest = target.join(&file.path);
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("create directory {}", parent.display()))?;
                }
                fs::copy(&source, &dest).with_context(|| {
                    format!("restore {} from stage {}", file.path, manifest.stage)
                })?;
                report.restored.insert(file.path.clone(), manifest.stage);
            }
        }

        info!(
            plan_id,
            stage,
            files = report.restored.len(),
            target = %target.display(),
            "snapshot restored"
        );
        Ok(report)
    }

    /// Files directory for a manifest, unpacking the archive first if needed.
    fn ensure_decompressed(&self, manifest: &SnapshotManifest) -> Result<PathBuf> {
        let stage_dir = self.paths.snapshot_dir(&manifest.plan_id, manifest.stage);
        let files_dir = stage_dir.join(FILES_DIR);
        if manifest.status != SnapshotStatus::Compressed {
            return Ok(files_dir);
        }

        let archive_path = stage_dir.join(ARCHIVE_NAME);
        let archive = File::open(&archive_path)
            .with_context(|| format!("open {}", archive_path.display()))?;
        fs::create_dir_all(&files_dir)
            .with_context(|| format!("create directory {}", files_dir.display()))?;
        tar::Archive::new(GzDecoder::new(archive))
            .unpack(&files_dir)
            .with_context(|| format!("unpack {}", archive_path.display()))?;
        fs::remove_file(&archive_path)
            .with_context(|| format!("remove {}", archive_path.display()))?;

        let mut updated = manifest.clone();
        updated.status = SnapshotStatus::Available;
        updated.compressed_at = None;
        write_json_atomic(
            &self.paths.manifest_path(&manifest.plan_id, manifest.stage),
            &updated,
        )?;
        debug!(plan_id = %manifest.plan_id, stage = manifest.stage, "snapshot decompressed");
        Ok(files_dir)
    }

    /// Keep the first, the last and the `retention` most recent snapshots.
    ///
    /// Recovery points of deleted stages are removed with them.
    pub fn cleanup_snapshots(&self, plan_id: &str, retention: usize) -> Result<CleanupReport> {
        let stages = self.snapshot_stages(plan_id)?;
        let (kept, deleted) = select_retained(&stages, retention);
        for stage in &deleted {
            remove_dir_if_exists(&self.paths.snapshot_dir(plan_id, *stage))?;
            remove_recovery_point(self.paths, plan_id, *stage)?;
        }
        if !deleted.is_empty() {
            info!(plan_id, deleted = ?deleted, kept = ?kept, "old snapshots removed");
        }
        Ok(CleanupReport { kept, deleted })
    }

    /// Pack snapshots older than `compression_age_days` into `files.tar.gz`.
    ///
    /// Returns the stages compressed by this call.
    pub fn compress_old_snapshots(&self, plan_id: &str) -> Result<Vec<u32>> {
        let now = self.clock.now();
        let max_age = i64::try_from(self.config.compression_age_days)
            .ok()
            .and_then(chrono::Duration::try_days)
            .unwrap_or(chrono::Duration::MAX);
        let mut compressed = Vec::new();
        for manifest in self.list_snapshots(plan_id)? {
            if manifest.status == SnapshotStatus::Compressed
                || now.signed_duration_since(manifest.created_at) < max_age
            {
                continue;
            }
            compressed.push(self.compress_snapshot(manifest, now)?);
        }
        Ok(compressed)
    }

    fn compress_snapshot(&self, mut manifest: SnapshotManifest, now: DateTime<Utc>) -> Result<u32> {
        let stage_dir = self.paths.snapshot_dir(&manifest.plan_id, manifest.stage);
        let files_dir = stage_dir.join(FILES_DIR);
        let archive_path = stage_dir.join(ARCHIVE_NAME);

        let archive = File::create(&archive_path)
            .with_context(|| format!("create {}", archive_path.display()))?;
        let mut builder = tar::Builder::new(GzEncoder::new(archive, Compression::default()));
        if files_dir.is_dir() {
            builder
                .append_dir_all(".", &files_dir)
                .with_context(|| format!("archive {}", files_dir.display()))?;
        }
        builder
            .into_inner()
            .and_then(GzEncoder::finish)
            .with_context(|| format!("finish {}", archive_path.display()))?;
        remove_dir_if_exists(&files_dir)?;

        manifest.status = SnapshotStatus::Compressed;
        manifest.compressed_at = Some(now);
        write_json_atomic(
            &self.paths.manifest_path(&manifest.plan_id, manifest.stage),
            &manifest,
        )?;
        debug!(plan_id = %manifest.plan_id, stage = manifest.stage, "snapshot compressed");
        Ok(manifest.stage)
    }

    /// Delete every snapshot of a plan.
    pub fn delete_all(&self, plan_id: &str) -> Result<bool> {
        validate_task_name(plan_id)?;
        remove_dir_if_exists(&self.paths.plan_snapshots_dir(plan_id))
    }
}

fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<&str> = relative
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<_>>()?;
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

pub fn file_sha256(path: &Path) -> Result<String> {
    let mut file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).with_context(|| format!("hash {}", path.display()))?;
    Ok(hex::encode(hasher.finalize()))
}

/// Parse a comma-separated `--paths` style list into include entries.
pub fn parse_include_list(raw: &[String]) -> Result<Vec<PathBuf>> {
    let include: Vec<PathBuf> = raw
        .iter()
        .flat_map(|entry| entry.split(','))
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(PathBuf::from)
        .collect();
    if include.is_empty() {
        return Err(anyhow!("snapshot include list is empty"));
    }
    Ok(include)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::recovery_points::load_recovery_point;
    use crate::test_support::{fixed_clock, later_clock};

    fn setup() -> (tempfile::TempDir, AutorunPaths, PathBuf) {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = AutorunPaths::new(temp.path().join("home"));
        let project = temp.path().join("project");
        fs::create_dir_all(project.join("src")).expect("mkdir");
        fs::write(project.join("src/main.rs"), "fn main() {}\n").expect("write");
        fs::write(project.join("README.md"), "# readme\n").expect("write");
        (temp, paths, project)
    }

    fn all() -> Vec<PathBuf> {
        vec![PathBuf::from(".")]
    }

    #[test]
    fn first_snapshot_records_everything_as_new() {
        let (_temp, paths, project) = setup();
        fs::create_dir_all(project.join("target/debug")).expect("mkdir");
        fs::write(project.join("target/debug/app"), "bin").expect("write");
        let config = SnapshotConfig::default();
        let clock = fixed_clock();
        let manager = SnapshotManager::new(&paths, &config, &clock);

        let manifest = manager.create_snapshot("demo", 1, &project, &all()).expect("snapshot");
        let recorded: Vec<&str> = manifest.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(recorded, vec!["README.md", "src/main.rs"]);
        assert!(manifest.files.iter().all(|f| f.change == ChangeType::New));
        assert_eq!(manifest.file_count, 2);
        assert_eq!(manifest.files[0].hash.len(), 64);
        assert!(paths.snapshot_dir("demo", 1).join("files/src/main.rs").is_file());
        assert!(load_recovery_point(&paths, "demo", 1).expect("load").is_some());
    }

    #[test]
    fn later_snapshot_only_stores_changes() {
        let (_temp, paths, project) = setup();
        let config = SnapshotConfig::default();
        let clock = fixed_clock();
        let manager = SnapshotManager::new(&paths, &config, &clock);
        manager.create_snapshot("demo", 1, &project, &all()).expect("stage 1");

        fs::write(project.join("src/main.rs"), "fn main() { run(); }\n").expect("modify");
        fs::write(project.join("src/lib.rs"), "pub fn run() {}\n").expect("add");
        let manifest = manager.create_snapshot("demo", 2, &project, &all()).expect("stage 2");

        let changes: Vec<(&str, ChangeType)> = manifest
            .files
            .iter()
            .map(|f| (f.path.as_str(), f.change))
            .collect();
        assert_eq!(
            changes,
            vec![("src/lib.rs", ChangeType::New), ("src/main.rs", ChangeType::Modified)]
        );
        assert!(!paths.snapshot_dir("demo", 2).join("files/README.md").exists());
    }

    #[test]
    fn missing_include_paths_are_skipped() {
        let (_temp, paths, project) = setup();
        let config = SnapshotConfig::default();
        let clock = fixed_clock();
        let manager = SnapshotManager::new(&paths, &config, &clock);
        let include = vec![PathBuf::from("README.md"), PathBuf::from("gone.txt")];
        let manifest = manager.create_snapshot("demo", 1, &project, &include).expect("snapshot");
        assert_eq!(manifest.file_count, 1);
    }

    #[test]
    fn restore_yields_identical_bytes_including_unchanged_files() {
        let (_temp, paths, project) = setup();
        let config = SnapshotConfig::default();
        let clock = fixed_clock();
        let manager = SnapshotManager::new(&paths, &config, &clock);
        manager.create_snapshot("demo", 1, &project, &all()).expect("stage 1");
        fs::write(project.join("src/main.rs"), "fn main() { v2(); }\n").expect("modify");
        manager.create_snapshot("demo", 2, &project, &all()).expect("stage 2");

        fs::write(project.join("src/main.rs"), "broken").expect("clobber");
        fs::write(project.join("README.md"), "clobbered").expect("clobber");

        let report = manager.restore_snapshot("demo", 2, None).expect("restore");
        assert_eq!(
            fs::read_to_string(project.join("src/main.rs")).expect("read"),
            "fn main() { v2(); }\n"
        );
        assert_eq!(
            fs::read_to_string(project.join("README.md")).expect("read"),
            "# readme\n"
        );
        assert_eq!(report.restored.get("src/main.rs"), Some(&2));
        assert_eq!(report.restored.get("README.md"), Some(&1));
    }

    #[test]
    fn restore_of_unknown_stage_is_recovery_point_not_found() {
        let (_temp, paths, _project) = setup();
        let config = SnapshotConfig::default();
        let clock = fixed_clock();
        let manager = SnapshotManager::new(&paths, &config, &clock);
        let err = manager.restore_snapshot("demo", 4, None).unwrap_err();
        assert_eq!(
            err.downcast_ref::<AutorunError>(),
            Some(&AutorunError::RecoveryPointNotFound {
                plan_id: "demo".to_string(),
                stage: 4
            })
        );
    }

    #[test]
    fn cleanup_keeps_endpoints_and_recent() {
        let (_temp, paths, project) = setup();
        let config = SnapshotConfig::default();
        let clock = fixed_clock();
        let manager = SnapshotManager::new(&paths, &config, &clock);
        for stage in 1..=6 {
            fs::write(project.join("README.md"), format!("v{stage}")).expect("write");
            manager.create_snapshot("demo", stage, &project, &all()).expect("snapshot");
        }

        let report = manager.cleanup_snapshots("demo", 2).expect("cleanup");
        assert_eq!(report.kept, vec![1, 5, 6]);
        assert_eq!(report.deleted, vec![2, 3, 4]);
        assert_eq!(manager.snapshot_stages("demo").expect("stages"), vec![1, 5, 6]);
        assert!(load_recovery_point(&paths, "demo", 3).expect("load").is_none());
    }

    #[test]
    fn old_snapshots_compress_and_restore() {
        let (_temp, paths, project) = setup();
        let config = SnapshotConfig::default();
        let clock = fixed_clock();
        SnapshotManager::new(&paths, &config, &clock)
            .create_snapshot("demo", 1, &project, &all())
            .expect("snapshot");

        let later = later_clock(8 * 24 * 60 * 60);
        let manager = SnapshotManager::new(&paths, &config, &later);
        let compressed = manager.compress_old_snapshots("demo").expect("compress");
        assert_eq!(compressed, vec![1]);
        let stage_dir = paths.snapshot_dir("demo", 1);
        assert!(stage_dir.join(ARCHIVE_NAME).is_file());
        assert!(!stage_dir.join(FILES_DIR).exists());
        let manifest = manager.load_manifest("demo", 1).expect("load").expect("manifest");
        assert_eq!(manifest.status, SnapshotStatus::Compressed);
        assert_eq!(manifest.compressed_at, Some(later.0));

        fs::write(project.join("README.md"), "changed").expect("write");
        manager.restore_snapshot("demo", 1, None).expect("restore");
        assert_eq!(
            fs::read_to_string(project.join("README.md")).expect("read"),
            "# readme\n"
        );
        let manifest = manager.load_manifest("demo", 1).expect("load").expect("manifest");
        assert_eq!(manifest.status, SnapshotStatus::Available);
    }

    #[test]
    fn recent_snapshots_are_not_compressed() {
        let (_temp, paths, project) = setup();
        let config = SnapshotConfig::default();
        let clock = fixed_clock();
        let manager = SnapshotManager::new(&paths, &config, &clock);
        manager.create_snapshot("demo", 1, &project, &all()).expect("snapshot");
        assert!(manager.compress_old_snapshots("demo").expect("compress").is_empty());
    }

    #[test]
    fn include_lists_split_on_commas() {
        let include = parse_include_list(&["src, docs".to_string(), "README.md".to_string()])
            .expect("parse");
        assert_eq!(
            include,
            vec![PathBuf::from("src"), PathBuf::from("docs"), PathBuf::from("README.md")]
        );
        assert!(parse_include_list(&[" ".to_string()]).is_err());
    }
}
