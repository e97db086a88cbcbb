//! Per-run manifests under `<build_dir>/runs/<run_id>/run-manifest.json`.
//!
//! A manifest is the structured summary of one invocation: compile
//! failures, archive and link outcome, and which files reached the device.

use std::cmp::Reverse;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::warn;

use crate::cache::CachePolicy;

pub const RUNS_DIR: &str = "runs";
const RUN_MANIFEST_FILENAME: &str = "run-manifest.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub command: String,
    pub status: RunStatus,
    pub created_at_utc: String,
    pub finished_at_utc: Option<String>,
    /// Cache policy the build used; `None` for deploy-only runs.
    #[serde(default)]
    pub cache: Option<CachePolicy>,
    #[serde(default)]
    pub report: serde_json::Value,
}

/// Sortable, unique-per-process id such as `20261015T081200Z-000123456`.
pub fn new_run_id() -> String {
    let now = OffsetDateTime::now_utc();
    format!(
        "{:04}{:02}{:02}T{:02}{:02}{:02}Z-{:09}",
        now.year(),
        u8::from(now.month()),
        now.day(),
        now.hour(),
        now.minute(),
        now.second(),
        now.nanosecond()
    )
}

pub fn now_utc() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "unknown".to_string())
}

pub fn runs_dir(build_dir: &Path) -> PathBuf {
    build_dir.join(RUNS_DIR)
}

pub fn manifest_path(run_dir: &Path) -> PathBuf {
    run_dir.join(RUN_MANIFEST_FILENAME)
}

/// Write the manifest via a temp file and rename, so readers never see a
/// partially written file.
pub fn write_manifest(build_dir: &Path, manifest: &RunManifest) -> Result<PathBuf> {
    let run_dir = runs_dir(build_dir).join(&manifest.run_id);
    fs::create_dir_all(&run_dir)
        .with_context(|| format!("creating run directory '{}'", run_dir.display()))?;
    let path = manifest_path(&run_dir);
    let tmp = run_dir.join(format!("{RUN_MANIFEST_FILENAME}.{}.tmp", std::process::id()));
    let bytes = serde_json::to_vec_pretty(manifest)?;
    fs::write(&tmp, bytes)
        .with_context(|| format!("writing run manifest '{}'", tmp.display()))?;
    fs::rename(&tmp, &path)
        .with_context(|| format!("moving run manifest into '{}'", path.display()))?;
    Ok(path)
}

/// Run directories, newest first by directory name.
pub fn run_dirs(build_dir: &Path) -> Result<Vec<PathBuf>> {
    let root = runs_dir(build_dir);
    if !root.is_dir() {
        return Ok(Vec::new());
    }
    let mut dirs = Vec::new();
    for entry in
        fs::read_dir(&root).with_context(|| format!("reading runs directory '{}'", root.display()))?
    {
        let entry =
            entry.with_context(|| format!("iterating runs directory '{}'", root.display()))?;
        let path = entry.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort_by_key(|dir| Reverse(dir.file_name().map(|n| n.to_os_string())));
    Ok(dirs)
}

/// Readable manifests, newest first. Missing or unparsable manifests are
/// skipped.
pub fn load_runs(build_dir: &Path) -> Result<Vec<RunManifest>> {
    let mut runs = Vec::new();
    for run_dir in run_dirs(build_dir)? {
        let path = manifest_path(&run_dir);
        if !path.is_file() {
            continue;
        }
        let parsed = fs::read(&path).map_err(anyhow::Error::from).and_then(|bytes| {
            serde_json::from_slice::<RunManifest>(&bytes).map_err(anyhow::Error::from)
        });
        match parsed {
            Ok(run) => runs.push(run),
            Err(err) => {
                warn!(manifest = %path.display(), error = %err, "skipping unreadable run manifest")
            }
        }
    }
    runs.sort_by_key(|run| Reverse(run.run_id.clone()));
    Ok(runs)
}

pub fn latest_run(build_dir: &Path) -> Result<Option<RunManifest>> {
    Ok(load_runs(build_dir)?.into_iter().next())
}

/// Remove all but the newest `keep` run directories, readable or not.
pub fn prune_old_runs(build_dir: &Path, keep: usize) -> Result<usize> {
    let mut removed = 0;
    for path in run_dirs(build_dir)?.into_iter().skip(keep) {
        fs::remove_dir_all(&path)
            .with_context(|| format!("removing expired run directory '{}'", path.display()))?;
        removed += 1;
    }
    Ok(removed)
}
