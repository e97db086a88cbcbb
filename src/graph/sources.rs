use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Suffix appended to a source's file name to form its object name.
pub const OBJECT_SUFFIX: &str = "o";

/// A compilable unit, identified by path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SourceFile {
    path: PathBuf,
}

impl SourceFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Compiled output of exactly one library member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectArtifact {
    pub source: SourceFile,
    pub path: PathBuf,
}

/// Library members split from excluded entry points.
#[derive(Debug, Clone, Default)]
pub struct Partition {
    pub members: Vec<ObjectArtifact>,
    pub excluded: Vec<SourceFile>,
}

/// Non-recursive scan of `dir` for files ending in `.<suffix>`, sorted.
pub fn discover_sources(dir: &Path, suffix: &str) -> Result<Vec<SourceFile>> {
    if !dir.is_dir() {
        bail!("library source directory not found: '{}'", dir.display());
    }
    let wanted = suffix.trim_start_matches('.');

    let mut sources = Vec::new();
    for entry in fs::read_dir(dir)
        .with_context(|| format!("reading source directory '{}'", dir.display()))?
    {
        let entry =
            entry.with_context(|| format!("reading entry under '{}'", dir.display()))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) != Some(wanted) {
            continue;
        }
        sources.push(SourceFile::new(path));
    }
    sources.sort();
    Ok(sources)
}

/// `<object_dir>/<file name>.o`, e.g. `lapi.c` -> `lapi.c.o`.
pub fn object_path(object_dir: &Path, source: &SourceFile) -> PathBuf {
    object_dir.join(format!("{}.{OBJECT_SUFFIX}", source.file_name()))
}

pub fn partition(
    sources: Vec<SourceFile>,
    exclude: &BTreeSet<String>,
    object_dir: &Path,
) -> Partition {
    let mut out = Partition::default();
    for source in sources {
        if exclude.contains(&source.file_name()) {
            out.excluded.push(source);
            continue;
        }
        let path = object_path(object_dir, &source);
        out.members.push(ObjectArtifact { source, path });
    }
    out
}
