//! Artifact cache: decides whether an object or archive may be reused.
//!
//! Two policies:
//!
//! - [`CachePolicy::Existence`] rebuilds only when the artifact file is
//!   missing. Deleting an artifact forces a rebuild; editing a source does
//!   NOT. This is the historical behaviour, kept for slow cross builds of a
//!   runtime that rarely changes. Stale objects and archives are possible.
//! - [`CachePolicy::Fingerprint`] additionally rebuilds when the recorded
//!   fingerprint (sha256 of inputs and command line) differs.
//!
//! Fingerprint entries live under `<build_dir>/.cache/` as one JSON file per
//! artifact, written atomically.

mod lock;

pub use lock::BuildLock;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

use crate::toolchain::CommandLine;

/// Cache state directory name inside the build directory.
pub const CACHE_DIR: &str = ".cache";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePolicy {
    Existence,
    Fingerprint,
}

impl CachePolicy {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "existence" | "exists" => Ok(CachePolicy::Existence),
            "fingerprint" | "hash" => Ok(CachePolicy::Fingerprint),
            other => bail!(
                "unsupported cache policy '{}'; expected 'existence' or 'fingerprint'",
                other
            ),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CachePolicy::Existence => "existence",
            CachePolicy::Fingerprint => "fingerprint",
        }
    }
}

/// Why an artifact has to be (re)built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildReason {
    Missing,
    Unrecorded,
    Changed,
}

/// Persisted fingerprint for one artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub artifact: String,
    pub fingerprint: String,
    pub recorded_at_unix: u64,
}

#[derive(Debug, Clone)]
pub struct ArtifactCache {
    policy: CachePolicy,
    state_dir: PathBuf,
}

impl ArtifactCache {
    /// Open (and create if needed) the cache state under `build_dir`.
    pub fn open(build_dir: &Path, policy: CachePolicy) -> Result<Self> {
        let state_dir = build_dir.join(CACHE_DIR);
        fs::create_dir_all(&state_dir)
            .with_context(|| format!("creating cache directory '{}'", state_dir.display()))?;
        Ok(Self { policy, state_dir })
    }

    pub fn policy(&self) -> CachePolicy {
        self.policy
    }

    /// `true` when `artifact` must be produced again.
    pub fn should_build(&self, artifact: &Path, fingerprint: &str) -> Result<bool> {
        Ok(self.build_reason(artifact, fingerprint)?.is_some())
    }

    pub fn build_reason(&self, artifact: &Path, fingerprint: &str) -> Result<Option<BuildReason>> {
        if !artifact.exists() {
            return Ok(Some(BuildReason::Missing));
        }
        if self.policy == CachePolicy::Existence {
            return Ok(None);
        }
        match self.entry(artifact)? {
            None => Ok(Some(BuildReason::Unrecorded)),
            Some(entry) if entry.fingerprint != fingerprint => Ok(Some(BuildReason::Changed)),
            Some(_) => Ok(None),
        }
    }

    pub fn entry(&self, artifact: &Path) -> Result<Option<CacheEntry>> {
        let path = self.entry_path(artifact);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)
            .with_context(|| format!("reading cache entry '{}'", path.display()))?;
        match serde_json::from_slice::<CacheEntry>(&bytes) {
            Ok(entry) => Ok(Some(entry)),
            Err(err) => {
                // A torn or foreign entry only costs a rebuild.
                debug!(entry = %path.display(), error = %err, "ignoring unreadable cache entry");
                Ok(None)
            }
        }
    }

    /// Record a successful build of `artifact`.
    pub fn record(&self, artifact: &Path, fingerprint: &str) -> Result<()> {
        let entry = CacheEntry {
            artifact: artifact.display().to_string(),
            fingerprint: fingerprint.to_string(),
            recorded_at_unix: now_unix(),
        };
        let path = self.entry_path(artifact);
        let bytes = serde_json::to_vec_pretty(&entry)?;
        let tmp = self.state_dir.join(tmp_name("entry.json"));
        fs::write(&tmp, bytes)
            .with_context(|| format!("writing cache entry '{}'", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("moving cache entry into '{}'", path.display()))?;
        Ok(())
    }

    /// Drop the entry for `artifact`; missing entries are fine.
    pub fn forget(&self, artifact: &Path) -> Result<()> {
        let path = self.entry_path(artifact);
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("removing cache entry '{}'", path.display()))?;
        }
        Ok(())
    }

    fn entry_path(&self, artifact: &Path) -> PathBuf {
        let key = sha256_bytes(artifact.as_os_str().as_encoded_bytes());
        self.state_dir.join(format!("{key}.json"))
    }
}

/// Fingerprint of one object: source bytes, the exact compile command and
/// the digest of the headers it can include (see [`header_digest`]).
pub fn object_fingerprint(source: &Path, compile: &CommandLine, headers: &str) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(b"object\0");
    hash_command(&mut hasher, compile);
    hasher.update(headers.as_bytes());
    hasher.update(b"\0");
    hash_file_into(&mut hasher, source)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Digest over every `*.h` directly inside `dirs`: path and contents, sorted
/// by path. Directories that do not exist contribute nothing.
///
/// Per-object include tracking is not attempted; any header edit
/// invalidates every object compiled against these directories.
pub fn header_digest(dirs: &[PathBuf]) -> Result<String> {
    let mut headers = BTreeSet::new();
    for dir in dirs {
        if !dir.is_dir() {
            continue;
        }
        for entry in fs::read_dir(dir)
            .with_context(|| format!("reading header directory '{}'", dir.display()))?
        {
            let path = entry
                .with_context(|| format!("reading entry under '{}'", dir.display()))?
                .path();
            if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some("h") {
                headers.insert(path);
            }
        }
    }

    let mut hasher = Sha256::new();
    hasher.update(b"headers\0");
    for header in &headers {
        hasher.update(header.as_os_str().as_encoded_bytes());
        hasher.update(b"\0");
        hash_file_into(&mut hasher, header)?;
        hasher.update(b"\0");
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Fingerprint of the archive: archive command plus each member fingerprint,
/// in command order.
pub fn archive_fingerprint(archive: &CommandLine, members: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"archive\0");
    hash_command(&mut hasher, archive);
    for member in members {
        hasher.update(member.as_bytes());
        hasher.update(b"\0");
    }
    format!("{:x}", hasher.finalize())
}

fn hash_command(hasher: &mut Sha256, cmd: &CommandLine) {
    hasher.update(cmd.program().as_encoded_bytes());
    hasher.update(b"\0");
    for arg in cmd.arguments() {
        hasher.update(arg.as_encoded_bytes());
        hasher.update(b"\0");
    }
}

fn hash_file_into(hasher: &mut Sha256, path: &Path) -> Result<()> {
    let f = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut r = BufReader::new(f);
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = r
            .read(&mut buf)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(())
}

fn sha256_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn tmp_name(prefix: &str) -> String {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{}-{seq}.tmp", std::process::id())
}
