//! Deployment to the device, one file per copy.
//!
//! `scp -r` does not reliably replace existing files on the device, so every
//! script is pushed individually to a remote path mirroring its path below
//! the script root. Each push is independent: a failure is recorded and the
//! rest still run. There is no rollback, so a partially updated device is a
//! possible end state.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::path::{Component, Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::DeployConfig;
use crate::toolchain::{CommandLine, CommandRunner};

/// A local file and where it lands on the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeploymentItem {
    pub local: PathBuf,
    pub remote: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeployFailure {
    pub item: DeploymentItem,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DeployReport {
    pub pushed: Vec<DeploymentItem>,
    pub failed: Vec<DeployFailure>,
}

impl DeployReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Reliable-or-failing remote write of one file.
pub trait Transport {
    fn push(&self, local: &Path, remote: &str) -> Result<()>;
}

/// Copies with `scp <local> <user>@<host>:<remote>`.
pub struct ScpTransport<'a> {
    program: String,
    user: String,
    host: String,
    runner: &'a dyn CommandRunner,
}

impl<'a> ScpTransport<'a> {
    pub fn new(config: &DeployConfig, runner: &'a dyn CommandRunner) -> Self {
        Self {
            program: config.program.clone(),
            user: config.user.clone(),
            host: config.host.clone(),
            runner,
        }
    }

    pub fn destination(&self, remote: &str) -> String {
        if self.user.is_empty() {
            format!("{}:{}", self.host, remote)
        } else {
            format!("{}@{}:{}", self.user, self.host, remote)
        }
    }

    pub fn copy_command(&self, local: &Path, remote: &str) -> CommandLine {
        let mut cmd = CommandLine::new(&self.program);
        cmd.arg(local).arg(self.destination(remote));
        cmd
    }
}

impl Transport for ScpTransport<'_> {
    fn push(&self, local: &Path, remote: &str) -> Result<()> {
        let cmd = self.copy_command(local, remote);
        let output = self
            .runner
            .run(&cmd)
            .with_context(|| format!("running '{}'", cmd))?;
        if !output.success {
            bail!(
                "{} failed ({}): {}",
                self.program,
                output.status_label(),
                output.diagnostics()
            );
        }
        Ok(())
    }
}

/// `<remote_dir>/<relative>` with `/` separators.
pub fn remote_path(remote_dir: &str, relative: &Path) -> String {
    let mut out = remote_dir.trim_end_matches('/').to_string();
    for component in relative.components() {
        if let Component::Normal(part) = component {
            out.push('/');
            out.push_str(&part.to_string_lossy());
        }
    }
    out
}

/// Every `*.<suffix>` file below `root`, mapped under `remote_dir`, sorted.
pub fn discover_scripts(root: &Path, suffix: &str, remote_dir: &str) -> Result<Vec<DeploymentItem>> {
    if !root.is_dir() {
        bail!("script root not found: '{}'", root.display());
    }
    let wanted = suffix.trim_start_matches('.');

    let mut items = Vec::new();
    for entry in WalkDir::new(root).follow_links(true).sort_by_file_name() {
        let entry =
            entry.with_context(|| format!("walking script root '{}'", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(wanted) {
            continue;
        }
        let relative = path.strip_prefix(root).unwrap_or(path);
        items.push(DeploymentItem {
            local: path.to_path_buf(),
            remote: remote_path(remote_dir, relative),
        });
    }
    Ok(items)
}

/// Scripts first, then the executable.
pub fn deployment_items(config: &DeployConfig, executable: &Path) -> Result<Vec<DeploymentItem>> {
    let mut items = match &config.script_root {
        Some(root) => discover_scripts(root, &config.script_suffix, &config.script_remote_dir)?,
        None => Vec::new(),
    };
    items.push(DeploymentItem {
        local: executable.to_path_buf(),
        remote: config.executable_remote.clone(),
    });
    Ok(items)
}

/// Push every item, continuing past failures.
pub fn deploy(transport: &dyn Transport, items: &[DeploymentItem]) -> DeployReport {
    let mut report = DeployReport::default();
    for item in items {
        let result = if item.local.is_file() {
            transport.push(&item.local, &item.remote)
        } else {
            Err(anyhow::anyhow!("local file missing: {}", item.local.display()))
        };
        match result {
            Ok(()) => {
                info!("[crossbuild:deploy] {} -> {}", item.local.display(), item.remote);
                report.pushed.push(item.clone());
            }
            Err(err) => {
                warn!("[crossbuild:deploy] {} failed: {err:#}", item.local.display());
                report.failed.push(DeployFailure {
                    item: item.clone(),
                    error: format!("{err:#}"),
                });
            }
        }
    }
    report
}
