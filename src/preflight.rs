//! Preflight checks for build validation.
//!
//! Validates that the host has the cross toolchain and the copy program
//! before anything is compiled, so a missing tool fails in one line instead
//! of as a wall of per-object spawn errors.

use anyhow::{bail, Result};
use std::path::PathBuf;

use crate::config::Config;

/// Check if a command exists on the host system.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Check that specific tools are available.
///
/// Each tuple is (command, hint shown when missing).
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<String> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .map(|(tool, hint)| format!("  {} ({})", tool, hint))
        .collect();

    if !missing.is_empty() {
        bail!("Missing required host tools:\n{}", missing.join("\n"));
    }
    Ok(())
}

/// Tools needed to build.
pub fn check_build_tools(config: &Config) -> Result<()> {
    check_required_tools(&[
        (config.toolchain.cc.as_str(), "cross compiler"),
        (config.toolchain.ar.as_str(), "cross archiver"),
    ])
}

/// Tools needed to deploy.
pub fn check_deploy_tools(config: &Config) -> Result<()> {
    check_required_tools(&[(config.deploy.program.as_str(), "remote copy")])
}

/// Inputs that must exist before a build: library sources, app sources and
/// every pinned shared object.
pub fn check_build_inputs(config: &Config) -> Result<()> {
    let mut missing: Vec<PathBuf> = Vec::new();
    if !config.library.source_dir.is_dir() {
        missing.push(config.library.source_dir.clone());
    }
    missing.extend(config.app.sources.iter().filter(|p| !p.is_file()).cloned());
    missing.extend(
        config
            .abi_shim
            .pinned
            .values()
            .filter(|p| !p.is_file())
            .cloned(),
    );

    if !missing.is_empty() {
        let list = missing
            .iter()
            .map(|p| format!("  {}", p.display()))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing build inputs:\n{}", list);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::Project;
    use std::fs;

    #[test]
    fn test_command_exists() {
        assert!(command_exists("sh"));
        assert!(!command_exists("definitely_not_a_real_command_12345"));
    }

    #[test]
    fn test_check_required_tools_failure_lists_tool() {
        let err = check_required_tools(&[("nonexistent_command_xyz", "fake")]).unwrap_err();
        assert!(err.to_string().contains("nonexistent_command_xyz"));
    }

    #[test]
    fn build_inputs_present_in_fixture() {
        let project = Project::new(&["a.c"]);
        check_build_inputs(&project.config()).unwrap();
    }

    #[test]
    fn missing_app_source_is_reported() {
        let project = Project::new(&["a.c"]);
        fs::remove_file(project.root().join("input.c")).unwrap();
        let err = check_build_inputs(&project.config()).unwrap_err();
        assert!(err.to_string().contains("input.c"));
    }

    #[test]
    fn fixture_toolchain_is_not_installed() {
        let project = Project::new(&["a.c"]);
        assert!(check_build_tools(&project.config()).is_err());
    }
}
