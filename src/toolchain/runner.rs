use anyhow::Result;

use super::CommandLine;
use crate::process::Cmd;

/// Outcome of one external command. A non-zero exit is the only failure signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub code: Option<i32>,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn ok() -> Self {
        Self {
            code: Some(0),
            success: true,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Combined stderr and stdout, trimmed.
    pub fn diagnostics(&self) -> String {
        let mut text = self.stderr.trim().to_string();
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(stdout);
        }
        text
    }

    pub fn status_label(&self) -> String {
        match self.code {
            Some(code) => format!("exit status {code}"),
            None => "terminated by signal".to_string(),
        }
    }
}

/// Executes rendered command lines.
///
/// `Err` means the command could not be started at all; a command that ran
/// and failed is `Ok` with `success == false`.
pub trait CommandRunner: Sync {
    fn run(&self, cmd: &CommandLine) -> Result<ToolOutput>;
}

/// Runs commands as host subprocesses, blocking until each exits.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostRunner;

impl CommandRunner for HostRunner {
    fn run(&self, cmd: &CommandLine) -> Result<ToolOutput> {
        let result = Cmd::new(cmd.program()).args(cmd.arguments()).run()?;
        Ok(ToolOutput {
            code: result.code,
            success: result.success(),
            stdout: result.stdout,
            stderr: result.stderr,
        })
    }
}
