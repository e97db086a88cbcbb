//! External command execution.
//!
//! `Cmd` is a small builder over [`std::process::Command`] that always
//! captures output. Only a failure to start the process is an error; a
//! non-zero exit comes back as a [`CmdResult`] because a failed compile is a
//! result to report, not a reason to abort.

use anyhow::{Context, Result};
use std::ffi::{OsStr, OsString};
use std::process::Command;

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub struct CmdResult {
    /// Exit code, `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    success: bool,
}

impl CmdResult {
    pub fn success(&self) -> bool {
        self.success
    }
}

/// Builder for a single external command.
#[derive(Debug)]
pub struct Cmd {
    program: OsString,
    args: Vec<OsString>,
}

impl Cmd {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    /// Run to completion. `Err` only when the process could not be spawned.
    pub fn run(self) -> Result<CmdResult> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .output()
            .with_context(|| format!("spawning '{}'", self.display()))?;

        Ok(CmdResult {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            success: output.status.success(),
        })
    }

    fn display(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|a| a.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout() {
        let result = Cmd::new("echo").arg("hello").run().unwrap();
        assert!(result.success());
        assert_eq!(result.stdout.trim(), "hello");
    }

    #[test]
    fn non_zero_exit_is_reported_not_raised() {
        let result = Cmd::new("sh").args(["-c", "exit 1"]).run().unwrap();
        assert!(!result.success());
        assert_eq!(result.code, Some(1));
    }

    #[test]
    fn missing_program_is_spawn_error() {
        let err = Cmd::new("definitely_not_a_real_command_12345")
            .run()
            .unwrap_err();
        assert!(err.to_string().contains("spawning"));
    }
}
