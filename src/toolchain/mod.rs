//! Cross-toolchain invocation.
//!
//! Every compiler, archiver and linker call is first rendered into a
//! [`CommandLine`] so it can be printed by `plan`, logged, fingerprinted and
//! inspected in tests before it is handed to a [`CommandRunner`].
//!
//! Argument grammar:
//!
//! ```text
//! compile: <cc> <warnings..> <opt> -c <source> -o <object> [-l<lib>]*
//! archive: <ar> rcs <archive> <object>+
//! link:    <cc> <warnings..> <opt> [-flto] -o <exe> [-L<dir>]* [-I<dir>]*
//!          <sources>* <static library> [<pinned .so>]* [-l<lib>]*
//! ```

pub mod runner;

pub use runner::{CommandRunner, HostRunner, ToolOutput};

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::debug;

use crate::config::ToolchainConfig;
use crate::shim::LinkTarget;

const LTO_FLAG: &str = "-flto";

/// A fully rendered external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    program: OsString,
    args: Vec<OsString>,
}

impl CommandLine {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
        }
    }

    pub fn arg(&mut self, arg: impl AsRef<OsStr>) -> &mut Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self.arg(arg);
        }
        self
    }

    pub fn program(&self) -> &OsStr {
        &self.program
    }

    pub fn arguments(&self) -> &[OsString] {
        &self.args
    }

    /// Index of the first argument equal to `needle`.
    pub fn position_of(&self, needle: impl AsRef<OsStr>) -> Option<usize> {
        let needle = needle.as_ref();
        self.args.iter().position(|a| a.as_os_str() == needle)
    }

    /// The path following `-o`, if any.
    pub fn output_path(&self) -> Option<PathBuf> {
        let idx = self.position_of("-o")?;
        self.args.get(idx + 1).map(PathBuf::from)
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.to_string_lossy())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Inputs of the final link, in the order they reach the linker.
#[derive(Debug, Clone)]
pub struct LinkSpec<'a> {
    pub output: &'a Path,
    pub library_dirs: &'a [PathBuf],
    pub include_dirs: &'a [PathBuf],
    pub sources: &'a [PathBuf],
    pub static_library: &'a Path,
    pub targets: &'a [LinkTarget],
}

/// Cross compiler, archiver and linker bound to a runner.
pub struct Toolchain<'a> {
    config: &'a ToolchainConfig,
    runner: &'a dyn CommandRunner,
}

impl<'a> Toolchain<'a> {
    pub fn new(config: &'a ToolchainConfig, runner: &'a dyn CommandRunner) -> Self {
        Self { config, runner }
    }

    pub fn compile_command(&self, source: &Path, object: &Path) -> CommandLine {
        let mut cmd = CommandLine::new(&self.config.cc);
        cmd.args(&self.config.warnings)
            .arg(&self.config.optimization)
            .arg("-c")
            .arg(source)
            .arg("-o")
            .arg(object);
        for lib in &self.config.compile_libraries {
            cmd.arg(format!("-l{lib}"));
        }
        cmd
    }

    pub fn archive_command(&self, archive: &Path, objects: &[PathBuf]) -> CommandLine {
        let mut cmd = CommandLine::new(&self.config.ar);
        cmd.arg("rcs").arg(archive).args(objects);
        cmd
    }

    pub fn link_command(&self, spec: &LinkSpec<'_>) -> CommandLine {
        let mut cmd = CommandLine::new(&self.config.cc);
        cmd.args(&self.config.warnings).arg(&self.config.optimization);
        if self.config.lto {
            cmd.arg(LTO_FLAG);
        }
        cmd.arg("-o").arg(spec.output);
        for dir in spec.library_dirs {
            cmd.arg(format!("-L{}", dir.display()));
        }
        for dir in spec.include_dirs {
            cmd.arg(format!("-I{}", dir.display()));
        }
        cmd.args(spec.sources);
        // ld binds a shared object's symbols only when an earlier input left
        // them undefined, so the archive must precede every pinned library.
        cmd.arg(spec.static_library);
        for target in spec.targets {
            target.render_into(&mut cmd);
        }
        cmd
    }

    pub fn compile(&self, source: &Path, object: &Path) -> Result<ToolOutput> {
        self.exec(&self.compile_command(source, object))
    }

    pub fn archive(&self, archive: &Path, objects: &[PathBuf]) -> Result<ToolOutput> {
        self.exec(&self.archive_command(archive, objects))
    }

    pub fn link(&self, spec: &LinkSpec<'_>) -> Result<ToolOutput> {
        self.exec(&self.link_command(spec))
    }

    pub fn exec(&self, cmd: &CommandLine) -> Result<ToolOutput> {
        debug!(command = %cmd, "running toolchain command");
        self.runner.run(cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::RecordingRunner;

    fn toolchain_config() -> ToolchainConfig {
        ToolchainConfig {
            cc: "arm-linux-gnueabihf-gcc".into(),
            ar: "arm-linux-gnueabihf-ar".into(),
            warnings: vec!["-Wall".into(), "-Wextra".into()],
            optimization: "-O3".into(),
            lto: true,
            compile_libraries: vec!["m".into()],
        }
    }

    fn strings(cmd: &CommandLine) -> Vec<String> {
        cmd.arguments()
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn compile_command_grammar() {
        let config = toolchain_config();
        let runner = RecordingRunner::default();
        let tc = Toolchain::new(&config, &runner);
        let cmd = tc.compile_command(Path::new("src/lapi.c"), Path::new("built/lapi.c.o"));
        assert_eq!(cmd.program(), "arm-linux-gnueabihf-gcc");
        assert_eq!(
            strings(&cmd),
            ["-Wall", "-Wextra", "-O3", "-c", "src/lapi.c", "-o", "built/lapi.c.o", "-lm"]
        );
        assert_eq!(cmd.output_path(), Some(PathBuf::from("built/lapi.c.o")));
    }

    #[test]
    fn archive_command_grammar() {
        let config = toolchain_config();
        let runner = RecordingRunner::default();
        let tc = Toolchain::new(&config, &runner);
        let objects = vec![PathBuf::from("a.c.o"), PathBuf::from("b.c.o")];
        let cmd = tc.archive_command(Path::new("all.a"), &objects);
        assert_eq!(cmd.program(), "arm-linux-gnueabihf-ar");
        assert_eq!(strings(&cmd), ["rcs", "all.a", "a.c.o", "b.c.o"]);
    }

    #[test]
    fn link_command_orders_archive_before_pinned_and_search_libs() {
        let config = toolchain_config();
        let runner = RecordingRunner::default();
        let tc = Toolchain::new(&config, &runner);
        let sources = vec![PathBuf::from("main.c"), PathBuf::from("input.c")];
        let includes = vec![PathBuf::from("lua/src")];
        let targets = vec![
            LinkTarget::Pinned {
                name: "m".into(),
                path: PathBuf::from("rmlib/libm.so.6"),
            },
            LinkTarget::Search("dl".into()),
        ];
        let spec = LinkSpec {
            output: Path::new("built/engine"),
            library_dirs: &[],
            include_dirs: &includes,
            sources: &sources,
            static_library: Path::new("built/luas/all.a"),
            targets: &targets,
        };
        let cmd = tc.link_command(&spec);
        assert_eq!(
            strings(&cmd),
            [
                "-Wall",
                "-Wextra",
                "-O3",
                "-flto",
                "-o",
                "built/engine",
                "-Ilua/src",
                "main.c",
                "input.c",
                "built/luas/all.a",
                "rmlib/libm.so.6",
                "-ldl",
            ]
        );
    }

    #[test]
    fn exec_goes_through_runner() {
        let config = toolchain_config();
        let runner = RecordingRunner::default();
        let tc = Toolchain::new(&config, &runner);
        let tmp = tempfile::TempDir::new().unwrap();
        let archive = tmp.path().join("luas/all.a");
        let out = tc.archive(&archive, &[PathBuf::from("x.o")]).unwrap();
        assert!(out.success);
        assert!(archive.is_file());
        assert_eq!(runner.archive_members(), ["x.o"]);
    }
}
