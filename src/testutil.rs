//! Test fixtures: a throwaway project tree and a runner that simulates the
//! cross toolchain by writing the files each command would produce.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Result;
use tempfile::TempDir;

use crate::cache::CachePolicy;
use crate::config::{load_config, Config};
use crate::toolchain::{CommandLine, CommandRunner, ToolOutput};

/// Records every command; fails those that mention a file named in `failing`.
#[derive(Default)]
pub struct RecordingRunner {
    commands: Mutex<Vec<CommandLine>>,
    failing: BTreeSet<String>,
}

impl RecordingRunner {
    pub fn failing(names: &[&str]) -> Self {
        Self {
            commands: Mutex::default(),
            failing: names.iter().map(|n| n.to_string()).collect(),
        }
    }

    pub fn commands(&self) -> Vec<CommandLine> {
        self.commands.lock().unwrap().clone()
    }

    /// File names passed to `-c`, sorted.
    pub fn compile_sources(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .commands()
            .iter()
            .filter_map(|cmd| {
                let idx = cmd.position_of("-c")?;
                cmd.arguments().get(idx + 1).map(|a| file_name(Path::new(a)))
            })
            .collect();
        out.sort();
        out
    }

    /// File names of the members of the last archive command.
    pub fn archive_members(&self) -> Vec<String> {
        self.commands()
            .iter()
            .rev()
            .find(|cmd| cmd.position_of("rcs") == Some(0))
            .map(|cmd| {
                cmd.arguments()[2..]
                    .iter()
                    .map(|a| file_name(Path::new(a)))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn link_commands(&self) -> Vec<CommandLine> {
        self.commands()
            .into_iter()
            .filter(|cmd| cmd.position_of("-c").is_none() && cmd.position_of("-o").is_some())
            .collect()
    }

    pub fn copy_commands(&self) -> Vec<CommandLine> {
        self.commands()
            .into_iter()
            .filter(|cmd| cmd.program() == "scp")
            .collect()
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&self, cmd: &CommandLine) -> Result<ToolOutput> {
        self.commands.lock().unwrap().push(cmd.clone());

        let fails = cmd
            .arguments()
            .iter()
            .any(|a| self.failing.contains(&file_name(Path::new(a))));
        if fails {
            return Ok(ToolOutput::failed(1, "simulated failure"));
        }

        if cmd.position_of("rcs") == Some(0) {
            let archive = PathBuf::from(&cmd.arguments()[1]);
            if let Some(parent) = archive.parent() {
                fs::create_dir_all(parent)?;
            }
            let members: Vec<String> = cmd.arguments()[2..]
                .iter()
                .map(|a| a.to_string_lossy().into_owned())
                .collect();
            fs::write(archive, members.join("\n"))?;
        } else if let Some(output) = cmd.output_path() {
            if let Some(parent) = output.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(output, cmd.to_string())?;
        }
        Ok(ToolOutput::ok())
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// A project tree with a vendored library, app sources and a pinned libm.
pub struct Project {
    tmp: TempDir,
}

impl Project {
    pub fn new(library_sources: &[&str]) -> Self {
        Self::with_cache(library_sources, CachePolicy::Fingerprint)
    }

    pub fn with_cache(library_sources: &[&str], policy: CachePolicy) -> Self {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();

        fs::create_dir_all(root.join("lua/src")).unwrap();
        for name in library_sources {
            fs::write(root.join("lua/src").join(name), format!("/* {name} */")).unwrap();
        }
        fs::write(root.join("lua/src/lua.h"), "").unwrap();
        for name in ["main.c", "input.c"] {
            fs::write(root.join(name), "int main;").unwrap();
        }
        fs::create_dir_all(root.join("rmlib")).unwrap();
        fs::write(root.join("rmlib/libm.so.6"), "ELF").unwrap();

        let config = format!(
            r#"
[toolchain]
cc = "cc-test"
ar = "ar-test"

[library]
source_dir = "lua/src"

[app]
sources = ["main.c", "input.c"]
include_dirs = ["lua/src"]
libraries = ["dl", "rt", "m"]

[abi_shim.pinned]
m = "rmlib/libm.so.6"

[deploy]
script_root = "luaapps"

[build]
jobs = 2
cache = "{}"
"#,
            policy.as_str()
        );
        fs::write(root.join("Crossbuild.toml"), config).unwrap();

        Self { tmp }
    }

    pub fn root(&self) -> &Path {
        self.tmp.path()
    }

    pub fn config_path(&self) -> PathBuf {
        self.root().join("Crossbuild.toml")
    }

    pub fn config(&self) -> Config {
        load_config(&self.config_path()).unwrap()
    }

    pub fn source(&self, name: &str) -> PathBuf {
        self.root().join("lua/src").join(name)
    }

    pub fn object(&self, source: &str) -> PathBuf {
        self.root().join("built/luas").join(format!("{source}.o"))
    }

    pub fn archive(&self) -> PathBuf {
        self.root().join("built/luas/all.a")
    }

    pub fn exe(&self) -> PathBuf {
        self.root().join("built/engine")
    }

    pub fn pinned_libm(&self) -> PathBuf {
        self.root().join("rmlib/libm.so.6")
    }
}
