//! Project configuration (`Crossbuild.toml`).
//!
//! Raw TOML tables are parsed with `deny_unknown_fields` and converted into a
//! validated [`Config`]. Relative paths resolve against the directory that
//! holds the config file. Every field except `library.source_dir` has a
//! default matching the reMarkable engine build.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::cache::CachePolicy;

pub const DEFAULT_CONFIG_FILE: &str = "Crossbuild.toml";
pub const CONFIG_ENV: &str = "CROSSBUILD_CONFIG";

#[derive(Debug, Clone)]
pub struct Config {
    /// Directory relative paths were resolved against.
    pub root: PathBuf,
    pub toolchain: ToolchainConfig,
    pub library: LibraryConfig,
    pub app: AppConfig,
    pub abi_shim: AbiShimConfig,
    pub deploy: DeployConfig,
    pub build: BuildSettings,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolchainConfig {
    pub cc: String,
    pub ar: String,
    pub warnings: Vec<String>,
    pub optimization: String,
    /// Pass `-flto` to the final link.
    pub lto: bool,
    /// `-l` flags appended to every object compile.
    pub compile_libraries: Vec<String>,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            cc: "arm-linux-gnueabihf-gcc".to_string(),
            ar: "arm-linux-gnueabihf-ar".to_string(),
            warnings: vec!["-Wall".to_string(), "-Wextra".to_string()],
            optimization: "-O3".to_string(),
            lto: true,
            compile_libraries: vec!["m".to_string()],
        }
    }
}

/// The vendored runtime folded into the static archive.
#[derive(Debug, Clone)]
pub struct LibraryConfig {
    pub source_dir: PathBuf,
    /// File suffix without the dot.
    pub suffix: String,
    /// Entry-point sources that define `main`.
    pub exclude: BTreeSet<String>,
    pub object_dir: PathBuf,
    pub archive: PathBuf,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub sources: Vec<PathBuf>,
    pub include_dirs: Vec<PathBuf>,
    pub libraries: Vec<String>,
    pub library_dirs: Vec<PathBuf>,
    pub output: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct AbiShimConfig {
    pub pinned: BTreeMap<String, PathBuf>,
}

#[derive(Debug, Clone)]
pub struct DeployConfig {
    pub user: String,
    pub host: String,
    pub program: String,
    pub executable_remote: String,
    /// `None` when the project has no scripts to ship.
    pub script_root: Option<PathBuf>,
    pub script_suffix: String,
    pub script_remote_dir: String,
}

#[derive(Debug, Clone)]
pub struct BuildSettings {
    pub dir: PathBuf,
    pub jobs: usize,
    pub cache: CachePolicy,
    pub allow_partial_archive: bool,
    pub keep_runs: usize,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CrossbuildToml {
    toolchain: Option<ToolchainToml>,
    library: LibraryToml,
    app: Option<AppToml>,
    abi_shim: Option<AbiShimToml>,
    deploy: Option<DeployToml>,
    build: Option<BuildToml>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ToolchainToml {
    cc: Option<String>,
    ar: Option<String>,
    warnings: Option<Vec<String>>,
    optimization: Option<String>,
    lto: Option<bool>,
    compile_libraries: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LibraryToml {
    source_dir: String,
    suffix: Option<String>,
    exclude: Option<Vec<String>>,
    object_dir: Option<String>,
    archive: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct AppToml {
    sources: Option<Vec<String>>,
    include_dirs: Option<Vec<String>>,
    libraries: Option<Vec<String>>,
    library_dirs: Option<Vec<String>>,
    output: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct AbiShimToml {
    #[serde(default)]
    pinned: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct DeployToml {
    user: Option<String>,
    host: Option<String>,
    program: Option<String>,
    executable_remote: Option<String>,
    script_root: Option<String>,
    script_suffix: Option<String>,
    script_remote_dir: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct BuildToml {
    dir: Option<String>,
    jobs: Option<usize>,
    cache: Option<String>,
    allow_partial_archive: Option<bool>,
    keep_runs: Option<usize>,
}

/// Config path from an explicit flag, then `CROSSBUILD_CONFIG`, then the
/// current directory.
pub fn locate_config(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    match std::env::var_os(CONFIG_ENV) {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => PathBuf::from(DEFAULT_CONFIG_FILE),
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading config '{}'", path.display()))?;
    let root = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    parse_config(&raw, &root).with_context(|| format!("parsing config '{}'", path.display()))
}

pub fn parse_config(raw: &str, root: &Path) -> Result<Config> {
    let parsed: CrossbuildToml = toml::from_str(raw)?;

    let toolchain = toolchain_config(parsed.toolchain.unwrap_or_default())?;
    let build = build_settings(root, parsed.build.unwrap_or_default())?;
    let library = library_config(root, &build.dir, parsed.library)?;
    let app = app_config(root, &build.dir, parsed.app.unwrap_or_default())?;
    let abi_shim = abi_shim_config(root, parsed.abi_shim.unwrap_or_default())?;
    let deploy = deploy_config(root, parsed.deploy.unwrap_or_default())?;

    Ok(Config {
        root: root.to_path_buf(),
        toolchain,
        library,
        app,
        abi_shim,
        deploy,
        build,
    })
}

fn toolchain_config(raw: ToolchainToml) -> Result<ToolchainConfig> {
    let defaults = ToolchainConfig::default();
    let config = ToolchainConfig {
        cc: raw.cc.unwrap_or(defaults.cc),
        ar: raw.ar.unwrap_or(defaults.ar),
        warnings: raw.warnings.unwrap_or(defaults.warnings),
        optimization: raw.optimization.unwrap_or(defaults.optimization),
        lto: raw.lto.unwrap_or(defaults.lto),
        compile_libraries: raw.compile_libraries.unwrap_or(defaults.compile_libraries),
    };
    if config.cc.trim().is_empty() || config.ar.trim().is_empty() {
        bail!("toolchain.cc and toolchain.ar must not be empty");
    }
    Ok(config)
}

fn library_config(root: &Path, build_dir: &Path, raw: LibraryToml) -> Result<LibraryConfig> {
    let suffix = raw
        .suffix
        .unwrap_or_else(|| "c".to_string())
        .trim()
        .trim_start_matches('.')
        .to_string();
    if suffix.is_empty() {
        bail!("library.suffix must not be empty");
    }

    let exclude = raw
        .exclude
        .unwrap_or_else(|| vec!["lua.c".to_string(), "luac.c".to_string()]);
    for name in &exclude {
        if name.contains('/') || name.contains('\\') {
            bail!("library.exclude entries are file names, got path '{}'", name);
        }
    }

    let object_dir = match raw.object_dir {
        Some(path) => resolve_path(root, &path),
        None => build_dir.join("luas"),
    };
    let archive = match raw.archive {
        Some(path) => resolve_path(root, &path),
        None => object_dir.join("all.a"),
    };

    Ok(LibraryConfig {
        source_dir: resolve_path(root, &raw.source_dir),
        suffix,
        exclude: exclude.into_iter().collect(),
        object_dir,
        archive,
    })
}

fn app_config(root: &Path, build_dir: &Path, raw: AppToml) -> Result<AppConfig> {
    let sources = raw.sources.unwrap_or_else(|| {
        ["framebuffer.c", "input.c", "main.c", "interpreter.c"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    });
    if sources.is_empty() {
        bail!("app.sources must list at least one source file");
    }

    let libraries = raw
        .libraries
        .unwrap_or_else(|| vec!["dl".to_string(), "rt".to_string()]);
    if libraries.iter().any(|l| l.trim().is_empty()) {
        bail!("app.libraries must not contain empty names");
    }

    let output = match raw.output {
        Some(path) => resolve_path(root, &path),
        None => build_dir.join("engine"),
    };

    Ok(AppConfig {
        sources: resolve_all(root, sources),
        include_dirs: resolve_all(root, raw.include_dirs.unwrap_or_default()),
        libraries,
        library_dirs: resolve_all(root, raw.library_dirs.unwrap_or_default()),
        output,
    })
}

fn abi_shim_config(root: &Path, raw: AbiShimToml) -> Result<AbiShimConfig> {
    let mut pinned = BTreeMap::new();
    for (name, path) in raw.pinned {
        let name = name.trim().to_string();
        if name.is_empty() {
            bail!("abi_shim.pinned keys must be library names");
        }
        pinned.insert(name, resolve_path(root, &path));
    }
    Ok(AbiShimConfig { pinned })
}

fn deploy_config(root: &Path, raw: DeployToml) -> Result<DeployConfig> {
    let config = DeployConfig {
        user: raw.user.unwrap_or_else(|| "root".to_string()),
        host: raw.host.unwrap_or_else(|| "remarkable".to_string()),
        program: raw.program.unwrap_or_else(|| "scp".to_string()),
        executable_remote: raw
            .executable_remote
            .unwrap_or_else(|| "/home/root/engine".to_string()),
        script_root: raw.script_root.map(|p| resolve_path(root, &p)),
        script_suffix: raw
            .script_suffix
            .unwrap_or_else(|| "lua".to_string())
            .trim_start_matches('.')
            .to_string(),
        script_remote_dir: raw
            .script_remote_dir
            .unwrap_or_else(|| "/home/root/luaapps".to_string()),
    };

    if config.host.trim().is_empty() {
        bail!("deploy.host must not be empty");
    }
    for (field, value) in [
        ("deploy.executable_remote", &config.executable_remote),
        ("deploy.script_remote_dir", &config.script_remote_dir),
    ] {
        if !value.starts_with('/') {
            bail!("{field} must be an absolute remote path, got '{}'", value);
        }
    }
    Ok(config)
}

fn build_settings(root: &Path, raw: BuildToml) -> Result<BuildSettings> {
    let jobs = match raw.jobs {
        Some(0) => bail!("build.jobs must be >= 1"),
        Some(n) => n,
        None => std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1),
    };
    let keep_runs = match raw.keep_runs {
        Some(0) => bail!("build.keep_runs must be >= 1"),
        Some(n) => n,
        None => 10,
    };
    let cache = match raw.cache.as_deref() {
        Some(value) => CachePolicy::parse(value)?,
        None => CachePolicy::Fingerprint,
    };

    Ok(BuildSettings {
        dir: resolve_path(root, raw.dir.as_deref().unwrap_or("built")),
        jobs,
        cache,
        allow_partial_archive: raw.allow_partial_archive.unwrap_or(false),
        keep_runs,
    })
}

pub(crate) fn resolve_path(root: &Path, path: &str) -> PathBuf {
    let candidate = Path::new(path);
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    }
}

fn resolve_all(root: &Path, paths: Vec<String>) -> Vec<PathBuf> {
    paths.iter().map(|p| resolve_path(root, p)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[library]
source_dir = "../lua-5.3.6/src"
"#;

    #[test]
    fn minimal_config_uses_engine_defaults() {
        let config = parse_config(MINIMAL, Path::new("/proj")).unwrap();
        assert_eq!(config.toolchain, ToolchainConfig::default());
        assert_eq!(config.library.source_dir, Path::new("/proj/../lua-5.3.6/src"));
        assert_eq!(config.library.object_dir, Path::new("/proj/built/luas"));
        assert_eq!(config.library.archive, Path::new("/proj/built/luas/all.a"));
        assert!(config.library.exclude.contains("lua.c"));
        assert!(config.library.exclude.contains("luac.c"));
        assert_eq!(config.app.output, Path::new("/proj/built/engine"));
        assert_eq!(config.app.libraries, ["dl", "rt"]);
        assert_eq!(config.build.cache, CachePolicy::Fingerprint);
        assert!(!config.build.allow_partial_archive);
        assert!(config.build.jobs >= 1);
        assert_eq!(config.deploy.executable_remote, "/home/root/engine");
        assert!(config.deploy.script_root.is_none());
    }

    #[test]
    fn full_config_resolves_relative_paths() {
        let raw = r#"
[toolchain]
cc = "gcc"
ar = "ar"
lto = false

[library]
source_dir = "lua/src"
suffix = ".c"
exclude = ["lua.c"]
object_dir = "out/obj"
archive = "out/liblua.a"

[app]
sources = ["main.c"]
include_dirs = ["lua/src"]
libraries = ["dl", "m"]
library_dirs = ["/opt/rmlib/lib"]
output = "out/engine"

[abi_shim.pinned]
m = "rmlib/libm.so.6"

[deploy]
host = "10.11.99.1"
script_root = "luaapps"

[build]
dir = "out"
jobs = 2
cache = "existence"
allow_partial_archive = true
keep_runs = 3
"#;
        let config = parse_config(raw, Path::new("/p")).unwrap();
        assert!(!config.toolchain.lto);
        assert_eq!(config.library.suffix, "c");
        assert_eq!(config.library.archive, Path::new("/p/out/liblua.a"));
        assert_eq!(config.app.library_dirs, [PathBuf::from("/opt/rmlib/lib")]);
        assert_eq!(
            config.abi_shim.pinned.get("m"),
            Some(&PathBuf::from("/p/rmlib/libm.so.6"))
        );
        assert_eq!(config.deploy.script_root, Some(PathBuf::from("/p/luaapps")));
        assert_eq!(config.build.jobs, 2);
        assert_eq!(config.build.cache, CachePolicy::Existence);
        assert!(config.build.allow_partial_archive);
        assert_eq!(config.build.keep_runs, 3);
    }

    #[test]
    fn library_outputs_follow_build_dir() {
        let raw = format!("{MINIMAL}\n[build]\ndir = \"out\"\n");
        let config = parse_config(&raw, Path::new("/p")).unwrap();
        assert_eq!(config.library.object_dir, Path::new("/p/out/luas"));
        assert_eq!(config.library.archive, Path::new("/p/out/luas/all.a"));
        assert_eq!(config.app.output, Path::new("/p/out/engine"));
    }

    #[test]
    fn rejects_unknown_fields() {
        let raw = format!("{MINIMAL}\n[build]\nparallel = true\n");
        assert!(parse_config(&raw, Path::new("/p")).is_err());
    }

    #[test]
    fn rejects_zero_jobs_and_bad_cache_policy() {
        let zero = format!("{MINIMAL}\n[build]\njobs = 0\n");
        assert!(parse_config(&zero, Path::new("/p")).is_err());
        let bad = format!("{MINIMAL}\n[build]\ncache = \"mtime\"\n");
        assert!(parse_config(&bad, Path::new("/p")).is_err());
    }

    #[test]
    fn rejects_relative_remote_paths() {
        let raw = format!("{MINIMAL}\n[deploy]\nexecutable_remote = \"engine\"\n");
        let err = parse_config(&raw, Path::new("/p")).unwrap_err();
        assert!(err.to_string().contains("absolute remote path"));
    }

    #[test]
    fn rejects_paths_in_exclude() {
        let raw = r#"
[library]
source_dir = "src"
exclude = ["sub/lua.c"]
"#;
        assert!(parse_config(raw, Path::new("/p")).is_err());
    }

    #[test]
    fn explicit_config_path_wins() {
        let path = locate_config(Some(Path::new("other.toml")));
        assert_eq!(path, PathBuf::from("other.toml"));
    }
}
