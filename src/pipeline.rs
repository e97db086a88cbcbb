//! End-to-end orchestration: lock, build, deploy, record.
//!
//! Deployment runs whether or not anything was recompiled, but only when the
//! link produced an executable in this run.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use tracing::{info, warn};

use crate::cache::{ArtifactCache, BuildLock, CACHE_DIR};
use crate::config::Config;
use crate::deploy::{self, DeployReport, ScpTransport};
use crate::graph::{self, BuildGraph, BuildPlan, BuildReport};
use crate::runs::{self, RunManifest, RunStatus};
use crate::toolchain::{CommandRunner, Toolchain};

/// Summary of one pipeline invocation.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub build: Option<BuildReport>,
    pub deploy: Option<DeployReport>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        let build_ok = self.build.as_ref().map_or(true, BuildReport::is_success);
        let deploy_ok = self.deploy.as_ref().map_or(true, DeployReport::is_success);
        build_ok && deploy_ok
    }
}

pub struct Pipeline<'a> {
    config: &'a Config,
    runner: &'a dyn CommandRunner,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &'a Config, runner: &'a dyn CommandRunner) -> Self {
        Self { config, runner }
    }

    /// Dry run: commands and cache decisions, nothing executed.
    pub fn plan(&self) -> Result<BuildPlan> {
        let toolchain = Toolchain::new(&self.config.toolchain, self.runner);
        let cache = ArtifactCache::open(&self.config.build.dir, self.config.build.cache)?;
        BuildGraph::new(self.config, &toolchain, &cache).plan()
    }

    pub fn build(&self) -> Result<RunReport> {
        self.locked("build", |p| {
            Ok(RunReport {
                build: Some(p.build_unlocked()?),
                deploy: None,
            })
        })
    }

    /// Push the existing executable and scripts without building.
    pub fn deploy(&self) -> Result<RunReport> {
        self.locked("deploy", |p| {
            Ok(RunReport {
                build: None,
                deploy: Some(p.deploy_unlocked()?),
            })
        })
    }

    /// Build, then deploy when an executable was linked.
    pub fn run(&self) -> Result<RunReport> {
        self.locked("run", |p| {
            let build = p.build_unlocked()?;
            let deploy = if build.executable().is_some() {
                Some(p.deploy_unlocked()?)
            } else {
                warn!("[crossbuild:deploy] skipped: no executable was linked");
                None
            };
            Ok(RunReport {
                build: Some(build),
                deploy,
            })
        })
    }

    /// Remove library objects and their cache entries; with `all`, also the
    /// archive, the executable and the whole cache state.
    pub fn clean(&self, all: bool) -> Result<usize> {
        let _lock = BuildLock::acquire(&self.config.build.dir)?;
        let library = &self.config.library;
        let cache = ArtifactCache::open(&self.config.build.dir, self.config.build.cache)?;

        let mut removed = 0;
        let mut remove = |path: &std::path::Path| -> Result<()> {
            if path.is_file() {
                fs::remove_file(path)
                    .with_context(|| format!("removing '{}'", path.display()))?;
                removed += 1;
            }
            cache.forget(path)
        };

        if library.source_dir.is_dir() {
            let sources = graph::discover_sources(&library.source_dir, &library.suffix)?;
            let parts = graph::partition(sources, &library.exclude, &library.object_dir);
            for object in &parts.members {
                remove(&object.path)?;
            }
        }
        if all {
            remove(&library.archive)?;
            remove(&self.config.app.output)?;
            let state = self.config.build.dir.join(CACHE_DIR);
            if state.is_dir() {
                fs::remove_dir_all(&state)
                    .with_context(|| format!("removing cache state '{}'", state.display()))?;
            }
        }
        info!("[crossbuild:clean] removed {} artifact(s)", removed);
        Ok(removed)
    }

    fn build_unlocked(&self) -> Result<BuildReport> {
        let toolchain = Toolchain::new(&self.config.toolchain, self.runner);
        let cache = ArtifactCache::open(&self.config.build.dir, self.config.build.cache)?;
        BuildGraph::new(self.config, &toolchain, &cache).run()
    }

    fn deploy_unlocked(&self) -> Result<DeployReport> {
        let items = deploy::deployment_items(&self.config.deploy, &self.config.app.output)?;
        let transport = ScpTransport::new(&self.config.deploy, self.runner);
        info!(
            "[crossbuild:deploy] {} file(s) to {}",
            items.len(),
            transport.destination("")
        );
        Ok(deploy::deploy(&transport, &items))
    }

    fn locked<F>(&self, command: &str, body: F) -> Result<RunReport>
    where
        F: FnOnce(&Self) -> Result<RunReport>,
    {
        let build_dir = &self.config.build.dir;
        let _lock = BuildLock::acquire(build_dir)?;
        let run_id = runs::new_run_id();
        let created_at_utc = runs::now_utc();

        let report = body(self)?;

        let manifest = RunManifest {
            run_id,
            command: command.to_string(),
            status: if report.is_success() {
                RunStatus::Success
            } else {
                RunStatus::Failed
            },
            created_at_utc,
            finished_at_utc: Some(runs::now_utc()),
            cache: report.build.as_ref().map(|_| self.config.build.cache),
            report: serde_json::to_value(&report).unwrap_or_default(),
        };
        // Bookkeeping errors are logged; the report is still returned.
        if let Err(err) = self.record_run(&manifest) {
            warn!("[crossbuild:{command}] could not record run: {err:#}");
        }
        Ok(report)
    }

    fn record_run(&self, manifest: &RunManifest) -> Result<()> {
        let build_dir = &self.config.build.dir;
        let path = runs::write_manifest(build_dir, manifest)?;
        runs::prune_old_runs(build_dir, self.config.build.keep_runs)?;
        info!("[crossbuild:{}] run manifest at {}", manifest.command, path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CachePolicy;
    use crate::testutil::{Project, RecordingRunner};

    #[test]
    fn run_builds_then_deploys_and_records_manifest() {
        let project = Project::new(&["a.c", "b.c"]);
        fs::create_dir_all(project.root().join("luaapps")).unwrap();
        fs::write(project.root().join("luaapps/x.lua"), "").unwrap();
        let config = project.config();
        let runner = RecordingRunner::default();

        let report = Pipeline::new(&config, &runner).run().unwrap();
        assert!(report.is_success());
        assert_eq!(report.deploy.as_ref().unwrap().pushed.len(), 2);

        let latest = runs::latest_run(&config.build.dir).unwrap().unwrap();
        assert_eq!(latest.command, "run");
        assert_eq!(latest.status, RunStatus::Success);
    }

    #[test]
    fn failed_build_skips_deploy() {
        let project = Project::new(&["a.c"]);
        fs::create_dir_all(project.root().join("luaapps")).unwrap();
        let config = project.config();
        let runner = RecordingRunner::failing(&["a.c"]);

        let report = Pipeline::new(&config, &runner).run().unwrap();
        assert!(!report.is_success());
        assert!(report.deploy.is_none());
        assert!(runner.copy_commands().is_empty());
        let latest = runs::latest_run(&config.build.dir).unwrap().unwrap();
        assert_eq!(latest.status, RunStatus::Failed);
    }

    #[test]
    fn clean_forces_recompile() {
        let project = Project::new(&["a.c", "b.c"]);
        fs::create_dir_all(project.root().join("luaapps")).unwrap();
        let config = project.config();
        let first = RecordingRunner::default();
        let pipeline = Pipeline::new(&config, &first);
        pipeline.build().unwrap();

        assert_eq!(pipeline.clean(false).unwrap(), 2);
        assert!(project.archive().is_file());

        let runner = RecordingRunner::default();
        Pipeline::new(&config, &runner).build().unwrap();
        assert_eq!(runner.compile_sources(), ["a.c", "b.c"]);

        assert_eq!(Pipeline::new(&config, &runner).clean(true).unwrap(), 4);
        assert!(!project.exe().exists());
    }

    #[test]
    fn torn_manifest_from_earlier_run_does_not_fail_build() {
        let project = Project::new(&["a.c"]);
        let config = project.config();
        let torn = runs::runs_dir(&config.build.dir).join("20200101T000000Z-000000000");
        fs::create_dir_all(&torn).unwrap();
        fs::write(runs::manifest_path(&torn), r#"{"run_id": "2020"#).unwrap();

        let runner = RecordingRunner::default();
        let report = Pipeline::new(&config, &runner).build().unwrap();
        assert!(report.is_success());

        let latest = runs::latest_run(&config.build.dir).unwrap().unwrap();
        assert_eq!(latest.command, "build");
        assert_eq!(latest.cache, Some(CachePolicy::Fingerprint));
    }

    #[test]
    fn deploy_only_run_records_no_cache_policy() {
        let project = Project::new(&["a.c"]);
        fs::create_dir_all(project.root().join("luaapps")).unwrap();
        let config = project.config();
        let runner = RecordingRunner::default();
        Pipeline::new(&config, &runner).build().unwrap();
        Pipeline::new(&config, &runner).deploy().unwrap();

        let latest = runs::latest_run(&config.build.dir).unwrap().unwrap();
        assert_eq!(latest.command, "deploy");
        assert_eq!(latest.cache, None);
    }

    #[test]
    fn concurrent_run_is_rejected() {
        let project = Project::new(&["a.c"]);
        let config = project.config();
        let _held = BuildLock::acquire(&config.build.dir).unwrap();
        let runner = RecordingRunner::default();
        assert!(Pipeline::new(&config, &runner).build().is_err());
        assert!(runner.commands().is_empty());
    }
}
