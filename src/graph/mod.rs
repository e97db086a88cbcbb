//! Build graph for the engine executable.
//!
//! ```text
//! <source_dir>/*.c  ──compile──▶  <object_dir>/*.c.o  ──ar rcs──▶  all.a
//!                                                                   │
//! app sources ───────────────────────────────────────────link──────┴──▶ engine
//!                                           (+ pinned .so, -l libs)
//! ```
//!
//! Objects are compiled on a rayon pool of `build.jobs` threads; the archive
//! waits for all of them. Compile failures are collected rather than aborting, so one run
//! surfaces every broken source. If the archive has to be (re)built while any
//! member failed, it is not built at all unless `allow_partial_archive` is
//! set. The executable is linked on every run.

mod sources;

pub use sources::{
    discover_sources, object_path, partition, ObjectArtifact, Partition, SourceFile,
    OBJECT_SUFFIX,
};

use anyhow::{Context, Result};
use rayon::prelude::*;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::cache::{self, ArtifactCache, BuildReason};
use crate::config::Config;
use crate::shim::AbiShim;
use crate::toolchain::{CommandLine, LinkSpec, ToolOutput, Toolchain};

/// One library member and its cache decision.
#[derive(Debug, Clone)]
pub struct PlannedObject {
    pub object: ObjectArtifact,
    pub command: CommandLine,
    pub fingerprint: String,
    pub reason: Option<BuildReason>,
}

#[derive(Debug, Clone)]
pub struct PlannedArchive {
    pub path: PathBuf,
    pub command: CommandLine,
    pub fingerprint: String,
    pub reason: Option<BuildReason>,
}

/// Everything a run would do, computed without running anything.
#[derive(Debug, Clone)]
pub struct BuildPlan {
    pub objects: Vec<PlannedObject>,
    pub excluded: Vec<SourceFile>,
    pub archive: PlannedArchive,
    pub link: CommandLine,
    pub executable: PathBuf,
}

impl BuildPlan {
    pub fn pending_objects(&self) -> impl Iterator<Item = &PlannedObject> {
        self.objects.iter().filter(|o| o.reason.is_some())
    }
}

/// A library member whose object could not be produced.
#[derive(Debug, Clone, Serialize)]
pub struct CompileFailure {
    pub source: PathBuf,
    pub object: PathBuf,
    pub status: String,
    pub diagnostics: String,
}

/// A fatal archive or link step.
#[derive(Debug, Clone, Serialize)]
pub struct StepFailure {
    pub command: String,
    pub status: String,
    pub diagnostics: String,
}

impl StepFailure {
    fn from_output(cmd: &CommandLine, output: &ToolOutput) -> Self {
        Self {
            command: cmd.to_string(),
            status: output.status_label(),
            diagnostics: output.diagnostics(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ArchiveOutcome {
    UpToDate,
    Built,
    /// Built while some members were missing; not recorded in the cache.
    BuiltPartial { missing: Vec<PathBuf> },
    /// Not built because members failed to compile.
    Blocked { failed: usize },
    Failed(StepFailure),
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LinkOutcome {
    Linked { executable: PathBuf },
    Skipped,
    Failed(StepFailure),
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub compiled: Vec<PathBuf>,
    pub cached: Vec<PathBuf>,
    pub failures: Vec<CompileFailure>,
    pub archive: ArchiveOutcome,
    pub link: LinkOutcome,
}

impl BuildReport {
    pub fn executable(&self) -> Option<&Path> {
        match &self.link {
            LinkOutcome::Linked { executable } => Some(executable),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && self.executable().is_some()
    }
}

pub struct BuildGraph<'a> {
    config: &'a Config,
    toolchain: &'a Toolchain<'a>,
    cache: &'a ArtifactCache,
    shim: AbiShim,
}

impl<'a> BuildGraph<'a> {
    pub fn new(config: &'a Config, toolchain: &'a Toolchain<'a>, cache: &'a ArtifactCache) -> Self {
        Self {
            config,
            toolchain,
            cache,
            shim: AbiShim::new(&config.abi_shim),
        }
    }

    pub fn plan(&self) -> Result<BuildPlan> {
        let library = &self.config.library;
        let sources = discover_sources(&library.source_dir, &library.suffix)?;
        let parts = partition(sources, &library.exclude, &library.object_dir);

        let mut header_dirs = vec![library.source_dir.clone()];
        for dir in &self.config.app.include_dirs {
            if !header_dirs.contains(dir) {
                header_dirs.push(dir.clone());
            }
        }
        let headers = cache::header_digest(&header_dirs)?;

        let mut objects = Vec::with_capacity(parts.members.len());
        for object in parts.members {
            let command = self.toolchain.compile_command(object.source.path(), &object.path);
            let fingerprint =
                cache::object_fingerprint(object.source.path(), &command, &headers)?;
            let reason = self.cache.build_reason(&object.path, &fingerprint)?;
            objects.push(PlannedObject {
                object,
                command,
                fingerprint,
                reason,
            });
        }

        let member_paths: Vec<PathBuf> = objects.iter().map(|o| o.object.path.clone()).collect();
        let archive_cmd = self.toolchain.archive_command(&library.archive, &member_paths);
        let member_prints: Vec<String> = objects.iter().map(|o| o.fingerprint.clone()).collect();
        let archive_fp = cache::archive_fingerprint(&archive_cmd, &member_prints);
        let archive_reason = self.cache.build_reason(&library.archive, &archive_fp)?;

        let app = &self.config.app;
        let targets = self.shim.link_targets(&app.libraries)?;
        let link = self.toolchain.link_command(&LinkSpec {
            output: &app.output,
            library_dirs: &app.library_dirs,
            include_dirs: &app.include_dirs,
            sources: &app.sources,
            static_library: &library.archive,
            targets: &targets,
        });

        Ok(BuildPlan {
            objects,
            excluded: parts.excluded,
            archive: PlannedArchive {
                path: library.archive.clone(),
                command: archive_cmd,
                fingerprint: archive_fp,
                reason: archive_reason,
            },
            link,
            executable: app.output.clone(),
        })
    }

    /// Compile pending objects, archive if needed, then link.
    ///
    /// `Err` is reserved for infrastructure problems (unreadable sources,
    /// cache I/O). Tool failures are reported in the returned [`BuildReport`].
    pub fn run(&self) -> Result<BuildReport> {
        let plan = self.plan()?;
        for source in &plan.excluded {
            debug!(source = %source.path().display(), "excluded entry point");
        }

        let object_dir = &self.config.library.object_dir;
        fs::create_dir_all(object_dir)
            .with_context(|| format!("creating object directory '{}'", object_dir.display()))?;

        let (pending, cached): (Vec<_>, Vec<_>) =
            plan.objects.iter().partition(|o| o.reason.is_some());
        let cached: Vec<PathBuf> = cached.iter().map(|o| o.object.path.clone()).collect();
        info!(
            "[crossbuild:compile] {} object(s) to build, {} cached, jobs={}",
            pending.len(),
            cached.len(),
            self.config.build.jobs
        );

        let workers = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.build.jobs)
            .thread_name(|i| format!("crossbuild-cc-{i}"))
            .build()
            .context("starting compile workers")?;
        let results: Vec<_> = workers.install(|| {
            pending
                .par_iter()
                .map(|planned| self.compile_one(planned))
                .collect()
        });

        let mut compiled = Vec::new();
        let mut failures = Vec::new();
        for result in results {
            match result? {
                Ok(path) => compiled.push(path),
                Err(failure) => failures.push(failure),
            }
        }
        for failure in &failures {
            warn!(
                "[crossbuild:compile] {} failed ({})",
                failure.source.display(),
                failure.status
            );
        }

        let archive = self.archive_step(&plan, &failures)?;
        let link = match &archive {
            ArchiveOutcome::Blocked { .. } | ArchiveOutcome::Failed(_) => LinkOutcome::Skipped,
            _ => self.link_step(&plan)?,
        };

        Ok(BuildReport {
            compiled,
            cached,
            failures,
            archive,
            link,
        })
    }

    fn compile_one(&self, planned: &PlannedObject) -> Result<Result<PathBuf, CompileFailure>> {
        let object = &planned.object;
        if object.path.exists() {
            // Stale object: a failed compile must not leave it behind.
            fs::remove_file(&object.path).with_context(|| {
                format!("removing stale object '{}'", object.path.display())
            })?;
        }
        info!("[crossbuild:compile] {}", object.source.path().display());

        let failure = |status: String, diagnostics: String| CompileFailure {
            source: object.source.path().to_path_buf(),
            object: object.path.clone(),
            status,
            diagnostics,
        };

        let output = match self.toolchain.exec(&planned.command) {
            Ok(output) => output,
            Err(err) => {
                self.cache.forget(&object.path)?;
                return Ok(Err(failure("not started".to_string(), format!("{err:#}"))));
            }
        };

        if !output.success {
            self.cache.forget(&object.path)?;
            return Ok(Err(failure(output.status_label(), output.diagnostics())));
        }
        if !object.path.is_file() {
            self.cache.forget(&object.path)?;
            return Ok(Err(failure(
                output.status_label(),
                "compiler reported success but wrote no object".to_string(),
            )));
        }

        self.cache.record(&object.path, &planned.fingerprint)?;
        Ok(Ok(object.path.clone()))
    }

    fn archive_step(&self, plan: &BuildPlan, failures: &[CompileFailure]) -> Result<ArchiveOutcome> {
        let archive = &plan.archive;
        let Some(reason) = archive.reason else {
            if !failures.is_empty() {
                warn!(
                    "[crossbuild:archive] {} is kept from an earlier build; it does not reflect the failed sources",
                    archive.path.display()
                );
            }
            debug!(archive = %archive.path.display(), "archive up to date");
            return Ok(ArchiveOutcome::UpToDate);
        };

        let allow_partial = self.config.build.allow_partial_archive;
        if !failures.is_empty() && !allow_partial {
            warn!(
                "[crossbuild:archive] not building {}: {} member(s) failed to compile",
                archive.path.display(),
                failures.len()
            );
            return Ok(ArchiveOutcome::Blocked {
                failed: failures.len(),
            });
        }

        let (present, missing): (Vec<PathBuf>, Vec<PathBuf>) = plan
            .objects
            .iter()
            .map(|o| o.object.path.clone())
            .partition(|p| p.is_file());

        if !missing.is_empty() && !allow_partial {
            return Ok(ArchiveOutcome::Blocked {
                failed: missing.len(),
            });
        }
        if present.is_empty() {
            return Ok(ArchiveOutcome::Failed(StepFailure {
                command: archive.command.to_string(),
                status: "not started".to_string(),
                diagnostics: "no library objects to archive".to_string(),
            }));
        }

        if archive.path.exists() {
            // `ar rcs` keeps members of an existing archive.
            fs::remove_file(&archive.path).with_context(|| {
                format!("removing previous archive '{}'", archive.path.display())
            })?;
        }
        self.cache.forget(&archive.path)?;

        let command = if missing.is_empty() {
            archive.command.clone()
        } else {
            warn!(
                "[crossbuild:archive] building partial archive without {} object(s)",
                missing.len()
            );
            self.toolchain.archive_command(&archive.path, &present)
        };

        info!(
            "[crossbuild:archive] {} ({} objects, {:?})",
            archive.path.display(),
            present.len(),
            reason
        );
        let output = match self.toolchain.exec(&command) {
            Ok(output) => output,
            Err(err) => {
                return Ok(ArchiveOutcome::Failed(StepFailure {
                    command: command.to_string(),
                    status: "not started".to_string(),
                    diagnostics: format!("{err:#}"),
                }))
            }
        };
        if !output.success || !archive.path.is_file() {
            return Ok(ArchiveOutcome::Failed(StepFailure::from_output(&command, &output)));
        }

        if missing.is_empty() {
            self.cache.record(&archive.path, &archive.fingerprint)?;
            Ok(ArchiveOutcome::Built)
        } else {
            Ok(ArchiveOutcome::BuiltPartial { missing })
        }
    }

    fn link_step(&self, plan: &BuildPlan) -> Result<LinkOutcome> {
        let exe = &plan.executable;
        if let Some(parent) = exe.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating output directory '{}'", parent.display()))?;
        }
        if exe.exists() {
            // A failed link must leave no executable behind to deploy.
            fs::remove_file(exe)
                .with_context(|| format!("removing previous executable '{}'", exe.display()))?;
        }

        info!("[crossbuild:link] {}", exe.display());
        debug!(command = %plan.link, "link command");
        let output = match self.toolchain.exec(&plan.link) {
            Ok(output) => output,
            Err(err) => {
                return Ok(LinkOutcome::Failed(StepFailure {
                    command: plan.link.to_string(),
                    status: "not started".to_string(),
                    diagnostics: format!("{err:#}"),
                }))
            }
        };
        if !output.success {
            return Ok(LinkOutcome::Failed(StepFailure::from_output(&plan.link, &output)));
        }
        if !exe.is_file() {
            return Ok(LinkOutcome::Failed(StepFailure {
                command: plan.link.to_string(),
                status: output.status_label(),
                diagnostics: "linker reported success but wrote no executable".to_string(),
            }));
        }
        Ok(LinkOutcome::Linked {
            executable: exe.clone(),
        })
    }
}
