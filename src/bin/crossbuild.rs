use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crossbuild::cache::CachePolicy;
use crossbuild::config::{self, Config};
use crossbuild::graph::{ArchiveOutcome, BuildPlan, BuildReport, LinkOutcome};
use crossbuild::{preflight, runs, DeployReport, HostRunner, Pipeline, RunReport};

/// Cross-compile the engine for the device and push it over scp
#[derive(Parser)]
#[command(name = "crossbuild")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Project file (default: $CROSSBUILD_CONFIG or ./Crossbuild.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Parallel object compiles (overrides build.jobs)
    #[arg(short, long, global = true)]
    jobs: Option<usize>,

    /// Cache policy: fingerprint or existence (overrides build.cache)
    #[arg(long, global = true)]
    cache: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build, then deploy if the executable linked
    Run,
    /// Compile, archive and link without deploying
    Build,
    /// Push the existing executable and scripts
    Deploy,
    /// Print the commands a build would run
    Plan,
    /// Remove compiled objects to force a rebuild
    Clean {
        /// Also remove the archive, the executable and cache state
        #[arg(long)]
        all: bool,
    },
    /// Check host tools and build inputs
    Preflight,
    /// Show the most recent run
    Status,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .without_time()
        .with_target(false)
        .init();

    let config_path = config::locate_config(cli.config.as_deref());
    let mut config = config::load_config(&config_path)?;
    apply_overrides(&mut config, cli.jobs, cli.cache.as_deref())?;

    let runner = HostRunner;
    let pipeline = Pipeline::new(&config, &runner);

    match cli.command {
        Commands::Run => {
            preflight::check_build_tools(&config)?;
            preflight::check_deploy_tools(&config)?;
            preflight::check_build_inputs(&config)?;
            finish("run", &pipeline.run()?)
        }
        Commands::Build => {
            preflight::check_build_tools(&config)?;
            preflight::check_build_inputs(&config)?;
            finish("build", &pipeline.build()?)
        }
        Commands::Deploy => {
            preflight::check_deploy_tools(&config)?;
            finish("deploy", &pipeline.deploy()?)
        }
        Commands::Plan => {
            print_plan(&pipeline.plan()?);
            Ok(())
        }
        Commands::Clean { all } => {
            let removed = pipeline.clean(all)?;
            println!("[crossbuild:clean] removed {removed} artifact(s)");
            Ok(())
        }
        Commands::Preflight => cmd_preflight(&config),
        Commands::Status => cmd_status(&config),
    }
}

fn apply_overrides(config: &mut Config, jobs: Option<usize>, cache: Option<&str>) -> Result<()> {
    if let Some(jobs) = jobs {
        if jobs == 0 {
            bail!("--jobs must be >= 1");
        }
        config.build.jobs = jobs;
    }
    if let Some(cache) = cache {
        config.build.cache = CachePolicy::parse(cache)?;
    }
    Ok(())
}

fn finish(command: &str, report: &RunReport) -> Result<()> {
    if let Some(build) = &report.build {
        print_build(build);
    }
    if let Some(deploy) = &report.deploy {
        print_deploy(deploy);
    }
    if !report.is_success() {
        bail!("{command} failed");
    }
    println!("[crossbuild:{command}] done");
    Ok(())
}

fn print_build(report: &BuildReport) {
    println!(
        "[crossbuild:build] {} compiled, {} cached, {} failed",
        report.compiled.len(),
        report.cached.len(),
        report.failures.len()
    );
    for failure in &report.failures {
        println!(
            "  FAILED {} ({})\n{}",
            failure.source.display(),
            failure.status,
            indent(&failure.diagnostics)
        );
    }
    match &report.archive {
        ArchiveOutcome::UpToDate => println!("[crossbuild:archive] up to date"),
        ArchiveOutcome::Built => println!("[crossbuild:archive] built"),
        ArchiveOutcome::BuiltPartial { missing } => println!(
            "[crossbuild:archive] built WITHOUT {} object(s); it will be rebuilt next run",
            missing.len()
        ),
        ArchiveOutcome::Blocked { failed } => println!(
            "[crossbuild:archive] not built: {failed} member(s) failed to compile"
        ),
        ArchiveOutcome::Failed(step) => println!(
            "[crossbuild:archive] FAILED ({})\n  {}\n{}",
            step.status,
            step.command,
            indent(&step.diagnostics)
        ),
    }
    match &report.link {
        LinkOutcome::Linked { executable } => {
            println!("[crossbuild:link] {}", executable.display())
        }
        LinkOutcome::Skipped => println!("[crossbuild:link] skipped"),
        LinkOutcome::Failed(step) => println!(
            "[crossbuild:link] FAILED ({})\n  {}\n{}",
            step.status,
            step.command,
            indent(&step.diagnostics)
        ),
    }
}

fn print_deploy(report: &DeployReport) {
    println!(
        "[crossbuild:deploy] {} pushed, {} failed",
        report.pushed.len(),
        report.failed.len()
    );
    for failure in &report.failed {
        println!("  FAILED {} -> {}", failure.item.local.display(), failure.item.remote);
        println!("{}", indent(&failure.error));
    }
}

fn print_plan(plan: &BuildPlan) {
    for object in &plan.objects {
        match object.reason {
            Some(reason) => println!("compile ({reason:?}): {}", object.command),
            None => println!("cached: {}", object.object.path.display()),
        }
    }
    for source in &plan.excluded {
        println!("excluded: {}", source.path().display());
    }
    match plan.archive.reason {
        Some(reason) => println!("archive ({reason:?}): {}", plan.archive.command),
        None => println!("cached: {}", plan.archive.path.display()),
    }
    println!("link: {}", plan.link);
}

fn cmd_preflight(config: &Config) -> Result<()> {
    let checks = [
        ("build tools", preflight::check_build_tools(config)),
        ("deploy tools", preflight::check_deploy_tools(config)),
        ("build inputs", preflight::check_build_inputs(config)),
    ];
    let mut failed = 0;
    for (name, result) in checks {
        match result {
            Ok(()) => println!("[crossbuild:preflight] {name}: ok"),
            Err(err) => {
                failed += 1;
                println!("[crossbuild:preflight] {name}: {err:#}");
            }
        }
    }
    if failed > 0 {
        bail!("preflight failed ({failed} check(s))");
    }
    Ok(())
}

fn cmd_status(config: &Config) -> Result<()> {
    let latest = runs::latest_run(&config.build.dir)
        .with_context(|| format!("reading runs under '{}'", config.build.dir.display()))?;
    let Some(run) = latest else {
        println!("[crossbuild:status] no runs recorded in {}", config.build.dir.display());
        return Ok(());
    };
    println!("run:      {}", run.run_id);
    println!("command:  {}", run.command);
    println!("status:   {:?}", run.status);
    println!("started:  {}", run.created_at_utc);
    if let Some(finished) = &run.finished_at_utc {
        println!("finished: {finished}");
    }
    if let Some(cache) = run.cache {
        println!("cache:    {}", cache.as_str());
    }
    Ok(())
}

fn indent(text: &str) -> String {
    text.lines()
        .map(|line| format!("    {line}"))
        .collect::<Vec<_>>()
        .join("\n")
}
