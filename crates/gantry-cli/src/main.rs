//! Gantry - staged build orchestration CLI
//!
//! ## Commands
//!
//! - `run`: Execute a pipeline definition and report the outcome
//! - `validate`: Check a pipeline definition without running it
//! - `tags`: Show the version tags a build number would receive

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn, Level};

use gantry_core::{
    abort_pair, configured_hooks, Collaborators, EnvCredentialStore, Outcome, Pipeline,
    PipelineDefinition, PipelineExecutor, PipelineReport, ProcessExecutor, StageStatus, TagScheme,
};

/// Conventional exit status of a process interrupted by SIGINT.
const EXIT_ABORTED: u8 = 130;

#[derive(Parser)]
#[command(name = "gantry")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Staged build orchestration", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines (also GANTRY_LOG_FORMAT=json)
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline
    Run {
        /// Pipeline definition (TOML)
        #[arg(short, long)]
        file: PathBuf,

        /// Build number of this run (falls back to BUILD_NUMBER)
        #[arg(long, env = "GANTRY_BUILD_NUMBER")]
        build_number: Option<u64>,

        /// Write the JSON run report here
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Validate a pipeline definition
    Validate {
        /// Pipeline definition (TOML)
        #[arg(short, long)]
        file: PathBuf,

        /// Build number to validate with, when the file has none
        #[arg(long, env = "GANTRY_BUILD_NUMBER")]
        build_number: Option<u64>,
    },

    /// Print the tags a build would be published under
    Tags {
        #[arg(long)]
        build_number: u64,

        #[arg(long, value_enum, default_value_t = SchemeArg::BuildAndLatest)]
        scheme: SchemeArg,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum SchemeArg {
    BuildAndLatest,
    BuildOnly,
}

impl From<SchemeArg> for TagScheme {
    fn from(arg: SchemeArg) -> Self {
        match arg {
            SchemeArg::BuildAndLatest => TagScheme::BuildAndLatest,
            SchemeArg::BuildOnly => TagScheme::BuildOnly,
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    gantry_core::telemetry::init_tracing(cli.json, level);

    match cli.command {
        Commands::Run {
            file,
            build_number,
            report,
        } => {
            let outcome = cmd_run(&file, build_number, report.as_deref()).await?;
            Ok(ExitCode::from(exit_status(outcome)))
        }
        Commands::Validate { file, build_number } => {
            cmd_validate(&file, build_number)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Tags {
            build_number,
            scheme,
        } => {
            for tag in TagScheme::from(scheme).tags(build_number) {
                println!("{tag}");
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// `--build-number`, then `GANTRY_BUILD_NUMBER` (via clap), then `BUILD_NUMBER`.
fn resolve_build_number(explicit: Option<u64>) -> Result<Option<u64>> {
    if explicit.is_some() {
        return Ok(explicit);
    }
    match std::env::var("BUILD_NUMBER") {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("BUILD_NUMBER is not a number: {value:?}")),
        Err(_) => Ok(None),
    }
}

fn load_pipeline(file: &Path, build_number: Option<u64>) -> Result<Pipeline> {
    let definition = PipelineDefinition::load(file)
        .with_context(|| format!("Failed to load pipeline from {}", file.display()))?;
    let pipeline = definition
        .into_pipeline(resolve_build_number(build_number)?)
        .with_context(|| format!("Invalid pipeline {}", file.display()))?;
    Ok(pipeline)
}

fn cmd_validate(file: &Path, build_number: Option<u64>) -> Result<()> {
    let pipeline = load_pipeline(file, build_number)?;
    let config = pipeline.config();
    println!("✓ {} is valid", file.display());
    println!("Pipeline: {} (build #{})", config.name, config.build_number);
    for (position, stage) in pipeline.stages().iter().enumerate() {
        let mut flags = Vec::new();
        if stage.best_effort {
            flags.push("best effort");
        }
        if stage.parallel {
            flags.push("parallel");
        }
        let flags = if flags.is_empty() {
            String::new()
        } else {
            format!(" [{}]", flags.join(", "))
        };
        println!(
            "  {}. {} ({} operations, {} post-actions){}",
            position + 1,
            stage.name,
            stage.operations.len(),
            stage.post.len(),
            flags
        );
    }
    if !config.hooks.is_empty() {
        println!("Hooks: {}", config.hooks.len());
    }
    Ok(())
}

async fn cmd_run(
    file: &Path,
    build_number: Option<u64>,
    report_path: Option<&Path>,
) -> Result<Outcome> {
    let pipeline = load_pipeline(file, build_number)?;
    let config = pipeline.config().clone();

    let executor = Arc::new(ProcessExecutor::new(config.abort_grace));
    let collaborators = Collaborators::from_config(
        &config,
        executor.clone(),
        Arc::new(EnvCredentialStore::default()),
    );
    let hooks = configured_hooks(&config, executor);

    let (handle, signal) = abort_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, aborting run");
            handle.abort();
        }
    });

    println!("Running pipeline {} (build #{})", config.name, config.build_number);
    let report = PipelineExecutor::new(pipeline, collaborators)
        .with_hooks(hooks)
        .run(signal)
        .await;

    print_report(&report);
    if let Some(path) = report_path {
        report
            .write_json(path)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
        info!(path = %path.display(), "run report written");
    }
    Ok(report.outcome)
}

fn print_report(report: &PipelineReport) {
    println!();
    println!("Run ID: {}", report.run_id);
    println!("Outcome: {}", report.outcome);
    println!("Duration: {}ms", report.duration_ms);
    println!();

    for stage in &report.stages {
        let marker = match stage.status {
            StageStatus::Success => "✓",
            StageStatus::Failure if stage.best_effort => "!",
            StageStatus::Failure => "✗",
            StageStatus::Skipped => "-",
            StageStatus::Aborted => "⊘",
        };
        println!("  {} {} ({}ms)", marker, stage.name, stage.duration_ms);
        if let Some(reason) = &stage.failure {
            println!("      {reason}");
        }
    }

    if let Some(gate) = &report.gate {
        println!();
        println!("Quality gate: {} ({})", gate.verdict, gate.correlation_id);
    }
    for artifact in &report.artifacts {
        println!("Published: {}", artifact.references().join(", "));
    }
    let failed_hooks: Vec<&str> = report
        .hooks
        .iter()
        .filter(|h| !h.success)
        .map(|h| h.hook.as_str())
        .collect();
    if !failed_hooks.is_empty() {
        println!("Failed hooks: {}", failed_hooks.join(", "));
    }

    println!();
    println!(
        "Summary: {}/{} stages succeeded",
        report.count(StageStatus::Success),
        report.stages.len()
    );
}

fn exit_status(outcome: Outcome) -> u8 {
    match outcome {
        Outcome::Success => 0,
        Outcome::Aborted => EXIT_ABORTED,
        _ => 1,
    }
}
