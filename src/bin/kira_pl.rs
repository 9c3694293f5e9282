use std::io::{self, Write};
use std::process::ExitCode;

use camino::Utf8PathBuf;
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use kira_pipeline::config::ConfigLoader;
use kira_pipeline::domain::{FileRef, LogCategory, StageId};
use kira_pipeline::error::PipelineError;
use kira_pipeline::log_store::LogStore;
use kira_pipeline::output::{self, JsonOutput, OutputMode};
use kira_pipeline::pipeline::{FailurePolicy, Pipeline, PipelineReport};
use kira_pipeline::stages::StageRegistry;

#[derive(Parser)]
#[command(name = "kira-pl")]
#[command(about = "Staged pipeline runner with tiered storage, recovery and versioned run logs")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<String>,

    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run every stage at one timestamp")]
    Run(RunArgs),
    #[command(about = "Resume a run, skipping stages that already succeeded")]
    Recover(RunArgs),
    #[command(about = "Show or restore persisted stage logs")]
    Logs(LogsArgs),
    #[command(about = "Delete outputs older than their storage_days")]
    Expire(ExpireArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Run timestamp in milliseconds since the epoch (default: now)
    #[arg(long)]
    timestamp: Option<i64>,

    /// Initial input objects, e.g. data/geo/a.pcl.100.none
    #[arg(long = "input")]
    inputs: Vec<String>,

    #[arg(long)]
    on_failure: Option<FailurePolicy>,
}

#[derive(Args)]
struct LogsArgs {
    #[arg(long)]
    stage: String,

    #[arg(long)]
    file: Option<String>,

    #[arg(long)]
    category: Option<LogCategory>,

    #[arg(long)]
    version: Option<i64>,

    /// Write every log of the run at --timestamp into this directory
    #[arg(long)]
    restore: Option<Utf8PathBuf>,

    #[arg(long)]
    timestamp: Option<i64>,
}

#[derive(Args)]
struct ExpireArgs {
    #[arg(long)]
    now: Option<i64>,
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(err) = report.downcast_ref::<PipelineError>() {
                return ExitCode::from(map_exit_code(err));
            }
            ExitCode::from(1)
        }
    }
}

fn map_exit_code(error: &PipelineError) -> u8 {
    match error.cause() {
        PipelineError::MissingConfig
        | PipelineError::ConfigRead(_)
        | PipelineError::ConfigParse(_)
        | PipelineError::InvalidStageId(_)
        | PipelineError::UnknownStageType(_)
        | PipelineError::InvalidPipeline(_) => 2,
        PipelineError::Transfer { .. } => 3,
        PipelineError::Workspace(_) | PipelineError::StageInit { .. } => 4,
        PipelineError::StageLogic { .. } => 5,
        PipelineError::Misuse { .. } => 70,
        _ => 1,
    }
}

fn run() -> miette::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Human
    };

    let resolved = ConfigLoader::resolve(cli.config.as_deref())?;
    let pipeline = Pipeline::from_config(&resolved, &StageRegistry::default())?;

    match cli.command {
        Commands::Run(args) => run_pipeline(pipeline, args, output_mode, false),
        Commands::Recover(args) => run_pipeline(pipeline, args, output_mode, true),
        Commands::Logs(args) => run_logs(&pipeline, args, output_mode),
        Commands::Expire(args) => run_expire(&pipeline, args, output_mode),
    }
}

fn run_pipeline(
    pipeline: Pipeline,
    args: RunArgs,
    output_mode: OutputMode,
    recover: bool,
) -> miette::Result<ExitCode> {
    let timestamp = args.timestamp.unwrap_or_else(|| Utc::now().timestamp_millis());
    let inputs = args
        .inputs
        .iter()
        .map(|value| value.parse::<FileRef>())
        .collect::<Result<Vec<_>, PipelineError>>()?;
    let pipeline = match args.on_failure {
        Some(policy) => pipeline.with_policy(policy),
        None => pipeline,
    };

    let report = if recover {
        pipeline.recover(timestamp, inputs)?
    } else {
        pipeline.run(timestamp, inputs)?
    };
    print_report(&report, output_mode)?;
    if report.is_success() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(1))
    }
}

fn print_report(report: &PipelineReport, output_mode: OutputMode) -> miette::Result<()> {
    match output_mode {
        OutputMode::Json => JsonOutput::print_report(report).into_diagnostic(),
        OutputMode::Human => {
            output::print_summary(report);
            Ok(())
        }
    }
}

fn run_logs(pipeline: &Pipeline, args: LogsArgs, output_mode: OutputMode) -> miette::Result<ExitCode> {
    let stage = resolve_stage(pipeline, &args.stage)?;
    let logs = pipeline.services().logs();

    if let Some(dir) = args.restore {
        let timestamp = args
            .timestamp
            .ok_or_else(|| miette::Report::msg("--restore requires --timestamp"))?;
        let restored = logs.restore(&stage, timestamp, &dir)?;
        match output_mode {
            OutputMode::Json => JsonOutput::print_paths(&restored).into_diagnostic()?,
            OutputMode::Human => {
                for path in &restored {
                    println!("{path}");
                }
            }
        }
        return Ok(ExitCode::SUCCESS);
    }

    let file = args
        .file
        .ok_or_else(|| miette::Report::msg("either --file or --restore is required"))?;
    let category = args
        .category
        .unwrap_or_else(|| LogStore::classify(&file));
    let content = logs.get(category, &LogStore::key(&stage, &file), args.version)?;
    io::stdout().write_all(&content).into_diagnostic()?;
    Ok(ExitCode::SUCCESS)
}

fn resolve_stage(pipeline: &Pipeline, value: &str) -> Result<StageId, PipelineError> {
    pipeline
        .stages()
        .iter()
        .map(|stage| stage.id())
        .find(|id| id.to_string() == value || id.name() == value)
        .cloned()
        .ok_or_else(|| PipelineError::NotFound(format!("stage {value}")))
}

fn run_expire(pipeline: &Pipeline, args: ExpireArgs, output_mode: OutputMode) -> miette::Result<ExitCode> {
    let now = args.now.unwrap_or_else(|| Utc::now().timestamp_millis());
    let removed = pipeline.expire(now)?;
    match output_mode {
        OutputMode::Json => JsonOutput::print_expired(&removed).into_diagnostic()?,
        OutputMode::Human => {
            println!("removed {} expired objects", removed.len());
            for file in &removed {
                println!("  {file}");
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}
