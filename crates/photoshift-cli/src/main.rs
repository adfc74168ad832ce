use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use photoshift_contracts::events::EventWriter;
use photoshift_contracts::jobs::{JobState, TransformationJob};
use photoshift_contracts::operations::OperationKind;
use photoshift_engine::{
    default_provider_registry, load_cost_table, BatchRequest, CreditLedger,
    DryrunProvider, Orchestrator, OrchestratorConfig, TransformationProvider,
    TransformationRequest,
};
use serde_json::json;

#[derive(Debug, Parser)]
#[command(name = "photoshift", version, about = "Credit-metered product photo transformations")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one transformation against a source image.
    Transform(TransformArgs),
    /// Run several transformations of one source image as a batch.
    Batch(BatchArgs),
    /// List operations and their credit costs.
    Operations,
}

#[derive(Debug, Args)]
struct SessionArgs {
    #[arg(long)]
    out: PathBuf,
    #[arg(long, default_value = "dryrun")]
    provider: String,
    #[arg(long, default_value_t = 10)]
    credits: u64,
    #[arg(long)]
    no_fallback: bool,
    /// Seconds between status queries; overrides PHOTOSHIFT_POLL_INTERVAL_S.
    #[arg(long)]
    poll_interval: Option<f64>,
    #[arg(long)]
    max_attempts: Option<u32>,
    /// Status queries the dryrun provider needs before a job completes.
    #[arg(long, default_value_t = 0)]
    dryrun_latency: u32,
}

#[derive(Debug, Args)]
struct TransformArgs {
    #[arg(long)]
    source: String,
    #[arg(long)]
    prompt: String,
    #[arg(long)]
    operation: OperationKind,
    #[command(flatten)]
    session: SessionArgs,
}

#[derive(Debug, Args)]
struct BatchArgs {
    #[arg(long)]
    source: String,
    /// `operation:prompt`, repeatable.
    #[arg(long = "edit", required = true, value_parser = parse_edit)]
    edits: Vec<(OperationKind, String)>,
    #[command(flatten)]
    session: SessionArgs,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("photoshift error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Transform(args) => run_transform(args),
        Command::Batch(args) => run_batch(args),
        Command::Operations => {
            run_operations()?;
            Ok(0)
        }
    }
}

fn run_transform(args: TransformArgs) -> Result<i32> {
    let orchestrator = open_session(&args.session)?;
    let request = TransformationRequest::new(args.source, args.prompt, args.operation);
    let job_id = orchestrator.submit_transformation(&request)?;
    let job = orchestrator.get_job_status(&job_id)?;
    report_job(&orchestrator, &job, &args.session.out)?;
    close_session(&orchestrator, &args.session.out)
}

fn run_batch(args: BatchArgs) -> Result<i32> {
    let orchestrator = open_session(&args.session)?;
    let batch = BatchRequest::for_image(&args.source, args.edits);
    let result = orchestrator.submit_batch(&batch)?;
    for outcome in &result.outcomes {
        let job = orchestrator.get_job_status(outcome.job_id())?;
        report_job(&orchestrator, &job, &args.session.out)?;
    }
    if !result.all_completed() {
        eprintln!(
            "batch {}: {} of {} jobs did not complete",
            result.batch_id,
            result.outcomes.len() - result.completed(),
            result.outcomes.len()
        );
    }
    close_session(&orchestrator, &args.session.out)
}

fn run_operations() -> Result<()> {
    let costs = load_cost_table()?;
    for (operation, cost) in costs.entries() {
        println!("{operation}\t{cost}");
    }
    Ok(())
}

fn open_session(args: &SessionArgs) -> Result<Orchestrator> {
    fs::create_dir_all(&args.out)
        .with_context(|| format!("failed to create {}", args.out.display()))?;

    let mut config = OrchestratorConfig::from_env();
    if args.no_fallback {
        config.fallback_enabled = false;
    }
    if let Some(seconds) = args.poll_interval {
        if !seconds.is_finite() || seconds < 0.0 {
            bail!("--poll-interval must be a non-negative number of seconds");
        }
        config.poll_interval = Duration::from_secs_f64(seconds);
    }
    if let Some(attempts) = args.max_attempts {
        config.max_poll_attempts = attempts.max(1);
    }
    if config.receipts_dir.is_none() {
        config.receipts_dir = Some(args.out.join("receipts"));
    }

    let provider = select_provider(&args.provider, args.dryrun_latency)?;
    let events = EventWriter::new(
        args.out.join("events.jsonl"),
        format!("session-{}", uuid::Uuid::new_v4()),
    );
    let orchestrator = Orchestrator::new(config, CreditLedger::new(args.credits), provider, events)?
        .with_cost_table(load_cost_table()?);
    Ok(orchestrator)
}

fn select_provider(name: &str, dryrun_latency: u32) -> Result<Arc<dyn TransformationProvider>> {
    let name = name.trim().to_ascii_lowercase();
    if name == "dryrun" && dryrun_latency > 0 {
        return Ok(Arc::new(DryrunProvider::with_latency(dryrun_latency)));
    }
    let registry = default_provider_registry();
    match registry.get(&name) {
        Some(provider) => Ok(provider),
        None => bail!(
            "unknown provider '{name}' (available: {})",
            registry.names().join(", ")
        ),
    }
}

fn report_job(orchestrator: &Orchestrator, job: &TransformationJob, out: &Path) -> Result<()> {
    let mut line = json!({
        "job_id": job.id,
        "operation": job.operation,
        "status": job.status().as_str(),
        "cost": job.cost,
    });
    match &job.state {
        JobState::Completed { result, simulated } => {
            line["result"] = json!(result);
            line["simulated"] = json!(simulated);
            if *simulated {
                let path = orchestrator
                    .simulator()
                    .render_placeholder(job, &out.join("placeholders"))?;
                line["placeholder_path"] = json!(path.to_string_lossy());
            }
        }
        JobState::Failed { kind, message } => {
            line["failure"] = json!(kind);
            line["message"] = json!(message);
        }
        JobState::TimedOut { handle, attempts } => {
            line["handle"] = json!(handle);
            line["poll_attempts"] = json!(attempts);
        }
        JobState::Pending | JobState::Processing { .. } | JobState::Cancelled => {}
    }
    println!("{line}");
    Ok(())
}

fn close_session(orchestrator: &Orchestrator, out: &Path) -> Result<i32> {
    let summary = orchestrator.finish(&out.join("summary.json"))?;
    eprintln!(
        "{} jobs: {} completed, {} failed, {} timed out; {} credits spent, {} left",
        summary.total_jobs,
        summary.completed,
        summary.failed,
        summary.timed_out,
        summary.credits_spent,
        summary.credits_available
    );
    Ok(exit_code(summary.timed_out))
}

fn exit_code(timed_out: u64) -> i32 {
    if timed_out > 0 {
        2
    } else {
        0
    }
}

fn parse_edit(raw: &str) -> Result<(OperationKind, String), String> {
    let (operation, prompt) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected operation:prompt, got '{raw}'"))?;
    let operation = operation.parse::<OperationKind>()?;
    let prompt = prompt.trim();
    if prompt.is_empty() {
        return Err(format!("edit '{raw}' has an empty prompt"));
    }
    Ok((operation, prompt.to_string()))
}
