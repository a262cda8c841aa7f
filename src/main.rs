// govern - invocation shim for the compliance & risk aggregation pipeline.
// The deployed trigger calls one subcommand per invocation.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

use govern_pipeline::compliance_ingest::SnapshotRulesEngine;
use govern_pipeline::config::load_config;
use govern_pipeline::delivery::Delivery;
use govern_pipeline::guidance::{load_guidance, read_guidance_file};
use govern_pipeline::PipelineContext;

#[derive(Parser)]
#[command(name = "govern", about = "Compliance & risk aggregation pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest recorded rules-engine poll results and refresh the backlog
    Poll { snapshot: PathBuf },
    /// Ingest one review-tool answer event
    RiskEvent { event: PathBuf },
    /// Replace the guidance mapping and refresh the backlog
    LoadGuidance { mapping: PathBuf },
    /// Recompute the remediation backlog
    Prioritize,
    /// List dead-lettered invocations
    DeadLetters,
}

fn read_json(path: &Path) -> anyhow::Result<Value> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("invalid JSON in {}", path.display()))
}

fn report<T>(handler: &str, delivery: Delivery<T>) -> ExitCode {
    match delivery {
        Delivery::Completed { attempts, .. } => {
            info!(handler, attempts, "done");
            ExitCode::SUCCESS
        }
        Delivery::Dropped { reason } => {
            eprintln!("{handler}: input dropped: {reason}");
            ExitCode::from(2)
        }
        Delivery::DeadLettered { letter_id, attempts } => {
            eprintln!("{handler}: dead-lettered as {letter_id} after {attempts} attempts");
            ExitCode::from(3)
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = load_config().context("failed to load configuration")?;
    let ctx = PipelineContext::open(config).context("failed to open pipeline")?;
    let dispatcher = ctx.dispatcher();

    let code = match cli.command {
        Command::Poll { snapshot } => {
            let payload = json!({ "snapshot": snapshot.display().to_string() });
            let delivery = dispatcher.dispatch("compliance_poll", &payload, |deadline| {
                let engine = SnapshotRulesEngine::from_file(&snapshot)?;
                ctx.compliance_cycle(&engine, deadline)
            })?;
            report("compliance_poll", delivery)
        }
        Command::RiskEvent { event } => {
            let payload = read_json(&event)?;
            let delivery = dispatcher.dispatch("risk_event", &payload, |_| ctx.risk_event(&payload))?;
            report("risk_event", delivery)
        }
        Command::LoadGuidance { mapping } => {
            let payload = json!({ "mapping": mapping.display().to_string() });
            let delivery = dispatcher.dispatch("load_guidance", &payload, |deadline| {
                let entries = read_guidance_file(&mapping)?;
                load_guidance(&ctx.store, &entries)?;
                ctx.prioritize(deadline)
            })?;
            report("load_guidance", delivery)
        }
        Command::Prioritize => {
            let delivery = dispatcher.dispatch("prioritize", &Value::Null, |deadline| ctx.prioritize(deadline))?;
            report("prioritize", delivery)
        }
        Command::DeadLetters => {
            for letter in ctx.store.dead_letters()? {
                println!("{}", serde_json::to_string(&letter)?);
            }
            ExitCode::SUCCESS
        }
    };

    ctx.store.flush()?;
    Ok(code)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run(Cli::parse()) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("govern: {e:#}");
            ExitCode::FAILURE
        }
    }
}
