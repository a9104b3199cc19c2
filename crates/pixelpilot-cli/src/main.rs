//! pixelpilot CLI entry point.

mod args;
mod capture;
mod config;
mod runs;
mod server;

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use pixelpilot_core::abort::abort_pair;
use pixelpilot_core::action::RecordingInjector;
use pixelpilot_core::pipeline::PipelineGraph;
use pixelpilot_core::{Outcome, RunStatus, Scheduler};
use tracing::{error, info};

use crate::args::{Cli, Commands, RunArgs, ValidateArgs};
use crate::capture::ReplayCapture;

const EXIT_FAILURE: u8 = 1;
/// Conventional exit status for termination by SIGINT.
const EXIT_ABORTED: u8 = 130;

fn main() -> ExitCode {
    // Logs go to stderr; stdout carries results and protocol responses.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Examples => {
            println!("{}", crate::args::EXAMPLES_TEXT);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Validate(args) => validate(&args),
        Commands::Run(args) => run_pipeline(args),
        Commands::Serve => run_server(),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

fn load(pipeline: &Path, resource_dir: Option<&Path>) -> anyhow::Result<PipelineGraph> {
    let options = config::load_options(pipeline, resource_dir);
    PipelineGraph::load(pipeline, options)
        .with_context(|| format!("Failed to load pipeline {:?}", pipeline))
}

/// Load a document and print its node summary.
fn validate(args: &ValidateArgs) -> anyhow::Result<ExitCode> {
    let graph = load(&args.pipeline, args.resource_dir.as_deref())?;
    let report = serde_json::json!({
        "nodes": graph.summary(),
        "roots": graph.roots(),
        "resource_base": graph.resource_base().display().to_string(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(ExitCode::SUCCESS)
}

/// Dry run a pipeline against recorded frames.
///
/// Ctrl+C and SIGTERM abort the run cooperatively; the outcome is still
/// reported.
fn run_pipeline(args: RunArgs) -> anyhow::Result<ExitCode> {
    let graph = Arc::new(load(&args.pipeline, args.resource_dir.as_deref())?);
    let capture = Arc::new(ReplayCapture::open(&args.frames)?);
    let injector = Arc::new(RecordingInjector::new());

    let runtime = tokio::runtime::Runtime::new()?;
    let outcome = runtime.block_on(async {
        let (handle, signal) = abort_pair();
        let scheduler = Scheduler::new(graph);
        let run = scheduler.run_with_abort(&args.entry, capture.clone(), injector.clone(), signal);
        tokio::pin!(run);

        tokio::select! {
            outcome = &mut run => outcome,
            _ = shutdown_signal() => {
                info!("Received interrupt, aborting run");
                handle.abort();
                run.await
            }
        }
    });

    info!("Run finished after {} capture(s)", capture.served());
    report(&outcome, args.json)?;

    Ok(match outcome.status {
        RunStatus::Succeeded => ExitCode::SUCCESS,
        RunStatus::Failed { .. } => ExitCode::from(EXIT_FAILURE),
        RunStatus::Aborted { .. } => ExitCode::from(EXIT_ABORTED),
    })
}

fn report(outcome: &Outcome, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(outcome)?);
        return Ok(());
    }
    for record in &outcome.visited {
        println!(
            "{:<24} attempts={:<4} {}ms",
            record.name, record.attempts, record.elapsed_ms
        );
    }
    match &outcome.status {
        RunStatus::Succeeded => println!("succeeded in {}ms", outcome.elapsed_ms),
        RunStatus::Failed { reason } => println!("failed: {}", reason),
        RunStatus::Aborted { node } => println!("aborted at '{}'", node),
    }
    Ok(())
}

/// Serve the JSON-line protocol on stdin/stdout until shutdown, EOF or a signal.
fn run_server() -> anyhow::Result<ExitCode> {
    let runtime = tokio::runtime::Runtime::new()?;

    runtime.block_on(async {
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        let stdout = tokio::io::stdout();

        tokio::select! {
            result = server::serve(stdin, stdout) => {
                result?;
                Ok::<_, anyhow::Error>(ExitCode::SUCCESS)
            }
            _ = shutdown_signal() => {
                info!("Received signal, shutting down");
                Ok(ExitCode::SUCCESS)
            }
        }
    })
}

async fn shutdown_signal() {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm() => {}
    }
}

/// Wait for SIGTERM signal (Unix only).
///
/// If signal registration fails, logs a warning and waits indefinitely.
#[cfg(unix)]
async fn sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::warn!(
                "Failed to register SIGTERM handler: {}, only SIGINT will be handled",
                e
            );
            std::future::pending::<()>().await;
        }
    }
}

/// SIGTERM is not available on non-Unix platforms; use a never-completing future.
#[cfg(not(unix))]
async fn sigterm() {
    std::future::pending::<()>().await;
}
