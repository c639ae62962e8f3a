//! solvewatch CLI
//!
//! Starts solve sessions on a solver server and watches their progress
//! over the dual-transport delivery subsystem, printing each update and a
//! final summary.

use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use solvewatch::api::SolverApi;
use solvewatch::config::Settings;
use solvewatch::progress::{Envelope, ProgressSink, ProgressWatcher};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::{prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "solvewatch", about = "Watch batch solve sessions", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check the server is reachable and configured
    Status,
    /// Start solving the server's questions folder and watch the session
    Solve,
    /// Watch an existing session by id
    Watch {
        /// Session id returned when the session was created
        session_id: String,
    },
    /// Print the final results of a finished session
    Results {
        /// Session id returned when the session was created
        session_id: String,
    },
    /// List generated reports
    Reports,
    /// Print one report's Markdown content
    Report {
        /// Report file name from the listing
        filename: String,
        /// Print the raw file instead of the parsed content
        #[arg(long)]
        raw: bool,
    },
}

/// Outcome delivered by the sink once the watched session ends.
enum WatchOutcome {
    Completed(Envelope),
    Failed(String),
}

/// Sink that logs every tick and hands the terminal outcome to `main`.
struct ConsoleSink {
    done: mpsc::Sender<WatchOutcome>,
}

impl ProgressSink for ConsoleSink {
    fn on_tick(&self, envelope: &Envelope) {
        match envelope.latest_result.as_ref() {
            Some(latest) => info!(
                completed = envelope.completed_count,
                total = envelope.total_count,
                item = %latest.filename,
                success = latest.success,
                "progress"
            ),
            None => info!(
                completed = envelope.completed_count,
                total = envelope.total_count,
                "progress"
            ),
        }
    }

    fn on_complete(&self, envelope: &Envelope) {
        let _ = self.done.try_send(WatchOutcome::Completed(envelope.clone()));
    }

    fn on_error(&self, message: &str) {
        let _ = self.done.try_send(WatchOutcome::Failed(message.to_string()));
    }
}

async fn watch_session(settings: &Settings, session_id: &str) -> Result<()> {
    let (done_tx, mut done_rx) = mpsc::channel(1);
    let sink = Arc::new(ConsoleSink { done: done_tx });
    let watcher = ProgressWatcher::new(settings, sink)?;
    watcher.start(session_id);

    let outcome = done_rx.recv().await;
    watcher.stop();

    match outcome {
        Some(WatchOutcome::Completed(envelope)) => {
            let solved = envelope.results.iter().filter(|r| r.success).count();
            let failed = envelope.results.len() - solved;
            println!(
                "Session {session_id} completed: {} items, {solved} solved, {failed} failed",
                envelope.results.len()
            );
            for result in &envelope.results {
                let mark = if result.success { "ok " } else { "ERR" };
                let detail = result
                    .error
                    .as_deref()
                    .unwrap_or_else(|| result.topic.as_deref().unwrap_or(""));
                println!("  [{mark}] {} {detail}", result.filename);
            }
            Ok(())
        }
        Some(WatchOutcome::Failed(message)) => bail!("session {session_id} failed: {message}"),
        None => bail!("watcher stopped without a terminal outcome"),
    }
}

async fn run(settings: Settings, command: Command) -> Result<()> {
    let api = SolverApi::new(&settings)?;
    match command {
        Command::Status => {
            let status = api.status().await?;
            println!(
                "server: {} (solver backend configured: {})",
                status.status, status.api_key_set
            );
        }
        Command::Solve => {
            let started = api.solve_folder().await?;
            println!(
                "Started session {} ({} question images)",
                started.session_id, started.file_count
            );
            watch_session(&settings, &started.session_id).await?;
        }
        Command::Watch { session_id } => {
            watch_session(&settings, &session_id).await?;
        }
        Command::Results { session_id } => {
            let results = api.results(&session_id).await?;
            let solved = results.results.iter().filter(|r| r.success).count();
            println!(
                "Session {session_id}: {} ({} items, {solved} solved)",
                results.status,
                results.results.len()
            );
            for result in &results.results {
                let mark = if result.success { "ok " } else { "ERR" };
                println!("  [{mark}] {}", result.filename);
            }
            if let Some(path) = &results.report_path {
                println!("report: {path}");
            }
        }
        Command::Reports => {
            let listing = api.outputs().await?;
            println!("{} report(s)", listing.count);
            for report in &listing.reports {
                println!("  {} ({} bytes, {})", report.filename, report.size, report.modified);
            }
        }
        Command::Report { filename, raw } => {
            if raw {
                println!("{}", api.report_raw(&filename).await?);
            } else {
                let report = api.report(&filename).await?;
                println!("{}", report.content);
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let settings = Settings::new()?;
    settings.validate()?;

    run(settings, cli.command).await
}
