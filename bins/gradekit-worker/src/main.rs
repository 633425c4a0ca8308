mod clone;
mod engine;
mod evaluator;
mod executor;
mod metrics;
mod scan;
mod script;
mod secret;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use clone::GitCli;
use executor::Pipeline;
use gradekit_common::redis;
use gradekit_common::{Config, RunData, RunStatus};
use metrics::Metrics;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gradekit-worker")]
#[command(about = "GradeKit worker - run course tests against student submissions", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume runs from the redis queue until interrupted
    Serve,

    /// Run the tests for a single RunData JSON file and print the report
    Run {
        /// Path to the RunData JSON
        #[arg(short, long)]
        request: PathBuf,
    },

    /// Extract score records from a captured test log
    Extract {
        /// Session secret the log was produced with
        #[arg(short, long)]
        secret: String,

        /// Captured combined output
        log: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Run { request } => run_once(config, &request).await,
        Commands::Extract { secret, log } => extract(&secret, &log),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("GRADEKIT_LOG_JSON")
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    // stdout is reserved for reports
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn build_pipeline(config: &Config) -> anyhow::Result<(Pipeline, Arc<Metrics>)> {
    let runner = engine::from_config(config)?;
    let scm = Arc::new(GitCli::new(config.scm_base_url.as_str()));
    let metrics = Arc::new(Metrics::new()?);
    let pipeline = Pipeline::new(scm, runner, metrics.clone(), config.clone());
    Ok((pipeline, metrics))
}

/// Token cancelled on the first ctrl-c
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "Failed to install ctrl-c handler");
            return;
        }
        info!("Received shutdown signal, cancelling in-flight run");
        trigger.cancel();
    });
    cancel
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let client = ::redis::Client::open(config.redis_url.as_str())?;
    let mut conn = ::redis::aio::ConnectionManager::new(client).await?;
    let (pipeline, metrics) = build_pipeline(&config)?;
    let cancel = cancel_on_ctrl_c();

    info!(
        redis_url = %config.redis_url,
        queue = %redis::run_queue(),
        runner = ?config.runner,
        "Worker listening for runs"
    );

    loop {
        // BLPOP with 5 second timeout so shutdown is noticed between runs
        let popped = tokio::select! {
            _ = cancel.cancelled() => break,
            popped = redis::pop_run(&mut conn, 5.0) => popped,
        };

        let run = match popped {
            Ok(Some(run)) => run,
            Ok(None) => continue,
            Err(err) => {
                error!(error = %err, "Redis error");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        let label = run.label();
        info!(label = %label, owner = %run.job_owner, "Received run");

        let outcome = pipeline.run_tests(&run, &cancel).await;
        match &outcome {
            Ok(results) => info!(label = %label, scores = results.scores.len(), "Run completed"),
            Err(err) => warn!(
                label = %label,
                kind = ?err.kind(),
                retryable = err.is_retryable(),
                error = %err,
                "Run failed"
            ),
        }

        let report = executor::report(label, outcome);
        if let Err(err) = redis::store_report(&mut conn, &report).await {
            error!(label = %report.label, error = %err, "Failed to store run report");
        }
    }

    tracing::debug!(metrics = %metrics.render(), "Final metrics");
    info!("Worker shutdown complete");
    Ok(())
}

async fn run_once(config: Config, request: &Path) -> anyhow::Result<()> {
    let payload = std::fs::read_to_string(request)
        .with_context(|| format!("failed to read {}", request.display()))?;
    let run: RunData = serde_json::from_str(&payload)
        .with_context(|| format!("invalid run request in {}", request.display()))?;

    let (pipeline, _metrics) = build_pipeline(&config)?;
    let cancel = cancel_on_ctrl_c();

    let outcome = pipeline.run_tests(&run, &cancel).await;
    let report = executor::report(run.label(), outcome);
    println!("{}", serde_json::to_string_pretty(&report)?);

    anyhow::ensure!(
        report.status == RunStatus::Succeeded,
        "run {} finished with status {:?}",
        report.label,
        report.status
    );
    Ok(())
}

fn extract(secret: &str, log: &Path) -> anyhow::Result<()> {
    let out = std::fs::read_to_string(log)
        .with_context(|| format!("failed to read {}", log.display()))?;

    let (results, outcome) = match evaluator::extract_results(&out, secret, Duration::ZERO) {
        Ok(results) => (results, Ok(())),
        Err(err) => {
            for rejected in err.rejected() {
                warn!(reason = %rejected, "Score record rejected");
            }
            let message = err.to_string();
            (err.into_results(), Err(anyhow!(message)))
        }
    };

    println!("{}", serde_json::to_string_pretty(&results)?);
    outcome
}
