//! Process-level orchestration: spawn a registered job in its own process
//! group, enforce its wall-clock limit, escalate SIGTERM -> SIGKILL on
//! timeout (taking orphaned browser children down with the group), and
//! guarantee a health file exists whatever the exit path was.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod jobs;

use jobs::JobSpec;
use procurement_core::health::{HealthReport, JobStatus};
use procurement_core::Config;
use tender_ingest::Store;

const TERM_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(
    name = "orchestrator",
    about = "Runs and supervises the scheduled procurement jobs",
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Spawn a registered job under supervision.
    Run {
        job: String,
        #[arg(long, help = "Override the job's wall-clock limit in seconds")]
        timeout_secs: Option<u64>,
    },
    /// Daily maintenance: close open tenders past their deadline.
    Lifecycle,
    /// Print a dataset's last health report.
    Health { dataset: String },
    /// Print the schedule contract for every registered job.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match cli.command {
        CliCommand::Run { job, timeout_secs } => run_job(&job, timeout_secs).await,
        CliCommand::Lifecycle => lifecycle().await,
        CliCommand::Health { dataset } => health(&dataset),
        CliCommand::Schedule => {
            for job in jobs::JOBS {
                println!("{:<22} {:<14} {}", job.name, job.schedule, job.note);
            }
            Ok(())
        }
    }
}

fn health(dataset: &str) -> Result<()> {
    let config = Config::from_env()?;
    match HealthReport::load(&config.health_dir, dataset) {
        Some(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        None => Err(anyhow!("no health report for dataset '{}'", dataset)),
    }
}

async fn lifecycle() -> Result<()> {
    let config = Config::from_env()?;
    let started = Utc::now();
    info!("=== LIFECYCLE MAINTENANCE STARTED ===");

    let result = async {
        let store = Store::connect(&config.database_url).await?;
        store.auto_close_expired().await
    }
    .await;

    let (status, closed, errors) = match result {
        Ok(closed) => (JobStatus::Success, closed, 0),
        Err(e) => {
            error!("Lifecycle maintenance failed: {:#}", e);
            (JobStatus::Failure, 0, 1)
        }
    };

    let report = HealthReport {
        items_processed: closed,
        error_count: errors,
        ..HealthReport::new("lifecycle", started)
    }
    .finish(status);
    report.write_to(&config.health_dir)?;

    info!("=== LIFECYCLE MAINTENANCE COMPLETED ({} closed) ===", closed);
    std::process::exit(report.exit_code);
}

async fn run_job(name: &str, timeout_secs: Option<u64>) -> Result<()> {
    let spec: &JobSpec =
        jobs::find(name).ok_or_else(|| anyhow!("unknown job '{}'; see `orchestrator schedule`", name))?;
    let config = Config::from_env()?;
    let timeout = timeout_secs
        .map(Duration::from_secs)
        .unwrap_or(spec.timeout);

    let started = Utc::now();
    info!("Supervising job '{}' (limit {:?})", spec.name, timeout);

    let mut child = Command::new(spec.binary)
        .args(spec.args)
        .process_group(0)
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
        .with_context(|| format!("could not spawn {}", spec.binary))?;

    let pid = child
        .id()
        .ok_or_else(|| anyhow!("spawned job has no pid"))? as i32;

    let exit_code = tokio::select! {
        status = child.wait() => {
            let status = status.context("wait on child failed")?;
            status.code().unwrap_or(1)
        }
        _ = tokio::time::sleep(timeout) => {
            warn!("Job '{}' hit its wall-clock limit, killing process group", spec.name);
            kill_group(pid).await;
            let _ = child.wait().await;
            // The child could not write its own report; record the timeout.
            let report = HealthReport::new(spec.dataset, started).finish(JobStatus::Timeout);
            if let Err(e) = report.write_to(&config.health_dir) {
                error!("Could not write timeout health report: {}", e);
            }
            124
        }
    };

    match exit_code {
        0 => info!("Job '{}' finished cleanly", spec.name),
        75 => info!("Job '{}' skipped: lock contested", spec.name),
        124 => warn!("Job '{}' timed out", spec.name),
        code => warn!("Job '{}' failed with exit code {}", spec.name, code),
    }
    std::process::exit(exit_code);
}

/// SIGTERM the whole group, give it a short grace, then SIGKILL. The group
/// includes any headless-browser processes the job spawned.
async fn kill_group(pid: i32) {
    let pgid = Pid::from_raw(pid);
    if killpg(pgid, Signal::SIGTERM).is_ok() {
        tokio::time::sleep(TERM_GRACE).await;
    }
    let _ = killpg(pgid, Signal::SIGKILL);
}
