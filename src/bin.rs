use anyhow::{Context, Result};
use rbackup::engine::context::Deadline;
use rbackup::{BackupConfig, BackupJob, StepOutcome};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Tells the caller to invoke the job again (EX_TEMPFAIL).
const EXIT_AGAIN: u8 = 75;

fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .context("usage: rbackupbin <config.json>")?;
    let config = BackupConfig::load(&path).with_context(|| format!("failed to load config '{}'", path.display()))?;
    let mut deadline = Deadline::after(Duration::from_secs(config.time_budget_secs));

    let mut job = BackupJob::open(config).context("failed to open backup job")?;
    let outcome = job.run_step(&mut deadline).context("backup step failed")?;
    let stats = job.stats();
    info!(
        archived = stats.archived,
        vanished = stats.vanished,
        unreadable = stats.unreadable,
        total = stats.total,
        ?outcome,
        "step finished"
    );
    Ok(match outcome {
        StepOutcome::Done => ExitCode::SUCCESS,
        StepOutcome::Interrupted => ExitCode::from(EXIT_AGAIN),
    })
}
