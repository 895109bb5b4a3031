mod jobs;
mod scheduler;
mod signals;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use ops_core::cfg::{self, AppId, Config};
use ops_core::job::JobStatus;
use ops_core::logx;
use ops_core::notify::{Notifier, SlackNotifier};
use tracing::{error, info, warn};

use crate::scheduler::Scheduler;

const APP: AppId = AppId {
    qualifier: "com",
    organization: "local",
    application: env!("CARGO_PKG_NAME"),
};

#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"), version, about = "Operations daemon: health checks, backups, feedback evaluation")]
struct Cli {
    /// Config file (default: the per-user config dir).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Override the configured log level.
    #[arg(long)]
    log: Option<String>,
    /// Run one job by name and exit.
    #[arg(long, value_name = "JOB")]
    once: Option<String>,
}

fn load(cli: &Cli) -> Result<Config> {
    let cfg = match &cli.config {
        Some(path) => cfg::load_from(path)?,
        None => cfg::load_or_init(&APP)?,
    };
    cfg.validate().context("invalid configuration")?;
    Ok(cfg)
}

fn build_runtime() -> std::io::Result<tokio::runtime::Runtime> {
    #[cfg(feature = "rt-single")]
    {
        tokio::runtime::Builder::new_current_thread().enable_all().build()
    }
    #[cfg(not(feature = "rt-single"))]
    {
        tokio::runtime::Builder::new_multi_thread().enable_all().build()
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let cfg = match load(&cli) {
        Ok(cfg) => cfg,
        Err(e) => {
            logx::init("info");
            error!("{e:#}");
            return ExitCode::FAILURE;
        }
    };
    let level = cli.log.clone().unwrap_or_else(|| cfg.log_level.clone());
    let _log_guard = logx::init_with_file(&level, &cfg.log_dir, APP.application);

    let rt = match build_runtime() {
        Ok(rt) => rt,
        Err(e) => {
            error!("tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };
    match rt.block_on(run(cli, cfg)) {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, cfg: Config) -> Result<ExitCode> {
    let slack = SlackNotifier::new(&cfg.slack);
    if !slack.is_configured() {
        warn!("no Slack token configured, notifications are logged only");
    }
    let notifier: Arc<dyn Notifier> = Arc::new(slack);

    let mut scheduler = Scheduler::new(cfg.tick()).with_notifier(notifier.clone());
    jobs::register_all(&mut scheduler, &cfg, notifier)?;

    if let Some(name) = cli.once.as_deref() {
        let Some(result) = scheduler.run_now(name).await else {
            let known: Vec<String> = scheduler.jobs().into_iter().map(|j| j.name).collect();
            anyhow::bail!("unknown job {name:?} (known: {})", known.join(", "));
        };
        info!(job = name, status = %result.status, "{}", result.summary());
        return Ok(if result.status == JobStatus::Error { ExitCode::FAILURE } else { ExitCode::SUCCESS });
    }

    info!("{} boot, database={}", APP.application, cfg::BackupTarget::parse(&cfg.database_url)?.kind());
    for job in scheduler.jobs() {
        info!(job = %job.name, trigger = %job.trigger, next_run = %job.next_run, "scheduled");
    }
    signals::install(scheduler.stop_handle())?;
    scheduler.run().await;
    for job in scheduler.jobs() {
        info!(job = %job.name, runs = job.runs, failures = job.failures, "job totals");
    }
    info!("{} stopped", APP.application);
    Ok(ExitCode::SUCCESS)
}
