use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use ops_core::backup::BackupManager;
use ops_core::cfg::{self, AppId, Config};
use ops_core::feedback::{evaluate, FeedbackCounts};
use ops_core::health::HealthMonitor;
use ops_core::job::{self, JobStatus};
use ops_core::logx;
use ops_core::notify::{Notifier, SlackNotifier};
use ops_core::store::{open_counters, FeedbackKind, FeedbackSource};
use tracing::debug;

// Shares the daemon's config file.
const APP: AppId = AppId {
    qualifier: "com",
    organization: "local",
    application: "opsd",
};

#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"), version, about = "One-shot operations: backup, health, feedback")]
struct Cli {
    /// Config file (default: the daemon's config in the per-user config dir).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Print results as JSON.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Dump the database, bundle logs, sweep expired archives.
    Backup {
        /// Override `retention_days`; 0 keeps everything.
        #[arg(long)]
        retention_days: Option<i64>,
    },
    /// Sample CPU, memory and disk once.
    Health {
        #[arg(long)]
        cpu: Option<f64>,
        #[arg(long)]
        mem: Option<f64>,
        #[arg(long)]
        disk: Option<f64>,
        /// Do not send the threshold alert.
        #[arg(long)]
        no_alert: bool,
    },
    /// Evaluate the dislike ratio.
    Feedback {
        #[arg(long, requires = "dislikes")]
        likes: Option<u64>,
        #[arg(long, requires = "likes")]
        dislikes: Option<u64>,
        #[arg(long)]
        threshold: Option<f64>,
        /// Add one signal to the counter store before evaluating.
        #[arg(long, value_parser = ["like", "dislike"], conflicts_with = "likes")]
        record: Option<String>,
    },
    /// List the daemon's jobs and their next run.
    Schedule,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = match cli.verbose { 0 => "warn", 1 => "info", 2 => "debug", _ => "trace" };
    logx::init(level);

    let rt = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };
    match rt.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn load(cli: &Cli) -> Result<Config> {
    let cfg = match &cli.config {
        Some(path) => cfg::load_from(path)?,
        None => cfg::load_or_init(&APP)?,
    };
    cfg.validate().context("invalid configuration")?;
    debug!(config = ?cli.config, tick_s = cfg.tick_secs, "config loaded");
    Ok(cfg)
}

fn exit_for(status: JobStatus) -> ExitCode {
    if status == JobStatus::Error { ExitCode::FAILURE } else { ExitCode::SUCCESS }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let cfg = load(&cli)?;
    let notifier: Arc<dyn Notifier> = Arc::new(SlackNotifier::new(&cfg.slack));

    match cli.cmd {
        Command::Backup { retention_days } => {
            let manager = BackupManager::from_config(&cfg, notifier)?;
            let rec = manager.create_backup(retention_days.unwrap_or(cfg.retention_days)).await;
            if cli.json {
                print_json(&rec)?;
            } else {
                println!("{}", rec.summary());
            }
            Ok(if rec.success { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
        Command::Health { cpu, mem, disk, no_alert } => {
            let mut thresholds = cfg.thresholds;
            thresholds.cpu = cpu.unwrap_or(thresholds.cpu);
            thresholds.mem = mem.unwrap_or(thresholds.mem);
            thresholds.disk = disk.unwrap_or(thresholds.disk);
            let mut monitor = HealthMonitor::local(&cfg.disk_path, cfg.cpu_window(), notifier);
            if no_alert {
                monitor = monitor.without_alerts();
            }
            let sample = monitor.check(&thresholds).await;
            if cli.json {
                print_json(&sample)?;
            } else {
                println!(
                    "status: {}\ncpu: {:.1}%\nmemory: {:.1}%\ndisk: {:.1}%",
                    sample.status, sample.cpu_pct, sample.mem_pct, sample.disk_pct
                );
                for alert in &sample.alerts {
                    println!("  - {alert}");
                }
                if let Some(e) = &sample.error {
                    println!("error: {e}");
                }
            }
            Ok(exit_for(sample.status))
        }
        Command::Feedback { likes, dislikes, threshold, record } => {
            let counts = match (likes, dislikes) {
                (Some(likes), Some(dislikes)) => FeedbackCounts { likes, dislikes },
                _ => {
                    let store = open_counters(&cfg.feedback_store_dir)
                        .with_context(|| format!("open feedback store {}", cfg.feedback_store_dir.display()))?;
                    if let Some(kind) = record.as_deref() {
                        let kind = if kind == "like" { FeedbackKind::Like } else { FeedbackKind::Dislike };
                        store.record(kind).context("record feedback")?;
                    }
                    store.counts().context("read feedback counters")?
                }
            };
            let ratio = evaluate(counts, threshold.unwrap_or(cfg.feedback_threshold));
            if cli.json {
                print_json(&ratio)?;
            } else {
                println!("{}", ratio.report());
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Schedule => {
            let now = Local::now().naive_local();
            let plan = job::plan(&cfg)?;
            for (name, trigger) in plan {
                let next = trigger.next_after(now);
                println!("{name:<16} {:<16} next: {}", trigger.to_string(), next.format("%Y-%m-%d %H:%M"));
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}
