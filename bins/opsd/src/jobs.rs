use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

use ops_core::backup::BackupManager;
use ops_core::cfg::Config;
use ops_core::feedback::{evaluate, FeedbackRatio};
use ops_core::health::{HealthMonitor, HealthSample, Thresholds};
use ops_core::job::{self, JobResult, JobStatus};
use ops_core::notify::{send_logged, Notifier};
use ops_core::process::run_with_timeout;
use ops_core::store::{open_counters, FeedbackSource};

use crate::scheduler::{Handler, Scheduler};

/// Called when the dislike ratio crosses the threshold. The retraining itself
/// happens elsewhere; implementations only request it.
#[async_trait]
pub trait RetrainTrigger: Send + Sync {
    async fn request(&self, ratio: &FeedbackRatio) -> Result<()>;
}

/// Runs a configured external command.
pub struct CommandTrigger {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandTrigger {
    pub fn new(argv: Vec<String>, timeout: Duration) -> Self {
        Self { argv, timeout }
    }
}

#[async_trait]
impl RetrainTrigger for CommandTrigger {
    async fn request(&self, ratio: &FeedbackRatio) -> Result<()> {
        let Some((program, args)) = self.argv.split_first() else {
            bail!("retrain_command is empty");
        };
        let mut cmd = Command::new(program);
        cmd.args(args)
            .env("FEEDBACK_RATIO", format!("{:.4}", ratio.ratio))
            .env("FEEDBACK_THRESHOLD", format!("{:.4}", ratio.threshold));
        info!(%program, ratio = ratio.ratio, "requesting retraining");
        let out = run_with_timeout(&mut cmd, self.timeout).await?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            bail!("retrain command exit status {:?}: {}", out.status.code(), stderr.trim());
        }
        Ok(())
    }
}

/// Used when no retrain command is configured: the request is only logged.
pub struct LogTrigger;

#[async_trait]
impl RetrainTrigger for LogTrigger {
    async fn request(&self, ratio: &FeedbackRatio) -> Result<()> {
        warn!(ratio = ratio.ratio, threshold = ratio.threshold, "retraining requested (no retrain_command configured)");
        Ok(())
    }
}

pub fn health_result(sample: HealthSample) -> JobResult {
    let mut r = JobResult::new(sample.status)
        .with("cpu_pct", sample.cpu_pct)
        .with("mem_pct", sample.mem_pct)
        .with("disk_pct", sample.disk_pct);
    if !sample.alerts.is_empty() {
        r = r.with("alerts", sample.alerts);
    }
    if let Some(e) = sample.error {
        r = r.with("error", e);
    }
    if sample.alert_delivered.is_some() {
        r = r.alerted();
    }
    r
}

pub fn health_job(monitor: Arc<HealthMonitor>, thresholds: Thresholds) -> impl Handler {
    move || {
        let monitor = Arc::clone(&monitor);
        async move { anyhow::Ok(health_result(monitor.check(&thresholds).await)) }
    }
}

pub fn backup_job(manager: Arc<BackupManager>, retention_days: i64) -> impl Handler {
    move || {
        let manager = Arc::clone(&manager);
        async move {
            let rec = manager.create_backup(retention_days).await;
            let mut r = if rec.success { JobResult::ok() } else { JobResult::error(rec.error.clone().unwrap_or_default()) };
            if let Some(p) = &rec.archive_path {
                r = r.with("archive", p.display().to_string());
            }
            r = r
                .with("size_bytes", rec.size_bytes)
                .with("duration_s", rec.duration_seconds)
                .with("swept", rec.sweep.deleted);
            if rec.notified.is_some() {
                r = r.alerted();
            }
            anyhow::Ok(r)
        }
    }
}

/// Evaluate the current counters, report them, and request retraining when warranted.
pub async fn check_feedback(
    source: &dyn FeedbackSource,
    threshold: f64,
    notifier: &dyn Notifier,
    trigger: &dyn RetrainTrigger,
) -> Result<JobResult> {
    let counts = source.counts().context("read feedback counters")?;
    let ratio = evaluate(counts, threshold);
    info!(
        likes = ratio.likes,
        dislikes = ratio.dislikes,
        ratio = ratio.ratio,
        decision = ratio.decision,
        "feedback evaluated"
    );
    send_logged(notifier, &ratio.report()).await;

    let status = if ratio.decision { JobStatus::Warning } else { JobStatus::Ok };
    let result = JobResult::new(status)
        .with("likes", ratio.likes)
        .with("dislikes", ratio.dislikes)
        .with("ratio", ratio.ratio)
        .with("retrain", ratio.decision);
    if ratio.decision {
        trigger.request(&ratio).await.context("retrain trigger")?;
    }
    Ok(result.alerted())
}

pub fn feedback_job(
    source: Arc<dyn FeedbackSource>,
    threshold: f64,
    notifier: Arc<dyn Notifier>,
    trigger: Arc<dyn RetrainTrigger>,
) -> impl Handler {
    move || {
        let (source, notifier, trigger) = (source.clone(), notifier.clone(), trigger.clone());
        async move { check_feedback(source.as_ref(), threshold, notifier.as_ref(), trigger.as_ref()).await }
    }
}

/// Build components once from `cfg` and register the standard jobs in plan order.
pub fn register_all(scheduler: &mut Scheduler, cfg: &Config, notifier: Arc<dyn Notifier>) -> Result<()> {
    let monitor = Arc::new(HealthMonitor::local(&cfg.disk_path, cfg.cpu_window(), notifier.clone()));
    let backups = Arc::new(BackupManager::from_config(cfg, notifier.clone())?);
    let counters: Arc<dyn FeedbackSource> = Arc::new(
        open_counters(&cfg.feedback_store_dir)
            .with_context(|| format!("open feedback store {}", cfg.feedback_store_dir.display()))?,
    );
    let trigger: Arc<dyn RetrainTrigger> = match &cfg.retrain_command {
        Some(argv) if !argv.is_empty() => {
            Arc::new(CommandTrigger::new(argv.clone(), Duration::from_secs(cfg.retrain_timeout_secs)))
        }
        _ => Arc::new(LogTrigger),
    };

    for (name, when) in job::plan(cfg)? {
        match name {
            job::HEALTH_CHECK => scheduler.register(name, when, health_job(monitor.clone(), cfg.thresholds))?,
            job::DB_BACKUP => scheduler.register(name, when, backup_job(backups.clone(), cfg.retention_days))?,
            job::FEEDBACK_CHECK => scheduler.register(
                name,
                when,
                feedback_job(counters.clone(), cfg.feedback_threshold, notifier.clone(), trigger.clone()),
            )?,
            other => bail!("no handler for planned job {other}"),
        }
    }
    Ok(())
}
