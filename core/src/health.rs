use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use sysinfo::{Disks, System};
use tracing::{error, info, warn};

use crate::error::MeasurementError;
use crate::job::JobStatus;
use crate::notify::{send_logged, Notifier};

/// Alert thresholds, percent. A metric strictly above its threshold breaches.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// CPU utilisation.
    pub cpu: f64,
    /// Memory utilisation.
    pub mem: f64,
    /// Disk utilisation of the sampled filesystem.
    pub disk: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self { cpu: 85.0, mem: 90.0, disk: 90.0 }
    }
}

/// One raw measurement, percent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Usage {
    /// CPU utilisation over the sampling window.
    pub cpu: f64,
    /// Memory in use.
    pub mem: f64,
    /// Disk space in use.
    pub disk: f64,
}

/// Source of resource measurements. Implementations may block.
pub trait ResourceSampler: Send + Sync + 'static {
    /// Take one measurement.
    fn sample(&self) -> Result<Usage, MeasurementError>;
}

/// Samples the local host with `sysinfo`.
pub struct SysinfoSampler {
    disk_path: PathBuf,
    cpu_window: Duration,
}

impl SysinfoSampler {
    /// Sample the filesystem holding `disk_path`, CPU over one second.
    pub fn new(disk_path: impl Into<PathBuf>) -> Self {
        Self { disk_path: disk_path.into(), cpu_window: Duration::from_secs(1) }
    }

    /// Override the CPU sampling window (clamped to sysinfo's minimum).
    pub fn with_cpu_window(mut self, window: Duration) -> Self {
        self.cpu_window = window;
        self
    }
}

impl ResourceSampler for SysinfoSampler {
    fn sample(&self) -> Result<Usage, MeasurementError> {
        let path = std::fs::canonicalize(&self.disk_path)
            .map_err(|source| MeasurementError::Path { path: self.disk_path.clone(), source })?;

        let mut sys = System::new();
        sys.refresh_cpu_usage();
        std::thread::sleep(self.cpu_window.max(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL));
        sys.refresh_cpu_usage();
        let cpu = sys.global_cpu_usage() as f64;

        sys.refresh_memory();
        let total = sys.total_memory();
        if total == 0 {
            return Err(MeasurementError::Sampler("total memory reported as zero".into()));
        }
        let mem = percent_used(total, sys.available_memory());

        let disks = Disks::new_with_refreshed_list();
        let disk = disks
            .list()
            .iter()
            .filter(|d| path.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .ok_or_else(|| MeasurementError::NoDisk(path.clone()))?;
        if disk.total_space() == 0 {
            return Err(MeasurementError::NoDisk(path));
        }
        let disk = percent_used(disk.total_space(), disk.available_space());

        Ok(Usage { cpu, mem, disk })
    }
}

fn percent_used(total: u64, available: u64) -> f64 {
    let used = total.saturating_sub(available);
    used as f64 * 100.0 / total as f64
}

/// Result of one health check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSample {
    /// `ok`, `warning` when any threshold is breached, `error` when sampling failed.
    pub status: JobStatus,
    /// CPU utilisation, percent (0 on error).
    pub cpu_pct: f64,
    /// Memory utilisation, percent (0 on error).
    pub mem_pct: f64,
    /// Disk utilisation, percent (0 on error).
    pub disk_pct: f64,
    /// One line per breached metric.
    pub alerts: Vec<String>,
    /// Sampling failure detail.
    pub error: Option<String>,
    /// Whether the alert reached the sink; `None` when no alert was attempted.
    pub alert_delivered: Option<bool>,
    /// Measurement time.
    pub timestamp: DateTime<Local>,
}

impl HealthSample {
    fn failed(error: String) -> Self {
        Self {
            status: JobStatus::Error,
            cpu_pct: 0.0,
            mem_pct: 0.0,
            disk_pct: 0.0,
            alerts: Vec::new(),
            error: Some(error),
            alert_delivered: None,
            timestamp: Local::now(),
        }
    }
}

/// Compare a measurement against thresholds.
pub fn assess(usage: Usage, thresholds: &Thresholds) -> HealthSample {
    let mut alerts = Vec::new();
    for (label, value, limit) in [
        ("CPU", usage.cpu, thresholds.cpu),
        ("Memory", usage.mem, thresholds.mem),
        ("Disk", usage.disk, thresholds.disk),
    ] {
        if value > limit {
            alerts.push(format!("{label}: {value:.1}% (threshold: {limit}%)"));
        }
    }
    HealthSample {
        status: if alerts.is_empty() { JobStatus::Ok } else { JobStatus::Warning },
        cpu_pct: usage.cpu,
        mem_pct: usage.mem,
        disk_pct: usage.disk,
        alerts,
        error: None,
        alert_delivered: None,
        timestamp: Local::now(),
    }
}

/// Samples resources and alerts on breaches.
pub struct HealthMonitor {
    sampler: Arc<dyn ResourceSampler>,
    notifier: Arc<dyn Notifier>,
    alerts_enabled: bool,
}

impl HealthMonitor {
    /// Monitor using `sampler`, alerting through `notifier`.
    pub fn new(sampler: Arc<dyn ResourceSampler>, notifier: Arc<dyn Notifier>) -> Self {
        Self { sampler, notifier, alerts_enabled: true }
    }

    /// Monitor of the local host, averaging CPU over `cpu_window`.
    pub fn local(disk_path: &Path, cpu_window: Duration, notifier: Arc<dyn Notifier>) -> Self {
        Self::new(Arc::new(SysinfoSampler::new(disk_path).with_cpu_window(cpu_window)), notifier)
    }

    /// Turn the warning notification off (samples are still assessed).
    pub fn without_alerts(mut self) -> Self {
        self.alerts_enabled = false;
        self
    }

    /// Take one sample. Never fails: sampling problems yield `status = error`.
    pub async fn check(&self, thresholds: &Thresholds) -> HealthSample {
        let sampler = Arc::clone(&self.sampler);
        let usage = match tokio::task::spawn_blocking(move || sampler.sample()).await {
            Ok(Ok(u)) => u,
            Ok(Err(e)) => {
                error!("health sampling failed: {}", e);
                return HealthSample::failed(e.to_string());
            }
            Err(e) => {
                error!("health sampler panicked: {}", e);
                return HealthSample::failed(format!("sampler aborted: {e}"));
            }
        };

        let mut sample = assess(usage, thresholds);
        info!(
            cpu = sample.cpu_pct,
            mem = sample.mem_pct,
            disk = sample.disk_pct,
            status = %sample.status,
            "health sample"
        );

        if sample.status == JobStatus::Warning {
            let lines: Vec<String> = sample.alerts.iter().map(|a| format!("  - {a}")).collect();
            warn!("resource threshold exceeded: {}", sample.alerts.join("; "));
            if self.alerts_enabled {
                let msg = format!(
                    "[health] resource threshold exceeded\n{}\n- at: {}",
                    lines.join("\n"),
                    sample.timestamp.format("%Y-%m-%d %H:%M:%S")
                );
                let outcome = send_logged(self.notifier.as_ref(), &msg).await;
                sample.alert_delivered = Some(outcome.ok);
            }
        }
        sample
    }
}
