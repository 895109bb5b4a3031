use chrono::{DateTime, Duration, Local, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::cfg::Config;
use crate::error::ConfigError;

/// Longest accepted interval: one year.
pub const MAX_INTERVAL_MINUTES: u64 = 525_600;

/// When a job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// Fixed period after the previous invocation.
    Every {
        /// Period in minutes, at least 1.
        minutes: u64,
    },
    /// Once a day at a local wall-clock time.
    DailyAt {
        /// Time of day.
        at: NaiveTime,
    },
}

impl Trigger {
    /// Interval trigger; zero minutes and intervals over a year are rejected.
    pub fn every_minutes(minutes: u64) -> Result<Self, ConfigError> {
        let t = Trigger::Every { minutes };
        t.validate()?;
        Ok(t)
    }

    /// Daily trigger from a strict `HH:MM` string.
    pub fn daily_at(hhmm: &str) -> Result<Self, ConfigError> {
        let bad = || ConfigError::InvalidTime(hhmm.to_string());
        let (h, m) = hhmm.split_once(':').ok_or_else(bad)?;
        if h.is_empty() || h.len() > 2 || m.len() != 2 {
            return Err(bad());
        }
        if !h.bytes().chain(m.bytes()).all(|b| b.is_ascii_digit()) {
            return Err(bad());
        }
        let hour: u32 = h.parse().map_err(|_| bad())?;
        let minute: u32 = m.parse().map_err(|_| bad())?;
        let at = NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(bad)?;
        Ok(Trigger::DailyAt { at })
    }

    /// Reject triggers that can never fire sensibly.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match *self {
            Trigger::Every { minutes: 0 } => Err(ConfigError::ZeroInterval),
            Trigger::Every { minutes } if minutes > MAX_INTERVAL_MINUTES => Err(ConfigError::OutOfRange {
                field: "interval_minutes",
                value: minutes.to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// First run strictly after `now`. A daily time equal to or earlier than
    /// `now`'s time of day lands on the following day.
    pub fn next_after(&self, now: NaiveDateTime) -> NaiveDateTime {
        match *self {
            Trigger::Every { minutes } => i64::try_from(minutes)
                .ok()
                .and_then(Duration::try_minutes)
                .and_then(|d| now.checked_add_signed(d))
                .unwrap_or(NaiveDateTime::MAX),
            Trigger::DailyAt { at } => {
                let today = now.date().and_time(at);
                if today <= now {
                    today.checked_add_signed(Duration::days(1)).unwrap_or(NaiveDateTime::MAX)
                } else {
                    today
                }
            }
        }
    }
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trigger::Every { minutes } => write!(f, "every {minutes}m"),
            Trigger::DailyAt { at } => write!(f, "daily at {}", at.format("%H:%M")),
        }
    }
}

/// Periodic resource check.
pub const HEALTH_CHECK: &str = "health_check";
/// Daily database backup.
pub const DB_BACKUP: &str = "db_backup";
/// Periodic feedback evaluation.
pub const FEEDBACK_CHECK: &str = "feedback_check";

/// Standard jobs and their triggers, in registration order.
pub fn plan(cfg: &Config) -> Result<Vec<(&'static str, Trigger)>, ConfigError> {
    Ok(vec![
        (HEALTH_CHECK, Trigger::every_minutes(cfg.monitor_interval_minutes)?),
        (DB_BACKUP, Trigger::daily_at(&cfg.backup_time)?),
        (FEEDBACK_CHECK, Trigger::every_minutes(cfg.feedback_interval_minutes)?),
    ])
}

/// Outcome class of one handler invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Completed normally.
    Ok,
    /// Completed but something needs attention.
    Warning,
    /// Failed.
    Error,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            JobStatus::Ok => "ok",
            JobStatus::Warning => "warning",
            JobStatus::Error => "error",
        })
    }
}

/// Result reported by a job handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    /// Outcome class.
    pub status: JobStatus,
    /// Handler-specific fields.
    pub detail: Map<String, Value>,
    /// When the result was produced.
    pub timestamp: DateTime<Local>,
}

/// Detail key set by handlers that already notified about their own outcome.
pub const ALERTED: &str = "alerted";

impl JobResult {
    /// New result with an empty detail map.
    pub fn new(status: JobStatus) -> Self {
        Self { status, detail: Map::new(), timestamp: Local::now() }
    }

    /// Successful result.
    pub fn ok() -> Self {
        Self::new(JobStatus::Ok)
    }

    /// Failed result carrying `error` as detail.
    pub fn error(error: impl std::fmt::Display) -> Self {
        Self::new(JobStatus::Error).with("error", error.to_string())
    }

    /// Add one detail entry.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.detail.insert(key.to_string(), value.into());
        self
    }

    /// Mark the result as already announced on the notification sink.
    pub fn alerted(self) -> Self {
        self.with(ALERTED, true)
    }

    /// Whether the handler already sent its own notification.
    pub fn was_alerted(&self) -> bool {
        self.detail.get(ALERTED).and_then(Value::as_bool).unwrap_or(false)
    }

    /// One-line description for logs and alerts.
    pub fn summary(&self) -> String {
        if let Some(e) = self.detail.get("error").and_then(Value::as_str) {
            return e.to_string();
        }
        let fields: Vec<String> = self
            .detail
            .iter()
            .filter(|(k, _)| k.as_str() != ALERTED)
            .map(|(k, v)| match v {
                Value::String(s) => format!("{k}={s}"),
                other => format!("{k}={other}"),
            })
            .collect();
        fields.join(" ")
    }
}
