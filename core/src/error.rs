use std::path::PathBuf;

use thiserror::Error;

/// Invalid or missing configuration. Fatal at startup.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A daily trigger time that is not `HH:MM`.
    #[error("invalid time of day {0:?} (expected HH:MM)")]
    InvalidTime(String),
    /// An interval trigger of zero minutes.
    #[error("interval must be at least one minute")]
    ZeroInterval,
    /// A value outside its permitted range.
    #[error("{field} out of range: {value}")]
    OutOfRange {
        /// Config key.
        field: &'static str,
        /// Offending value, rendered.
        value: String,
    },
    /// The database URL could not be turned into a backup target.
    #[error("invalid database url: {0}")]
    DatabaseUrl(String),
    /// A required connection parameter is absent.
    #[error("database url is missing {0}")]
    MissingConnectionInfo(&'static str),
}

/// Errors raised while registering jobs.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A job with this name is already registered.
    #[error("job {0:?} is already registered")]
    DuplicateJob(String),
    /// The trigger is malformed.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Failure of a spawned external program.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The executable could not be found.
    #[error("{0}: command not found")]
    NotFound(String),
    /// The program ran longer than allowed and was killed.
    #[error("{program} timed out after {secs}s")]
    Timeout {
        /// Program name.
        program: String,
        /// Bound that was exceeded.
        secs: u64,
    },
    /// Spawning or waiting failed.
    #[error("{program}: {source}")]
    Io {
        /// Program name.
        program: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Reasons a backup run fails.
#[derive(Debug, Error)]
pub enum BackupError {
    /// The backup target could not be resolved.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The embedded database file does not exist.
    #[error("source database not found: {}", .0.display())]
    SourceNotFound(PathBuf),
    /// The dump utility is not installed.
    #[error("dump utility not found: {0}")]
    ToolNotFound(String),
    /// The dump utility exited unsuccessfully.
    #[error("dump failed (exit {code:?}): {stderr}")]
    Dump {
        /// Exit code, `None` when killed by a signal.
        code: Option<i32>,
        /// Captured standard error, trimmed.
        stderr: String,
    },
    /// The dump utility exceeded its time bound.
    #[error("dump timed out after {0}s")]
    DumpTimeout(u64),
    /// The produced artifact is missing or zero bytes.
    #[error("backup artifact is missing or empty: {}", .0.display())]
    EmptyArtifact(PathBuf),
    /// Another backup is already running.
    #[error("a backup is already in progress")]
    Busy,
    /// Filesystem failure while writing or verifying.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Archive packaging failure.
    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
}

impl BackupError {
    /// True for failures of the external dump tool (exit code, missing tool, timeout).
    pub fn is_external_tool(&self) -> bool {
        matches!(self, Self::ToolNotFound(_) | Self::Dump { .. } | Self::DumpTimeout(_))
    }
}

/// Resource sampling failed.
#[derive(Debug, Error)]
pub enum MeasurementError {
    /// The disk path could not be inspected.
    #[error("cannot inspect {}: {source}", path.display())]
    Path {
        /// Path that was sampled.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// No mounted filesystem contains the path.
    #[error("no filesystem found for {}", .0.display())]
    NoDisk(PathBuf),
    /// The sampler itself failed.
    #[error("sampler failed: {0}")]
    Sampler(String),
}

/// Feedback counter storage failure.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Reading or writing a counter file failed.
    #[error("counter store io: {0}")]
    Io(#[from] std::io::Error),
    /// A counter file holds bytes that are not a counter.
    #[error("corrupt counter {key}: {source}")]
    Corrupt {
        /// Counter name.
        key: String,
        /// Decode error.
        #[source]
        source: bincode::Error,
    },
}
