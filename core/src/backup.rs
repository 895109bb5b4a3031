use std::fs::{self, File};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Local};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::cfg::{BackupTarget, Config, DbKind};
use crate::error::{BackupError, ConfigError, ExecError};
use crate::notify::{send_logged, Notifier};
use crate::process::run_with_timeout;

const SECS_PER_DAY: u64 = 86_400;
const STDERR_LIMIT: usize = 500;

/// Filesystem and tool settings of the backup manager.
#[derive(Debug, Clone)]
pub struct BackupSettings {
    /// Where archives are written and swept.
    pub backup_dir: PathBuf,
    /// Whose `*.log*` files are bundled.
    pub log_dir: PathBuf,
    /// Dump executable for server engines.
    pub dump_program: String,
    /// Hard bound on the dump executable.
    pub dump_timeout: Duration,
}

impl BackupSettings {
    /// Settings taken from the application config.
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            backup_dir: cfg.backup_dir.clone(),
            log_dir: cfg.log_dir.clone(),
            dump_program: cfg.dump_program.clone(),
            dump_timeout: Duration::from_secs(cfg.dump_timeout_secs),
        }
    }
}

/// Outcome of the retention sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// False when `retention_days <= 0` disabled the sweep.
    pub enabled: bool,
    /// Files removed.
    pub deleted: usize,
    /// Bytes released by the removed files.
    pub freed_bytes: u64,
    /// Expired files that could not be removed.
    pub failed: usize,
}

/// Result of one `create_backup` run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRecord {
    /// Start of the run.
    pub timestamp: DateTime<Local>,
    /// Engine that was dumped.
    pub db_kind: DbKind,
    /// Final archive, present only on success.
    pub archive_path: Option<PathBuf>,
    /// Archive size.
    pub size_bytes: u64,
    /// Wall time of the whole run.
    pub duration_seconds: f64,
    /// Whether a verified archive was produced.
    pub success: bool,
    /// Failure detail.
    pub error: Option<String>,
    /// Log files bundled into the archive.
    pub log_files: usize,
    /// Retention sweep outcome (runs on success and failure).
    pub sweep: SweepReport,
    /// Whether the summary reached the sink; `None` when none was attempted.
    pub notified: Option<bool>,
}

impl BackupRecord {
    /// Human-readable summary used for the notification and the CLI.
    pub fn summary(&self) -> String {
        let mut lines = Vec::new();
        if self.success {
            lines.push("[backup] completed".to_string());
            if let Some(p) = &self.archive_path {
                lines.push(format!("- file: {}", p.display()));
            }
            lines.push(format!("- size: {}", human_bytes(self.size_bytes)));
            lines.push(format!("- logs: {}", self.log_files));
        } else {
            lines.push("[backup] FAILED".to_string());
            lines.push(format!("- error: {}", self.error.as_deref().unwrap_or("unknown")));
        }
        lines.push(format!("- db: {}", self.db_kind));
        lines.push(format!("- duration: {:.2}s", self.duration_seconds));
        if self.sweep.enabled {
            lines.push(format!(
                "- retention: removed {} old archive(s), freed {}",
                self.sweep.deleted,
                human_bytes(self.sweep.freed_bytes)
            ));
        } else {
            lines.push("- retention: sweep disabled".to_string());
        }
        lines.push(format!("- at: {}", self.timestamp.format("%Y-%m-%d %H:%M:%S")));
        lines.join("\n")
    }
}

impl BackupRecord {
    fn rejected(timestamp: DateTime<Local>, db_kind: DbKind) -> Self {
        Self {
            timestamp,
            db_kind,
            archive_path: None,
            size_bytes: 0,
            duration_seconds: 0.0,
            success: false,
            error: Some(BackupError::Busy.to_string()),
            log_files: 0,
            sweep: SweepReport::default(),
            notified: None,
        }
    }
}

/// Lock file marking a run in progress in a backup directory.
pub const LOCK_FILE: &str = ".backup.lock";
/// A lock older than this was left by a run that died; it is taken over.
const STALE_LOCK_AFTER: Duration = Duration::from_secs(SECS_PER_DAY);

/// Exclusive hold on a backup directory, released on drop.
struct DirLock {
    path: PathBuf,
}

impl DirLock {
    fn acquire(dir: &Path) -> Result<Self, BackupError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(LOCK_FILE);
        match Self::create(&path) {
            Err(BackupError::Busy) if Self::is_stale(&path) => {
                warn!(lock = %path.display(), "taking over stale backup lock");
                remove_if_exists(&path);
                Self::create(&path)
            }
            other => other,
        }
    }

    fn create(path: &Path) -> Result<Self, BackupError> {
        match fs::OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut f) => {
                writeln!(f, "{}", std::process::id())?;
                Ok(Self { path: path.to_path_buf() })
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(BackupError::Busy),
            Err(e) => Err(e.into()),
        }
    }

    fn is_stale(path: &Path) -> bool {
        fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.elapsed().ok())
            .is_some_and(|age| age > STALE_LOCK_AFTER)
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        remove_if_exists(&self.path);
    }
}

fn human_bytes(n: u64) -> String {
    if n < 1024 * 1024 {
        format!("{:.1} KB", n as f64 / 1024.0)
    } else {
        format!("{:.2} MB", n as f64 / (1024.0 * 1024.0))
    }
}

/// Produces verified, retention-bounded archives. At most one run is in flight.
pub struct BackupManager {
    settings: BackupSettings,
    target: BackupTarget,
    notifier: Arc<dyn Notifier>,
    running: Mutex<()>,
}

impl BackupManager {
    /// Manager for `target`.
    pub fn new(settings: BackupSettings, target: BackupTarget, notifier: Arc<dyn Notifier>) -> Self {
        Self { settings, target, notifier, running: Mutex::new(()) }
    }

    /// Manager built from the application config; fails on an unusable database URL.
    pub fn from_config(cfg: &Config, notifier: Arc<dyn Notifier>) -> Result<Self, ConfigError> {
        let target = BackupTarget::parse(&cfg.database_url)?;
        Ok(Self::new(BackupSettings::from_config(cfg), target, notifier))
    }

    /// Dump, verify, package and sweep. Never returns an error: failures are in
    /// the record. A run started while another is in flight is rejected.
    pub async fn create_backup(&self, retention_days: i64) -> BackupRecord {
        let started = Instant::now();
        let timestamp = Local::now();
        let db_kind = self.target.kind();

        let Ok(_guard) = self.running.try_lock() else {
            warn!("backup requested while another run is in progress; rejected");
            return BackupRecord::rejected(timestamp, db_kind);
        };
        // Other processes (the CLI next to the daemon) share the directory.
        let (_dir_lock, lock_err) = match DirLock::acquire(&self.settings.backup_dir) {
            Ok(lock) => (Some(lock), None),
            Err(BackupError::Busy) => {
                warn!(dir = %self.settings.backup_dir.display(), "backup directory is locked by another run; rejected");
                return BackupRecord::rejected(timestamp, db_kind);
            }
            Err(e) => (None, Some(e)),
        };

        let stamp = timestamp.format("%Y%m%d_%H%M%S").to_string();
        info!(db = %db_kind, %stamp, "backup started");
        let produced = match lock_err {
            Some(e) => Err(e),
            None => self.produce_archive(&stamp).await,
        };

        // Cleanup is independent of today's result.
        let dir = self.settings.backup_dir.clone();
        let sweep = tokio::task::spawn_blocking(move || sweep_expired(&dir, retention_days, SystemTime::now()))
            .await
            .unwrap_or_else(|e| {
                error!("retention sweep aborted: {}", e);
                SweepReport { enabled: retention_days > 0, ..SweepReport::default() }
            });

        let mut record = BackupRecord {
            timestamp,
            db_kind,
            archive_path: None,
            size_bytes: 0,
            duration_seconds: 0.0,
            success: false,
            error: None,
            log_files: 0,
            sweep,
            notified: None,
        };
        match produced {
            Ok(archive) => {
                record.success = true;
                record.size_bytes = archive.size_bytes;
                record.log_files = archive.log_files;
                record.archive_path = Some(archive.path);
            }
            Err(e) => {
                if e.is_external_tool() {
                    error!(kind = "external_tool", "backup failed: {}", e);
                } else {
                    error!("backup failed: {}", e);
                }
                record.error = Some(e.to_string());
            }
        }
        record.duration_seconds = started.elapsed().as_secs_f64();

        if record.success {
            info!(
                archive = %record.archive_path.as_deref().unwrap_or(Path::new("")).display(),
                size = record.size_bytes,
                logs = record.log_files,
                swept = record.sweep.deleted,
                "backup completed"
            );
        }
        let outcome = send_logged(self.notifier.as_ref(), &record.summary()).await;
        record.notified = Some(outcome.ok);
        record
    }

    async fn produce_archive(&self, stamp: &str) -> Result<Archive, BackupError> {
        let dir = self.settings.backup_dir.clone();
        tokio::fs::create_dir_all(&dir).await?;

        let dump = match &self.target {
            BackupTarget::Postgres { .. } => {
                let out = dir.join(format!("db_backup_{stamp}.dump"));
                if let Err(e) = self.dump_postgres(&out).await {
                    remove_if_exists(&out);
                    return Err(e);
                }
                out
            }
            BackupTarget::Sqlite { path } => {
                let src = path.clone();
                let out = dir.join(format!("sqlite_backup_{stamp}.db.gz"));
                let dest = out.clone();
                let copied = tokio::task::spawn_blocking(move || compress_file(&src, &dest))
                    .await
                    .map_err(|e| BackupError::Io(io::Error::new(ErrorKind::Other, e)))?;
                if let Err(e) = copied {
                    remove_if_exists(&out);
                    return Err(e);
                }
                out
            }
        };

        let archive_path = dir.join(format!("backup_{stamp}.zip"));
        let log_dir = self.settings.log_dir.clone();
        let raw = dump.clone();
        let packaged = tokio::task::spawn_blocking(move || -> Result<Archive, BackupError> {
            let dump_size = verify_artifact(&raw)?;
            debug!(dump = %raw.display(), bytes = dump_size, "dump verified");
            package(&raw, &log_dir, &archive_path)
        })
        .await
        .map_err(|e| BackupError::Io(io::Error::new(ErrorKind::Other, e)));

        // The raw dump is redundant once packaged, and never kept on failure.
        remove_if_exists(&dump);
        packaged?
    }

    async fn dump_postgres(&self, out: &Path) -> Result<(), BackupError> {
        let BackupTarget::Postgres { host, port, user, password, database } = &self.target else {
            return Ok(());
        };
        let mut cmd = Command::new(&self.settings.dump_program);
        cmd.arg("-h").arg(host)
            .arg("-p").arg(port.to_string())
            .arg("-U").arg(user)
            .arg("-d").arg(database)
            .arg("-F").arg("c")
            .arg("-f").arg(out);
        if let Some(pw) = password {
            cmd.env("PGPASSWORD", pw);
        }
        info!(%host, %database, program = %self.settings.dump_program, "running database dump");

        let output = run_with_timeout(&mut cmd, self.settings.dump_timeout)
            .await
            .map_err(|e| match e {
                ExecError::NotFound(p) => BackupError::ToolNotFound(p),
                ExecError::Timeout { secs, .. } => BackupError::DumpTimeout(secs),
                ExecError::Io { source, .. } => BackupError::Io(source),
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr: String = stderr.trim().chars().take(STDERR_LIMIT).collect();
            return Err(BackupError::Dump { code: output.status.code(), stderr });
        }
        Ok(())
    }
}

struct Archive {
    path: PathBuf,
    size_bytes: u64,
    log_files: usize,
}

/// Size of `path`; missing or zero-byte artifacts are errors.
fn verify_artifact(path: &Path) -> Result<u64, BackupError> {
    match fs::metadata(path) {
        Ok(m) if m.is_file() && m.len() > 0 => Ok(m.len()),
        Ok(_) => Err(BackupError::EmptyArtifact(path.to_path_buf())),
        Err(e) if e.kind() == ErrorKind::NotFound => Err(BackupError::EmptyArtifact(path.to_path_buf())),
        Err(e) => Err(e.into()),
    }
}

fn compress_file(src: &Path, dest: &Path) -> Result<(), BackupError> {
    let mut input = match File::open(src) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(BackupError::SourceNotFound(src.to_path_buf()))
        }
        Err(e) => return Err(e.into()),
    };
    let mut enc = GzEncoder::new(File::create(dest)?, Compression::default());
    io::copy(&mut input, &mut enc)?;
    enc.finish()?.sync_all()?;
    Ok(())
}

/// Log files are those whose name contains `.log` (`app.log`, `app.log.1`, `app.log.2024-01-01`).
fn is_log_file(name: &str) -> bool {
    name.contains(".log")
}

fn log_files(log_dir: &Path) -> Vec<PathBuf> {
    let entries = match fs::read_dir(log_dir) {
        Ok(e) => e,
        Err(e) => {
            warn!("log directory {} not readable: {}", log_dir.display(), e);
            return Vec::new();
        }
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter(|e| is_log_file(&e.file_name().to_string_lossy()))
        .map(|e| e.path())
        .collect();
    files.sort();
    files
}

/// Write `dump` plus the log files into `archive` via a temp file, verify it,
/// then move it into place.
fn package(dump: &Path, log_dir: &Path, archive: &Path) -> Result<Archive, BackupError> {
    let tmp = archive.with_extension("zip.partial");
    let result = write_zip(dump, log_dir, &tmp).and_then(|logs| {
        let size = verify_artifact(&tmp)?;
        fs::rename(&tmp, archive)?;
        Ok(Archive { path: archive.to_path_buf(), size_bytes: size, log_files: logs })
    });
    if result.is_err() {
        remove_if_exists(&tmp);
    }
    result
}

fn write_zip(dump: &Path, log_dir: &Path, dest: &Path) -> Result<usize, BackupError> {
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut zip = ZipWriter::new(File::create(dest)?);

    let dump_name = dump
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "dump".to_string());
    zip.start_file(dump_name, options)?;
    io::copy(&mut File::open(dump)?, &mut zip)?;

    let mut count = 0;
    for path in log_files(log_dir) {
        let mut f = match File::open(&path) {
            Ok(f) => f,
            Err(e) => {
                warn!("skipping log {}: {}", path.display(), e);
                continue;
            }
        };
        let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        zip.start_file(format!("logs/{name}"), options)?;
        io::copy(&mut f, &mut zip)?;
        count += 1;
    }

    zip.finish()?.sync_all()?;
    debug!(logs = count, "archive written");
    Ok(count)
}

/// Names the sweep is allowed to delete.
fn is_backup_artifact(name: &str) -> bool {
    name.starts_with("backup_") || name.starts_with("db_backup_") || name.starts_with("sqlite_backup_")
}

/// Delete backup artifacts in `dir` whose mtime is older than `now - retention_days`.
/// `retention_days <= 0` disables the sweep.
pub fn sweep_expired(dir: &Path, retention_days: i64, now: SystemTime) -> SweepReport {
    if retention_days <= 0 {
        info!(retention_days, "retention sweep disabled");
        return SweepReport::default();
    }
    let mut report = SweepReport { enabled: true, ..SweepReport::default() };
    let window = Duration::from_secs((retention_days as u64).saturating_mul(SECS_PER_DAY));
    let Some(cutoff) = now.checked_sub(window) else {
        return report;
    };

    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == ErrorKind::NotFound => return report,
        Err(e) => {
            warn!("cannot list {} for retention sweep: {}", dir.display(), e);
            return report;
        }
    };

    for entry in entries.filter_map(|e| e.ok()) {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !is_backup_artifact(&name) {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        if !meta.is_file() {
            continue;
        }
        let Ok(mtime) = meta.modified() else { continue };
        if mtime >= cutoff {
            continue;
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => {
                report.deleted += 1;
                report.freed_bytes += meta.len();
                debug!(file = %name, "expired backup removed");
            }
            Err(e) => {
                report.failed += 1;
                warn!("could not remove expired backup {}: {}", name, e);
            }
        }
    }

    info!(
        retention_days,
        deleted = report.deleted,
        freed_bytes = report.freed_bytes,
        "retention sweep finished"
    );
    report
}

fn remove_if_exists(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != ErrorKind::NotFound {
            warn!("could not remove {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::SendOutcome;
    use async_trait::async_trait;
    use std::io::Read;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recorder {
        sent: StdMutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl Notifier for Recorder {
        async fn send(&self, message: &str) -> SendOutcome {
            self.sent.lock().unwrap().push(message.to_string());
            if self.fail { SendOutcome::failed("request_failed: offline") } else { SendOutcome::delivered() }
        }
    }

    struct Fixture {
        root: tempfile::TempDir,
        rec: Arc<Recorder>,
    }

    impl Fixture {
        fn new() -> Self {
            let root = tempfile::tempdir().unwrap();
            fs::create_dir_all(root.path().join("logs")).unwrap();
            Self { root, rec: Arc::new(Recorder::default()) }
        }

        fn backups(&self) -> PathBuf {
            self.root.path().join("backups")
        }

        fn settings(&self, program: &str) -> BackupSettings {
            BackupSettings {
                backup_dir: self.backups(),
                log_dir: self.root.path().join("logs"),
                dump_program: program.to_string(),
                dump_timeout: Duration::from_secs(5),
            }
        }

        fn sqlite(&self, db: &Path) -> BackupManager {
            BackupManager::new(
                self.settings("unused"),
                BackupTarget::Sqlite { path: db.to_path_buf() },
                self.rec.clone(),
            )
        }

        fn postgres(&self, settings: BackupSettings) -> BackupManager {
            let target = BackupTarget::Postgres {
                host: "localhost".into(),
                port: 5432,
                user: "app".into(),
                password: Some("pw123".into()),
                database: "prod".into(),
            };
            BackupManager::new(settings, target, self.rec.clone())
        }

        fn zips(&self) -> Vec<String> {
            self.names().into_iter().filter(|n| n.ends_with(".zip")).collect()
        }

        fn names(&self) -> Vec<String> {
            match fs::read_dir(self.backups()) {
                Ok(rd) => rd.map(|e| e.unwrap().file_name().to_string_lossy().into_owned()).collect(),
                Err(_) => Vec::new(),
            }
        }
    }

    fn age(path: &Path, days: u64) {
        let when = SystemTime::now() - Duration::from_secs(days * SECS_PER_DAY);
        File::options().write(true).open(path).unwrap().set_modified(when).unwrap();
    }

    fn zip_entries(path: &Path) -> Vec<String> {
        let mut z = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
        let mut names: Vec<String> = (0..z.len()).map(|i| z.by_index(i).unwrap().name().to_string()).collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn sqlite_backup_bundles_dump_and_logs() {
        let fx = Fixture::new();
        let db = fx.root.path().join("app.db");
        fs::write(&db, b"SQLite format 3\0 some pages").unwrap();
        fs::write(fx.root.path().join("logs/opsd.log"), "line\n").unwrap();
        fs::write(fx.root.path().join("logs/opsd.log.2024-03-09"), "older\n").unwrap();
        fs::write(fx.root.path().join("logs/notes.txt"), "ignored").unwrap();

        let rec = fx.sqlite(&db).create_backup(7).await;

        assert!(rec.success, "{:?}", rec.error);
        assert_eq!(rec.db_kind, DbKind::Sqlite);
        assert_eq!(rec.log_files, 2);
        assert!(rec.size_bytes > 0);
        let archive = rec.archive_path.clone().unwrap();
        assert!(archive.file_name().unwrap().to_string_lossy().starts_with("backup_"));
        let entries = zip_entries(&archive);
        assert_eq!(entries.len(), 3);
        assert!(entries[0].starts_with("logs/opsd.log"));
        assert!(entries.iter().any(|e| e.starts_with("sqlite_backup_") && e.ends_with(".db.gz")));
        // only the archive remains
        assert_eq!(fx.names().len(), 1);
        assert_eq!(rec.notified, Some(true));
        let sent = fx.rec.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].starts_with("[backup] completed"));
    }

    #[tokio::test]
    async fn missing_sqlite_file_fails_without_archive() {
        let fx = Fixture::new();
        let rec = fx.sqlite(&fx.root.path().join("nope.db")).create_backup(7).await;
        assert!(!rec.success);
        assert!(rec.error.unwrap().contains("source database not found"));
        assert!(fx.zips().is_empty());
        assert!(fx.rec.sent.lock().unwrap()[0].starts_with("[backup] FAILED"));
    }

    #[tokio::test]
    async fn stale_directory_lock_is_taken_over() {
        let fx = Fixture::new();
        let db = fx.root.path().join("app.db");
        fs::write(&db, b"data").unwrap();
        fs::create_dir_all(fx.backups()).unwrap();
        let lock = fx.backups().join(LOCK_FILE);

        fs::write(&lock, b"4242\n").unwrap();
        let busy = fx.sqlite(&db).create_backup(7).await;
        assert!(!busy.success);
        assert!(lock.exists());

        age(&lock, 2);
        let rec = fx.sqlite(&db).create_backup(7).await;
        assert!(rec.success, "{:?}", rec.error);
        assert!(!lock.exists());
    }

    #[tokio::test]
    async fn sink_failure_keeps_backup_successful() {
        let mut fx = Fixture::new();
        fx.rec = Arc::new(Recorder { fail: true, ..Recorder::default() });
        let db = fx.root.path().join("app.db");
        fs::write(&db, b"data").unwrap();
        let rec = fx.sqlite(&db).create_backup(7).await;
        assert!(rec.success);
        assert_eq!(rec.notified, Some(false));
    }

    #[test]
    fn sweep_removes_only_expired_artifacts_once() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("backup_20240101_000000.zip");
        let edge = dir.path().join("backup_20240105_000000.zip");
        let fresh = dir.path().join("backup_20240110_000000.zip");
        let foreign = dir.path().join("keep-me.txt");
        for p in [&old, &edge, &fresh, &foreign] {
            fs::write(p, b"0123456789").unwrap();
        }
        age(&old, 10);
        age(&edge, 6);
        age(&foreign, 30);

        let first = sweep_expired(dir.path(), 7, SystemTime::now());
        assert_eq!(first, SweepReport { enabled: true, deleted: 1, freed_bytes: 10, failed: 0 });
        assert!(!old.exists());
        assert!(edge.exists() && fresh.exists() && foreign.exists());

        let second = sweep_expired(dir.path(), 7, SystemTime::now());
        assert_eq!(second.deleted, 0);
    }

    #[test]
    fn non_positive_retention_disables_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("backup_20200101_000000.zip");
        fs::write(&old, b"x").unwrap();
        age(&old, 400);
        for days in [0, -3] {
            let r = sweep_expired(dir.path(), days, SystemTime::now());
            assert!(!r.enabled);
            assert_eq!(r.deleted, 0);
        }
        assert!(old.exists());
    }

    #[test]
    fn sweep_of_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let r = sweep_expired(&dir.path().join("absent"), 7, SystemTime::now());
        assert_eq!(r.deleted, 0);
        assert!(r.enabled);
    }

    #[test]
    fn log_pattern_matches_rotations() {
        assert!(is_log_file("scheduler.log"));
        assert!(is_log_file("system_monitor.log.3"));
        assert!(is_log_file("opsd.log.2024-03-10"));
        assert!(!is_log_file("report.csv"));
    }

    #[cfg(unix)]
    mod dump {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        fn script(dir: &Path, name: &str, body: &str) -> String {
            let path = dir.join(name);
            fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
            path.to_string_lossy().into_owned()
        }

        const WRITE_PASSWORD: &str =
            r#"while [ $# -gt 0 ]; do if [ "$1" = "-f" ]; then printf '%s' "$PGPASSWORD" > "$2"; fi; shift; done"#;

        #[tokio::test]
        async fn postgres_dump_is_packaged_and_removed() {
            let fx = Fixture::new();
            fs::write(fx.root.path().join("logs/api.log"), "req\n").unwrap();
            let prog = script(fx.root.path(), "fake_dump.sh", WRITE_PASSWORD);

            let rec = fx.postgres(fx.settings(&prog)).create_backup(7).await;

            assert!(rec.success, "{:?}", rec.error);
            assert_eq!(rec.db_kind, DbKind::Postgres);
            let archive = rec.archive_path.unwrap();
            let mut z = zip::ZipArchive::new(File::open(&archive).unwrap()).unwrap();
            let dump_name = (0..z.len())
                .map(|i| z.by_index(i).unwrap().name().to_string())
                .find(|n| n.starts_with("db_backup_") && n.ends_with(".dump"))
                .unwrap();
            let mut body = String::new();
            z.by_name(&dump_name).unwrap().read_to_string(&mut body).unwrap();
            assert_eq!(body, "pw123");
            assert!(z.by_name("logs/api.log").is_ok());
            assert!(!fx.names().iter().any(|n| n.ends_with(".dump")));
        }

        #[tokio::test]
        async fn failed_dump_still_sweeps() {
            let fx = Fixture::new();
            fs::create_dir_all(fx.backups()).unwrap();
            let old = fx.backups().join("backup_20240101_000000.zip");
            let recent = fx.backups().join("backup_20240108_000000.zip");
            fs::write(&old, b"old archive").unwrap();
            fs::write(&recent, b"recent archive").unwrap();
            age(&old, 10);
            age(&recent, 1);
            let prog = script(fx.root.path(), "failing_dump.sh", "echo 'connection refused' >&2; exit 1");

            let rec = fx.postgres(fx.settings(&prog)).create_backup(7).await;

            assert!(!rec.success);
            assert!(rec.error.as_deref().unwrap().contains("connection refused"));
            assert!(rec.archive_path.is_none());
            assert_eq!(rec.sweep.deleted, 1);
            assert_eq!(fx.zips(), vec!["backup_20240108_000000.zip".to_string()]);
            let sent = fx.rec.sent.lock().unwrap();
            assert!(sent[0].contains("removed 1 old archive"));
        }

        #[tokio::test]
        async fn zero_byte_dump_is_rejected() {
            let fx = Fixture::new();
            let prog = script(
                fx.root.path(),
                "empty_dump.sh",
                r#"while [ $# -gt 0 ]; do if [ "$1" = "-f" ]; then : > "$2"; fi; shift; done"#,
            );
            let rec = fx.postgres(fx.settings(&prog)).create_backup(7).await;
            assert!(!rec.success);
            assert!(rec.error.unwrap().contains("missing or empty"));
            assert!(fx.names().is_empty());
        }

        #[tokio::test]
        async fn slow_dump_times_out() {
            let fx = Fixture::new();
            let prog = script(fx.root.path(), "slow_dump.sh", "sleep 5");
            let mut settings = fx.settings(&prog);
            settings.dump_timeout = Duration::from_millis(300);
            let rec = fx.postgres(settings).create_backup(7).await;
            assert!(!rec.success);
            assert!(rec.error.unwrap().contains("timed out"));
            assert!(fx.zips().is_empty());
        }

        #[tokio::test]
        async fn missing_dump_tool_is_reported() {
            let fx = Fixture::new();
            let rec = fx.postgres(fx.settings("no-such-pg_dump-binary")).create_backup(7).await;
            assert!(!rec.success);
            assert!(rec.error.unwrap().contains("dump utility not found"));
        }

        #[tokio::test]
        async fn concurrent_backup_is_rejected() {
            let fx = Fixture::new();
            let prog = script(fx.root.path(), "slow_ok.sh", &format!("sleep 1\n{WRITE_PASSWORD}"));
            let mgr = fx.postgres(fx.settings(&prog));

            let (a, b) = tokio::join!(mgr.create_backup(7), async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                mgr.create_backup(7).await
            });

            assert!(a.success, "{:?}", a.error);
            assert!(!b.success);
            assert_eq!(b.error.as_deref(), Some("a backup is already in progress"));
            assert_eq!(fx.zips().len(), 1);
        }

        #[tokio::test]
        async fn second_manager_on_same_directory_is_rejected() {
            let fx = Fixture::new();
            let prog = script(fx.root.path(), "slow_ok.sh", &format!("sleep 1\n{WRITE_PASSWORD}"));
            let daemon = fx.postgres(fx.settings(&prog));
            let cli = fx.postgres(fx.settings(&prog));

            let (a, b) = tokio::join!(daemon.create_backup(7), async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                cli.create_backup(7).await
            });

            assert!(a.success, "{:?}", a.error);
            assert!(!b.success);
            assert_eq!(b.error.as_deref(), Some("a backup is already in progress"));
            assert_eq!(b.notified, None);
            assert_eq!(fx.zips(), vec![a.archive_path.unwrap().file_name().unwrap().to_string_lossy().into_owned()]);
            assert!(!fx.backups().join(LOCK_FILE).exists());

            let again = cli.create_backup(7).await;
            assert!(again.success, "{:?}", again.error);
        }
    }
}
