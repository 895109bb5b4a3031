use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::feedback::FeedbackCounts;

/// Kind of feedback signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackKind {
    /// Thumbs up.
    Like,
    /// Thumbs down.
    Dislike,
}

impl FeedbackKind {
    fn key(self) -> &'static str {
        match self {
            FeedbackKind::Like => "likes",
            FeedbackKind::Dislike => "dislikes",
        }
    }
}

/// Query side of the feedback counters.
pub trait FeedbackSource: Send + Sync {
    /// Current totals.
    fn counts(&self) -> Result<FeedbackCounts, StoreError>;
}

/// Counters kept as one bincode-encoded `u64` file per kind under `root`.
pub struct FsCounterStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

/// Open a counter store rooted at `dir` (created if missing).
pub fn open_counters<P: AsRef<Path>>(dir: P) -> Result<FsCounterStore, StoreError> {
    let root = dir.as_ref().to_path_buf();
    fs::create_dir_all(&root)?;
    Ok(FsCounterStore { root, write_lock: Mutex::new(()) })
}

impl FsCounterStore {
    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.bin"))
    }

    fn read(&self, key: &str) -> Result<u64, StoreError> {
        match fs::read(self.path_for(key)) {
            Ok(bytes) => bincode::deserialize(&bytes)
                .map_err(|source| StoreError::Corrupt { key: key.to_string(), source }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, key: &str, value: u64) -> Result<(), StoreError> {
        let path = self.path_for(key);
        let buf = bincode::serialize(&value)
            .map_err(|source| StoreError::Corrupt { key: key.to_string(), source })?;
        // Write temp then rename so readers never see a torn counter.
        let tmp = path.with_extension("tmp");
        let mut f = fs::File::create(&tmp)?;
        f.write_all(&buf)?;
        f.sync_all()?;
        fs::rename(tmp, path)?;
        Ok(())
    }

    /// Add one signal; returns the new count for that kind.
    pub fn record(&self, kind: FeedbackKind) -> Result<u64, StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        let next = self.read(kind.key())?.saturating_add(1);
        self.write(kind.key(), next)?;
        Ok(next)
    }

    /// Overwrite both counters (imports from the serving database).
    pub fn set(&self, counts: FeedbackCounts) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        self.write(FeedbackKind::Like.key(), counts.likes)?;
        self.write(FeedbackKind::Dislike.key(), counts.dislikes)
    }
}

impl FeedbackSource for FsCounterStore {
    fn counts(&self) -> Result<FeedbackCounts, StoreError> {
        Ok(FeedbackCounts {
            likes: self.read(FeedbackKind::Like.key())?,
            dislikes: self.read(FeedbackKind::Dislike.key())?,
        })
    }
}
