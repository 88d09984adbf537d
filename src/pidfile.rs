/// Persisted record of the launched bot process, plus the lock that
/// serializes mutating invocations.
///
/// The record's presence only asserts that a process was launched under
/// this identifier; liveness is always re-verified against the process
/// table. Writes use the atomic temp-file-then-rename pattern so a
/// concurrent `status` never reads a partial record.
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PidRecord {
    pub pid: u32,
    /// Process-table start time (unix seconds) captured right after launch.
    /// Liveness checks require the table to agree within a small tolerance,
    /// so a reused pid is not mistaken for the bot.
    pub started_at: u64,
    /// Script the process was launched from, kept for diagnostics.
    pub script: String,
}

/// Manages the pid record file lifecycle.
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Read the stored record. Absent, empty, or unparsable files all
    /// report "no record" — a corrupt record is no better than a stale one.
    pub fn load(&self) -> Option<PidRecord> {
        let contents = std::fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str(&contents) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "pid record is unreadable, treating as absent"
                );
                None
            }
        }
    }

    /// Atomically persist the record, creating the parent directory if needed.
    pub fn save(&self, record: &PidRecord) -> Result<(), RecordError> {
        let json = serde_json::to_string_pretty(record)
            .map_err(|e| RecordError::Serialize { source: e })?;

        let dir = self.path.parent().unwrap_or(Path::new("."));
        std::fs::create_dir_all(dir).map_err(|e| RecordError::Dir {
            path: dir.to_path_buf(),
            source: e,
        })?;

        let tmp_path = dir.join(format!(".pidrecord.tmp.{}", std::process::id()));
        std::fs::write(&tmp_path, json.as_bytes()).map_err(|e| RecordError::Write {
            path: tmp_path.clone(),
            source: e,
        })?;
        std::fs::rename(&tmp_path, &self.path).map_err(|e| RecordError::Rename {
            from: tmp_path,
            to: self.path.clone(),
            source: e,
        })?;

        Ok(())
    }

    /// Remove the record. Absence is not an error.
    pub fn clear(&self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Exclusive lock held for the duration of a mutating operation.
///
/// The bare record file is a weak mutual-exclusion signal: two `start`
/// invocations can both pass the liveness check before either writes it.
/// The lock closes that window. Released when the guard is dropped.
#[derive(Debug)]
pub struct OpLock {
    _file: std::fs::File,
}

impl OpLock {
    pub fn acquire(path: &Path) -> Result<OpLock, LockError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| LockError::Io {
                path: path.to_path_buf(),
                source: e,
            })?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|e| LockError::Io {
                path: path.to_path_buf(),
                source: e,
            })?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(OpLock { _file: file }),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(LockError::Busy {
                path: path.to_path_buf(),
            }),
            Err(e) => Err(LockError::Io {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }
}

/// Errors from pid record persistence.
#[derive(Debug)]
pub enum RecordError {
    Serialize {
        source: serde_json::Error,
    },
    Dir {
        path: PathBuf,
        source: std::io::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for RecordError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordError::Serialize { source } => {
                write!(f, "failed to serialize pid record: {source}")
            }
            RecordError::Dir { path, source } => {
                write!(f, "failed to create {}: {source}", path.display())
            }
            RecordError::Write { path, source } => {
                write!(f, "failed to write {}: {source}", path.display())
            }
            RecordError::Rename { from, to, source } => {
                write!(
                    f,
                    "failed to rename {} -> {}: {source}",
                    from.display(),
                    to.display()
                )
            }
        }
    }
}

impl std::error::Error for RecordError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RecordError::Serialize { source } => Some(source),
            RecordError::Dir { source, .. } => Some(source),
            RecordError::Write { source, .. } => Some(source),
            RecordError::Rename { source, .. } => Some(source),
        }
    }
}

/// Errors from the operation lock.
#[derive(Debug)]
pub enum LockError {
    /// Another supervisor invocation holds the lock right now.
    Busy {
        path: PathBuf,
    },
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockError::Busy { path } => {
                write!(
                    f,
                    "another supervisor operation is in progress (lock {})",
                    path.display()
                )
            }
            LockError::Io { path, source } => {
                write!(f, "failed to lock {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for LockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LockError::Busy { .. } => None,
            LockError::Io { source, .. } => Some(source),
        }
    }
}
