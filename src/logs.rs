/// Append-only log file shared by the supervisor and the bot process.
///
/// The bot's stdout and stderr land here, interleaved with timestamped
/// supervisor status lines. The file is never truncated by the supervisor.
use chrono::Local;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

const FOLLOW_POLL_INTERVAL: Duration = Duration::from_millis(250);

pub struct LogSink {
    path: PathBuf,
}

impl LogSink {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the log directory and file if absent. Idempotent; a side
    /// effect of launch, tail, and follow alike.
    pub fn ensure(&self) -> Result<(), LogError> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| LogError::Dir {
                path: dir.to_path_buf(),
                source: e,
            })?;
        }
        self.append_handle().map(|_| ())
    }

    /// An append-mode handle, suitable for redirecting child output.
    pub fn append_handle(&self) -> Result<File, LogError> {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| LogError::Open {
                path: self.path.clone(),
                source: e,
            })
    }

    /// Append a timestamped supervisor status line.
    pub fn note(&self, msg: &str) -> Result<(), LogError> {
        self.ensure()?;
        let mut file = self.append_handle()?;
        let line = format!(
            "[{}] supervisor: {msg}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S")
        );
        file.write_all(line.as_bytes()).map_err(|e| LogError::Write {
            path: self.path.clone(),
            source: e,
        })
    }

    /// Last `min(n, total)` lines, in original order.
    pub fn tail(&self, n: usize) -> Result<Vec<String>, LogError> {
        self.ensure()?;
        let contents = std::fs::read(&self.path).map_err(|e| LogError::Read {
            path: self.path.clone(),
            source: e,
        })?;
        let contents = String::from_utf8_lossy(&contents);
        let lines: Vec<&str> = contents.lines().collect();
        let skip = lines.len().saturating_sub(n);
        Ok(lines[skip..].iter().map(|s| s.to_string()).collect())
    }

    /// Read lines appended since `pos`, advancing it past complete lines
    /// only. A trailing partial line stays unconsumed until its newline
    /// arrives. If the file shrank underneath us (re-created externally),
    /// reading restarts from the top.
    pub fn read_new_lines(&self, pos: &mut u64) -> Result<Vec<String>, LogError> {
        let io_err = |e| LogError::Read {
            path: self.path.clone(),
            source: e,
        };

        let mut file = File::open(&self.path).map_err(io_err)?;
        let len = file.metadata().map_err(io_err)?.len();
        if len < *pos {
            *pos = 0;
        }
        if len == *pos {
            return Ok(Vec::new());
        }

        file.seek(SeekFrom::Start(*pos)).map_err(io_err)?;
        let mut chunk = Vec::with_capacity((len - *pos) as usize);
        file.take(len - *pos)
            .read_to_end(&mut chunk)
            .map_err(io_err)?;

        let Some(last_newline) = chunk.iter().rposition(|&b| b == b'\n') else {
            return Ok(Vec::new());
        };
        let consumed = last_newline + 1;
        *pos += consumed as u64;

        let text = String::from_utf8_lossy(&chunk[..consumed]);
        Ok(text.lines().map(|s| s.to_string()).collect())
    }

    /// Stream newly appended lines to stdout until Ctrl-C.
    ///
    /// Starts at the current end of file; only lines written after the
    /// call show up. Infinite and non-restartable.
    pub async fn follow(&self) -> Result<(), LogError> {
        self.ensure()?;
        let mut pos = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        tracing::debug!(path = %self.path.display(), pos, "following log");

        loop {
            tokio::select! {
                res = tokio::signal::ctrl_c() => {
                    res.map_err(|e| LogError::Read {
                        path: self.path.clone(),
                        source: e,
                    })?;
                    return Ok(());
                }
                _ = tokio::time::sleep(FOLLOW_POLL_INTERVAL) => {
                    for line in self.read_new_lines(&mut pos)? {
                        println!("{line}");
                    }
                }
            }
        }
    }
}

/// Errors from log file operations.
#[derive(Debug)]
pub enum LogError {
    Dir {
        path: PathBuf,
        source: std::io::Error,
    },
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for LogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (verb, path, source) = match self {
            LogError::Dir { path, source } => ("create log directory", path, source),
            LogError::Open { path, source } => ("open log file", path, source),
            LogError::Read { path, source } => ("read log file", path, source),
            LogError::Write { path, source } => ("write log file", path, source),
        };
        write!(f, "failed to {verb} {}: {source}", path.display())
    }
}

impl std::error::Error for LogError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LogError::Dir { source, .. }
            | LogError::Open { source, .. }
            | LogError::Read { source, .. }
            | LogError::Write { source, .. } => Some(source),
        }
    }
}
