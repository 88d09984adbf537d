/// Orchestrates launch, liveness, shutdown and status for the bot process.
///
/// One invocation performs one operation to completion. The pid record is
/// only ever mutated after the corresponding OS-level event has been
/// observed: saved once the child survived the settle delay, cleared once
/// an exit was confirmed.
use crate::config::{ConfigError, SupervisorConfig};
use crate::launcher::{self, LaunchError};
use crate::logs::{LogError, LogSink};
use crate::pidfile::{LockError, OpLock, PidFile, PidRecord, RecordError};
use crate::probe::{LivenessProbe, ProcessMetrics};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::time::Duration;

/// Log lines surfaced as a diagnostic when a launch dies during the
/// settle window.
const STARTUP_TAIL_LINES: usize = 15;

/// Supervisor states. `Starting` and `Stopping` are transient within a
/// single invocation; only `Stopped` and `Running` are observable from
/// outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            State::Stopped => "stopped",
            State::Starting => "starting",
            State::Running => "running",
            State::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// What `status()` observed.
#[derive(Debug)]
pub struct StatusReport {
    pub state: State,
    pub pid: Option<u32>,
    pub metrics: Option<ProcessMetrics>,
    /// True when a record for an already-dead process was found and cleared.
    pub cleared_stale: bool,
}

/// What `stop()` did.
#[derive(Debug)]
pub struct StopReport {
    pub pid: u32,
    /// True when the graceful signal went unacknowledged and the process
    /// had to be killed.
    pub forced: bool,
}

pub struct Supervisor {
    config: SupervisorConfig,
    records: PidFile,
    probe: LivenessProbe,
    log: LogSink,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        let records = PidFile::new(config.paths.pid_file.clone());
        let log = LogSink::new(config.log_file());
        Self {
            config,
            records,
            probe: LivenessProbe::new(),
            log,
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Launch the bot and confirm it survives the settle delay.
    pub async fn start(&mut self) -> Result<u32, SupervisorError> {
        // refuse before touching anything if the bot cannot possibly run
        self.config.check_secret()?;
        let _lock = OpLock::acquire(&self.config.lock_file())?;
        self.start_locked().await
    }

    /// Signal the bot to exit, escalating to SIGKILL after the timeout.
    pub async fn stop(&mut self) -> Result<StopReport, SupervisorError> {
        let _lock = OpLock::acquire(&self.config.lock_file())?;
        self.stop_locked().await
    }

    /// Stop (tolerating "not running"), pause, then start again.
    pub async fn restart(&mut self) -> Result<u32, SupervisorError> {
        self.config.check_secret()?;
        let _lock = OpLock::acquire(&self.config.lock_file())?;

        match self.stop_locked().await {
            Ok(report) => {
                tracing::info!(pid = report.pid, forced = report.forced, "stopped for restart");
            }
            Err(SupervisorError::NotRunning) => {
                tracing::debug!("bot was not running, starting fresh");
            }
            Err(e) => return Err(e),
        }

        tokio::time::sleep(self.settle_delay()).await;
        self.start_locked().await
    }

    /// Report the observable state without mutating anything except a
    /// stale record, which is cleared on sight.
    pub fn status(&mut self) -> StatusReport {
        let (record, cleared_stale) = self.live_record();
        match record {
            None => StatusReport {
                state: State::Stopped,
                pid: None,
                metrics: None,
                cleared_stale,
            },
            Some(record) => {
                let metrics = self.probe.metrics(&record);
                StatusReport {
                    state: State::Running,
                    pid: Some(record.pid),
                    metrics,
                    cleared_stale,
                }
            }
        }
    }

    async fn start_locked(&mut self) -> Result<u32, SupervisorError> {
        if let (Some(record), _) = self.live_record() {
            return Err(SupervisorError::AlreadyRunning { pid: record.pid });
        }

        tracing::debug!(state = %State::Starting, "launching bot");
        self.log.note(&format!("starting {}", self.config.bot.name))?;
        let pid = launcher::launch(&self.config.bot, &self.log)?;

        tokio::time::sleep(self.settle_delay()).await;

        let Some(started_at) = self.probe.start_time(pid) else {
            // the child died before the settle check; nothing to track
            self.records.clear();
            self.log
                .note(&format!("{} exited during startup", self.config.bot.name))?;
            let tail = self.log.tail(STARTUP_TAIL_LINES).unwrap_or_default();
            return Err(SupervisorError::StartupFailed { tail });
        };

        let record = PidRecord {
            pid,
            started_at,
            script: self.config.bot.script.display().to_string(),
        };
        self.records.save(&record)?;
        tracing::debug!(state = %State::Running, pid, "bot confirmed alive");
        self.log
            .note(&format!("{} running (pid {pid})", self.config.bot.name))?;
        Ok(pid)
    }

    async fn stop_locked(&mut self) -> Result<StopReport, SupervisorError> {
        let (record, _) = self.live_record();
        let Some(record) = record else {
            return Err(SupervisorError::NotRunning);
        };

        tracing::debug!(state = %State::Stopping, pid = record.pid, "sending SIGTERM");
        self.log.note(&format!(
            "stopping {} (pid {})",
            self.config.bot.name, record.pid
        ))?;
        signal_process(record.pid, Signal::SIGTERM)?;

        if self.await_exit(&record, self.config.timing.stop_timeout_secs).await {
            self.records.clear();
            self.log
                .note(&format!("{} stopped", self.config.bot.name))?;
            return Ok(StopReport {
                pid: record.pid,
                forced: false,
            });
        }

        tracing::warn!(
            pid = record.pid,
            timeout_secs = self.config.timing.stop_timeout_secs,
            "graceful shutdown unacknowledged, sending SIGKILL"
        );
        self.log.note(&format!(
            "{} ignored SIGTERM, killing (pid {})",
            self.config.bot.name, record.pid
        ))?;
        signal_process(record.pid, Signal::SIGKILL)?;

        if self.await_exit(&record, self.config.timing.kill_timeout_secs).await {
            self.records.clear();
            self.log
                .note(&format!("{} killed", self.config.bot.name))?;
            return Ok(StopReport {
                pid: record.pid,
                forced: true,
            });
        }

        Err(SupervisorError::StopFailed { pid: record.pid })
    }

    /// Load the record, clearing it if the process it names is gone.
    fn live_record(&mut self) -> (Option<PidRecord>, bool) {
        match self.records.load() {
            None => (None, false),
            Some(record) if self.probe.is_alive(&record) => (Some(record), false),
            Some(record) => {
                tracing::warn!(pid = record.pid, "clearing stale pid record");
                self.records.clear();
                (None, true)
            }
        }
    }

    /// Poll until the recorded process is gone. True if it exited in time.
    async fn await_exit(&mut self, record: &PidRecord, timeout_secs: u64) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);
        let poll = Duration::from_millis(self.config.timing.poll_interval_ms);
        while tokio::time::Instant::now() < deadline {
            if !self.probe.is_alive(record) {
                return true;
            }
            tokio::time::sleep(poll).await;
        }
        !self.probe.is_alive(record)
    }

    fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.config.timing.settle_delay_secs)
    }
}

/// Send a signal, treating "no such process" as already done — the process
/// can exit between the liveness check and the kill.
fn signal_process(pid: u32, sig: Signal) -> Result<(), SupervisorError> {
    match kill(Pid::from_raw(pid as i32), sig) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(source) => Err(SupervisorError::Signal { pid, source }),
    }
}

/// Every way a supervisor operation can fail. Each maps to a non-zero
/// exit code and a human-readable message in `main`.
#[derive(Debug)]
pub enum SupervisorError {
    Config(ConfigError),
    Lock(LockError),
    AlreadyRunning { pid: u32 },
    NotRunning,
    /// The child was gone at the settle check; carries a log tail as the
    /// diagnostic.
    StartupFailed { tail: Vec<String> },
    /// SIGKILL went unacknowledged, which should not happen outside of
    /// unkillable (D-state) processes.
    StopFailed { pid: u32 },
    Launch(LaunchError),
    Record(RecordError),
    Log(LogError),
    Signal { pid: u32, source: nix::Error },
}

impl std::fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorError::Config(e) => write!(f, "{e}"),
            SupervisorError::Lock(e) => write!(f, "{e}"),
            SupervisorError::AlreadyRunning { pid } => {
                write!(f, "bot is already running (pid {pid})")
            }
            SupervisorError::NotRunning => write!(f, "bot is not running"),
            SupervisorError::StartupFailed { .. } => {
                write!(f, "bot exited during startup")
            }
            SupervisorError::StopFailed { pid } => {
                write!(f, "process {pid} did not exit even after SIGKILL")
            }
            SupervisorError::Launch(e) => write!(f, "{e}"),
            SupervisorError::Record(e) => write!(f, "{e}"),
            SupervisorError::Log(e) => write!(f, "{e}"),
            SupervisorError::Signal { pid, source } => {
                write!(f, "failed to signal pid {pid}: {source}")
            }
        }
    }
}

impl std::error::Error for SupervisorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SupervisorError::Config(e) => Some(e),
            SupervisorError::Lock(e) => Some(e),
            SupervisorError::Launch(e) => Some(e),
            SupervisorError::Record(e) => Some(e),
            SupervisorError::Log(e) => Some(e),
            SupervisorError::Signal { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<ConfigError> for SupervisorError {
    fn from(e: ConfigError) -> Self {
        SupervisorError::Config(e)
    }
}

impl From<LockError> for SupervisorError {
    fn from(e: LockError) -> Self {
        SupervisorError::Lock(e)
    }
}

impl From<LaunchError> for SupervisorError {
    fn from(e: LaunchError) -> Self {
        SupervisorError::Launch(e)
    }
}

impl From<RecordError> for SupervisorError {
    fn from(e: RecordError) -> Self {
        SupervisorError::Record(e)
    }
}

impl From<LogError> for SupervisorError {
    fn from(e: LogError) -> Self {
        SupervisorError::Log(e)
    }
}
