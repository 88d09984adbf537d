use crate::pidfile::PidRecord;
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};

/// Tolerance when comparing the recorded launch time against the process
/// table, in seconds. Anything further apart is a reused pid.
const START_TIME_TOLERANCE_SECS: u64 = 2;

/// Resource usage of a live process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessMetrics {
    pub memory_bytes: u64,
    pub uptime_secs: u64,
}

/// Process-table queries for the supervised bot.
///
/// A pid alone is not identity: the OS reuses them. Callers that hold a
/// `PidRecord` get liveness answers that also check the recorded start time.
pub struct LivenessProbe {
    sys: System,
}

impl LivenessProbe {
    pub fn new() -> Self {
        Self { sys: System::new() }
    }

    /// Refresh and fetch the table entry for `pid`, filtering out zombies:
    /// a zombie still has an entry but has already exited, and counting it
    /// alive would wedge `stop` forever.
    fn refresh(&mut self, pid: u32) -> Option<&sysinfo::Process> {
        let pid = Pid::from_u32(pid);
        self.sys
            .refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        let process = self.sys.process(pid)?;
        match process.status() {
            ProcessStatus::Zombie | ProcessStatus::Dead => None,
            _ => Some(process),
        }
    }

    /// Start time (unix seconds) of a live process, used to stamp a fresh
    /// record right after launch.
    pub fn start_time(&mut self, pid: u32) -> Option<u64> {
        self.refresh(pid).map(|p| p.start_time())
    }

    /// Whether the recorded process is still the one in the table.
    pub fn is_alive(&mut self, record: &PidRecord) -> bool {
        match self.refresh(record.pid) {
            Some(process) => {
                process.start_time().abs_diff(record.started_at) <= START_TIME_TOLERANCE_SECS
            }
            None => false,
        }
    }

    /// Memory and uptime of the recorded process; `None` once it is gone
    /// or the pid now names someone else.
    pub fn metrics(&mut self, record: &PidRecord) -> Option<ProcessMetrics> {
        let started_at = record.started_at;
        let process = self.refresh(record.pid)?;
        if process.start_time().abs_diff(started_at) > START_TIME_TOLERANCE_SECS {
            return None;
        }
        Some(ProcessMetrics {
            memory_bytes: process.memory(),
            uptime_secs: process.run_time(),
        })
    }
}

impl Default for LivenessProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Well above the kernel's default pid_max, so never a real process.
    const NO_SUCH_PID: u32 = 2_000_000_000;

    fn own_record(probe: &mut LivenessProbe) -> PidRecord {
        let pid = std::process::id();
        PidRecord {
            pid,
            started_at: probe.start_time(pid).expect("own process must be alive"),
            script: "self".to_string(),
        }
    }

    #[test]
    fn test_own_process_is_alive() {
        let mut probe = LivenessProbe::new();
        let record = own_record(&mut probe);
        assert!(probe.is_alive(&record));
    }

    #[test]
    fn test_nonexistent_pid_is_not_alive() {
        let mut probe = LivenessProbe::new();
        let record = PidRecord {
            pid: NO_SUCH_PID,
            started_at: 1,
            script: "ghost".to_string(),
        };
        assert!(!probe.is_alive(&record));
        assert!(probe.metrics(&record).is_none());
        assert!(probe.start_time(NO_SUCH_PID).is_none());
    }

    #[test]
    fn test_start_time_mismatch_means_pid_reuse() {
        let mut probe = LivenessProbe::new();
        let mut record = own_record(&mut probe);
        record.started_at += 1_000_000;

        assert!(!probe.is_alive(&record));
        assert!(probe.metrics(&record).is_none());
    }

    #[test]
    fn test_metrics_of_live_process() {
        let mut probe = LivenessProbe::new();
        let record = own_record(&mut probe);

        let metrics = probe.metrics(&record).expect("own process has metrics");
        assert!(metrics.memory_bytes > 0);
        // freshly started test binary, but the clock only moves forward
        assert!(metrics.uptime_secs < 3600);
    }
}
