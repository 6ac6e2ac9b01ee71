use crate::process::handle::ProcessHandle;
use crate::process::types::ProcessState;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// Reads the resident memory of a process
pub trait MemoryProbe: Send {
    /// Resident set size in bytes, or `None` if the process no longer exists
    fn resident_bytes(&mut self, pid: u32) -> Option<u64>;
}

/// Memory probe backed by sysinfo
pub struct SysinfoProbe {
    system: System,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SysinfoProbe {
    fn resident_bytes(&mut self, pid: u32) -> Option<u64> {
        let sys_pid = Pid::from_u32(pid);

        // Refresh only this process, memory only
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[sys_pid]),
            true,
            ProcessRefreshKind::new().with_memory(),
        );

        self.system.process(sys_pid).map(|process| process.memory())
    }
}

/// A handle using more memory than its spec allows
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub id: String,
    pub generation: u64,
    /// State at sampling time; a Starting handle is treated as a failed start
    pub state: ProcessState,
    pub observed_bytes: u64,
    pub limit_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SampleOutcome {
    WithinLimit(u64),
    Violation(Violation),
    /// No live process to sample (not started, already exited, or vanished)
    NotRunning,
}

/// Samples memory usage of handles against their configured limits
pub struct ResourceMonitor {
    probe: Box<dyn MemoryProbe>,
}

impl ResourceMonitor {
    pub fn new(probe: Box<dyn MemoryProbe>) -> Self {
        Self { probe }
    }

    /// Sample one handle. Starting and Running handles are measured; a
    /// Stopping handle is already on its way out and is not sampled.
    pub fn sample(&mut self, handle: &ProcessHandle) -> SampleOutcome {
        if !matches!(
            handle.state(),
            ProcessState::Starting | ProcessState::Running
        ) {
            return SampleOutcome::NotRunning;
        }

        let Some(pid) = handle.pid() else {
            return SampleOutcome::NotRunning;
        };

        let Some(bytes) = self.probe.resident_bytes(pid) else {
            return SampleOutcome::NotRunning;
        };

        match handle.spec().max_memory_bytes {
            Some(limit) if bytes > limit => SampleOutcome::Violation(Violation {
                id: handle.id().to_string(),
                generation: handle.generation(),
                state: handle.state(),
                observed_bytes: bytes,
                limit_bytes: limit,
            }),
            _ => SampleOutcome::WithinLimit(bytes),
        }
    }
}
