use serde::{Deserialize, Serialize};

/// Lifecycle state of one supervised instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
    FatallyFailed,
}

impl ProcessState {
    /// States in which an OS process exists
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ProcessState::Starting | ProcessState::Running | ProcessState::Stopping
        )
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessState::Starting => write!(f, "starting"),
            ProcessState::Running => write!(f, "running"),
            ProcessState::Stopping => write!(f, "stopping"),
            ProcessState::Stopped => write!(f, "stopped"),
            ProcessState::Crashed => write!(f, "crashed"),
            ProcessState::FatallyFailed => write!(f, "fatally-failed"),
        }
    }
}

/// How a process run ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitInfo {
    /// The process exited on its own or was killed by a signal
    Exited {
        code: Option<i32>,
        signal: Option<i32>,
    },
    /// The process could not be created
    SpawnFailed(String),
}

impl ExitInfo {
    pub fn code(code: i32) -> Self {
        ExitInfo::Exited {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signal(signal: i32) -> Self {
        ExitInfo::Exited {
            code: None,
            signal: Some(signal),
        }
    }
}

impl std::fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitInfo::Exited {
                code: Some(code), ..
            } => write!(f, "exit code {}", code),
            ExitInfo::Exited {
                signal: Some(signal),
                ..
            } => write!(f, "signal {}", signal),
            ExitInfo::Exited { .. } => write!(f, "unknown exit"),
            ExitInfo::SpawnFailed(reason) => write!(f, "spawn failed: {}", reason),
        }
    }
}

/// Signal delivered to a child by its watcher task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// The spec's configured graceful signal
    Graceful,
    /// Forced termination (SIGKILL)
    Kill,
}

/// Why a stop was requested; decides what happens once the process is gone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopIntent {
    /// Operator stop: the handle stays down
    Requested,
    /// Explicit restart: start again immediately after exit
    Restart,
    /// Memory limit exceeded: run the restart policy after exit
    ResourceViolation,
}

/// Classification of an observed exit, fed to the restart policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCause {
    /// Exit that followed an operator stop or restart command
    Requested,
    /// Exit that followed a graceful stop issued for a resource violation
    ResourceViolation,
    /// Unexpected exit (including exit code zero)
    Crashed,
    /// The process could not be spawned or failed during start
    SpawnFailed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_states() {
        assert!(ProcessState::Starting.is_active());
        assert!(ProcessState::Running.is_active());
        assert!(ProcessState::Stopping.is_active());
        assert!(ProcessState::Stopped.is_terminal());
        assert!(ProcessState::Crashed.is_terminal());
        assert!(ProcessState::FatallyFailed.is_terminal());
    }

    #[test]
    fn test_display() {
        assert_eq!(ProcessState::FatallyFailed.to_string(), "fatally-failed");
        assert_eq!(ExitInfo::code(1).to_string(), "exit code 1");
        assert_eq!(ExitInfo::signal(9).to_string(), "signal 9");
    }
}
