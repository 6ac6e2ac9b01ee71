use crate::process::{DoNotRestartReason, ExitCause, ExitInfo};
use std::time::Duration;

/// Operational events broadcast by the supervisor
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    Started {
        id: String,
        pid: u32,
        generation: u64,
    },
    /// Start confirmation elapsed with the process alive
    Running { id: String },
    SpawnFailed { id: String, reason: String },
    Exited {
        id: String,
        info: ExitInfo,
        cause: ExitCause,
        uptime: Duration,
    },
    RestartScheduled {
        id: String,
        delay: Duration,
        consecutive_failures: u32,
    },
    NotRestarted {
        id: String,
        reason: DoNotRestartReason,
    },
    /// Restart budget exhausted; needs an explicit start or restart
    FatallyFailed { id: String },
    ResourceViolation {
        id: String,
        observed_bytes: u64,
        limit_bytes: u64,
    },
    ForceKilled { id: String },
    ShutdownComplete,
}

impl SupervisorEvent {
    pub fn id(&self) -> Option<&str> {
        match self {
            SupervisorEvent::Started { id, .. }
            | SupervisorEvent::Running { id }
            | SupervisorEvent::SpawnFailed { id, .. }
            | SupervisorEvent::Exited { id, .. }
            | SupervisorEvent::RestartScheduled { id, .. }
            | SupervisorEvent::NotRestarted { id, .. }
            | SupervisorEvent::FatallyFailed { id }
            | SupervisorEvent::ResourceViolation { id, .. }
            | SupervisorEvent::ForceKilled { id } => Some(id),
            SupervisorEvent::ShutdownComplete => None,
        }
    }
}
