use crate::error::{Result, VigilError};
use crate::process::{ExitInfo, ProcessHandle, ProcessState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::watch;

/// Point-in-time view of one handle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessStatus {
    pub id: String,
    /// Name of the spec this instance belongs to
    pub name: String,
    pub instance: usize,
    pub state: ProcessState,
    pub pid: Option<u32>,
    /// Wall-clock start of the current (or last) run
    pub started_at: Option<DateTime<Utc>>,
    /// Length of the last finished run
    #[serde(with = "humantime_serde")]
    pub last_uptime: Option<Duration>,
    pub restarts: u32,
    pub consecutive_failures: u32,
    pub last_exit: Option<ExitInfo>,
    pub memory_bytes: Option<u64>,
    pub restart_pending: bool,
}

impl ProcessStatus {
    pub fn from_handle(handle: &ProcessHandle) -> Self {
        Self {
            id: handle.id().to_string(),
            name: handle.spec().name.clone(),
            instance: handle.index(),
            state: handle.state(),
            pid: handle.pid(),
            started_at: handle.started_wall(),
            last_uptime: handle.last_uptime(),
            restarts: handle.restarts(),
            consecutive_failures: handle.consecutive_failures(),
            last_exit: handle.last_exit().cloned(),
            memory_bytes: handle.memory_bytes(),
            restart_pending: handle.restart_pending(),
        }
    }

    /// Time the current run has been up, measured against `now`
    pub fn uptime(&self, now: DateTime<Utc>) -> Option<Duration> {
        if !self.state.is_active() {
            return None;
        }
        self.started_at
            .and_then(|started| (now - started).to_std().ok())
    }
}

/// Consistent copy of every handle, in start order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub processes: Vec<ProcessStatus>,
    /// Set once `stop_all` has begun
    pub shutting_down: bool,
}

impl StatusSnapshot {
    pub fn get(&self, id: &str) -> Option<&ProcessStatus> {
        self.processes.iter().find(|p| p.id == id)
    }

    /// Whether no handle has a live process
    pub fn all_terminal(&self) -> bool {
        self.processes.iter().all(|p| p.state.is_terminal())
    }
}

/// Read-only access to the latest published snapshot.
///
/// Reading never waits on the supervisor loop.
#[derive(Clone)]
pub struct StatusReporter {
    rx: watch::Receiver<StatusSnapshot>,
}

impl StatusReporter {
    pub(crate) fn new(rx: watch::Receiver<StatusSnapshot>) -> Self {
        Self { rx }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.rx.borrow().clone()
    }

    pub fn process(&self, id: &str) -> Option<ProcessStatus> {
        self.rx.borrow().get(id).cloned()
    }

    /// Wait until a snapshot satisfies `predicate` and return it.
    ///
    /// Fails with `ShutDown` if the supervisor exits first without ever
    /// publishing a matching snapshot.
    pub async fn wait_for(
        &mut self,
        mut predicate: impl FnMut(&StatusSnapshot) -> bool,
    ) -> Result<StatusSnapshot> {
        let snapshot = self
            .rx
            .wait_for(|s| predicate(s))
            .await
            .map_err(|_| VigilError::ShutDown)?;
        Ok(snapshot.clone())
    }
}
