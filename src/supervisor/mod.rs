//! Supervisor - public handle to the supervising actor
//!
//! `Supervisor` is a cheap, cloneable handle. Every command is sent to the
//! actor task, which owns all process handles; status reads go through a
//! watch channel and never wait on the actor.

mod actor;
mod commands;
mod events;
mod status;


pub use events::SupervisorEvent;
pub use status::{ProcessStatus, StatusReporter, StatusSnapshot};

use crate::config::{ProcessSpec, SupervisorSettings, VigilConfig};
use crate::error::{Result, VigilError};
use crate::process::{MemoryProbe, ProcessHandle, ResourceMonitor, Spawner};
use actor::SupervisorActor;
use commands::{Command, Responder};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

const COMMAND_CHANNEL_CAPACITY: usize = 64;
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Handle to a running supervisor.
///
/// When every clone is dropped the supervisor stops all processes and exits.
#[derive(Clone)]
pub struct Supervisor {
    cmd_tx: mpsc::Sender<Command>,
    status_rx: watch::Receiver<StatusSnapshot>,
    events: broadcast::Sender<SupervisorEvent>,
}

impl Supervisor {
    /// Build one handle per (spec, instance) and spawn the actor.
    ///
    /// Nothing is started until `start_all` or `start`. The join handle
    /// resolves when the actor halts after `stop_all`.
    pub fn spawn(
        specs: Vec<ProcessSpec>,
        settings: SupervisorSettings,
        spawner: Arc<dyn Spawner>,
        probe: Box<dyn MemoryProbe>,
    ) -> Result<(Self, JoinHandle<Result<()>>)> {
        let mut seen = HashSet::new();
        let mut handles = Vec::new();

        for spec in specs {
            let spec = Arc::new(spec);
            for (index, id) in spec.instance_ids().into_iter().enumerate() {
                if !seen.insert(id.clone()) {
                    return Err(VigilError::Config(format!(
                        "Duplicate process id: {}",
                        id
                    )));
                }
                handles.push(ProcessHandle::new(id, index, Arc::clone(&spec)));
            }
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let initial = StatusSnapshot {
            processes: handles.iter().map(ProcessStatus::from_handle).collect(),
            shutting_down: false,
        };
        let (status_tx, status_rx) = watch::channel(initial);
        let (notify, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let actor = SupervisorActor::new(
            handles,
            settings,
            spawner,
            ResourceMonitor::new(probe),
            events_tx,
            status_tx,
            notify.clone(),
        );
        let join = tokio::spawn(actor.run(cmd_rx, events_rx));

        Ok((
            Self {
                cmd_tx,
                status_rx,
                events: notify,
            },
            join,
        ))
    }

    /// Convenience wrapper over `spawn` for a loaded configuration
    pub fn from_config(
        config: &VigilConfig,
        spawner: Arc<dyn Spawner>,
        probe: Box<dyn MemoryProbe>,
    ) -> Result<(Self, JoinHandle<Result<()>>)> {
        Self::spawn(config.specs(), config.supervisor.clone(), spawner, probe)
    }

    async fn request(&self, make: impl FnOnce(Responder) -> Command) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| VigilError::ShutDown)?;
        rx.await.map_err(|_| VigilError::ShutDown)?
    }

    /// Start every handle that is not already active, in configuration order
    pub async fn start_all(&self) -> Result<()> {
        self.request(|resp| Command::StartAll { resp }).await
    }

    /// Gracefully stop everything and halt the supervisor.
    ///
    /// Scheduled restarts are canceled and every active handle is stopped
    /// concurrently (signals go out in reverse start order). Returns once
    /// every handle is terminal.
    pub async fn stop_all(&self) -> Result<()> {
        self.request(|resp| Command::StopAll { resp }).await
    }

    /// Start an instance, or every instance of a spec
    pub async fn start(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.request(|resp| Command::Start { id, resp }).await
    }

    /// Stop an instance (or every instance of a spec) and wait for it to exit
    pub async fn stop(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.request(|resp| Command::Stop { id, resp }).await
    }

    /// Explicit restart: resets the failure streak, stops if active, then starts
    pub async fn restart(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.request(|resp| Command::Restart { id, resp }).await
    }

    /// Latest published snapshot
    pub fn status(&self) -> StatusSnapshot {
        self.status_rx.borrow().clone()
    }

    pub fn reporter(&self) -> StatusReporter {
        StatusReporter::new(self.status_rx.clone())
    }

    /// Receive operational events (exits, restarts, violations, fatal failures)
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }
}
