//! In-memory spawner and memory probe for deterministic tests

use crate::error::{Result, VigilError};
use crate::process::monitor::MemoryProbe;
use crate::process::spawner::{Child, SpawnRequest, Spawner};
use crate::process::types::{ExitInfo, StopSignal};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

const SIGKILL: i32 = 9;
const SIGTERM: i32 = 15;

type ExitSender = Arc<watch::Sender<Option<ExitInfo>>>;

#[derive(Default)]
struct FakeState {
    next_pid: u32,
    live: HashMap<String, (u32, ExitSender)>,
    fail_next: HashMap<String, String>,
    ignore_graceful: HashSet<String>,
    signals: HashMap<String, Vec<StopSignal>>,
    spawns: HashMap<String, usize>,
    envs: HashMap<String, HashMap<String, String>>,
}

/// Spawner whose children live until a test tells them to exit
#[derive(Clone, Default)]
pub struct FakeSpawner {
    state: Arc<Mutex<FakeState>>,
}

impl FakeSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Make the current child of `id` exit with `info`
    pub fn exit(&self, id: &str, info: ExitInfo) {
        let state = self.lock();
        let (_, tx) = state
            .live
            .get(id)
            .unwrap_or_else(|| panic!("no child spawned for {}", id));
        tx.send_replace(Some(info));
    }

    /// Fail the next spawn of `id`
    pub fn fail_next(&self, id: &str, reason: &str) {
        self.lock()
            .fail_next
            .insert(id.to_string(), reason.to_string());
    }

    /// Children of `id` ignore the graceful stop signal
    pub fn ignore_graceful(&self, id: &str) {
        self.lock().ignore_graceful.insert(id.to_string());
    }

    /// Signals delivered to children of `id`, across all generations
    pub fn signals(&self, id: &str) -> Vec<StopSignal> {
        self.lock().signals.get(id).cloned().unwrap_or_default()
    }

    /// Successful spawns of `id`
    pub fn spawn_count(&self, id: &str) -> usize {
        self.lock().spawns.get(id).copied().unwrap_or(0)
    }

    /// Environment passed to the latest spawn of `id`
    pub fn last_env(&self, id: &str) -> Option<HashMap<String, String>> {
        self.lock().envs.get(id).cloned()
    }

    /// Whether the latest child of `id` has not exited yet
    pub fn is_alive(&self, id: &str) -> bool {
        self.lock()
            .live
            .get(id)
            .is_some_and(|(_, tx)| tx.borrow().is_none())
    }
}

#[async_trait]
impl Spawner for FakeSpawner {
    async fn spawn(&self, request: SpawnRequest) -> Result<Box<dyn Child>> {
        let id = request.instance_id;
        let mut state = self.lock();

        if let Some(reason) = state.fail_next.remove(&id) {
            return Err(VigilError::Spawn(id, reason));
        }

        state.next_pid += 1;
        let pid = 1000 + state.next_pid;
        let (tx, rx) = watch::channel(None);
        let tx = Arc::new(tx);

        state.live.insert(id.clone(), (pid, Arc::clone(&tx)));
        *state.spawns.entry(id.clone()).or_default() += 1;
        state.envs.insert(id.clone(), request.env);

        Ok(Box::new(FakeChild {
            id,
            pid,
            exit_tx: tx,
            exit_rx: rx,
            state: Arc::clone(&self.state),
        }))
    }
}

struct FakeChild {
    id: String,
    pid: u32,
    exit_tx: ExitSender,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    state: Arc<Mutex<FakeState>>,
}

#[async_trait]
impl Child for FakeChild {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn signal(&mut self, signal: StopSignal) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.signals.entry(self.id.clone()).or_default().push(signal);

        let exit = match signal {
            StopSignal::Kill => Some(SIGKILL),
            StopSignal::Graceful if !state.ignore_graceful.contains(&self.id) => Some(SIGTERM),
            StopSignal::Graceful => None,
        };

        if let Some(signo) = exit {
            self.exit_tx.send_if_modified(|current| {
                if current.is_none() {
                    *current = Some(ExitInfo::signal(signo));
                    true
                } else {
                    false
                }
            });
        }
        Ok(())
    }

    async fn wait(&mut self) -> Result<ExitInfo> {
        loop {
            let current = self.exit_rx.borrow_and_update().clone();
            if let Some(info) = current {
                return Ok(info);
            }
            self.exit_rx
                .changed()
                .await
                .map_err(|_| VigilError::Internal("fake child dropped".to_string()))?;
        }
    }
}

/// Memory probe reporting whatever a test sets
#[derive(Clone, Default)]
pub struct FakeProbe {
    readings: Arc<Mutex<HashMap<u32, u64>>>,
}

impl FakeProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, pid: u32, bytes: u64) {
        self.readings.lock().unwrap().insert(pid, bytes);
    }
}

impl MemoryProbe for FakeProbe {
    fn resident_bytes(&mut self, pid: u32) -> Option<u64> {
        self.readings.lock().unwrap().get(&pid).copied()
    }
}
