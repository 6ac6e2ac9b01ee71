use crate::config::ProcessSpec;
use crate::error::Result;
use crate::process::restart::{RestartDecision, RestartPolicy, RestartTracker};
use crate::process::spawner::{overlay_env, Child, SpawnRequest, Spawner};
use crate::process::types::{ExitCause, ExitInfo, ProcessState, StopIntent, StopSignal};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Messages posted to the supervisor by watcher and timer tasks.
///
/// Every event carries the generation it was created for; events whose
/// generation no longer matches the handle are stale and dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleEvent {
    Exited {
        id: String,
        generation: u64,
        info: ExitInfo,
    },
    StartConfirmed {
        id: String,
        generation: u64,
    },
    KillTimeout {
        id: String,
        generation: u64,
    },
    RestartDue {
        id: String,
        generation: u64,
    },
}

impl HandleEvent {
    pub fn id(&self) -> &str {
        match self {
            HandleEvent::Exited { id, .. }
            | HandleEvent::StartConfirmed { id, .. }
            | HandleEvent::KillTimeout { id, .. }
            | HandleEvent::RestartDue { id, .. } => id,
        }
    }
}

/// What an observed exit amounted to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    pub cause: ExitCause,
    /// The stop intent that preceded the exit, if any
    pub intent: Option<StopIntent>,
    pub uptime: Duration,
}

/// Runtime record for one instance of a spec.
///
/// Owned and mutated only by the supervisor actor.
pub struct ProcessHandle {
    id: String,
    index: usize,
    spec: Arc<ProcessSpec>,
    policy: RestartPolicy,
    tracker: RestartTracker,
    state: ProcessState,
    pid: Option<u32>,
    generation: u64,
    started_at: Option<Instant>,
    started_wall: Option<DateTime<Utc>>,
    last_exit: Option<ExitInfo>,
    last_uptime: Option<Duration>,
    memory_bytes: Option<u64>,
    restarts: u32,
    stop_intent: Option<StopIntent>,
    /// Set when a run is aborted while Starting; the exit then counts as a failed start
    start_failure: Option<String>,
    signals: Option<mpsc::UnboundedSender<StopSignal>>,
    pending_restart: Option<AbortHandle>,
    kill_timer: Option<AbortHandle>,
    confirm_timer: Option<AbortHandle>,
}

impl ProcessHandle {
    /// New handle in the Stopped state; nothing runs until `start`
    pub fn new(id: String, index: usize, spec: Arc<ProcessSpec>) -> Self {
        let policy = RestartPolicy::from_spec(&spec);
        let tracker = RestartTracker::new(spec.max_restarts);

        Self {
            id,
            index,
            spec,
            policy,
            tracker,
            state: ProcessState::Stopped,
            pid: None,
            generation: 0,
            started_at: None,
            started_wall: None,
            last_exit: None,
            last_uptime: None,
            memory_bytes: None,
            restarts: 0,
            stop_intent: None,
            start_failure: None,
            signals: None,
            pending_restart: None,
            kill_timer: None,
            confirm_timer: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn spec(&self) -> &Arc<ProcessSpec> {
        &self.spec
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn started_wall(&self) -> Option<DateTime<Utc>> {
        self.started_wall
    }

    pub fn last_exit(&self) -> Option<&ExitInfo> {
        self.last_exit.as_ref()
    }

    pub fn last_uptime(&self) -> Option<Duration> {
        self.last_uptime
    }

    pub fn memory_bytes(&self) -> Option<u64> {
        self.memory_bytes
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.tracker.consecutive_failures()
    }

    pub fn restart_pending(&self) -> bool {
        self.pending_restart.is_some()
    }

    /// Spawn a new OS process for this handle.
    ///
    /// On success the handle is Starting (or Running when no start
    /// confirmation is configured) and a watcher task owns the child. On
    /// failure the handle is untouched apart from its generation; the caller
    /// records the failed run with `record_spawn_failure`.
    pub async fn start(
        &mut self,
        spawner: &Arc<dyn Spawner>,
        inject_env: &HashMap<String, String>,
        events: &mpsc::UnboundedSender<HandleEvent>,
    ) -> Result<()> {
        self.cancel_pending_restart();
        self.generation += 1;

        let request = SpawnRequest {
            instance_id: self.id.clone(),
            instance_index: self.index,
            spec: Arc::clone(&self.spec),
            env: overlay_env(inject_env, &self.spec.env),
        };

        let child = spawner.spawn(request).await?;
        let pid = child.pid();

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        tokio::spawn(watch_child(
            child,
            self.id.clone(),
            self.generation,
            signal_rx,
            events.clone(),
        ));

        self.pid = Some(pid);
        self.signals = Some(signal_tx);
        self.started_at = Some(Instant::now());
        self.started_wall = Some(Utc::now());
        self.memory_bytes = None;
        self.stop_intent = None;
        self.start_failure = None;

        match self.spec.start_confirm {
            Some(confirm) => {
                self.state = ProcessState::Starting;
                let event = HandleEvent::StartConfirmed {
                    id: self.id.clone(),
                    generation: self.generation,
                };
                self.confirm_timer = Some(post_after(confirm, event, events.clone()));
            }
            None => self.state = ProcessState::Running,
        }

        info!(
            "Started {} (PID: {}, generation {})",
            self.id, pid, self.generation
        );
        Ok(())
    }

    /// Record a spawn that never produced a process as an immediate failed run
    pub fn record_spawn_failure(&mut self, reason: String, now: Instant) -> ExitOutcome {
        self.state = ProcessState::Crashed;
        self.pid = None;
        self.signals = None;
        self.started_at = None;
        self.last_exit = Some(ExitInfo::SpawnFailed(reason));
        self.last_uptime = Some(Duration::ZERO);
        self.stop_intent = None;
        self.start_failure = None;

        self.tracker
            .record_run(Duration::ZERO, self.spec.min_uptime, false);
        self.tracker.record_restart(now);

        ExitOutcome {
            cause: ExitCause::SpawnFailed,
            intent: None,
            uptime: Duration::ZERO,
        }
    }

    /// Start confirmation elapsed with the process still alive
    pub fn confirm_started(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.state != ProcessState::Starting {
            return false;
        }
        self.confirm_timer = None;
        self.state = ProcessState::Running;
        debug!("{} confirmed running", self.id);
        true
    }

    /// Ask the process to stop gracefully and arm the kill timeout.
    ///
    /// Returns whether a signal was sent. While already Stopping no signal is
    /// re-sent; a later operator intent replaces an earlier one, but never
    /// the other way round.
    pub fn request_stop(
        &mut self,
        intent: StopIntent,
        events: &mpsc::UnboundedSender<HandleEvent>,
    ) -> bool {
        match self.state {
            ProcessState::Stopping => {
                if intent != StopIntent::ResourceViolation {
                    self.stop_intent = Some(intent);
                }
                false
            }
            ProcessState::Starting | ProcessState::Running => {
                self.send_signal(StopSignal::Graceful);
                self.state = ProcessState::Stopping;
                self.stop_intent = Some(intent);
                cancel(&mut self.confirm_timer);

                let event = HandleEvent::KillTimeout {
                    id: self.id.clone(),
                    generation: self.generation,
                };
                self.kill_timer = Some(post_after(self.spec.kill_timeout, event, events.clone()));

                debug!(
                    "Sent {} to {} ({:?})",
                    self.spec.stop_signal, self.id, intent
                );
                true
            }
            _ => false,
        }
    }

    /// Kill timeout fired; force-kill if the same run is still Stopping
    pub fn force_kill(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.state != ProcessState::Stopping {
            return false;
        }
        self.kill_timer = None;
        warn!(
            "{} did not exit within {:?}, sending SIGKILL",
            self.id, self.spec.kill_timeout
        );
        self.send_signal(StopSignal::Kill);
        true
    }

    /// Kill a process that is still Starting; its exit counts as a failed start
    pub fn abort_start(&mut self, reason: String) {
        if self.state != ProcessState::Starting {
            return;
        }
        warn!("Aborting start of {}: {}", self.id, reason);
        cancel(&mut self.confirm_timer);
        self.send_signal(StopSignal::Kill);
        self.start_failure = Some(reason);
        self.stop_intent = Some(StopIntent::ResourceViolation);
        self.state = ProcessState::Stopping;
    }

    /// Apply an exit reported by the watcher task.
    ///
    /// Returns `None` for stale events. The exit is recorded in the restart
    /// history before returning, so the policy sees it.
    pub fn observe_exit(
        &mut self,
        generation: u64,
        info: ExitInfo,
        now: Instant,
    ) -> Option<ExitOutcome> {
        if generation != self.generation || !self.state.is_active() {
            return None;
        }

        let uptime = self
            .started_at
            .map(|started| now.saturating_duration_since(started))
            .unwrap_or_default();

        cancel(&mut self.kill_timer);
        cancel(&mut self.confirm_timer);
        self.signals = None;
        self.pid = None;
        self.memory_bytes = None;

        let intent = self.stop_intent.take();
        let start_failure = self.start_failure.take();

        let cause = match intent {
            Some(StopIntent::Requested) | Some(StopIntent::Restart) => ExitCause::Requested,
            _ if start_failure.is_some() => ExitCause::SpawnFailed,
            Some(StopIntent::ResourceViolation) => ExitCause::ResourceViolation,
            None => ExitCause::Crashed,
        };

        self.state = match cause {
            ExitCause::Requested | ExitCause::ResourceViolation => ProcessState::Stopped,
            ExitCause::Crashed | ExitCause::SpawnFailed => ProcessState::Crashed,
        };

        self.last_exit = Some(info);
        self.last_uptime = Some(uptime);

        let requested = cause == ExitCause::Requested;
        self.tracker
            .record_run(uptime, self.spec.min_uptime, requested);
        if !requested {
            self.tracker.record_restart(now);
        }

        Some(ExitOutcome {
            cause,
            intent,
            uptime,
        })
    }

    /// Consult the restart policy for an exit already recorded on this handle
    pub fn decide(&self, cause: ExitCause, now: Instant) -> RestartDecision {
        self.policy.decide(&self.tracker, cause, now)
    }

    pub fn mark_fatal(&mut self) {
        self.cancel_pending_restart();
        self.state = ProcessState::FatallyFailed;
    }

    /// Arm a cancelable restart after `delay`
    pub fn schedule_restart(&mut self, delay: Duration, events: &mpsc::UnboundedSender<HandleEvent>) {
        self.cancel_pending_restart();
        let event = HandleEvent::RestartDue {
            id: self.id.clone(),
            generation: self.generation,
        };
        self.pending_restart = Some(post_after(delay, event, events.clone()));
    }

    /// Claim a due restart. Returns false when it was canceled or is stale.
    pub fn take_due_restart(&mut self, generation: u64) -> bool {
        if generation != self.generation
            || self.pending_restart.is_none()
            || !self.state.is_terminal()
            || self.state == ProcessState::FatallyFailed
        {
            return false;
        }
        self.pending_restart = None;
        true
    }

    /// Cancel a scheduled restart, leaving the current terminal state as is
    pub fn cancel_pending_restart(&mut self) -> bool {
        cancel(&mut self.pending_restart)
    }

    /// Count a start that replaces a previous run
    pub fn count_restart(&mut self) {
        self.restarts = self.restarts.saturating_add(1);
    }

    /// Explicit restart: forget the failure streak
    pub fn reset_failures(&mut self) {
        self.tracker.reset_failures();
    }

    /// Manual intervention on a fatally failed handle: forget the window history
    pub fn clear_history(&mut self) {
        self.tracker.clear();
        if self.state == ProcessState::FatallyFailed {
            self.state = ProcessState::Stopped;
        }
    }

    pub fn record_memory(&mut self, bytes: u64) {
        self.memory_bytes = Some(bytes);
    }

    fn send_signal(&self, signal: StopSignal) {
        match self.signals {
            Some(ref tx) => {
                if tx.send(signal).is_err() {
                    debug!("Watcher of {} already finished", self.id);
                }
            }
            None => debug!("No live process for {}", self.id),
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        cancel(&mut self.pending_restart);
        cancel(&mut self.kill_timer);
        cancel(&mut self.confirm_timer);
    }
}

fn cancel(timer: &mut Option<AbortHandle>) -> bool {
    match timer.take() {
        Some(handle) => {
            handle.abort();
            true
        }
        None => false,
    }
}

/// Post `event` after `delay`, returning a handle that cancels the timer
fn post_after(
    delay: Duration,
    event: HandleEvent,
    events: mpsc::UnboundedSender<HandleEvent>,
) -> AbortHandle {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = events.send(event);
    })
    .abort_handle()
}

/// Own a child until it exits, relaying stop signals to it
async fn watch_child(
    mut child: Box<dyn Child>,
    id: String,
    generation: u64,
    mut signals: mpsc::UnboundedReceiver<StopSignal>,
    events: mpsc::UnboundedSender<HandleEvent>,
) {
    let mut signals_open = true;

    let info = loop {
        tokio::select! {
            result = child.wait() => {
                break match result {
                    Ok(info) => info,
                    Err(e) => {
                        warn!("Failed to wait for {}: {}", id, e);
                        ExitInfo::Exited { code: None, signal: None }
                    }
                };
            }
            signal = signals.recv(), if signals_open => match signal {
                Some(signal) => {
                    if let Err(e) = child.signal(signal) {
                        warn!("Failed to signal {}: {}", id, e);
                    }
                }
                None => signals_open = false,
            }
        }
    };

    debug!("{} (generation {}) exited: {}", id, generation, info);
    let _ = events.send(HandleEvent::Exited {
        id,
        generation,
        info,
    });
}
