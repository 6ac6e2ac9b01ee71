//! Supervisor actor - the single owner of every process handle
//!
//! The actor runs in one task and multiplexes three inputs: commands from
//! `Supervisor` handles, events from per-child watcher and timer tasks, and
//! the resource sampling interval. After every message it publishes a fresh
//! status snapshot and resolves any callers whose wait condition now holds.

use super::commands::{Command, Responder};
use super::events::SupervisorEvent;
use super::status::{ProcessStatus, StatusSnapshot};
use crate::config::SupervisorSettings;
use crate::error::{Result, VigilError};
use crate::process::{
    DoNotRestartReason, ExitCause, HandleEvent, ProcessHandle, ProcessState, ResourceMonitor,
    RestartDecision, SampleOutcome, Spawner, StopIntent,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// A caller waiting for a set of handles to settle.
///
/// Each target is satisfied once its handle is terminal or has moved past
/// the generation recorded when the command was accepted.
struct Waiter {
    targets: Vec<(usize, u64)>,
    error: Option<VigilError>,
    /// Set for `restart` callers, who also learn about a failed re-spawn
    restart: bool,
    resp: Responder,
}

impl Waiter {
    fn is_satisfied(&self, handles: &[ProcessHandle]) -> bool {
        self.targets.iter().all(|&(idx, generation)| {
            let handle = &handles[idx];
            handle.state().is_terminal() || handle.generation() != generation
        })
    }

    fn resolve(self) {
        let result = match self.error {
            Some(e) => Err(e),
            None => Ok(()),
        };
        let _ = self.resp.send(result);
    }
}

pub(super) struct SupervisorActor {
    /// Handles in start order
    handles: Vec<ProcessHandle>,
    settings: SupervisorSettings,
    spawner: Arc<dyn Spawner>,
    monitor: ResourceMonitor,
    events_tx: mpsc::UnboundedSender<HandleEvent>,
    status_tx: watch::Sender<StatusSnapshot>,
    notify: broadcast::Sender<SupervisorEvent>,
    waiters: Vec<Waiter>,
    shutting_down: bool,
}

impl SupervisorActor {
    pub(super) fn new(
        handles: Vec<ProcessHandle>,
        settings: SupervisorSettings,
        spawner: Arc<dyn Spawner>,
        monitor: ResourceMonitor,
        events_tx: mpsc::UnboundedSender<HandleEvent>,
        status_tx: watch::Sender<StatusSnapshot>,
        notify: broadcast::Sender<SupervisorEvent>,
    ) -> Self {
        Self {
            handles,
            settings,
            spawner,
            monitor,
            events_tx,
            status_tx,
            notify,
            waiters: Vec::new(),
            shutting_down: false,
        }
    }

    /// Main event loop.
    ///
    /// Terminates after a shutdown (explicit `stop_all`, or every
    /// `Supervisor` handle dropped) once every handle is terminal.
    pub(super) async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut events_rx: mpsc::UnboundedReceiver<HandleEvent>,
    ) -> Result<()> {
        let mut sampler = tokio::time::interval(self.settings.sample_interval);
        sampler.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut cmd_closed = false;
        self.publish();

        loop {
            if self.shutting_down && self.all_terminal() {
                break;
            }

            // Child and timer events first so exits are never starved by commands
            tokio::select! {
                biased;

                maybe_event = events_rx.recv() => match maybe_event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        error!("Event channel closed unexpectedly");
                        return Err(VigilError::Internal("event channel closed".to_string()));
                    }
                },

                maybe_cmd = cmd_rx.recv(), if !cmd_closed => match maybe_cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        info!("All supervisor handles dropped; stopping every process");
                        cmd_closed = true;
                        self.begin_shutdown(None);
                    }
                },

                _ = sampler.tick() => {
                    if !self.shutting_down {
                        self.sample_resources();
                    }
                }
            }

            self.publish();
            self.resolve_waiters();
        }

        self.resolve_waiters();
        let _ = self.notify.send(SupervisorEvent::ShutdownComplete);
        info!("Supervisor stopped");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    async fn handle_command(&mut self, cmd: Command) {
        debug!("Received {} command", cmd.name());

        match cmd {
            Command::StartAll { resp } => {
                if self.shutting_down {
                    let _ = resp.send(Err(VigilError::ShutDown));
                    return;
                }
                let mut result = Ok(());
                for idx in 0..self.handles.len() {
                    match self.start_manual(idx).await {
                        // Contained to the handle and already reported
                        Err(e) if e.is_per_process() => {}
                        Err(e) => {
                            if result.is_ok() {
                                result = Err(e);
                            }
                        }
                        Ok(()) => {}
                    }
                }
                let _ = resp.send(result);
            }

            Command::StopAll { resp } => self.begin_shutdown(Some(resp)),

            Command::Start { id, resp } => {
                if self.shutting_down {
                    let _ = resp.send(Err(VigilError::ShutDown));
                    return;
                }
                let result = match self.resolve(&id) {
                    Ok(targets) => {
                        let mut result = Ok(());
                        for idx in targets {
                            if let Err(e) = self.start_manual(idx).await {
                                if result.is_ok() {
                                    result = Err(e);
                                }
                            }
                        }
                        result
                    }
                    Err(e) => Err(e),
                };
                let _ = resp.send(result);
            }

            Command::Stop { id, resp } => match self.resolve(&id) {
                Ok(targets) => {
                    let targets = targets
                        .into_iter()
                        .map(|idx| {
                            let handle = &mut self.handles[idx];
                            if handle.cancel_pending_restart() {
                                info!("Canceled scheduled restart of {}", handle.id());
                            }
                            handle.request_stop(StopIntent::Requested, &self.events_tx);
                            (idx, handle.generation())
                        })
                        .collect();
                    self.waiters.push(Waiter {
                        targets,
                        error: None,
                        restart: false,
                        resp,
                    });
                }
                Err(e) => {
                    let _ = resp.send(Err(e));
                }
            },

            Command::Restart { id, resp } => {
                if self.shutting_down {
                    let _ = resp.send(Err(VigilError::ShutDown));
                    return;
                }
                let targets = match self.resolve(&id) {
                    Ok(targets) => targets,
                    Err(e) => {
                        let _ = resp.send(Err(e));
                        return;
                    }
                };

                let mut waited = Vec::with_capacity(targets.len());
                let mut error = None;
                for idx in targets {
                    let generation = self.handles[idx].generation();
                    if let Err(e) = self.restart_manual(idx).await {
                        error.get_or_insert(e);
                    }
                    waited.push((idx, generation));
                }
                self.waiters.push(Waiter {
                    targets: waited,
                    error,
                    restart: true,
                    resp,
                });
            }
        }
    }

    /// Map a command id to handle indices: exact instance id first, then spec name
    fn resolve(&self, id: &str) -> Result<Vec<usize>> {
        if let Some(idx) = self.index_of(id) {
            return Ok(vec![idx]);
        }

        let matches: Vec<usize> = self
            .handles
            .iter()
            .enumerate()
            .filter(|(_, h)| h.spec().name == id)
            .map(|(idx, _)| idx)
            .collect();

        if matches.is_empty() {
            Err(VigilError::NotFound(id.to_string()))
        } else {
            Ok(matches)
        }
    }

    fn index_of(&self, id: &str) -> Option<usize> {
        self.handles.iter().position(|h| h.id() == id)
    }

    /// Operator start. No-op for a handle that is already active.
    async fn start_manual(&mut self, idx: usize) -> Result<()> {
        let handle = &mut self.handles[idx];
        if handle.state().is_active() {
            debug!("{} is already {}", handle.id(), handle.state());
            return Ok(());
        }
        if handle.state() == ProcessState::FatallyFailed {
            info!("Manual start of fatally failed {}", handle.id());
            handle.clear_history();
        }
        self.start_handle(idx).await
    }

    /// Operator restart: reset the failure streak, then stop (if active) and start
    async fn restart_manual(&mut self, idx: usize) -> Result<()> {
        let handle = &mut self.handles[idx];
        handle.reset_failures();
        if handle.state() == ProcessState::FatallyFailed {
            handle.clear_history();
        }

        if handle.state().is_active() {
            info!("Restarting {}", handle.id());
            handle.request_stop(StopIntent::Restart, &self.events_tx);
            return Ok(());
        }

        handle.cancel_pending_restart();
        handle.count_restart();
        self.start_handle(idx).await
    }

    fn begin_shutdown(&mut self, resp: Option<Responder>) {
        if !self.shutting_down {
            info!("Stopping all processes");
            self.shutting_down = true;

            for handle in self.handles.iter_mut().rev() {
                if handle.cancel_pending_restart() {
                    debug!("Canceled scheduled restart of {}", handle.id());
                }
                handle.request_stop(StopIntent::Requested, &self.events_tx);
            }
        }

        if let Some(resp) = resp {
            let targets = self
                .handles
                .iter()
                .enumerate()
                .map(|(idx, h)| (idx, h.generation()))
                .collect();
            self.waiters.push(Waiter {
                targets,
                error: None,
                restart: false,
                resp,
            });
        }
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    async fn handle_event(&mut self, event: HandleEvent) {
        let Some(idx) = self.index_of(event.id()) else {
            warn!("Event for unknown process {}", event.id());
            return;
        };

        match event {
            HandleEvent::Exited {
                id,
                generation,
                info,
            } => {
                let now = Instant::now();
                let handle = &mut self.handles[idx];
                let Some(outcome) = handle.observe_exit(generation, info.clone(), now) else {
                    debug!("Ignoring stale exit of {} (generation {})", id, generation);
                    return;
                };

                match outcome.cause {
                    ExitCause::Crashed => warn!(
                        "{} exited unexpectedly ({}) after {:?}",
                        id, info, outcome.uptime
                    ),
                    _ => info!("{} exited ({}) after {:?}", id, info, outcome.uptime),
                }
                let _ = self.notify.send(SupervisorEvent::Exited {
                    id,
                    info,
                    cause: outcome.cause,
                    uptime: outcome.uptime,
                });

                if outcome.intent == Some(StopIntent::Restart) && !self.shutting_down {
                    self.handles[idx].count_restart();
                    if let Err(e) = self.start_handle(idx).await {
                        self.fail_restart_waiters(idx, &e);
                    }
                    return;
                }

                self.apply_policy(idx, outcome.cause, now);
            }

            HandleEvent::StartConfirmed { id, generation } => {
                if self.handles[idx].confirm_started(generation) {
                    let _ = self.notify.send(SupervisorEvent::Running { id });
                }
            }

            HandleEvent::KillTimeout { id, generation } => {
                if self.handles[idx].force_kill(generation) {
                    let _ = self.notify.send(SupervisorEvent::ForceKilled { id });
                }
            }

            HandleEvent::RestartDue { id, generation } => {
                if self.shutting_down || !self.handles[idx].take_due_restart(generation) {
                    debug!("Dropping canceled restart of {}", id);
                    return;
                }
                self.handles[idx].count_restart();
                let _ = self.start_handle(idx).await;
            }
        }
    }

    /// Spawn a handle; a spawn error is recorded as a failed run and fed to the policy
    async fn start_handle(&mut self, idx: usize) -> Result<()> {
        let handle = &mut self.handles[idx];
        match handle
            .start(&self.spawner, &self.settings.inject_env, &self.events_tx)
            .await
        {
            Ok(()) => {
                if let Some(pid) = handle.pid() {
                    let _ = self.notify.send(SupervisorEvent::Started {
                        id: handle.id().to_string(),
                        pid,
                        generation: handle.generation(),
                    });
                }
                Ok(())
            }
            Err(e) => {
                let reason = match e {
                    VigilError::Spawn(_, ref reason) => reason.clone(),
                    ref other => other.to_string(),
                };
                error!("Failed to start {}: {}", handle.id(), reason);
                let _ = self.notify.send(SupervisorEvent::SpawnFailed {
                    id: handle.id().to_string(),
                    reason: reason.clone(),
                });

                let now = Instant::now();
                handle.record_spawn_failure(reason, now);
                self.apply_policy(idx, ExitCause::SpawnFailed, now);
                Err(e)
            }
        }
    }

    fn apply_policy(&mut self, idx: usize, cause: ExitCause, now: Instant) {
        let handle = &mut self.handles[idx];
        if self.shutting_down {
            debug!("Not restarting {} during shutdown", handle.id());
            return;
        }

        let id = handle.id().to_string();
        let delay = match handle.decide(cause, now) {
            RestartDecision::RestartNow => Duration::ZERO,
            RestartDecision::RestartAfter(delay) => delay,
            RestartDecision::DoNotRestart(DoNotRestartReason::RestartLimitExceeded) => {
                handle.mark_fatal();
                error!(
                    "{} exceeded {} restarts within {:?}; giving up until started manually",
                    id,
                    handle.spec().max_restarts,
                    handle.spec().restart_window
                );
                let _ = self.notify.send(SupervisorEvent::FatallyFailed { id });
                return;
            }
            RestartDecision::DoNotRestart(reason) => {
                debug!("Not restarting {} ({})", id, reason);
                let _ = self.notify.send(SupervisorEvent::NotRestarted { id, reason });
                return;
            }
        };

        let consecutive_failures = handle.consecutive_failures();
        info!(
            "Restarting {} in {:?} ({} consecutive failures)",
            id, delay, consecutive_failures
        );
        handle.schedule_restart(delay, &self.events_tx);
        let _ = self.notify.send(SupervisorEvent::RestartScheduled {
            id,
            delay,
            consecutive_failures,
        });
    }

    // ------------------------------------------------------------------
    // Resource sampling
    // ------------------------------------------------------------------

    fn sample_resources(&mut self) {
        for idx in 0..self.handles.len() {
            match self.monitor.sample(&self.handles[idx]) {
                SampleOutcome::WithinLimit(bytes) => self.handles[idx].record_memory(bytes),
                SampleOutcome::Violation(violation) => {
                    let handle = &mut self.handles[idx];
                    handle.record_memory(violation.observed_bytes);
                    warn!(
                        "{} uses {} bytes, limit is {} bytes",
                        violation.id, violation.observed_bytes, violation.limit_bytes
                    );

                    if violation.state == ProcessState::Starting {
                        handle.abort_start(format!(
                            "memory limit exceeded while starting ({} > {} bytes)",
                            violation.observed_bytes, violation.limit_bytes
                        ));
                    } else {
                        handle.request_stop(StopIntent::ResourceViolation, &self.events_tx);
                    }

                    let _ = self.notify.send(SupervisorEvent::ResourceViolation {
                        id: violation.id,
                        observed_bytes: violation.observed_bytes,
                        limit_bytes: violation.limit_bytes,
                    });
                }
                SampleOutcome::NotRunning => {}
            }
        }
    }

    // ------------------------------------------------------------------
    // Publishing
    // ------------------------------------------------------------------

    fn all_terminal(&self) -> bool {
        self.handles.iter().all(|h| h.state().is_terminal())
    }

    fn publish(&self) {
        let snapshot = StatusSnapshot {
            processes: self.handles.iter().map(ProcessStatus::from_handle).collect(),
            shutting_down: self.shutting_down,
        };

        self.status_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }

    /// Hand a failed re-spawn to every `restart` caller waiting on `idx`
    fn fail_restart_waiters(&mut self, idx: usize, error: &VigilError) {
        let id = self.handles[idx].id().to_string();
        for waiter in self.waiters.iter_mut() {
            if waiter.restart
                && waiter.error.is_none()
                && waiter.targets.iter().any(|&(target, _)| target == idx)
            {
                let reason = match error {
                    VigilError::Spawn(_, reason) => reason.clone(),
                    other => other.to_string(),
                };
                waiter.error = Some(VigilError::Spawn(id.clone(), reason));
            }
        }
    }

    fn resolve_waiters(&mut self) {
        let (done, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.waiters)
            .into_iter()
            .partition(|w| w.is_satisfied(&self.handles));
        self.waiters = pending;

        for waiter in done {
            waiter.resolve();
        }
    }
}
