use crate::config::ProcessSpec;
use crate::process::types::ExitCause;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Outcome of consulting the restart policy after an exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    RestartNow,
    RestartAfter(Duration),
    DoNotRestart(DoNotRestartReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoNotRestartReason {
    /// autorestart is disabled
    Manual,
    /// The exit followed an explicit stop
    Requested,
    /// Too many restarts inside the rolling window; the handle is fatally failed
    RestartLimitExceeded,
}

impl std::fmt::Display for DoNotRestartReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DoNotRestartReason::Manual => write!(f, "manual"),
            DoNotRestartReason::Requested => write!(f, "requested"),
            DoNotRestartReason::RestartLimitExceeded => write!(f, "restart-limit-exceeded"),
        }
    }
}

/// Restart policy configuration
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Whether automatic restart is enabled
    pub enabled: bool,
    /// Maximum number of restarts within the time window
    pub max_restarts: usize,
    /// Rolling window for counting restarts
    pub window: Duration,
    /// Delay before the first restart
    pub initial_delay: Duration,
    /// Multiplier applied per consecutive failure
    pub backoff_base: f64,
    /// Cap on the computed delay
    pub max_delay: Duration,
}

impl RestartPolicy {
    pub fn from_spec(spec: &ProcessSpec) -> Self {
        Self {
            enabled: spec.autorestart,
            max_restarts: spec.max_restarts,
            window: spec.restart_window,
            initial_delay: spec.restart_delay,
            backoff_base: spec.exp_backoff_base,
            max_delay: spec.max_restart_delay,
        }
    }

    /// Decide what to do after an exit.
    ///
    /// The tracker must already contain the exit being decided on, so the
    /// windowed count includes it.
    pub fn decide(&self, tracker: &RestartTracker, cause: ExitCause, now: Instant) -> RestartDecision {
        if !self.enabled {
            return RestartDecision::DoNotRestart(DoNotRestartReason::Manual);
        }

        if cause == ExitCause::Requested {
            return RestartDecision::DoNotRestart(DoNotRestartReason::Requested);
        }

        if tracker.count_recent_restarts(self.window, now) >= self.max_restarts {
            return RestartDecision::DoNotRestart(DoNotRestartReason::RestartLimitExceeded);
        }

        match self.calculate_delay(tracker.consecutive_failures()) {
            delay if delay.is_zero() => RestartDecision::RestartNow,
            delay => RestartDecision::RestartAfter(delay),
        }
    }

    /// Exponential backoff: initial * base^(failures - 1), capped at max_delay
    pub fn calculate_delay(&self, consecutive_failures: u32) -> Duration {
        let exponent = consecutive_failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.backoff_base.powi(exponent);
        let nanos = self.initial_delay.as_nanos() as f64 * factor;

        if !nanos.is_finite() || nanos >= self.max_delay.as_nanos() as f64 {
            self.max_delay
        } else {
            Duration::from_nanos(nanos as u64)
        }
    }
}

/// Tracks restart history and the failure streak for a process
#[derive(Debug, Clone)]
pub struct RestartTracker {
    /// Timestamps of recent restart-triggering exits (ring buffer)
    restart_times: VecDeque<Instant>,
    capacity: usize,
    consecutive_failures: u32,
}

impl RestartTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            restart_times: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
            consecutive_failures: 0,
        }
    }

    /// Record a restart-triggering exit
    pub fn record_restart(&mut self, now: Instant) {
        if self.restart_times.len() == self.capacity {
            self.restart_times.pop_front();
        }
        self.restart_times.push_back(now);
    }

    /// Update the failure streak after a run of the given length
    pub fn record_run(&mut self, uptime: Duration, min_uptime: Duration, requested: bool) {
        if uptime >= min_uptime {
            self.consecutive_failures = 0;
        } else if !requested {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn reset_failures(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Count restarts within `window` of `now`
    pub fn count_recent_restarts(&self, window: Duration, now: Instant) -> usize {
        self.restart_times
            .iter()
            .filter(|&&time| now.saturating_duration_since(time) < window)
            .count()
    }

    /// Forget the window history and the failure streak (manual intervention)
    pub fn clear(&mut self) {
        self.restart_times.clear();
        self.consecutive_failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_restarts: usize) -> RestartPolicy {
        let mut spec = ProcessSpec::new("test", "/bin/true");
        spec.max_restarts = max_restarts;
        spec.restart_window = Duration::from_secs(60);
        spec.min_uptime = Duration::from_secs(10);
        spec.restart_delay = Duration::from_secs(5);
        spec.exp_backoff_base = 2.0;
        spec.max_restart_delay = Duration::from_secs(60);
        RestartPolicy::from_spec(&spec)
    }

    fn crash(tracker: &mut RestartTracker, now: Instant) {
        tracker.record_run(Duration::from_secs(1), Duration::from_secs(10), false);
        tracker.record_restart(now);
    }

    #[test]
    fn test_autorestart_disabled() {
        let mut policy = policy(3);
        policy.enabled = false;
        let mut tracker = RestartTracker::new(3);
        let now = Instant::now();
        crash(&mut tracker, now);

        assert_eq!(
            policy.decide(&tracker, ExitCause::Crashed, now),
            RestartDecision::DoNotRestart(DoNotRestartReason::Manual)
        );
    }

    #[test]
    fn test_requested_exit_not_restarted() {
        let policy = policy(3);
        let tracker = RestartTracker::new(3);
        assert_eq!(
            policy.decide(&tracker, ExitCause::Requested, Instant::now()),
            RestartDecision::DoNotRestart(DoNotRestartReason::Requested)
        );
    }

    #[test]
    fn test_third_crash_in_window_is_fatal() {
        let policy = policy(3);
        let mut tracker = RestartTracker::new(3);
        let t0 = Instant::now();

        crash(&mut tracker, t0);
        assert_eq!(
            policy.decide(&tracker, ExitCause::Crashed, t0),
            RestartDecision::RestartAfter(Duration::from_secs(5))
        );

        let t1 = t0 + Duration::from_secs(1);
        crash(&mut tracker, t1);
        assert_eq!(
            policy.decide(&tracker, ExitCause::Crashed, t1),
            RestartDecision::RestartAfter(Duration::from_secs(10))
        );

        let t2 = t0 + Duration::from_secs(2);
        crash(&mut tracker, t2);
        assert_eq!(
            policy.decide(&tracker, ExitCause::Crashed, t2),
            RestartDecision::DoNotRestart(DoNotRestartReason::RestartLimitExceeded)
        );

        // Still exhausted later inside the same window
        let t3 = t0 + Duration::from_secs(3);
        assert_eq!(
            policy.decide(&tracker, ExitCause::Crashed, t3),
            RestartDecision::DoNotRestart(DoNotRestartReason::RestartLimitExceeded)
        );
    }

    #[test]
    fn test_window_expiry_frees_budget() {
        let policy = policy(2);
        let mut tracker = RestartTracker::new(2);
        let t0 = Instant::now();

        crash(&mut tracker, t0);
        crash(&mut tracker, t0 + Duration::from_secs(1));
        assert!(matches!(
            policy.decide(&tracker, ExitCause::Crashed, t0 + Duration::from_secs(1)),
            RestartDecision::DoNotRestart(_)
        ));

        let later = t0 + Duration::from_secs(120);
        crash(&mut tracker, later);
        assert!(matches!(
            policy.decide(&tracker, ExitCause::Crashed, later),
            RestartDecision::RestartAfter(_)
        ));
    }

    #[test]
    fn test_backoff_monotonic_then_capped() {
        let policy = policy(10);
        let delays: Vec<Duration> = (0..10).map(|n| policy.calculate_delay(n)).collect();

        assert_eq!(delays[0], Duration::from_secs(5));
        assert_eq!(delays[1], Duration::from_secs(5));
        assert_eq!(delays[2], Duration::from_secs(10));
        assert_eq!(delays[3], Duration::from_secs(20));
        assert_eq!(delays[4], Duration::from_secs(40));
        assert_eq!(delays[5], Duration::from_secs(60));

        for pair in delays.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
        assert!(delays[5..].iter().all(|d| *d == Duration::from_secs(60)));
    }

    #[test]
    fn test_backoff_huge_exponent_saturates() {
        let policy = policy(10);
        assert_eq!(policy.calculate_delay(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_fixed_backoff_with_unit_base() {
        let mut policy = policy(10);
        policy.backoff_base = 1.0;
        assert_eq!(policy.calculate_delay(1), Duration::from_secs(5));
        assert_eq!(policy.calculate_delay(8), Duration::from_secs(5));
    }

    #[test]
    fn test_successful_run_resets_failures() {
        let mut tracker = RestartTracker::new(5);
        tracker.record_run(Duration::from_secs(1), Duration::from_secs(10), false);
        tracker.record_run(Duration::from_secs(1), Duration::from_secs(10), false);
        assert_eq!(tracker.consecutive_failures(), 2);

        tracker.record_run(Duration::from_secs(10), Duration::from_secs(10), false);
        assert_eq!(tracker.consecutive_failures(), 0);
    }

    #[test]
    fn test_requested_short_run_does_not_count() {
        let mut tracker = RestartTracker::new(5);
        tracker.record_run(Duration::from_secs(1), Duration::from_secs(10), true);
        assert_eq!(tracker.consecutive_failures(), 0);
    }

    #[test]
    fn test_ring_buffer_is_bounded() {
        let mut tracker = RestartTracker::new(3);
        let now = Instant::now();
        for i in 0..10 {
            tracker.record_restart(now + Duration::from_millis(i));
        }
        assert_eq!(tracker.count_recent_restarts(Duration::from_secs(60), now), 3);
    }

    #[test]
    fn test_clear() {
        let mut tracker = RestartTracker::new(3);
        let now = Instant::now();
        crash(&mut tracker, now);
        tracker.clear();
        assert_eq!(tracker.consecutive_failures(), 0);
        assert_eq!(tracker.count_recent_restarts(Duration::from_secs(60), now), 0);
    }
}
