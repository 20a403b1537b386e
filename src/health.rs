//! Failure accounting and timed revival for a single upstream.
//!
//! The tracker is a sliding-window circuit breaker without probing:
//! failures inside `error_time` accumulate until `max_errors` is reached and
//! the upstream is declared dead. A dead upstream comes back on its own once
//! `revive_time` has elapsed. Every read re-evaluates the state against the
//! supplied clock reading, so no timers are involved.

use std::time::{Duration, Instant};

use serde::Serialize;

/// Health policy shared by every upstream of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpstreamLimits {
    /// Failures within `error_time` that mark an upstream dead (at least 1).
    pub max_errors: u32,
    /// Length of the window in which failures accumulate.
    pub error_time: Duration,
    /// How long a dead upstream stays dead.
    pub revive_time: Duration,
    /// How long a failing address family is kept out of rotation.
    pub address_cooldown: Duration,
}

impl Default for UpstreamLimits {
    fn default() -> Self {
        Self {
            max_errors: crate::config::DEFAULT_MAX_ERRORS,
            error_time: crate::config::DEFAULT_ERROR_TIME,
            revive_time: crate::config::DEFAULT_REVIVE_TIME,
            address_cooldown: crate::config::DEFAULT_REVIVE_TIME,
        }
    }
}

/// Liveness of an upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Eligible for selection.
    Alive,
    /// Quarantined until the revive time has passed.
    Dead,
}

/// Per-upstream failure counter and dead/alive state.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    state: HealthState,
    errors: u32,
    window_start: Instant,
    dead_since: Option<Instant>,
}

impl HealthTracker {
    /// Creates an alive tracker whose first error window starts at `now`.
    pub fn new(now: Instant) -> Self {
        Self {
            state: HealthState::Alive,
            errors: 0,
            window_start: now,
            dead_since: None,
        }
    }

    /// Current state after applying the revival check.
    pub fn state(&mut self, now: Instant, limits: &UpstreamLimits) -> HealthState {
        self.refresh(now, limits);
        self.state
    }

    /// Returns `true` if the upstream is alive at `now`.
    pub fn is_alive(&mut self, now: Instant, limits: &UpstreamLimits) -> bool {
        self.state(now, limits) == HealthState::Alive
    }

    /// Errors counted in the current window. Frozen while dead.
    pub fn errors(&self) -> u32 {
        self.errors
    }

    /// Records one failure.
    ///
    /// Returns `true` if this failure moved the upstream from alive to dead.
    pub fn record_failure(&mut self, now: Instant, limits: &UpstreamLimits) -> bool {
        self.refresh(now, limits);
        if self.state == HealthState::Dead {
            return false;
        }

        if now.saturating_duration_since(self.window_start) > limits.error_time {
            self.errors = 0;
            self.window_start = now;
        }

        self.errors = self.errors.saturating_add(1);
        if self.errors >= limits.max_errors {
            self.state = HealthState::Dead;
            self.dead_since = Some(now);
            return true;
        }

        false
    }

    /// Records a success, forgetting stale failures. Has no effect while dead.
    pub fn record_success(&mut self, now: Instant, limits: &UpstreamLimits) {
        self.refresh(now, limits);
        if self.state == HealthState::Alive {
            self.errors = 0;
        }
    }

    /// Revives a dead tracker once its revive time has elapsed.
    ///
    /// Returns `true` if the tracker was revived by this call.
    pub fn refresh(&mut self, now: Instant, limits: &UpstreamLimits) -> bool {
        match (self.state, self.dead_since) {
            (HealthState::Dead, Some(since))
                if now.saturating_duration_since(since) >= limits.revive_time =>
            {
                self.state = HealthState::Alive;
                self.errors = 0;
                self.window_start = now;
                self.dead_since = None;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(max_errors: u32) -> UpstreamLimits {
        UpstreamLimits {
            max_errors,
            error_time: Duration::from_secs(2),
            revive_time: Duration::from_millis(500),
            address_cooldown: Duration::from_millis(500),
        }
    }

    #[test]
    fn new_tracker_starts_alive() {
        let now = Instant::now();
        let mut tracker = HealthTracker::new(now);
        assert!(tracker.is_alive(now, &limits(3)));
        assert_eq!(tracker.errors(), 0);
    }

    #[test]
    fn dies_at_threshold() {
        let now = Instant::now();
        let limits = limits(3);
        let mut tracker = HealthTracker::new(now);

        assert!(!tracker.record_failure(now, &limits));
        assert!(!tracker.record_failure(now, &limits));
        assert!(tracker.record_failure(now, &limits));
        assert_eq!(tracker.state(now, &limits), HealthState::Dead);
    }

    #[test]
    fn failures_while_dead_are_ignored() {
        let now = Instant::now();
        let limits = limits(2);
        let mut tracker = HealthTracker::new(now);

        tracker.record_failure(now, &limits);
        assert!(tracker.record_failure(now, &limits));
        for _ in 0..100 {
            assert!(!tracker.record_failure(now, &limits));
        }
        assert_eq!(tracker.errors(), 2);
    }

    #[test]
    fn expired_window_restarts_count() {
        let start = Instant::now();
        let limits = limits(2);
        let mut tracker = HealthTracker::new(start);

        tracker.record_failure(start, &limits);
        let later = start + Duration::from_secs(3);
        assert!(!tracker.record_failure(later, &limits));
        assert_eq!(tracker.errors(), 1);
        assert!(tracker.is_alive(later, &limits));
    }

    #[test]
    fn failures_inside_window_accumulate() {
        let start = Instant::now();
        let limits = limits(2);
        let mut tracker = HealthTracker::new(start);

        tracker.record_failure(start, &limits);
        assert!(tracker.record_failure(start + Duration::from_secs(1), &limits));
    }

    #[test]
    fn revives_after_revive_time() {
        let start = Instant::now();
        let limits = limits(1);
        let mut tracker = HealthTracker::new(start);

        tracker.record_failure(start, &limits);
        assert!(!tracker.is_alive(start + Duration::from_millis(499), &limits));

        let revived_at = start + Duration::from_millis(500);
        assert!(tracker.is_alive(revived_at, &limits));
        assert_eq!(tracker.errors(), 0);

        // A fresh window begins at revival.
        assert!(tracker.record_failure(revived_at, &limits));
    }

    #[test]
    fn failure_after_revive_time_counts_against_revived_state() {
        let start = Instant::now();
        let limits = limits(2);
        let mut tracker = HealthTracker::new(start);

        tracker.record_failure(start, &limits);
        tracker.record_failure(start, &limits);

        let later = start + Duration::from_secs(1);
        assert!(!tracker.record_failure(later, &limits));
        assert_eq!(tracker.errors(), 1);
        assert!(tracker.is_alive(later, &limits));
    }

    #[test]
    fn success_resets_errors_only_when_alive() {
        let now = Instant::now();
        let limits = limits(2);
        let mut tracker = HealthTracker::new(now);

        tracker.record_failure(now, &limits);
        tracker.record_success(now, &limits);
        assert_eq!(tracker.errors(), 0);

        tracker.record_failure(now, &limits);
        tracker.record_failure(now, &limits);
        tracker.record_success(now, &limits);
        assert_eq!(tracker.errors(), 2);
        assert!(!tracker.is_alive(now, &limits));
    }
}
