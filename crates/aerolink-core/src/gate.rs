//! Failure gate for upstream reconnection.
//!
//! Tracks consecutive upstream failures and decides when the next reconnect
//! attempt is permitted. Crossing the failure threshold opens the gate for a
//! cooldown window; a single probe attempt is allowed once the window expires
//! (half-open), and only a successful inbound read closes the gate again.
//!
//! The gate is the sole backoff authority: sub-threshold failures get a short
//! exponentially growing delay, threshold crossings get the full cooldown.

use std::time::Duration;
use tokio::time::Instant;

/// Consecutive failures before the gate opens.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// How long the gate stays open before permitting a probe.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);

/// Base delay between sub-threshold reconnect attempts.
pub const DEFAULT_BASE_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Failure gate state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    /// Reconnect attempts pass through (possibly after a short delay).
    Closed,

    /// Too many consecutive failures - attempts blocked until the cooldown expires.
    Open,

    /// Cooldown expired - exactly one probe attempt is in flight.
    HalfOpen,
}

/// Outcome of asking the gate whether a reconnect attempt may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    /// Attempt now.
    Ready,

    /// Wait this long, then ask again.
    Wait(Duration),
}

/// Failure-containment state machine gating upstream reconnects.
#[derive(Debug)]
pub struct FailureGate {
    state: GateState,
    failures: u32,
    threshold: u32,
    cooldown: Duration,
    base_delay: Duration,
    retry_at: Option<Instant>,
}

impl FailureGate {
    /// Create a closed gate.
    #[must_use]
    pub fn new(threshold: u32, cooldown: Duration, base_delay: Duration) -> Self {
        Self {
            state: GateState::Closed,
            failures: 0,
            threshold: threshold.max(1),
            cooldown,
            base_delay,
            retry_at: None,
        }
    }

    /// Record a failed read or reconnect attempt.
    ///
    /// Returns `true` when this failure opened the gate (the caller emits the
    /// gate-open event exactly once per opening). A failure while already
    /// `Open` is a no-op and does not extend the cooldown; a failure while
    /// `HalfOpen` re-opens with a fresh cooldown.
    pub fn record_failure(&mut self, now: Instant) -> bool {
        self.failures = self.failures.saturating_add(1);

        match self.state {
            GateState::Closed => {
                if self.failures >= self.threshold {
                    self.state = GateState::Open;
                    self.retry_at = Some(now + self.cooldown);
                    true
                } else {
                    self.retry_at = Some(now + self.short_delay());
                    false
                }
            }
            GateState::HalfOpen => {
                self.state = GateState::Open;
                self.retry_at = Some(now + self.cooldown);
                true
            }
            GateState::Open => false,
        }
    }

    /// Record a successful inbound read.
    ///
    /// Resets the failure counter and forces the gate closed. Returns `true`
    /// when the gate was not closed before (the caller emits the gate-closed
    /// event). A successful reconnect handshake alone does not reset anything;
    /// only delivered data does.
    pub fn record_success(&mut self) -> bool {
        let was_open = self.state != GateState::Closed;
        self.state = GateState::Closed;
        self.failures = 0;
        self.retry_at = None;
        was_open
    }

    /// Ask whether a reconnect attempt may proceed at `now`.
    ///
    /// Advances `Open` to `HalfOpen` when the cooldown has expired, granting
    /// exactly one probe. `Retry::Wait` carries the remaining wait.
    pub fn ready_to_retry(&mut self, now: Instant) -> Retry {
        match self.retry_at {
            None => Retry::Ready,
            Some(at) if now >= at => {
                if self.state == GateState::Open {
                    self.state = GateState::HalfOpen;
                }
                self.retry_at = None;
                Retry::Ready
            }
            Some(at) => Retry::Wait(at - now),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> GateState {
        self.state
    }

    /// Consecutive failure count.
    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.failures
    }

    /// Configured cooldown window.
    #[must_use]
    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Delay before the next sub-threshold attempt: base * 2^(failures-1),
    /// capped at the cooldown so short retries never exceed the open window.
    fn short_delay(&self) -> Duration {
        let exp = self.failures.saturating_sub(1).min(16);
        (self.base_delay * 2u32.pow(exp)).min(self.cooldown)
    }
}

impl Default for FailureGate {
    fn default() -> Self {
        Self::new(
            DEFAULT_FAILURE_THRESHOLD,
            DEFAULT_COOLDOWN,
            DEFAULT_BASE_RETRY_DELAY,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> FailureGate {
        FailureGate::new(3, Duration::from_secs(30), Duration::from_secs(2))
    }

    #[test]
    fn test_new_gate_is_closed_and_ready() {
        let mut g = gate();
        assert_eq!(g.state(), GateState::Closed);
        assert_eq!(g.failure_count(), 0);
        assert_eq!(g.ready_to_retry(Instant::now()), Retry::Ready);
    }

    #[test]
    fn test_threshold_opens_gate() {
        let mut g = gate();
        let t0 = Instant::now();

        assert!(!g.record_failure(t0));
        assert!(!g.record_failure(t0));
        assert_eq!(g.state(), GateState::Closed);

        // Third consecutive failure crosses the threshold.
        assert!(g.record_failure(t0));
        assert_eq!(g.state(), GateState::Open);
        assert_eq!(g.failure_count(), 3);
    }

    #[test]
    fn test_open_gate_blocks_until_cooldown_expires() {
        let mut g = gate();
        let t0 = Instant::now();
        for _ in 0..3 {
            g.record_failure(t0);
        }

        match g.ready_to_retry(t0 + Duration::from_secs(29)) {
            Retry::Wait(remaining) => assert_eq!(remaining, Duration::from_secs(1)),
            Retry::Ready => panic!("gate permitted a retry before the cooldown expired"),
        }
        assert_eq!(g.state(), GateState::Open);
    }

    #[test]
    fn test_cooldown_expiry_grants_one_probe() {
        let mut g = gate();
        let t0 = Instant::now();
        for _ in 0..3 {
            g.record_failure(t0);
        }

        let t1 = t0 + Duration::from_secs(31);
        assert_eq!(g.ready_to_retry(t1), Retry::Ready);
        assert_eq!(g.state(), GateState::HalfOpen);
    }

    #[test]
    fn test_half_open_failure_reopens_with_fresh_cooldown() {
        let mut g = gate();
        let t0 = Instant::now();
        for _ in 0..3 {
            g.record_failure(t0);
        }
        let t1 = t0 + Duration::from_secs(31);
        g.ready_to_retry(t1);
        assert_eq!(g.state(), GateState::HalfOpen);

        assert!(g.record_failure(t1));
        assert_eq!(g.state(), GateState::Open);
        match g.ready_to_retry(t1 + Duration::from_secs(29)) {
            Retry::Wait(remaining) => assert_eq!(remaining, Duration::from_secs(1)),
            Retry::Ready => panic!("fresh cooldown not applied after half-open failure"),
        }
    }

    #[test]
    fn test_failure_while_open_does_not_extend_cooldown() {
        let mut g = gate();
        let t0 = Instant::now();
        for _ in 0..3 {
            g.record_failure(t0);
        }

        // Extra failures while open are a no-op.
        assert!(!g.record_failure(t0 + Duration::from_secs(10)));
        assert_eq!(g.ready_to_retry(t0 + Duration::from_secs(31)), Retry::Ready);
    }

    #[test]
    fn test_success_closes_and_resets() {
        let mut g = gate();
        let t0 = Instant::now();
        for _ in 0..3 {
            g.record_failure(t0);
        }

        assert!(g.record_success());
        assert_eq!(g.state(), GateState::Closed);
        assert_eq!(g.failure_count(), 0);
        assert_eq!(g.ready_to_retry(t0 + Duration::from_secs(60)), Retry::Ready);
    }

    #[test]
    fn test_sub_threshold_success_resets_silently() {
        let mut g = gate();
        let t0 = Instant::now();
        g.record_failure(t0);

        // The gate never opened, so no gate-closed notification is due.
        assert!(!g.record_success());
        assert_eq!(g.failure_count(), 0);
    }

    #[test]
    fn test_sub_threshold_backoff_grows_exponentially() {
        let mut g = gate();
        let t0 = Instant::now();

        g.record_failure(t0);
        match g.ready_to_retry(t0) {
            Retry::Wait(d) => assert_eq!(d, Duration::from_secs(2)),
            Retry::Ready => panic!("expected short backoff after first failure"),
        }

        // Elapse the first delay, then fail again.
        let t1 = t0 + Duration::from_secs(2);
        assert_eq!(g.ready_to_retry(t1), Retry::Ready);
        g.record_failure(t1);
        match g.ready_to_retry(t1) {
            Retry::Wait(d) => assert_eq!(d, Duration::from_secs(4)),
            Retry::Ready => panic!("expected doubled backoff after second failure"),
        }
    }

    #[test]
    fn test_short_backoff_capped_at_cooldown() {
        let mut g = FailureGate::new(100, Duration::from_secs(10), Duration::from_secs(2));
        let mut now = Instant::now();
        for _ in 0..50 {
            g.record_failure(now);
            now += Duration::from_secs(60);
        }
        g.record_failure(now);
        match g.ready_to_retry(now) {
            Retry::Wait(d) => assert!(d <= Duration::from_secs(10)),
            Retry::Ready => panic!("expected capped backoff"),
        }
    }

    #[test]
    fn test_default_tuning() {
        let g = FailureGate::default();
        assert_eq!(g.cooldown(), Duration::from_secs(30));
        assert_eq!(g.state(), GateState::Closed);
    }
}
