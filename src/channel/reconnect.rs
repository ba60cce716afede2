//! Bounded exponential backoff.
//!
//! # State Machine
//!
//! ```text
//!          schedule                fire
//!   Idle ───────────► Waiting ───────────► Attempting
//!    ▲                   ▲                     │
//!    │ on_connected      └──── schedule ───────┤
//!    │ / cancel                                │ schedule (count == max)
//!    └─────────────────────────────────────────┴──────────► GivenUp
//! ```
//!
//! The delay before retry `n` (zero-based) is `min(base * 2^n, cap)`.

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

// ============================================================================
// ReconnectPolicy
// ============================================================================

/// Backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first retry.
    pub base: Duration,
    /// Ceiling of the delay.
    pub cap: Duration,
    /// Retries allowed before giving up.
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    /// Creates a policy.
    #[inline]
    #[must_use]
    pub const fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            cap,
            max_attempts,
        }
    }

    /// Delay before the retry that follows `count` earlier retries.
    #[must_use]
    pub fn delay_for(&self, count: u32) -> Duration {
        let factor = 2u32.saturating_pow(count);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

// ============================================================================
// ReconnectPhase
// ============================================================================

/// Phase of the reconnect state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconnectPhase {
    /// Nothing scheduled.
    #[default]
    Idle,
    /// Retry timer armed.
    Waiting,
    /// Retry in flight.
    Attempting,
    /// Retries exhausted.
    GivenUp,
}

/// Result of reporting an unexpected closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// Retry armed.
    Scheduled {
        /// One-based retry number.
        attempt: u32,
        /// Wait before the retry.
        delay: Duration,
    },
    /// A retry is already armed.
    AlreadyWaiting,
    /// No retries left.
    GivenUp {
        /// Retries performed.
        attempts: u32,
    },
}

// ============================================================================
// ReconnectController
// ============================================================================

/// Retry scheduler for one channel.
#[derive(Debug, Clone)]
pub struct ReconnectController {
    policy: ReconnectPolicy,
    phase: ReconnectPhase,
    /// Retries scheduled since the last successful connect.
    count: u32,
    /// When the armed retry fires.
    deadline: Option<Instant>,
}

impl ReconnectController {
    /// Creates an idle controller.
    #[inline]
    #[must_use]
    pub const fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            phase: ReconnectPhase::Idle,
            count: 0,
            deadline: None,
        }
    }

    /// Returns the backoff parameters.
    #[inline]
    #[must_use]
    pub const fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Returns the current phase.
    #[inline]
    #[must_use]
    pub const fn phase(&self) -> ReconnectPhase {
        self.phase
    }

    /// Retries scheduled since the last successful connect.
    #[inline]
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.count
    }

    /// When the armed retry fires, if any.
    #[inline]
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns `true` while a retry timer is armed.
    #[inline]
    #[must_use]
    pub const fn is_waiting(&self) -> bool {
        matches!(self.phase, ReconnectPhase::Waiting)
    }

    /// Delay the next scheduled retry would use.
    #[inline]
    #[must_use]
    pub fn next_delay(&self) -> Duration {
        self.policy.delay_for(self.count)
    }

    /// Reports an unexpected closure or failed open.
    pub fn schedule(&mut self, now: Instant) -> ScheduleOutcome {
        match self.phase {
            ReconnectPhase::Waiting => return ScheduleOutcome::AlreadyWaiting,
            ReconnectPhase::GivenUp => {
                return ScheduleOutcome::GivenUp {
                    attempts: self.count,
                };
            }
            ReconnectPhase::Idle | ReconnectPhase::Attempting => {}
        }

        if self.count >= self.policy.max_attempts {
            self.phase = ReconnectPhase::GivenUp;
            self.deadline = None;
            debug!(attempts = self.count, "reconnect attempts exhausted");
            return ScheduleOutcome::GivenUp {
                attempts: self.count,
            };
        }

        let delay = self.next_delay();
        self.count += 1;
        self.deadline = Some(now + delay);
        self.phase = ReconnectPhase::Waiting;
        debug!(
            attempt = self.count,
            delay_ms = delay.as_millis() as u64,
            "reconnect scheduled"
        );

        ScheduleOutcome::Scheduled {
            attempt: self.count,
            delay,
        }
    }

    /// Moves to [`ReconnectPhase::Attempting`] when the armed retry is due.
    ///
    /// Returns `true` when the caller must start an open attempt.
    pub fn fire(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(due) if self.is_waiting() && now >= due => {
                self.deadline = None;
                self.phase = ReconnectPhase::Attempting;
                true
            }
            _ => false,
        }
    }

    /// Records a successful connect.
    pub fn on_connected(&mut self) {
        self.reset();
    }

    /// Cancels any armed retry and clears the counter.
    pub fn reset(&mut self) {
        self.phase = ReconnectPhase::Idle;
        self.count = 0;
        self.deadline = None;
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    fn controller() -> ReconnectController {
        ReconnectController::new(ReconnectPolicy::new(
            Duration::from_secs(1),
            Duration::from_secs(30),
            5,
        ))
    }

    #[test]
    fn test_delay_sequence() {
        let policy = controller().policy;
        let delays: Vec<u64> = (0..7).map(|n| policy.delay_for(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_first_retry_waits_base_delay() {
        let now = Instant::now();
        let mut ctl = controller();

        let outcome = ctl.schedule(now);
        assert_eq!(
            outcome,
            ScheduleOutcome::Scheduled {
                attempt: 1,
                delay: Duration::from_secs(1)
            }
        );
        assert!(!ctl.fire(now));
        assert!(!ctl.fire(now + Duration::from_millis(999)));
        assert!(ctl.fire(now + Duration::from_secs(1)));
        assert_eq!(ctl.phase(), ReconnectPhase::Attempting);
    }

    #[test]
    fn test_schedule_while_waiting_is_ignored() {
        let now = Instant::now();
        let mut ctl = controller();
        ctl.schedule(now);
        assert_eq!(ctl.schedule(now), ScheduleOutcome::AlreadyWaiting);
        assert_eq!(ctl.attempts(), 1);
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let mut now = Instant::now();
        let mut ctl = controller();

        for expected in 1..=5 {
            let ScheduleOutcome::Scheduled { attempt, delay } = ctl.schedule(now) else {
                panic!("expected retry {expected}");
            };
            assert_eq!(attempt, expected);
            now += delay;
            assert!(ctl.fire(now));
        }

        assert_eq!(ctl.schedule(now), ScheduleOutcome::GivenUp { attempts: 5 });
        assert_eq!(ctl.phase(), ReconnectPhase::GivenUp);
        assert_eq!(ctl.deadline(), None);
        assert_eq!(ctl.schedule(now), ScheduleOutcome::GivenUp { attempts: 5 });
    }

    #[test]
    fn test_connect_resets_counter_and_cancels_timer() {
        let now = Instant::now();
        let mut ctl = controller();
        ctl.schedule(now);
        ctl.on_connected();

        assert_eq!(ctl.attempts(), 0);
        assert_eq!(ctl.deadline(), None);
        assert_eq!(ctl.phase(), ReconnectPhase::Idle);
        assert!(!ctl.fire(now + Duration::from_secs(60)));
    }

    #[test]
    fn test_reset_after_give_up() {
        let mut ctl = ReconnectController::new(ReconnectPolicy::new(
            Duration::from_secs(1),
            Duration::from_secs(1),
            0,
        ));
        assert_eq!(
            ctl.schedule(Instant::now()),
            ScheduleOutcome::GivenUp { attempts: 0 }
        );
        ctl.reset();
        assert_eq!(ctl.phase(), ReconnectPhase::Idle);
    }

    proptest! {
        #[test]
        fn test_delays_are_monotonic_and_capped(
            base_ms in 1u64..5_000,
            cap_factor in 1u64..64,
            count in 0u32..40,
        ) {
            let base = Duration::from_millis(base_ms);
            let cap = Duration::from_millis(base_ms * cap_factor);
            let policy = ReconnectPolicy::new(base, cap, 10);

            let current = policy.delay_for(count);
            let next = policy.delay_for(count + 1);
            prop_assert!(current <= next);
            prop_assert!(next <= cap);
            prop_assert!(current >= base.min(cap));
        }
    }
}
