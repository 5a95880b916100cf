//! Per-dependency circuit breaker.
//!
//! State machine: CLOSED → OPEN after 5 consecutive failures, OPEN →
//! HALF_OPEN after a 30 s cool-down (single probe), HALF_OPEN → CLOSED on
//! probe success, back to OPEN on probe failure. All state lives in atomics
//! so `allow()` is callable from any task without locking.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::Duration;

/// Consecutive failures that trip the breaker.
const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
/// How long the breaker stays OPEN before letting one probe through.
const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(30);

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

pub struct CircuitBreaker {
    name: &'static str,
    failure_threshold: u32,
    open_timeout_ms: u64,
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    opened_at_ms: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: &'static str) -> Self {
        Self::with_settings(name, DEFAULT_FAILURE_THRESHOLD, DEFAULT_OPEN_TIMEOUT)
    }

    pub fn with_settings(name: &'static str, failure_threshold: u32, open_timeout: Duration) -> Self {
        Self {
            name,
            failure_threshold,
            open_timeout_ms: open_timeout.as_millis() as u64,
            state: AtomicU8::new(STATE_CLOSED),
            consecutive_failures: AtomicU32::new(0),
            opened_at_ms: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> BreakerState {
        match self.state.load(Ordering::Acquire) {
            STATE_OPEN => BreakerState::Open,
            STATE_HALF_OPEN => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }

    /// Whether a call may proceed right now.
    ///
    /// While OPEN, the first caller after the cool-down wins the CAS to
    /// HALF_OPEN and becomes the probe; everyone else keeps failing fast
    /// until the probe reports back.
    pub fn allow(&self) -> bool {
        match self.state.load(Ordering::Acquire) {
            STATE_CLOSED => true,
            STATE_HALF_OPEN => false,
            _ => {
                let opened = self.opened_at_ms.load(Ordering::Acquire);
                if now_ms().saturating_sub(opened) < self.open_timeout_ms {
                    return false;
                }
                self.state
                    .compare_exchange(
                        STATE_OPEN,
                        STATE_HALF_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
            }
        }
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        let prev = self.state.swap(STATE_CLOSED, Ordering::AcqRel);
        if prev != STATE_CLOSED {
            tracing::info!(breaker = self.name, "circuit breaker closed");
        }
    }

    pub fn record_failure(&self) {
        let state = self.state.load(Ordering::Acquire);
        if state == STATE_HALF_OPEN {
            // Probe failed: reopen and restart the cool-down.
            self.opened_at_ms.store(now_ms(), Ordering::Release);
            self.state.store(STATE_OPEN, Ordering::Release);
            tracing::warn!(breaker = self.name, "probe failed, circuit breaker reopened");
            return;
        }

        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= self.failure_threshold && state == STATE_CLOSED {
            self.opened_at_ms.store(now_ms(), Ordering::Release);
            self.state.store(STATE_OPEN, Ordering::Release);
            tracing::warn!(
                breaker = self.name,
                failures,
                "failure threshold reached, circuit breaker opened"
            );
        }
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold_failures() {
        let b = CircuitBreaker::with_settings("test", 3, Duration::from_secs(30));
        assert!(b.allow());
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Closed);
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.allow());
    }

    #[test]
    fn success_resets_failure_streak() {
        let b = CircuitBreaker::with_settings("test", 3, Duration::from_secs(30));
        b.record_failure();
        b.record_failure();
        b.record_success();
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_admits_exactly_one_probe() {
        let b = CircuitBreaker::with_settings("test", 1, Duration::from_millis(0));
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);

        // Cool-down of zero: first allow() wins the probe slot.
        assert!(b.allow());
        assert_eq!(b.state(), BreakerState::HalfOpen);
        assert!(!b.allow());

        b.record_success();
        assert_eq!(b.state(), BreakerState::Closed);
        assert!(b.allow());
    }

    #[test]
    fn failed_probe_reopens() {
        let b = CircuitBreaker::with_settings("test", 1, Duration::from_millis(0));
        b.record_failure();
        assert!(b.allow());
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
    }
}
