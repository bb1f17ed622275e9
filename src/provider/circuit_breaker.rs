//! Per-adapter circuit breaker.
//!
//! State is an atomic enum tag plus a failure counter — the one genuinely
//! shared, concurrently-mutated piece of adapter state. `std::sync::Mutex`
//! guarding a small plain struct gets the same safety with far less code
//! than hand-rolled CAS loops, and the breaker is only ever touched for the
//! duration of a field read/write, never across an await point, so lock
//! contention isn't a concern.

use std::sync::Mutex;
use std::time::{Duration, Instant};

const FAILURE_THRESHOLD: u32 = 5;
const FAILURE_WINDOW: Duration = Duration::from_secs(60);
const OPEN_DURATION: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: State,
    consecutive_failures: u32,
    window_start: Option<Instant>,
    opened_at: Option<Instant>,
}

/// Closed → Open after 5 consecutive failures within a 60s window. Half-open
/// after 30s, allowing exactly one probe; success closes, failure reopens.
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: State::Closed,
                consecutive_failures: 0,
                window_start: None,
                opened_at: None,
            }),
        }
    }

    /// Whether a call is currently allowed through. Transitions Open →
    /// HalfOpen when the open timer has elapsed; the caller that observes
    /// HalfOpen is the probe attempt.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        match inner.state {
            State::Closed => true,
            State::HalfOpen => true,
            State::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= OPEN_DURATION {
                    inner.state = State::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        inner.state = State::Closed;
        inner.consecutive_failures = 0;
        inner.window_start = None;
        inner.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        match inner.state {
            State::HalfOpen => {
                inner.state = State::Open;
                inner.opened_at = Some(Instant::now());
                inner.consecutive_failures = FAILURE_THRESHOLD;
            }
            State::Closed | State::Open => {
                let now = Instant::now();
                let window_expired = inner
                    .window_start
                    .map(|start| now.duration_since(start) > FAILURE_WINDOW)
                    .unwrap_or(true);
                if window_expired {
                    inner.window_start = Some(now);
                    inner.consecutive_failures = 0;
                }
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= FAILURE_THRESHOLD {
                    inner.state = State::Open;
                    inner.opened_at = Some(now);
                }
            }
        }
    }

    #[cfg(test)]
    fn is_open(&self) -> bool {
        matches!(
            self.inner.lock().expect("mutex poisoned").state,
            State::Open
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_allows_calls() {
        let breaker = CircuitBreaker::new();
        assert!(breaker.allow());
    }

    #[test]
    fn opens_after_five_consecutive_failures() {
        let breaker = CircuitBreaker::new();
        for _ in 0..4 {
            breaker.record_failure();
            assert!(breaker.allow(), "should stay closed before 5th failure");
        }
        breaker.record_failure();
        assert!(breaker.is_open());
        assert!(!breaker.allow());
    }

    #[test]
    fn success_resets_failure_count() {
        let breaker = CircuitBreaker::new();
        for _ in 0..4 {
            breaker.record_failure();
        }
        breaker.record_success();
        for _ in 0..4 {
            breaker.record_failure();
            assert!(breaker.allow());
        }
    }

    #[test]
    fn half_open_probe_failure_reopens() {
        let breaker = CircuitBreaker::new();
        for _ in 0..5 {
            breaker.record_failure();
        }
        assert!(breaker.is_open());
        // Force the open timer into the past to simulate elapsed time.
        {
            let mut inner = breaker.inner.lock().unwrap();
            inner.opened_at = Some(Instant::now() - Duration::from_secs(31));
        }
        assert!(breaker.allow()); // transitions to half-open, probe allowed
        breaker.record_failure();
        assert!(breaker.is_open());
        assert!(!breaker.allow());
    }

    #[test]
    fn half_open_probe_success_closes() {
        let breaker = CircuitBreaker::new();
        for _ in 0..5 {
            breaker.record_failure();
        }
        {
            let mut inner = breaker.inner.lock().unwrap();
            inner.opened_at = Some(Instant::now() - Duration::from_secs(31));
        }
        assert!(breaker.allow());
        breaker.record_success();
        assert!(breaker.allow());
        assert!(!breaker.is_open());
    }
}
