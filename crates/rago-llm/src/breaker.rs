//! Per-provider circuit breaker
//!
//! Counts consecutive failures; once the threshold is reached the circuit
//! opens and the provider is skipped until the timeout elapses. The first
//! request after that is a single half-open trial: success closes the
//! circuit, failure re-opens it.

use parking_lot::Mutex;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum State {
    Closed { consecutive_failures: u32 },
    Open { until: Instant },
    /// Trial request in flight
    HalfOpen,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    threshold: u32,
    timeout: Duration,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, threshold: u32, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            threshold: threshold.max(1),
            timeout,
            state: Mutex::new(State::Closed {
                consecutive_failures: 0,
            }),
        }
    }

    /// True while requests must not reach the backend
    pub fn is_open(&self) -> bool {
        match *self.state.lock() {
            State::Closed { .. } => false,
            State::Open { until } => Instant::now() < until,
            State::HalfOpen => true,
        }
    }

    pub fn state(&self) -> BreakerState {
        match *self.state.lock() {
            State::Closed { .. } => BreakerState::Closed,
            State::Open { until } if Instant::now() >= until => BreakerState::HalfOpen,
            State::Open { .. } => BreakerState::Open,
            State::HalfOpen => BreakerState::HalfOpen,
        }
    }

    /// Claims permission to send one request
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            State::Closed { .. } => true,
            State::Open { until } => {
                if Instant::now() >= until {
                    info!(provider = %self.name, "Circuit half-open, allowing trial request");
                    *state = State::HalfOpen;
                    true
                } else {
                    false
                }
            }
            State::HalfOpen => false,
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        if matches!(*state, State::HalfOpen) {
            info!(provider = %self.name, "Circuit closed after successful trial");
        }
        *state = State::Closed {
            consecutive_failures: 0,
        };
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        let reopen = match &mut *state {
            State::Closed {
                consecutive_failures,
            } => {
                *consecutive_failures += 1;
                if *consecutive_failures >= self.threshold {
                    warn!(
                        provider = %self.name,
                        failures = *consecutive_failures,
                        "Circuit opened, provider skipped for {}s",
                        self.timeout.as_secs()
                    );
                    true
                } else {
                    false
                }
            }
            State::HalfOpen => {
                warn!(provider = %self.name, "Trial request failed, circuit re-opened");
                true
            }
            State::Open { .. } => false,
        };
        if reopen {
            *state = State::Open {
                until: Instant::now() + self.timeout,
            };
        }
    }

    /// Releases a half-open claim without an outcome (e.g. cancelled trial)
    pub fn release(&self) {
        let mut state = self.state.lock();
        if matches!(*state, State::HalfOpen) {
            *state = State::Open {
                until: Instant::now(),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_failure_does_not_trip() {
        let cb = CircuitBreaker::new("a", 3, Duration::from_secs(30));
        cb.record_failure();
        assert!(!cb.is_open());
        assert!(cb.try_acquire());
    }

    #[test]
    fn test_threshold_failures_trip() {
        let cb = CircuitBreaker::new("a", 3, Duration::from_secs(30));
        for _ in 0..3 {
            cb.record_failure();
        }
        assert!(cb.is_open());
        assert!(!cb.try_acquire());
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[test]
    fn test_success_resets_count() {
        let cb = CircuitBreaker::new("a", 3, Duration::from_secs(30));
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        assert!(!cb.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_timeout() {
        let cb = CircuitBreaker::new("a", 1, Duration::from_secs(30));
        cb.record_failure();
        assert!(!cb.try_acquire());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(!cb.is_open());
        assert!(cb.try_acquire());
        // only one trial at a time
        assert!(!cb.try_acquire());

        cb.record_failure();
        assert!(cb.is_open());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(cb.try_acquire());
        cb.record_success();
        assert_eq!(cb.state(), BreakerState::Closed);
    }
}
