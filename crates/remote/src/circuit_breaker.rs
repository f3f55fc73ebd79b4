//! Circuit breaker shared by every caller of the remote endpoint.
//!
//! - `closed`: calls pass; `failure_threshold` consecutive failures open it
//! - `open`: calls are rejected until `open_timeout` has elapsed since the
//!   last failure, then the next call moves it to `half_open`
//! - `half_open`: trial calls pass; one failure re-opens, `success_threshold`
//!   consecutive successes close it

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::GuardedError;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub open_timeout: Duration,
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 10,
            open_timeout: Duration::from_secs(300),
            success_threshold: 3,
        }
    }
}

/// Point-in-time view, for admin endpoints and logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Remaining cool-down while open.
    pub retry_in_secs: Option<u64>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                last_failure: None,
                last_failure_at: None,
            }),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Gate a call. Must run before every remote call.
    pub fn before_call(&self) -> Result<(), GuardedError> {
        self.before_call_at(Instant::now())
    }

    pub(crate) fn before_call_at(&self, now: Instant) -> Result<(), GuardedError> {
        let mut inner = self.lock();
        if inner.state != CircuitState::Open {
            return Ok(());
        }
        match self.remaining_cooldown(&inner, now) {
            Some(retry_in) => Err(GuardedError::CircuitOpen { retry_in }),
            None => {
                info!("circuit breaker half-open, allowing trial calls");
                inner.state = CircuitState::HalfOpen;
                inner.consecutive_successes = 0;
                Ok(())
            }
        }
    }

    pub fn on_success(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = 0;
        if inner.state == CircuitState::HalfOpen {
            inner.consecutive_successes += 1;
            if inner.consecutive_successes >= self.config.success_threshold {
                info!(
                    successes = inner.consecutive_successes,
                    "circuit breaker closed, remote recovered"
                );
                inner.state = CircuitState::Closed;
                inner.consecutive_successes = 0;
            }
        }
    }

    pub fn on_failure(&self) {
        self.on_failure_at(Instant::now());
    }

    pub(crate) fn on_failure_at(&self, now: Instant) {
        let mut inner = self.lock();
        inner.consecutive_failures += 1;
        inner.last_failure = Some(now);
        inner.last_failure_at = Some(Utc::now());

        match inner.state {
            CircuitState::HalfOpen => {
                warn!("trial call failed, circuit breaker re-opened");
                inner.state = CircuitState::Open;
                inner.consecutive_successes = 0;
            }
            CircuitState::Closed if inner.consecutive_failures >= self.config.failure_threshold => {
                warn!(
                    failures = inner.consecutive_failures,
                    open_timeout_secs = self.config.open_timeout.as_secs(),
                    "circuit breaker opened"
                );
                inner.state = CircuitState::Open;
            }
            _ => {}
        }
    }

    /// Force `closed` with zeroed counters.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        inner.last_failure = None;
        inner.last_failure_at = None;
        info!("circuit breaker reset");
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// `true` while open and still cooling down. Does not transition.
    pub fn is_open(&self) -> bool {
        self.retry_in().is_some()
    }

    /// Remaining cool-down, if the breaker is open.
    pub fn retry_in(&self) -> Option<Duration> {
        let inner = self.lock();
        if inner.state != CircuitState::Open {
            return None;
        }
        self.remaining_cooldown(&inner, Instant::now())
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.lock();
        let retry_in = match inner.state {
            CircuitState::Open => self.remaining_cooldown(&inner, Instant::now()),
            _ => None,
        };
        CircuitSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            last_failure_at: inner.last_failure_at,
            retry_in_secs: retry_in.map(|d| d.as_secs()),
        }
    }

    fn remaining_cooldown(&self, inner: &Inner, now: Instant) -> Option<Duration> {
        let last = inner.last_failure?;
        let elapsed = now.saturating_duration_since(last);
        if elapsed >= self.config.open_timeout {
            None
        } else {
            Some(self.config.open_timeout - elapsed)
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 3,
            open_timeout: Duration::from_secs(300),
            success_threshold: 2,
        })
    }

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let b = breaker();
        let now = Instant::now();
        b.on_failure_at(now);
        b.on_failure_at(now);
        assert_eq!(b.state(), CircuitState::Closed);
        b.on_failure_at(now);
        assert_eq!(b.state(), CircuitState::Open);

        let err = b.before_call_at(now + Duration::from_secs(100)).unwrap_err();
        assert_eq!(
            err,
            GuardedError::CircuitOpen {
                retry_in: Duration::from_secs(200)
            }
        );
    }

    #[test]
    fn a_success_resets_the_failure_streak() {
        let b = breaker();
        let now = Instant::now();
        b.on_failure_at(now);
        b.on_failure_at(now);
        b.on_success();
        b.on_failure_at(now);
        b.on_failure_at(now);
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_after_timeout_then_closes_on_successes() {
        let b = breaker();
        let now = Instant::now();
        for _ in 0..3 {
            b.on_failure_at(now);
        }
        let later = now + Duration::from_secs(300);
        assert!(b.before_call_at(later).is_ok());
        assert_eq!(b.state(), CircuitState::HalfOpen);

        b.on_success();
        assert_eq!(b.state(), CircuitState::HalfOpen);
        b.on_success();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn a_failure_in_half_open_reopens() {
        let b = breaker();
        let now = Instant::now();
        for _ in 0..3 {
            b.on_failure_at(now);
        }
        let later = now + Duration::from_secs(301);
        b.before_call_at(later).unwrap();
        b.on_success();
        b.on_failure_at(later);
        assert_eq!(b.state(), CircuitState::Open);
        assert!(b.before_call_at(later + Duration::from_secs(10)).is_err());
    }

    #[test]
    fn reset_closes_and_clears() {
        let b = breaker();
        for _ in 0..3 {
            b.on_failure();
        }
        assert!(b.is_open());
        b.reset();
        let snap = b.snapshot();
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.consecutive_failures, 0);
        assert_eq!(snap.last_failure_at, None);
        assert!(b.before_call().is_ok());
    }

    #[derive(Debug, Clone)]
    enum Event {
        Success,
        Failure,
        Wait(u64),
    }

    fn event() -> impl Strategy<Value = Event> {
        prop_oneof![
            3 => Just(Event::Success),
            4 => Just(Event::Failure),
            1 => (1u64..400).prop_map(Event::Wait),
        ]
    }

    proptest! {
        /// Property: the breaker mirrors a reference model of the three-state
        /// machine for any sequence of outcomes and clock advances.
        #[test]
        fn matches_the_reference_model(events in prop::collection::vec(event(), 0..200)) {
            let cfg = CircuitBreakerConfig {
                failure_threshold: 4,
                open_timeout: Duration::from_secs(60),
                success_threshold: 3,
            };
            let b = CircuitBreaker::new(cfg);
            let mut now = Instant::now();

            let mut state = CircuitState::Closed;
            let mut failures = 0u32;
            let mut successes = 0u32;
            let mut last_failure = None::<Instant>;

            for ev in events {
                match ev {
                    Event::Wait(secs) => now += Duration::from_secs(secs),
                    Event::Success | Event::Failure => {
                        // Every outcome is preceded by a gate check.
                        let expected_open = state == CircuitState::Open
                            && last_failure.is_some_and(|t| now.duration_since(t) < cfg.open_timeout);
                        let gate = b.before_call_at(now);
                        prop_assert_eq!(gate.is_err(), expected_open);
                        if expected_open {
                            continue;
                        }
                        if state == CircuitState::Open {
                            state = CircuitState::HalfOpen;
                            successes = 0;
                        }

                        if matches!(ev, Event::Success) {
                            b.on_success();
                            failures = 0;
                            if state == CircuitState::HalfOpen {
                                successes += 1;
                                if successes >= cfg.success_threshold {
                                    state = CircuitState::Closed;
                                    successes = 0;
                                }
                            }
                        } else {
                            b.on_failure_at(now);
                            failures += 1;
                            last_failure = Some(now);
                            if state == CircuitState::HalfOpen {
                                state = CircuitState::Open;
                                successes = 0;
                            } else if failures >= cfg.failure_threshold {
                                state = CircuitState::Open;
                            }
                        }
                    }
                }
                prop_assert_eq!(b.state(), state);
                if state == CircuitState::Closed {
                    prop_assert!(failures < cfg.failure_threshold);
                }
            }
        }
    }
}
