//! Per-backend circuit breakers.
//!
//! Stops sending traffic to a backend that keeps failing. States:
//! - Closed: normal operation, consecutive failures are counted
//! - Open: calls are refused without touching the network until the
//!   cool-down has elapsed
//! - HalfOpen: a bounded number of trial calls decide whether to close again
//!
//! Every decision happens under the breaker's own mutex, so concurrent callers
//! observe a single transition. Callers hold a [`CallPermit`] for the duration
//! of a backend call and report its outcome through it.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tollgate_core::clock::SharedClock;
use tollgate_core::routes::Backend;
use tracing::{debug, info, warn};

use crate::metrics;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before allowing trials.
    pub open_duration: Duration,
    /// Concurrent trials allowed in half-open, and the consecutive trial
    /// successes required to close.
    pub half_open_max_trials: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(30),
            half_open_max_trials: 1,
        }
    }
}

/// Result of a backend call as seen by the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// Transport error, timeout or a 5xx response.
    Failure,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    half_open_in_flight: u32,
    opened_at_ms: u64,
    last_state_change_ms: u64,
    /// Bumped on every transition; outcomes from an older generation are stale.
    generation: u64,
}

/// Serializable view of one breaker.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub backend: Backend,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub half_open_successes: u32,
    pub half_open_in_flight: u32,
    /// Seconds until an open circuit admits trials.
    pub retry_in_secs: Option<u64>,
    pub last_state_change_ms: u64,
}

/// A circuit breaker for a single backend.
pub struct CircuitBreaker {
    backend: Backend,
    config: CircuitBreakerConfig,
    clock: SharedClock,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(backend: Backend, config: CircuitBreakerConfig, clock: SharedClock) -> Self {
        let now = clock.now_millis();
        Self {
            backend,
            config,
            clock,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                half_open_in_flight: 0,
                opened_at_ms: 0,
                last_state_change_ms: now,
                generation: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // State stays consistent between statements, so a poisoned lock is usable.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ask to make a call. `None` means the circuit refuses it.
    pub fn try_acquire(self: &Arc<Self>) -> Option<CallPermit> {
        let mut inner = self.lock();
        let now = self.clock.now_millis();

        if inner.state == CircuitState::Open {
            let elapsed = now.saturating_sub(inner.opened_at_ms);
            if elapsed < self.config.open_duration.as_millis() as u64 {
                debug!(backend = %self.backend, "Circuit OPEN, refusing call");
                return None;
            }
            self.transition(&mut inner, CircuitState::HalfOpen, now);
        }

        let trial = inner.state == CircuitState::HalfOpen;
        if trial {
            if inner.half_open_in_flight >= self.config.half_open_max_trials {
                debug!(backend = %self.backend, "Circuit HALF-OPEN, trial slots taken");
                return None;
            }
            inner.half_open_in_flight += 1;
        }

        Some(CallPermit {
            breaker: Arc::clone(self),
            generation: inner.generation,
            trial,
            reported: false,
        })
    }

    /// Whether a call would currently be refused without side effects.
    pub fn would_allow(&self) -> bool {
        let inner = self.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => {
                inner.half_open_in_flight < self.config.half_open_max_trials
            }
            CircuitState::Open => {
                let elapsed = self.clock.now_millis().saturating_sub(inner.opened_at_ms);
                elapsed >= self.config.open_duration.as_millis() as u64
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.lock();
        let retry_in_secs = (inner.state == CircuitState::Open).then(|| {
            let reopen_at = inner.opened_at_ms + self.config.open_duration.as_millis() as u64;
            reopen_at
                .saturating_sub(self.clock.now_millis())
                .div_ceil(1000)
        });

        CircuitSnapshot {
            backend: self.backend,
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            half_open_successes: inner.half_open_successes,
            half_open_in_flight: inner.half_open_in_flight,
            retry_in_secs,
            last_state_change_ms: inner.last_state_change_ms,
        }
    }

    /// Force the circuit closed (operator action).
    pub fn reset(&self) {
        let mut inner = self.lock();
        let now = self.clock.now_millis();
        self.transition(&mut inner, CircuitState::Closed, now);
        info!(backend = %self.backend, "Circuit breaker RESET");
    }

    fn report(&self, generation: u64, trial: bool, outcome: Outcome) {
        let mut inner = self.lock();
        if generation != inner.generation {
            debug!(backend = %self.backend, ?outcome, "Ignoring stale outcome");
            return;
        }
        let now = self.clock.now_millis();

        match (inner.state, outcome) {
            (CircuitState::Closed, Outcome::Success) => {
                inner.consecutive_failures = 0;
            }
            (CircuitState::Closed, Outcome::Failure) => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open, now);
                }
            }
            (CircuitState::HalfOpen, Outcome::Success) if trial => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.half_open_max_trials {
                    self.transition(&mut inner, CircuitState::Closed, now);
                }
            }
            (CircuitState::HalfOpen, Outcome::Failure) if trial => {
                inner.consecutive_failures += 1;
                self.transition(&mut inner, CircuitState::Open, now);
            }
            _ => {}
        }
    }

    fn release(&self, generation: u64, trial: bool) {
        let mut inner = self.lock();
        if trial && generation == inner.generation && inner.state == CircuitState::HalfOpen {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState, now: u64) {
        let from = inner.state;
        inner.state = to;
        inner.generation += 1;
        inner.last_state_change_ms = now;
        inner.half_open_successes = 0;
        inner.half_open_in_flight = 0;

        match to {
            CircuitState::Open => {
                inner.opened_at_ms = now;
                warn!(
                    backend = %self.backend,
                    failures = inner.consecutive_failures,
                    ?from,
                    "Circuit breaker OPENED"
                );
                metrics::record_circuit_trip(self.backend);
            }
            CircuitState::HalfOpen => {
                debug!(backend = %self.backend, "Circuit breaker HALF-OPEN, testing recovery");
            }
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
                if from != CircuitState::Closed {
                    info!(backend = %self.backend, "Circuit breaker CLOSED");
                }
            }
        }

        metrics::set_circuit_state(self.backend, to);
    }
}

/// Permission to make one backend call.
///
/// Dropping the permit without reporting releases its half-open trial slot
/// and records nothing.
#[must_use = "report the call outcome or drop the permit to release it"]
pub struct CallPermit {
    breaker: Arc<CircuitBreaker>,
    generation: u64,
    trial: bool,
    reported: bool,
}

impl CallPermit {
    pub fn report(mut self, outcome: Outcome) {
        self.reported = true;
        self.breaker.report(self.generation, self.trial, outcome);
    }

    pub fn backend(&self) -> Backend {
        self.breaker.backend
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.reported {
            self.breaker.release(self.generation, self.trial);
        }
    }
}

/// One breaker per backend, created at startup.
pub struct CircuitBreakers {
    breakers: HashMap<Backend, Arc<CircuitBreaker>>,
}

impl CircuitBreakers {
    pub fn new(config: CircuitBreakerConfig, clock: SharedClock) -> Self {
        let breakers = Backend::ALL
            .iter()
            .map(|&b| (b, Arc::new(CircuitBreaker::new(b, config, clock.clone()))))
            .collect();
        Self { breakers }
    }

    pub fn get(&self, backend: Backend) -> &Arc<CircuitBreaker> {
        // Every backend is inserted in `new`.
        &self.breakers[&backend]
    }

    pub fn allow(&self, backend: Backend) -> Option<CallPermit> {
        self.get(backend).try_acquire()
    }

    pub fn reset(&self, backend: Backend) {
        self.get(backend).reset();
    }

    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        Backend::ALL
            .iter()
            .map(|&b| self.get(b).snapshot())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tollgate_core::clock::ManualClock;

    fn breaker(threshold: u32, trials: u32) -> (Arc<ManualClock>, Arc<CircuitBreaker>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let config = CircuitBreakerConfig {
            failure_threshold: threshold,
            open_duration: Duration::from_secs(30),
            half_open_max_trials: trials,
        };
        let cb = Arc::new(CircuitBreaker::new(Backend::Order, config, clock.clone()));
        (clock, cb)
    }

    fn fail(cb: &Arc<CircuitBreaker>) {
        cb.try_acquire().unwrap().report(Outcome::Failure);
    }

    fn succeed(cb: &Arc<CircuitBreaker>) {
        cb.try_acquire().unwrap().report(Outcome::Success);
    }

    #[test]
    fn test_circuit_breaker_closed() {
        let (_, cb) = breaker(5, 1);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire().is_some());
    }

    #[test]
    fn test_circuit_breaker_trips() {
        let (_, cb) = breaker(3, 1);
        for _ in 0..3 {
            fail(&cb);
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.try_acquire().is_none());
        assert!(!cb.would_allow());
        assert_eq!(cb.snapshot().retry_in_secs, Some(30));
    }

    #[test]
    fn test_success_resets_failures() {
        let (_, cb) = breaker(3, 1);
        fail(&cb);
        fail(&cb);
        assert_eq!(cb.snapshot().consecutive_failures, 2);
        succeed(&cb);
        assert_eq!(cb.snapshot().consecutive_failures, 0);
        fail(&cb);
        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_success_closes() {
        let (clock, cb) = breaker(2, 1);
        fail(&cb);
        fail(&cb);

        clock.advance(Duration::from_secs(29));
        assert!(cb.try_acquire().is_none());
        clock.advance(Duration::from_secs(1));

        let trial = cb.try_acquire().unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        // Only one trial at a time.
        assert!(cb.try_acquire().is_none());

        trial.report(Outcome::Success);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire().is_some());
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let (clock, cb) = breaker(1, 1);
        fail(&cb);
        clock.advance(Duration::from_secs(30));

        cb.try_acquire().unwrap().report(Outcome::Failure);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.try_acquire().is_none());

        // The cool-down restarts from the failed trial.
        clock.advance(Duration::from_secs(30));
        assert!(cb.try_acquire().is_some());
    }

    #[test]
    fn test_multiple_trials_required() {
        let (clock, cb) = breaker(1, 2);
        fail(&cb);
        clock.advance(Duration::from_secs(30));

        let a = cb.try_acquire().unwrap();
        let b = cb.try_acquire().unwrap();
        assert!(cb.try_acquire().is_none());

        a.report(Outcome::Success);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        b.report(Outcome::Success);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_dropped_permit_releases_trial() {
        let (clock, cb) = breaker(1, 1);
        fail(&cb);
        clock.advance(Duration::from_secs(30));

        let trial = cb.try_acquire().unwrap();
        drop(trial);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.snapshot().half_open_in_flight, 0);
        assert!(cb.try_acquire().is_some());
    }

    #[test]
    fn test_stale_outcome_ignored() {
        let (_, cb) = breaker(1, 1);
        let slow = cb.try_acquire().unwrap();
        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Open);

        // A call admitted before the trip finishes afterwards.
        slow.report(Outcome::Success);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_reset() {
        let (_, cb) = breaker(1, 1);
        fail(&cb);
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire().is_some());
    }

    #[test]
    fn test_backends_are_independent() {
        let clock = Arc::new(ManualClock::new(0));
        let breakers = CircuitBreakers::new(
            CircuitBreakerConfig {
                failure_threshold: 1,
                ..Default::default()
            },
            clock,
        );

        breakers
            .allow(Backend::Order)
            .unwrap()
            .report(Outcome::Failure);
        assert!(breakers.allow(Backend::Order).is_none());
        assert!(breakers.allow(Backend::User).is_some());

        let snapshots = breakers.snapshots();
        assert_eq!(snapshots.len(), 4);
        assert_eq!(snapshots[1].state, CircuitState::Open);

        breakers.reset(Backend::Order);
        assert!(breakers.allow(Backend::Order).is_some());
    }

    #[test]
    fn test_snapshot_serializes() {
        let (_, cb) = breaker(1, 1);
        let json = serde_json::to_value(cb.snapshot()).unwrap();
        assert_eq!(json["backend"], "order");
        assert_eq!(json["state"], "closed");
    }
}
