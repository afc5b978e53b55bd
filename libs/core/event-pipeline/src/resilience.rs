//! Circuit breaker for downstream calls made from inside handlers.
//!
//! ## States
//!
//! ```text
//! ┌─────────┐  failures >= threshold  ┌────────┐
//! │ CLOSED  │ ──────────────────────> │  OPEN  │ <──────────┐
//! └─────────┘                         └────────┘            │
//!      ^                                   │                │
//!      │                                   │ cooldown over  │ trial failed
//!      │                                   v                │
//!      │     trial succeeded      ┌─────────────┐           │
//!      └───────────────────────── │  HALF-OPEN  │ ──────────┘
//!                                 └─────────────┘
//! ```
//!
//! Half-open admits exactly one trial call; everyone else is rejected as if the
//! circuit were open until the trial settles. A trial whose future is dropped
//! before completing counts as failed.
//!
//! ## Example
//!
//! ```rust,ignore
//! use event_pipeline::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError};
//!
//! let breaker = CircuitBreaker::new("slack", CircuitBreakerConfig::default());
//!
//! match breaker.call(|| client.post(url).send()).await {
//!     Ok(response) => { /* ... */ }
//!     Err(CircuitBreakerError::Open { .. }) => { /* fail fast, nothing was sent */ }
//!     Err(CircuitBreakerError::Inner(e)) => { /* the call itself failed */ }
//! }
//! ```

use crate::metrics::record_circuit_transition;
use serde::Serialize;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use strum::{AsRefStr, Display};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls are rejected without being attempted.
    Open,
    /// One trial call is allowed to probe the downstream.
    HalfOpen,
}

/// Configuration for the circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before admitting a trial.
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the failure threshold.
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Set the cooldown.
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }
}

/// Error returned by [`CircuitBreaker::call`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CircuitBreakerError<E> {
    /// The call was not attempted
    #[error("Circuit breaker '{name}' is open (retry in {retry_after:?})")]
    Open { name: String, retry_after: Duration },

    /// The call was attempted and failed
    #[error(transparent)]
    Inner(E),
}

impl<E> CircuitBreakerError<E> {
    /// Whether the call was rejected without being attempted
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitBreakerError::Open { .. })
    }
}

/// Point-in-time view of a breaker, for the admin endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Milliseconds until a trial is admitted (open state only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failures: u32,
    open_until: Option<Instant>,
    trial_in_flight: bool,
}

/// Process-local circuit breaker.
///
/// State transitions happen under a mutex which is never held while the protected
/// call runs.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: 0,
                open_until: None,
                trial_in_flight: false,
            }),
        }
    }

    /// Breaker name (used in logs and metrics).
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Run `f` under the breaker.
    ///
    /// Returns [`CircuitBreakerError::Open`] without calling `f` when the circuit is
    /// open, or when it is half-open and another caller holds the trial slot.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.acquire().map_err(|retry_after| CircuitBreakerError::Open {
            name: self.name.clone(),
            retry_after,
        })?;

        let result = f().await;
        permit.settle(result.is_ok());
        result.map_err(CircuitBreakerError::Inner)
    }

    /// Current state. An expired open window reads as half-open.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.refresh(&mut inner, Instant::now());
        inner.state
    }

    /// Whether a call made now would be attempted.
    pub fn may_attempt(&self) -> bool {
        let mut inner = self.lock();
        self.refresh(&mut inner, Instant::now());
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => !inner.trial_in_flight,
            CircuitState::Open => false,
        }
    }

    /// Consecutive failures counted while closed.
    pub fn failure_count(&self) -> u32 {
        self.lock().failures
    }

    /// Force the breaker closed.
    pub fn reset(&self) {
        let mut inner = self.lock();
        self.close(&mut inner);
    }

    /// Snapshot for reporting.
    pub fn snapshot(&self) -> BreakerSnapshot {
        let now = Instant::now();
        let mut inner = self.lock();
        self.refresh(&mut inner, now);
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.failures,
            retry_after_ms: match inner.state {
                CircuitState::Open => inner
                    .open_until
                    .map(|until| until.saturating_duration_since(now).as_millis() as u64),
                _ => None,
            },
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn refresh(&self, inner: &mut Inner, now: Instant) {
        if inner.state == CircuitState::Open
            && inner.open_until.is_none_or(|until| now >= until)
        {
            inner.state = CircuitState::HalfOpen;
            inner.trial_in_flight = false;
            info!(breaker = %self.name, "Circuit breaker HALF-OPEN (testing recovery)");
            record_circuit_transition(&self.name, CircuitState::HalfOpen.as_ref());
        }
    }

    /// Take a permit, or return how long until one may be granted.
    fn acquire(&self) -> Result<Permit<'_>, Duration> {
        let now = Instant::now();
        let mut inner = self.lock();
        self.refresh(&mut inner, now);

        match inner.state {
            CircuitState::Closed => Ok(Permit::new(self, false)),
            CircuitState::HalfOpen if !inner.trial_in_flight => {
                inner.trial_in_flight = true;
                Ok(Permit::new(self, true))
            }
            CircuitState::HalfOpen => Err(Duration::ZERO),
            CircuitState::Open => Err(inner
                .open_until
                .map(|until| until.saturating_duration_since(now))
                .unwrap_or_default()),
        }
    }

    fn record(&self, trial: bool, success: bool) {
        let mut inner = self.lock();

        if trial {
            if success {
                self.close(&mut inner);
            } else {
                self.open(&mut inner);
            }
            return;
        }

        // Results of calls admitted before the circuit opened do not move it
        if inner.state != CircuitState::Closed {
            return;
        }

        if success {
            inner.failures = 0;
        } else {
            inner.failures += 1;
            if inner.failures >= self.config.failure_threshold {
                self.open(&mut inner);
            }
        }
    }

    fn open(&self, inner: &mut Inner) {
        inner.state = CircuitState::Open;
        inner.open_until = Some(Instant::now() + self.config.cooldown);
        inner.trial_in_flight = false;
        warn!(
            breaker = %self.name,
            failures = inner.failures,
            cooldown_secs = self.config.cooldown.as_secs(),
            "Circuit breaker OPENED"
        );
        record_circuit_transition(&self.name, CircuitState::Open.as_ref());
    }

    fn close(&self, inner: &mut Inner) {
        let was = inner.state;
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.open_until = None;
        inner.trial_in_flight = false;
        if was != CircuitState::Closed {
            info!(breaker = %self.name, "Circuit breaker CLOSED (recovered)");
            record_circuit_transition(&self.name, CircuitState::Closed.as_ref());
        }
    }
}

/// Admission to run one protected call.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl<'a> Permit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    fn settle(mut self, success: bool) {
        self.settled = true;
        self.breaker.record(self.trial, success);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.record(true, false);
        }
    }
}
