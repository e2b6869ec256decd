//! Per-tool circuit breaker.
//!
//! Isolates a tool that keeps failing: after `failure_threshold` consecutive
//! failures the breaker opens and rejects calls fast, then probes cautiously
//! (half-open, bounded concurrency) once the recovery timeout elapses. The
//! recovery timeout grows multiplicatively while failures continue and snaps
//! back to the initial value on recovery.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;

/// Breaker state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Tuning for one breaker.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub initial_recovery_timeout: Duration,
    /// Growth factor applied to the recovery timeout while failures continue.
    pub timeout_multiplier: f64,
    pub max_timeout: Duration,
    /// Consecutive half-open successes required to close.
    pub success_threshold: u32,
    /// Concurrent probes admitted while half-open.
    pub max_half_open_calls: u32,
    /// Apply ±10% jitter to recovery timers.
    pub jitter: bool,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            initial_recovery_timeout: Duration::from_secs(60),
            timeout_multiplier: 2.0,
            max_timeout: Duration::from_secs(600),
            success_threshold: 1,
            max_half_open_calls: 1,
            jitter: true,
        }
    }
}

/// Retry hint returned with fast rejections while half-open is saturated.
const HALF_OPEN_RETRY_AFTER: Duration = Duration::from_secs(5);

/// Ring size for recent error messages.
const RECENT_ERRORS: usize = 10;

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failure_count: u32,
    consecutive_failures: u32,
    half_open_successes: u32,
    half_open_in_flight: u32,
    last_failure_at: Option<Instant>,
    current_recovery_timeout: Duration,
    // observability counters
    total_calls: u64,
    total_successes: u64,
    total_failures: u64,
    total_rejections: u64,
    state_changes: u64,
    recent_errors: VecDeque<(DateTime<Utc>, String)>,
}

/// A circuit breaker for one tool.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

/// Serializable summary of a breaker's state.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub failure_count: u32,
    pub consecutive_failures: u32,
    pub total_calls: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
    pub state_changes: u64,
    pub current_recovery_timeout_sec: f64,
    pub recent_errors: Vec<String>,
}

/// Outcome of asking the breaker for admission.
pub enum Admission<'a> {
    /// Proceed; report the outcome through the returned permit.
    Allowed(BreakerPermit<'a>),
    /// Fail fast; retry after the embedded duration.
    Rejected { retry_after: Duration },
}

/// Tracks one admitted call through to its recorded outcome.
///
/// Dropping the permit without recording releases the half-open slot
/// without counting either way (the call was abandoned, not observed).
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    recorded: bool,
}

impl BreakerPermit<'_> {
    pub fn succeed(mut self) {
        self.recorded = true;
        self.breaker.on_success();
    }

    pub fn fail(mut self, error: &str) {
        self.recorded = true;
        self.breaker.on_failure(error);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.recorded {
            self.breaker.release_unrecorded();
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Arc<Self> {
        let initial = config.initial_recovery_timeout;
        Arc::new(Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                consecutive_failures: 0,
                half_open_successes: 0,
                half_open_in_flight: 0,
                last_failure_at: None,
                current_recovery_timeout: initial,
                total_calls: 0,
                total_successes: 0,
                total_failures: 0,
                total_rejections: 0,
                state_changes: 0,
                recent_errors: VecDeque::with_capacity(RECENT_ERRORS),
            }),
        })
    }

    /// Ask for admission. Open breakers reject until the recovery timeout
    /// elapses; the first admission afterwards transitions to half-open.
    pub fn try_acquire(&self) -> Admission<'_> {
        let mut inner = self.lock();
        inner.total_calls += 1;

        match inner.state {
            BreakerState::Closed => Admission::Allowed(self.permit()),
            BreakerState::Open => {
                let elapsed = inner
                    .last_failure_at
                    .map(|t| t.elapsed())
                    .unwrap_or_default();
                let wait = self.jittered(inner.current_recovery_timeout);
                if elapsed >= wait {
                    self.transition(&mut inner, BreakerState::HalfOpen);
                    inner.half_open_successes = 0;
                    inner.half_open_in_flight = 1;
                    tracing::info!(breaker = %self.name, "circuit breaker probing (half-open)");
                    Admission::Allowed(self.permit())
                } else {
                    inner.total_rejections += 1;
                    let retry_after = self.jittered(wait.saturating_sub(elapsed));
                    Admission::Rejected { retry_after }
                }
            }
            BreakerState::HalfOpen => {
                if inner.half_open_in_flight < self.config.max_half_open_calls {
                    inner.half_open_in_flight += 1;
                    Admission::Allowed(self.permit())
                } else {
                    inner.total_rejections += 1;
                    Admission::Rejected {
                        retry_after: HALF_OPEN_RETRY_AFTER,
                    }
                }
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.lock();
        inner.total_successes += 1;
        inner.consecutive_failures = 0;
        match inner.state {
            BreakerState::Closed => {
                inner.failure_count = 0;
            }
            BreakerState::HalfOpen => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold {
                    self.transition(&mut inner, BreakerState::Closed);
                    inner.failure_count = 0;
                    inner.current_recovery_timeout = self.config.initial_recovery_timeout;
                    tracing::info!(breaker = %self.name, "circuit breaker closed after recovery");
                }
            }
            // A success while open means the permit outlived a concurrent
            // re-open; counters were already handled there.
            BreakerState::Open => {}
        }
    }

    fn on_failure(&self, error: &str) {
        let mut inner = self.lock();
        inner.total_failures += 1;
        inner.failure_count += 1;
        inner.consecutive_failures += 1;
        inner.last_failure_at = Some(Instant::now());
        if inner.recent_errors.len() == RECENT_ERRORS {
            inner.recent_errors.pop_front();
        }
        inner.recent_errors.push_back((Utc::now(), error.to_string()));

        match inner.state {
            BreakerState::Closed => {
                if inner.failure_count >= self.config.failure_threshold {
                    self.transition(&mut inner, BreakerState::Open);
                    if inner.consecutive_failures > self.config.failure_threshold {
                        self.grow_timeout(&mut inner);
                    }
                    tracing::warn!(
                        breaker = %self.name,
                        failures = inner.failure_count,
                        recovery_sec = inner.current_recovery_timeout.as_secs_f64(),
                        "circuit breaker opened"
                    );
                }
            }
            BreakerState::HalfOpen => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                self.transition(&mut inner, BreakerState::Open);
                self.grow_timeout(&mut inner);
                tracing::warn!(
                    breaker = %self.name,
                    recovery_sec = inner.current_recovery_timeout.as_secs_f64(),
                    "circuit breaker re-opened from half-open probe"
                );
            }
            BreakerState::Open => {}
        }
    }

    fn release_unrecorded(&self) {
        let mut inner = self.lock();
        if inner.state == BreakerState::HalfOpen {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }

    /// Summary snapshot for descriptor listings and logs.
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            consecutive_failures: inner.consecutive_failures,
            total_calls: inner.total_calls,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            total_rejections: inner.total_rejections,
            state_changes: inner.state_changes,
            current_recovery_timeout_sec: inner.current_recovery_timeout.as_secs_f64(),
            recent_errors: inner
                .recent_errors
                .iter()
                .map(|(at, msg)| format!("{at}: {msg}"))
                .collect(),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    fn permit(&self) -> BreakerPermit<'_> {
        BreakerPermit {
            breaker: self,
            recorded: false,
        }
    }

    fn transition(&self, inner: &mut Inner, to: BreakerState) {
        if inner.state != to {
            inner.state = to;
            inner.state_changes += 1;
        }
    }

    fn grow_timeout(&self, inner: &mut Inner) {
        let grown = inner.current_recovery_timeout.as_secs_f64() * self.config.timeout_multiplier;
        inner.current_recovery_timeout =
            Duration::from_secs_f64(grown.min(self.config.max_timeout.as_secs_f64()));
    }

    fn jittered(&self, d: Duration) -> Duration {
        if !self.config.jitter || d.is_zero() {
            return d;
        }
        let factor = rand::thread_rng().gen_range(0.9..=1.1);
        Duration::from_secs_f64(d.as_secs_f64() * factor)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}
