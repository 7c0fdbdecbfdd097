//! Per-origin circuit breaking for fetch traffic.
//!
//! Each origin (scheme+host) gets its own breaker so one failing site
//! never suspends traffic to the rest.
//!
//! # Circuit States
//!
//! ```text
//! CLOSED (healthy) --[N failures]--> OPEN (rejecting) --[cool-down]--> HALF_OPEN (one probe)
//!                                                                            |
//!                                        <--[probe fails, cool-down ×2]--    |
//!                                                                            |
//! CLOSED <-----------------------------[probe succeeds]---------------------+
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::AppError;

/// Current state of one breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Breaker tuning.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before opening.
    pub failure_threshold: u32,
    /// Successful probes in half-open needed to close again.
    pub success_threshold: u32,
    /// Initial open duration before admitting a probe.
    pub cool_down: Duration,
    /// Each reopen doubles the cool-down, up to this cap.
    pub max_cool_down: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            cool_down: Duration::from_secs(60),
            max_cool_down: Duration::from_secs(600),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
    last_error_message: Option<String>,
    current_cool_down: Duration,
    /// Half-open admits a single probe; set while it is in flight.
    probe_in_flight: bool,
}

impl BreakerInner {
    fn new(config: &BreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            last_error_message: None,
            current_cool_down: config.cool_down,
            probe_in_flight: false,
        }
    }
}

/// Whether a fetch may proceed through the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Rejected { retry_after: Duration },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed)
    }
}

/// Snapshot for monitoring.
#[derive(Debug, Clone)]
pub struct BreakerStats {
    pub origin: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_error: Option<String>,
    pub time_until_half_open: Option<Duration>,
}

/// Thread-safe breaker for one origin.
#[derive(Clone)]
pub struct CircuitBreaker {
    origin: String,
    config: BreakerConfig,
    inner: Arc<Mutex<BreakerInner>>,
}

impl CircuitBreaker {
    pub fn new(origin: impl Into<String>, config: BreakerConfig) -> Self {
        let inner = BreakerInner::new(&config);
        Self {
            origin: origin.into(),
            config,
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(origin = %self.origin, "Recovered from poisoned breaker mutex");
            poisoned.into_inner()
        })
    }

    /// Current state, applying the lazy open → half-open transition.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);
        inner.state
    }

    /// Ask to send one fetch. Open circuits reject; half-open admits a
    /// single probe and rejects concurrent attempts until it resolves.
    pub fn admit(&self) -> Admission {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);

        match inner.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => Admission::Rejected {
                retry_after: self.remaining_cool_down(&inner),
            },
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Admission::Rejected {
                        retry_after: Duration::from_secs(1),
                    }
                } else {
                    inner.probe_in_flight = true;
                    Admission::Allowed
                }
            }
        }
    }

    /// Record the outcome of an admitted fetch. Errors that do not trip
    /// the circuit (protection pages in particular) are neutral: they
    /// neither reset nor advance the counter.
    pub fn record(&self, result: Result<(), &AppError>) {
        match result {
            Ok(()) => self.record_success(),
            Err(e) if e.should_trip_circuit() => self.record_failure(e),
            Err(_) => {
                let mut inner = self.lock_inner();
                inner.probe_in_flight = false;
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock_inner();
        inner.probe_in_flight = false;

        match inner.state {
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    tracing::info!(
                        origin = %self.origin,
                        "circuit closing after successful probe"
                    );
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.last_error_message = None;
                    inner.current_cool_down = self.config.cool_down;
                }
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, error: &AppError) {
        let mut inner = self.lock_inner();
        inner.probe_in_flight = false;

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                inner.last_failure_time = Some(Instant::now());
                inner.last_error_message = Some(error.to_string());

                if inner.failure_count >= self.config.failure_threshold {
                    tracing::warn!(
                        origin = %self.origin,
                        failures = inner.failure_count,
                        error = %error,
                        "circuit opening"
                    );
                    inner.state = CircuitState::Open;
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!(
                    origin = %self.origin,
                    error = %error,
                    "probe failed, circuit reopening"
                );
                inner.state = CircuitState::Open;
                inner.last_failure_time = Some(Instant::now());
                inner.last_error_message = Some(error.to_string());
                inner.success_count = 0;
                inner.current_cool_down =
                    std::cmp::min(inner.current_cool_down * 2, self.config.max_cool_down);
            }
            CircuitState::Open => {
                inner.last_error_message = Some(error.to_string());
            }
        }
    }

    pub fn stats(&self) -> BreakerStats {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);

        let time_until_half_open = (inner.state == CircuitState::Open)
            .then(|| self.remaining_cool_down(&inner));

        BreakerStats {
            origin: self.origin.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            last_error: inner.last_error_message.clone(),
            time_until_half_open,
        }
    }

    fn remaining_cool_down(&self, inner: &BreakerInner) -> Duration {
        inner
            .last_failure_time
            .map(|t| inner.current_cool_down.saturating_sub(t.elapsed()))
            .unwrap_or(inner.current_cool_down)
    }

    fn maybe_transition_to_half_open(&self, inner: &mut BreakerInner) {
        if inner.state == CircuitState::Open
            && let Some(last_failure) = inner.last_failure_time
            && last_failure.elapsed() >= inner.current_cool_down
        {
            tracing::info!(origin = %self.origin, "circuit transitioning to half-open");
            inner.state = CircuitState::HalfOpen;
            inner.success_count = 0;
            inner.probe_in_flight = false;
        }
    }
}

/// In-memory registry: origin → breaker. State is advisory and resets on
/// process restart. Updates are mutually exclusive per origin only.
#[derive(Clone)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: Arc<Mutex<HashMap<String, CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Breaker for an origin, created closed on first sight.
    pub fn for_origin(&self, origin: &str) -> CircuitBreaker {
        let mut breakers = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        breakers
            .entry(origin.to_string())
            .or_insert_with(|| CircuitBreaker::new(origin, self.config.clone()))
            .clone()
    }

    pub fn stats(&self) -> Vec<BreakerStats> {
        let breakers = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        breakers.values().map(|b| b.stats()).collect()
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}
