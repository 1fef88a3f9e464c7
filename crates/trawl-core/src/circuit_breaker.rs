//! Cool-down breaker for authenticated source APIs.
//!
//! Guards an API path that has a cheaper-to-keep-trying alternative (the
//! HTML path). While the breaker is open, callers skip the API entirely.
//!
//! ```text
//! CLOSED --[N failures | quota/auth]--> OPEN --[cool-down]--> HALF_OPEN
//!    ^                                    ^                        |
//!    |                                    +------[failure]---------+
//!    +-------------------------------------------[success]---------+
//! ```
//!
//! Quota and auth rejections open the breaker immediately: retrying them
//! before the cool-down ends only burns requests. Repeated quota trips
//! stretch the cool-down up to `max_cool_down`.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// API calls flow normally.
    Closed,
    /// API calls are skipped until the cool-down ends.
    Open,
    /// One probe call is allowed through.
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

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive transient failures (network, 5xx) before opening.
    pub failure_threshold: u32,
    pub cool_down: Duration,
    /// Applied to the current cool-down on every repeated quota trip.
    pub quota_backoff_multiplier: f32,
    pub max_cool_down: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cool_down: Duration::from_secs(15 * 60),
            quota_backoff_multiplier: 2.0,
            max_cool_down: Duration::from_secs(6 * 60 * 60),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
    last_error: Option<String>,
    current_cool_down: Duration,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_error: Option<String>,
    pub remaining_cool_down: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<BreakerInner>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            inner: Arc::new(Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                opened_at: None,
                last_error: None,
                current_cool_down: config.cool_down,
            })),
            config,
        }
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(circuit = %self.name, "Recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    fn remaining(inner: &BreakerInner) -> Duration {
        inner
            .opened_at
            .map(|t| inner.current_cool_down.saturating_sub(t.elapsed()))
            .unwrap_or(Duration::ZERO)
    }

    fn refresh(&self, inner: &mut BreakerInner) {
        if inner.state == CircuitState::Open && Self::remaining(inner).is_zero() {
            tracing::info!(circuit = %self.name, "Cool-down over, probing API again");
            inner.state = CircuitState::HalfOpen;
        }
    }

    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock_inner();
        self.refresh(&mut inner);
        inner.state
    }

    /// `Ok` when an API call may be attempted, otherwise the remaining
    /// cool-down.
    pub fn allow(&self) -> Result<(), Duration> {
        let mut inner = self.lock_inner();
        self.refresh(&mut inner);
        match inner.state {
            CircuitState::Open => Err(Self::remaining(&inner)),
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock_inner();
        if inner.state == CircuitState::HalfOpen {
            tracing::info!(circuit = %self.name, "API probe succeeded, closing breaker");
        }
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.opened_at = None;
        inner.last_error = None;
        inner.current_cool_down = self.config.cool_down;
    }

    /// Record a failed API call. Errors that do not indicate an API-side
    /// problem are ignored.
    pub fn record_failure(&self, error: &AppError) {
        if !error.should_trip_circuit() {
            return;
        }
        let immediate = matches!(error, AppError::QuotaExceeded(_) | AppError::AuthError(_));
        let quota = matches!(error, AppError::QuotaExceeded(_) | AppError::RateLimitExceeded);

        let mut inner = self.lock_inner();
        self.refresh(&mut inner);
        inner.failure_count += 1;
        inner.last_error = Some(error.to_string());

        let should_open = match inner.state {
            CircuitState::Closed => immediate || inner.failure_count >= self.config.failure_threshold,
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };
        if !should_open {
            return;
        }

        let reopening = inner.state == CircuitState::HalfOpen;
        if quota && reopening {
            inner.current_cool_down = Duration::from_secs_f32(
                inner.current_cool_down.as_secs_f32() * self.config.quota_backoff_multiplier,
            )
            .min(self.config.max_cool_down);
        }
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        tracing::warn!(
            circuit = %self.name,
            error = %error,
            cool_down_secs = inner.current_cool_down.as_secs(),
            "API breaker open, using fallback path"
        );
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.lock_inner();
        self.refresh(&mut inner);
        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            last_error: inner.last_error.clone(),
            remaining_cool_down: (inner.state == CircuitState::Open)
                .then(|| Self::remaining(&inner)),
        }
    }
}
