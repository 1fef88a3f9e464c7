//! Per-source sliding-window admission control.
//!
//! Every source gets its own window of recent admission instants, bounded
//! by a [`RateLimit`]. A caller of [`RateLimiter::await_slot`] is admitted
//! immediately while the window has room; otherwise it sleeps until the
//! oldest admission leaves the window.
//!
//! Waiters for the same source are admitted strictly in arrival order: the
//! per-source state sits behind a FIFO-fair `tokio::sync::Mutex`, and a
//! waiter keeps that lock while it sleeps, so nobody queued behind it can
//! overtake. Different sources never contend with each other.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use trawl_core::rate_limit::{RateLimit, RateLimiter};
//!
//! # async fn run() {
//! let limiter = RateLimiter::new(RateLimit::new(10, Duration::from_secs(60)))
//!     .with_limit("slow-board", RateLimit::new(2, Duration::from_secs(10)));
//! limiter.await_slot("slow-board").await;
//! # }
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;

/// Admission budget: at most `max_requests` within any `window`.
///
/// Deserialized from `{"max_requests": n, "window_secs": s}`; a zero
/// request budget is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RateLimitFields")]
pub struct RateLimit {
    pub max_requests: u32,
    pub window: Duration,
}

#[derive(Deserialize)]
struct RateLimitFields {
    max_requests: u32,
    window_secs: u64,
}

impl TryFrom<RateLimitFields> for RateLimit {
    type Error = String;

    fn try_from(fields: RateLimitFields) -> Result<Self, Self::Error> {
        if fields.max_requests == 0 {
            return Err("max_requests must be at least 1".to_string());
        }
        Ok(Self {
            max_requests: fields.max_requests,
            window: Duration::from_secs(fields.window_secs),
        })
    }
}

impl RateLimit {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests: max_requests.max(1),
            window,
        }
    }
}

impl Default for RateLimit {
    /// 10 requests per minute.
    fn default() -> Self {
        Self::new(10, Duration::from_secs(60))
    }
}

/// Recent admissions for one source.
#[derive(Debug, Default)]
struct RateWindow {
    admitted: VecDeque<Instant>,
}

impl RateWindow {
    /// Drop admissions that have left the window.
    fn purge(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.admitted.front() {
            if now.duration_since(oldest) >= window {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Shared, cloneable per-source rate limiter.
#[derive(Clone)]
pub struct RateLimiter {
    default_limit: RateLimit,
    limits: Arc<HashMap<String, RateLimit>>,
    /// Lazily created window per source.
    windows: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<RateWindow>>>>>,
}

impl RateLimiter {
    pub fn new(default_limit: RateLimit) -> Self {
        Self {
            default_limit,
            limits: Arc::new(HashMap::new()),
            windows: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Override the budget for one source. Call before sharing the limiter.
    pub fn with_limit(mut self, source: impl Into<String>, limit: RateLimit) -> Self {
        Arc::make_mut(&mut self.limits).insert(source.into(), limit);
        self
    }

    pub fn limit_for(&self, source: &str) -> RateLimit {
        self.limits
            .get(source)
            .copied()
            .unwrap_or(self.default_limit)
    }

    fn window_for(&self, source: &str) -> Arc<tokio::sync::Mutex<RateWindow>> {
        let mut windows = self.windows.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned rate limiter map");
            poisoned.into_inner()
        });
        windows
            .entry(source.to_string())
            .or_default()
            .clone()
    }

    /// Suspend until a request for `source` may proceed, then record it.
    pub async fn await_slot(&self, source: &str) {
        let limit = self.limit_for(source);
        let window = self.window_for(source);
        let mut state = window.lock().await;

        loop {
            let now = Instant::now();
            state.purge(now, limit.window);

            // A zero budget degrades to one admission per window.
            let oldest = match state.admitted.front() {
                Some(&oldest) if state.admitted.len() >= limit.max_requests as usize => oldest,
                _ => {
                    state.admitted.push_back(now);
                    return;
                }
            };
            let wait = (oldest + limit.window).saturating_duration_since(now);
            tracing::debug!(
                source = %source,
                wait_ms = %wait.as_millis(),
                "Rate limit reached, waiting for slot"
            );
            tokio::time::sleep(wait).await;
        }
    }

    /// Admissions currently inside the window for `source`.
    pub async fn in_flight(&self, source: &str) -> usize {
        let limit = self.limit_for(source);
        let window = self.window_for(source);
        let mut state = window.lock().await;
        state.purge(Instant::now(), limit.window);
        state.admitted.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn admits_up_to_limit_immediately() {
        let limiter = RateLimiter::new(RateLimit::new(3, Duration::from_secs(1)));
        let start = Instant::now();
        for _ in 0..3 {
            limiter.await_slot("board").await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(limiter.in_flight("board").await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn requests_beyond_limit_wait_for_window() {
        let max = 5;
        let window = Duration::from_secs(2);
        let limiter = RateLimiter::new(RateLimit::new(max, window));
        let start = Instant::now();

        let mut admitted_at = Vec::new();
        for _ in 0..(max + 5) {
            limiter.await_slot("board").await;
            admitted_at.push(start.elapsed());
        }

        for at in &admitted_at[..max as usize] {
            assert_eq!(*at, Duration::ZERO);
        }
        for at in &admitted_at[max as usize..] {
            assert!(*at >= window, "admitted too early: {at:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn no_window_ever_exceeds_limit() {
        let limiter = RateLimiter::new(RateLimit::new(2, Duration::from_millis(500)));
        let start = Instant::now();
        let mut admitted_at = Vec::new();
        for _ in 0..9 {
            limiter.await_slot("board").await;
            admitted_at.push(start.elapsed());
        }
        for (i, at) in admitted_at.iter().enumerate() {
            let in_window = admitted_at[i..]
                .iter()
                .filter(|later| **later < *at + Duration::from_millis(500))
                .count();
            assert!(in_window <= 2);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_are_admitted_in_arrival_order() {
        let limiter = RateLimiter::new(RateLimit::new(1, Duration::from_millis(100)));
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..6 {
            let limiter = limiter.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                limiter.await_slot("board").await;
                order.lock().unwrap().push(i);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn sources_do_not_block_each_other() {
        let limiter = RateLimiter::new(RateLimit::new(1, Duration::from_secs(10)));
        let start = Instant::now();
        limiter.await_slot("a").await;
        limiter.await_slot("b").await;
        limiter.await_slot("c").await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[test]
    fn per_source_override() {
        let limiter = RateLimiter::new(RateLimit::default())
            .with_limit("slow", RateLimit::new(1, Duration::from_secs(30)));
        assert_eq!(limiter.limit_for("slow").max_requests, 1);
        assert_eq!(limiter.limit_for("other"), RateLimit::default());
    }

    #[test]
    fn zero_budget_is_rejected_on_load() {
        let err = serde_json::from_str::<RateLimit>(r#"{"max_requests": 0, "window_secs": 60}"#)
            .unwrap_err();
        assert!(err.to_string().contains("max_requests"));

        let limit: RateLimit =
            serde_json::from_str(r#"{"max_requests": 4, "window_secs": 30}"#).unwrap();
        assert_eq!(limit, RateLimit::new(4, Duration::from_secs(30)));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_budget_built_by_hand_admits_one_per_window() {
        let limit = RateLimit {
            max_requests: 0,
            window: Duration::from_secs(60),
        };
        let limiter = RateLimiter::new(limit);
        let start = Instant::now();
        limiter.await_slot("board").await;
        limiter.await_slot("board").await;
        assert!(start.elapsed() >= Duration::from_secs(60));
        assert_eq!(limiter.in_flight("board").await, 1);
    }
}
