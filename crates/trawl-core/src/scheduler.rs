use std::collections::HashMap;
use std::future::Future;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use cron::Schedule;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;

/// Parse a cron expression (seconds field first, as the `cron` crate expects).
pub fn parse_schedule(expr: &str) -> Result<Schedule, AppError> {
    Schedule::from_str(expr.trim())
        .map_err(|e| AppError::ValidationError(format!("invalid cron expression '{expr}': {e}")))
}

/// Named cron runners. Each runner sleeps until the next firing time, then
/// calls its callback, until cancelled.
#[derive(Clone, Default)]
pub struct RecurringScheduler {
    runners: Arc<Mutex<HashMap<String, CancellationToken>>>,
    shutdown: CancellationToken,
}

impl RecurringScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scheduler whose runners all stop when `parent` is cancelled.
    pub fn with_parent(parent: &CancellationToken) -> Self {
        Self {
            runners: Arc::default(),
            shutdown: parent.child_token(),
        }
    }

    fn runners(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.runners.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start a runner under `name`, replacing any runner already there.
    pub fn schedule<F, Fut>(&self, name: &str, schedule: Schedule, fire: F)
    where
        F: Fn(DateTime<Utc>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let token = self.shutdown.child_token();
        if let Some(previous) = self.runners().insert(name.to_string(), token.clone()) {
            previous.cancel();
        }

        let name = name.to_string();
        tokio::spawn(async move {
            loop {
                let Some(next) = schedule.upcoming(Utc).next() else {
                    tracing::warn!(schedule = %name, "Cron schedule has no future firing");
                    break;
                };
                let delay = (next - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                tokio::select! {
                    () = tokio::time::sleep(delay) => {
                        tracing::debug!(schedule = %name, at = %next, "Recurring schedule fired");
                        fire(next).await;
                        // Do not fire twice for the same instant.
                        let remaining = next - Utc::now();
                        if remaining > TimeDelta::zero() {
                            tokio::time::sleep(remaining.to_std().unwrap_or(Duration::ZERO)).await;
                        }
                    }
                    () = token.cancelled() => break,
                }
            }
            tracing::debug!(schedule = %name, "Recurring schedule stopped");
        });
    }

    /// Stop one runner. Returns false if no runner has that name.
    pub fn cancel(&self, name: &str) -> bool {
        match self.runners().remove(name) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.runners().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.runners().clear();
    }
}
