//! Proxy rotation with per-endpoint health tracking.
//!
//! [`ProxyPool::next`] round-robins over healthy endpoints. When every
//! endpoint is unhealthy the pool degrades to best effort: failure streaks
//! are reset and the first configured proxy is handed out rather than
//! blocking the caller.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    Http,
    Https,
    Socks5,
}

impl ProxyProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyProtocol::Http => "http",
            ProxyProtocol::Https => "https",
            ProxyProtocol::Socks5 => "socks5",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyCredentials {
    pub username: String,
    pub password: String,
}

/// A proxy endpoint, parsed from `scheme://[user:pass@]host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: u16,
    pub credentials: Option<ProxyCredentials>,
    pub protocol: ProxyProtocol,
}

impl ProxyEndpoint {
    pub fn new(host: impl Into<String>, port: u16, protocol: ProxyProtocol) -> Self {
        Self {
            host: host.into(),
            port,
            credentials: None,
            protocol,
        }
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.credentials = Some(ProxyCredentials {
            username: username.to_string(),
            password: password.to_string(),
        });
        self
    }

    /// Proxy URL including credentials, suitable for HTTP clients.
    pub fn url(&self) -> String {
        match &self.credentials {
            Some(c) => format!(
                "{}://{}:{}@{}:{}",
                self.protocol.as_str(),
                c.username,
                c.password,
                self.host,
                self.port
            ),
            None => format!("{}://{}:{}", self.protocol.as_str(), self.host, self.port),
        }
    }
}

/// Never prints credentials.
impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.protocol.as_str(), self.host, self.port)
    }
}

impl FromStr for ProxyEndpoint {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let with_scheme = if raw.contains("://") {
            raw.to_string()
        } else {
            format!("http://{raw}")
        };
        let url = Url::parse(&with_scheme)
            .map_err(|e| AppError::ConfigError(format!("Invalid proxy '{raw}': {e}")))?;

        let protocol = match url.scheme() {
            "http" => ProxyProtocol::Http,
            "https" => ProxyProtocol::Https,
            "socks5" | "socks5h" => ProxyProtocol::Socks5,
            other => {
                return Err(AppError::ConfigError(format!(
                    "Unsupported proxy protocol '{other}'"
                )));
            }
        };
        let host = url
            .host_str()
            .ok_or_else(|| AppError::ConfigError(format!("Proxy '{raw}' has no host")))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| AppError::ConfigError(format!("Proxy '{raw}' has no port")))?;

        let mut endpoint = ProxyEndpoint::new(host, port, protocol);
        if !url.username().is_empty() {
            endpoint = endpoint.with_credentials(url.username(), url.password().unwrap_or(""));
        }
        Ok(endpoint)
    }
}

/// Rolling health of one proxy.
#[derive(Debug, Clone, Serialize)]
pub struct ProxyHealth {
    pub healthy: bool,
    pub last_latency_ms: Option<u64>,
    pub last_checked: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

impl Default for ProxyHealth {
    /// Unchecked proxies are presumed usable.
    fn default() -> Self {
        Self {
            healthy: true,
            last_latency_ms: None,
            last_checked: None,
            consecutive_failures: 0,
        }
    }
}

/// Probes one proxy, returning the round-trip latency on success.
pub trait ProxyProber: Send + Sync + 'static {
    fn probe(
        &self,
        proxy: &ProxyEndpoint,
    ) -> impl Future<Output = Result<Duration, AppError>> + Send;
}

struct ProxyEntry {
    endpoint: ProxyEndpoint,
    health: Mutex<ProxyHealth>,
}

impl ProxyEntry {
    fn health(&self) -> MutexGuard<'_, ProxyHealth> {
        self.health.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(proxy = %self.endpoint, "Recovered from poisoned proxy health");
            poisoned.into_inner()
        })
    }

    fn is_usable(&self, threshold: u32) -> bool {
        let health = self.health();
        health.healthy && health.consecutive_failures < threshold
    }
}

/// Snapshot of one proxy for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct ProxyStatus {
    pub proxy: String,
    pub health: ProxyHealth,
}

/// Thread-safe pool of proxies shared by all workers.
#[derive(Clone)]
pub struct ProxyPool {
    entries: Arc<Vec<ProxyEntry>>,
    cursor: Arc<AtomicUsize>,
    failure_threshold: u32,
}

impl ProxyPool {
    pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

    pub fn new(endpoints: Vec<ProxyEndpoint>) -> Self {
        let entries = endpoints
            .into_iter()
            .map(|endpoint| ProxyEntry {
                endpoint,
                health: Mutex::new(ProxyHealth::default()),
            })
            .collect();
        Self {
            entries: Arc::new(entries),
            cursor: Arc::new(AtomicUsize::new(0)),
            failure_threshold: Self::DEFAULT_FAILURE_THRESHOLD,
        }
    }

    /// A pool with no proxies: `next()` always yields `None`.
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Next proxy to use. Only returns `None` for an empty pool.
    pub fn next(&self) -> Option<ProxyEndpoint> {
        let len = self.entries.len();
        if len == 0 {
            return None;
        }

        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        for offset in 0..len {
            let entry = &self.entries[(start + offset) % len];
            if entry.is_usable(self.failure_threshold) {
                return Some(entry.endpoint.clone());
            }
        }

        tracing::warn!(
            proxies = len,
            "No healthy proxy available, resetting failure streaks"
        );
        for entry in self.entries.iter() {
            entry.health().consecutive_failures = 0;
        }
        Some(self.entries[0].endpoint.clone())
    }

    /// Feed back the outcome of a request or probe through `proxy`.
    pub fn record_result(&self, proxy: &ProxyEndpoint, healthy: bool, latency_ms: Option<u64>) {
        let Some(entry) = self.entries.iter().find(|e| &e.endpoint == proxy) else {
            return;
        };
        let mut health = entry.health();
        health.healthy = healthy;
        health.last_checked = Some(Utc::now());
        if latency_ms.is_some() {
            health.last_latency_ms = latency_ms;
        }
        if healthy {
            health.consecutive_failures = 0;
        } else {
            health.consecutive_failures += 1;
        }
    }

    pub fn status(&self) -> Vec<ProxyStatus> {
        self.entries
            .iter()
            .map(|e| ProxyStatus {
                proxy: e.endpoint.to_string(),
                health: e.health().clone(),
            })
            .collect()
    }

    /// Probe every proxy once, concurrently.
    pub async fn check_all<P: ProxyProber>(&self, prober: &P) {
        let probes = self.entries.iter().map(|entry| async move {
            let result = prober.probe(&entry.endpoint).await;
            (entry, result)
        });
        for (entry, result) in futures::future::join_all(probes).await {
            match result {
                Ok(latency) => {
                    self.record_result(&entry.endpoint, true, Some(latency.as_millis() as u64));
                }
                Err(e) => {
                    tracing::debug!(proxy = %entry.endpoint, error = %e, "Proxy probe failed");
                    self.record_result(&entry.endpoint, false, None);
                }
            }
        }
    }

    /// Probe all proxies every `interval` until cancelled.
    pub fn spawn_health_checks<P: ProxyProber>(
        &self,
        prober: P,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            loop {
                pool.check_all(&prober).await;
                let healthy = pool
                    .status()
                    .iter()
                    .filter(|s| s.health.healthy)
                    .count();
                tracing::info!(healthy, total = pool.len(), "Proxy health check complete");

                tokio::select! {
                    () = tokio::time::sleep(interval) => {}
                    () = cancel.cancelled() => break,
                }
            }
        })
    }
}
