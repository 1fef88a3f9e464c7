use std::time::{Duration, Instant};

use trawl_core::error::AppError;
use trawl_core::proxy::{ProxyEndpoint, ProxyProber};

use crate::fetcher::{build_client, map_send_error};

/// Probes a proxy by fetching a known URL through it.
#[derive(Debug, Clone)]
pub struct HttpProxyProber {
    check_url: String,
    timeout: Duration,
}

impl HttpProxyProber {
    pub fn new(check_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            check_url: check_url.into(),
            timeout,
        }
    }
}

impl ProxyProber for HttpProxyProber {
    async fn probe(&self, proxy: &ProxyEndpoint) -> Result<Duration, AppError> {
        let client = build_client(Some(proxy), self.timeout)?;
        let started = Instant::now();
        let response = client
            .get(&self.check_url)
            .send()
            .await
            .map_err(|e| map_send_error(e, self.timeout, true))?;

        if !response.status().is_success() {
            return Err(AppError::ProxyError(format!(
                "Probe through {proxy} returned HTTP {}",
                response.status().as_u16()
            )));
        }
        Ok(started.elapsed())
    }
}
