use std::net::IpAddr;
use std::time::Duration;

use moka::sync::Cache;
use reqwest::Client;
use reqwest::header::USER_AGENT;
use trawl_core::error::AppError;
use trawl_core::proxy::ProxyEndpoint;
use trawl_core::traits::{FetchRequest, Fetcher};
use url::Url;

const DEFAULT_USER_AGENT: &str = "Trawl/0.1 (listing ingestion)";

/// HTTP fetcher using reqwest.
///
/// One client is kept per proxy (clients bind their proxy at build time).
/// The request identity, when present, overrides the User-Agent header.
/// SSRF protection is **enabled** by default: requests to private/reserved
/// IP ranges are blocked. Use [`allow_private_urls`](Self::allow_private_urls)
/// to disable it.
#[derive(Clone)]
pub struct ReqwestFetcher {
    direct: Client,
    proxied: Cache<String, Client>,
    timeout: Duration,
    ssrf_protection: bool,
}

impl ReqwestFetcher {
    pub fn new() -> Result<Self, AppError> {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, AppError> {
        Ok(Self {
            direct: build_client(None, timeout)?,
            proxied: Cache::new(64),
            timeout,
            ssrf_protection: true,
        })
    }

    /// Disable SSRF protection, allowing requests to private/reserved IPs.
    pub fn allow_private_urls(mut self) -> Self {
        self.ssrf_protection = false;
        self
    }

    fn client_for(&self, proxy: Option<&ProxyEndpoint>) -> Result<Client, AppError> {
        let Some(proxy) = proxy else {
            return Ok(self.direct.clone());
        };
        let key = proxy.url();
        if let Some(client) = self.proxied.get(&key) {
            return Ok(client);
        }
        let client = build_client(Some(proxy), self.timeout)?;
        self.proxied.insert(key, client.clone());
        Ok(client)
    }
}

pub(crate) fn build_client(
    proxy: Option<&ProxyEndpoint>,
    timeout: Duration,
) -> Result<Client, AppError> {
    let mut builder = Client::builder()
        .user_agent(DEFAULT_USER_AGENT)
        .timeout(timeout);
    if let Some(proxy) = proxy {
        let proxy = reqwest::Proxy::all(proxy.url())
            .map_err(|e| AppError::ConfigError(format!("Invalid proxy {proxy}: {e}")))?;
        builder = builder.proxy(proxy);
    }
    builder
        .build()
        .map_err(|e| AppError::HttpError(e.to_string()))
}

/// Map a transport error, attributing connection failures to the proxy when
/// one was in use.
pub(crate) fn map_send_error(e: reqwest::Error, timeout: Duration, proxied: bool) -> AppError {
    if e.is_timeout() {
        AppError::Timeout(timeout.as_secs())
    } else if e.is_connect() && proxied {
        AppError::ProxyError(format!("Connection via proxy failed: {e}"))
    } else if e.is_connect() {
        AppError::NetworkError(format!("Connection failed: {e}"))
    } else {
        AppError::HttpError(e.to_string())
    }
}

impl Fetcher for ReqwestFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<String, AppError> {
        if self.ssrf_protection {
            validate_url(&request.url).await?;
        }

        let client = self.client_for(request.proxy.as_ref())?;
        let mut builder = client.get(&request.url);
        if let Some(identity) = &request.identity {
            builder = builder.header(USER_AGENT, identity.user_agent.as_str());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| map_send_error(e, self.timeout, request.proxy.is_some()))?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(AppError::RateLimitExceeded);
        }
        if !status.is_success() {
            return Err(AppError::HttpError(format!(
                "HTTP {} for {}",
                status.as_u16(),
                request.url
            )));
        }

        response
            .text()
            .await
            .map_err(|e| AppError::HttpError(format!("Failed to read response body: {e}")))
    }
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Reject non-http(s) URLs and hosts that resolve to private/reserved IPs.
async fn validate_url(url: &str) -> Result<(), AppError> {
    let parsed = Url::parse(url).map_err(|e| AppError::HttpError(format!("Invalid URL: {e}")))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::HttpError(format!(
                "URL scheme '{scheme}' is not allowed (only http/https)"
            )));
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::HttpError("URL has no host".to_string()))?;

    if let Ok(ip) = host.trim_matches(['[', ']']).parse::<IpAddr>() {
        if is_private_ip(ip) {
            return Err(AppError::HttpError(format!(
                "SSRF blocked: {host} resolves to private/reserved IP"
            )));
        }
        return Ok(());
    }

    let port = parsed.port_or_known_default().unwrap_or(80);
    let addrs: Vec<_> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| AppError::NetworkError(format!("DNS resolution failed for {host}: {e}")))?
        .collect();

    if addrs.is_empty() {
        return Err(AppError::NetworkError(format!(
            "DNS resolution returned no addresses for {host}"
        )));
    }
    if let Some(addr) = addrs.iter().find(|a| is_private_ip(a.ip())) {
        return Err(AppError::HttpError(format!(
            "SSRF blocked: {host} resolves to private/reserved IP {}",
            addr.ip()
        )));
    }
    Ok(())
}

fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local() // includes cloud metadata
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation()
                || v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64 // CGN
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || (v6.segments()[0] & 0xFFC0) == 0xFE80
                || (v6.segments()[0] & 0xFE00) == 0xFC00
                || v6
                    .to_ipv4_mapped()
                    .is_some_and(|v4| is_private_ip(IpAddr::V4(v4)))
        }
    }
}

#[cfg(test)]
mod tests {
    use trawl_core::proxy::ProxyProtocol;
    use trawl_core::traits::Identity;

    use super::*;

    #[test]
    fn private_ranges_are_blocked() {
        for ip in ["127.0.0.1", "10.1.2.3", "192.168.0.10", "169.254.169.254", "100.64.0.1", "::1", "fc00::1", "::ffff:10.0.0.1"] {
            assert!(is_private_ip(ip.parse().unwrap()), "{ip}");
        }
        for ip in ["8.8.8.8", "2001:4860:4860::8888"] {
            assert!(!is_private_ip(ip.parse().unwrap()), "{ip}");
        }
    }

    #[tokio::test]
    async fn ssrf_check_rejects_literal_private_and_bad_scheme() {
        let err = validate_url("http://127.0.0.1/admin").await.unwrap_err();
        assert!(err.to_string().contains("SSRF blocked"));
        let err = validate_url("file:///etc/passwd").await.unwrap_err();
        assert!(err.to_string().contains("not allowed"));
    }

    #[tokio::test]
    async fn ssrf_check_runs_before_any_request() {
        let fetcher = ReqwestFetcher::new().unwrap();
        let request = FetchRequest::new("http://10.0.0.5/jobs").as_identity(Identity {
            user_agent: "ua".into(),
            viewport: (1280, 720),
        });
        assert!(fetcher.fetch(&request).await.is_err());
    }

    #[test]
    fn one_client_per_proxy() {
        let fetcher = ReqwestFetcher::new().unwrap();
        let proxy = ProxyEndpoint::new("10.0.0.9", 3128, ProxyProtocol::Http);
        fetcher.client_for(Some(&proxy)).unwrap();
        fetcher.client_for(Some(&proxy)).unwrap();
        fetcher.proxied.run_pending_tasks();
        assert_eq!(fetcher.proxied.entry_count(), 1);
    }
}
