use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use chromiumoxide::{Browser, BrowserConfig};
use futures::StreamExt;
use trawl_core::error::AppError;
use trawl_core::proxy::ProxyEndpoint;
use trawl_core::traits::{FetchRequest, Fetcher, Identity};

use crate::identity::random_identity;

/// Headless-browser fetcher using Chromium via the Chrome DevTools Protocol.
///
/// Renders JavaScript before returning the HTML, for sources whose listing
/// pages are built client-side. One Chromium process is shared by all clones;
/// each fetch opens a tab, applies the request's user agent, and closes it.
///
/// The proxy is fixed for the browser session (`--proxy-server`); a request
/// carrying a different proxy is fetched through the session proxy.
#[derive(Clone)]
pub struct BrowserFetcher {
    browser: Arc<Browser>,
    proxy: Option<ProxyEndpoint>,
    timeout: Duration,
}

impl BrowserFetcher {
    /// Launch with a random identity, no proxy, and a 30 s navigation timeout.
    pub async fn new() -> Result<Self, AppError> {
        Self::launch(random_identity(), None, Duration::from_secs(30)).await
    }

    /// Launch a session presenting `identity`'s viewport, optionally through
    /// `proxy`.
    pub async fn launch(
        identity: Identity,
        proxy: Option<ProxyEndpoint>,
        timeout: Duration,
    ) -> Result<Self, AppError> {
        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .disable_default_args()
            .window_size(identity.viewport.0, identity.viewport.1);

        if let Some(bin) = Self::find_chrome_binary() {
            tracing::info!("Using Chrome binary: {}", bin.display());
            builder = builder.chrome_executable(bin);
        }
        if let Some(proxy) = &proxy {
            builder = builder.arg(format!(
                "--proxy-server={}://{}:{}",
                proxy.protocol.as_str(),
                proxy.host,
                proxy.port
            ));
        }

        let config = builder
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--no-first-run")
            .arg(format!("--user-agent={}", identity.user_agent))
            .build()
            .map_err(|e| AppError::ConfigError(format!("Browser config error: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| AppError::Generic(format!("Failed to launch browser: {e}")))?;

        // The CDP handler must be polled continuously for the connection to work.
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    tracing::warn!("Browser CDP handler error: {event:?}");
                    break;
                }
            }
        });

        Ok(Self {
            browser: Arc::new(browser),
            proxy,
            timeout,
        })
    }

    /// Locate a real Chrome/Chromium binary. Snap wrappers strip headless
    /// flags, so the binary inside the snap is preferred.
    fn find_chrome_binary() -> Option<PathBuf> {
        if let Ok(p) = std::env::var("CHROME_BIN") {
            let path = PathBuf::from(&p);
            if path.exists() {
                return Some(path);
            }
        }

        [
            "/snap/chromium/current/usr/lib/chromium-browser/chrome",
            "/var/lib/flatpak/exports/bin/org.chromium.Chromium",
            "/usr/bin/google-chrome-stable",
            "/usr/bin/google-chrome",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
        ]
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
    }
}

impl Fetcher for BrowserFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<String, AppError> {
        if request.proxy.is_some() && request.proxy != self.proxy {
            tracing::debug!(url = %request.url, "Request proxy differs from browser session proxy");
        }

        let url = request.url.as_str();
        let result = tokio::time::timeout(self.timeout, async {
            let page = self
                .browser
                .new_page("about:blank")
                .await
                .map_err(|e| AppError::NetworkError(format!("Failed to open tab: {e}")))?;

            if let Some(identity) = &request.identity {
                page.set_user_agent(SetUserAgentOverrideParams::new(identity.user_agent.clone()))
                    .await
                    .map_err(|e| AppError::Generic(format!("Failed to set user agent: {e}")))?;
            }

            page.goto(url)
                .await
                .map_err(|e| AppError::NetworkError(format!("Failed to navigate to {url}: {e}")))?;
            page.find_element("body")
                .await
                .map_err(|e| AppError::HttpError(format!("Page did not render body: {e}")))?;

            let html = page
                .content()
                .await
                .map_err(|e| AppError::HttpError(format!("Failed to read page content: {e}")))?;

            let _ = page.close().await;
            Ok::<String, AppError>(html)
        })
        .await;

        match result {
            Ok(inner) => inner,
            Err(_) => Err(AppError::Timeout(self.timeout.as_secs())),
        }
    }
}
