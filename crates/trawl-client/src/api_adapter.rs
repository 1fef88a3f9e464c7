use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use trawl_core::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use trawl_core::error::AppError;
use trawl_core::models::RawRecord;
use trawl_core::rate_limit::RateLimiter;
use trawl_core::traits::{FetchOutcome, SkippedElement, SourceAdapter};

use crate::fetcher::map_send_error;
use crate::retry::RetryPolicy;
use crate::schema::ShapeCheck;
use crate::seen::SeenCache;

/// What to do when the API path fails.
#[derive(Debug, Clone, Default)]
pub enum FallbackPolicy {
    /// Try the API on every fetch; fall back to HTML whenever it fails.
    #[default]
    Always,
    /// After quota/auth rejections (or repeated transient failures) skip the
    /// API entirely for a cool-down and go straight to HTML.
    CoolDown(CircuitBreakerConfig),
}

/// Authenticated JSON GET.
pub trait JsonApi: Send + Sync + 'static {
    fn get_json(
        &self,
        url: &str,
        token: &str,
    ) -> impl Future<Output = Result<serde_json::Value, AppError>> + Send;
}

/// [`JsonApi`] over reqwest with bearer-token auth.
#[derive(Clone)]
pub struct ReqwestJsonApi {
    client: Client,
    timeout: Duration,
}

impl ReqwestJsonApi {
    pub fn new(timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;
        Ok(Self { client, timeout })
    }
}

impl JsonApi for ReqwestJsonApi {
    async fn get_json(&self, url: &str, token: &str) -> Result<serde_json::Value, AppError> {
        let response = self
            .client
            .get(url)
            .bearer_auth(token)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| map_send_error(e, self.timeout, false))?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail = body.chars().take(200).collect::<String>();
            return Err(match status {
                401 | 403 => AppError::AuthError(format!("HTTP {status}: {detail}")),
                429 => AppError::QuotaExceeded(format!("HTTP 429: {detail}")),
                _ => AppError::HttpError(format!("HTTP {status} for {url}")),
            });
        }

        response
            .json()
            .await
            .map_err(|e| AppError::ExtractionError(format!("Malformed API payload: {e}")))
    }
}

/// Where the listing array lives in the API response, and how items are keyed.
#[derive(Debug, Clone)]
pub struct ApiEndpoint {
    /// Request URL. `{url}` is replaced with the job URL, percent-encoded.
    pub url: String,
    pub token: String,
    /// JSON pointer to the item array; empty means the response is the array.
    pub items_pointer: String,
    pub id_field: String,
}

impl ApiEndpoint {
    fn request_url(&self, job_url: &str) -> String {
        if self.url.contains("{url}") {
            let encoded: String = url::form_urlencoded::byte_serialize(job_url.as_bytes()).collect();
            self.url.replace("{url}", &encoded)
        } else {
            self.url.clone()
        }
    }
}

/// Source adapter that reads listings from an authenticated API and falls
/// back to an HTML adapter for the same source when the API fails. Callers
/// cannot tell which path produced the records.
pub struct ApiSourceAdapter<J: JsonApi> {
    name: String,
    api: J,
    endpoint: ApiEndpoint,
    fallback: Arc<dyn SourceAdapter>,
    limiter: RateLimiter,
    retry: RetryPolicy,
    breaker: Option<CircuitBreaker>,
    seen: SeenCache,
    shape: ShapeCheck,
    fallbacks: AtomicU64,
}

impl<J: JsonApi> ApiSourceAdapter<J> {
    /// `fallback` must report the same source name.
    pub fn new(
        name: impl Into<String>,
        api: J,
        endpoint: ApiEndpoint,
        fallback: Arc<dyn SourceAdapter>,
        limiter: RateLimiter,
    ) -> Self {
        Self {
            name: name.into(),
            api,
            endpoint,
            fallback,
            limiter,
            retry: RetryPolicy::default(),
            breaker: None,
            seen: SeenCache::default(),
            shape: ShapeCheck::object(),
            fallbacks: AtomicU64::new(0),
        }
    }

    pub fn with_policy(mut self, policy: FallbackPolicy) -> Self {
        self.breaker = match policy {
            FallbackPolicy::Always => None,
            FallbackPolicy::CoolDown(config) => {
                Some(CircuitBreaker::new(format!("{}-api", self.name), config))
            }
        };
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_shape(mut self, shape: ShapeCheck) -> Self {
        self.shape = shape;
        self
    }

    /// How many fetches were served by the HTML path.
    pub fn fallback_count(&self) -> u64 {
        self.fallbacks.load(Ordering::Relaxed)
    }

    pub fn breaker(&self) -> Option<&CircuitBreaker> {
        self.breaker.as_ref()
    }

    async fn fetch_api(&self, url: &str) -> Result<FetchOutcome, AppError> {
        let request_url = self.endpoint.request_url(url);
        let target = request_url.as_str();
        let payload = self
            .retry
            .run(target, move |_| async move {
                self.limiter.await_slot(&self.name).await;
                self.api.get_json(target, &self.endpoint.token).await
            })
            .await?;

        let located = match self.endpoint.items_pointer.as_str() {
            "" => Some(&payload),
            pointer => payload.pointer(pointer),
        };
        let items = located.and_then(|v| v.as_array()).ok_or_else(|| {
            AppError::ExtractionError(format!(
                "API payload has no item array at '{}'",
                self.endpoint.items_pointer
            ))
        })?;

        let mut outcome = FetchOutcome::default();
        let mut emitted = HashSet::new();
        for (index, item) in items.iter().enumerate() {
            match self.to_record(item, &mut emitted) {
                Ok(Some(record)) => outcome.records.push(record),
                Ok(None) => {}
                Err(reason) => outcome.skipped.push(SkippedElement { index, reason }),
            }
        }
        Ok(outcome)
    }

    /// `Ok(None)` for an item already stored this session or repeated on
    /// this page.
    fn to_record(
        &self,
        item: &serde_json::Value,
        emitted: &mut HashSet<String>,
    ) -> Result<Option<RawRecord>, String> {
        if !self.validate_shape(item) {
            return Err("unexpected item shape".to_string());
        }
        let id = match item.get(&self.endpoint.id_field) {
            Some(serde_json::Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => return Err("missing external id".to_string()),
        };
        if self.seen.contains(&id) || !emitted.insert(id.clone()) {
            return Ok(None);
        }
        let fields = item.as_object().cloned().unwrap_or_default();
        let mut record = RawRecord::new(&self.name, Some(id));
        record.fields = fields;
        Ok(Some(record))
    }

    async fn fall_back(&self, url: &str) -> Result<FetchOutcome, AppError> {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
        self.fallback.fetch(url).await
    }
}

#[async_trait]
impl<J: JsonApi> SourceAdapter for ApiSourceAdapter<J> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, url: &str) -> Result<FetchOutcome, AppError> {
        if let Some(breaker) = &self.breaker
            && let Err(remaining) = breaker.allow()
        {
            tracing::debug!(
                source = %self.name,
                remaining_secs = remaining.as_secs(),
                "API cooling down, using HTML path"
            );
            return self.fall_back(url).await;
        }

        match self.fetch_api(url).await {
            Ok(outcome) => {
                if let Some(breaker) = &self.breaker {
                    breaker.record_success();
                }
                Ok(outcome)
            }
            Err(e) => {
                if let Some(breaker) = &self.breaker {
                    breaker.record_failure(&e);
                }
                tracing::warn!(source = %self.name, error = %e, "API path failed, falling back to HTML");
                self.fall_back(url).await
            }
        }
    }

    fn validate_shape(&self, data: &serde_json::Value) -> bool {
        self.shape.matches(data)
    }

    fn commit_seen(&self, ids: &[String]) {
        for id in ids {
            self.seen.mark(id);
        }
        self.fallback.commit_seen(ids);
    }

    fn clear_session(&self) {
        self.seen.clear();
        self.fallback.clear_session();
    }
}
