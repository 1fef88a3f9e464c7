use std::collections::HashSet;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use trawl_core::error::AppError;
use trawl_core::proxy::{ProxyEndpoint, ProxyPool};
use trawl_core::rate_limit::RateLimiter;
use trawl_core::traits::{
    Cleaner, FetchOutcome, FetchRequest, Fetcher, Identity, SkippedElement, SourceAdapter,
};

use crate::cleaner::HtmdCleaner;
use crate::extract::{CardExtractor, ListingSelectors};
use crate::identity::random_identity;
use crate::retry::RetryPolicy;
use crate::schema::ShapeCheck;
use crate::seen::SeenCache;

/// Source adapter that scrapes listing cards out of HTML pages.
///
/// Every attempt waits for a rate-limiter slot, goes out through the next
/// proxy, and is bounded by `timeout`. Transient failures are retried per
/// [`RetryPolicy`]. Cards already emitted in this session are dropped.
pub struct HtmlSourceAdapter<F: Fetcher, C: Cleaner = HtmdCleaner> {
    name: String,
    fetcher: F,
    cleaner: C,
    extractor: CardExtractor,
    limiter: RateLimiter,
    proxies: ProxyPool,
    retry: RetryPolicy,
    timeout: Duration,
    seen: SeenCache,
    shape: ShapeCheck,
    identity: Mutex<Identity>,
}

impl<F: Fetcher> HtmlSourceAdapter<F> {
    pub fn new(
        name: impl Into<String>,
        fetcher: F,
        selectors: &ListingSelectors,
        limiter: RateLimiter,
    ) -> Result<Self, AppError> {
        Ok(Self {
            name: name.into(),
            fetcher,
            cleaner: HtmdCleaner::new(),
            extractor: CardExtractor::new(selectors)?,
            limiter,
            proxies: ProxyPool::empty(),
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(30),
            seen: SeenCache::default(),
            shape: ShapeCheck::object(),
            identity: Mutex::new(random_identity()),
        })
    }
}

impl<F: Fetcher, C: Cleaner> HtmlSourceAdapter<F, C> {
    pub fn with_proxies(mut self, proxies: ProxyPool) -> Self {
        self.proxies = proxies;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_shape(mut self, shape: ShapeCheck) -> Self {
        self.shape = shape;
        self
    }

    pub fn with_seen_capacity(mut self, capacity: u64) -> Self {
        self.seen = SeenCache::new(capacity);
        self
    }

    fn identity(&self) -> Identity {
        self.identity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    async fn fetch_once(&self, url: &str) -> Result<String, AppError> {
        self.limiter.await_slot(&self.name).await;

        let proxy = self.proxies.next();
        let request = FetchRequest::new(url)
            .via(proxy.clone())
            .as_identity(self.identity());

        let started = Instant::now();
        let result = match tokio::time::timeout(self.timeout, self.fetcher.fetch(&request)).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Timeout(self.timeout.as_secs())),
        };

        if let Some(proxy) = &proxy {
            self.report_proxy(proxy, &result, started.elapsed());
        }
        result
    }

    /// Only transport-level failures count against a proxy; an HTTP 404 says
    /// nothing about the proxy's health.
    fn report_proxy(&self, proxy: &ProxyEndpoint, result: &Result<String, AppError>, took: Duration) {
        match result {
            Ok(_) => self
                .proxies
                .record_result(proxy, true, Some(took.as_millis() as u64)),
            Err(
                AppError::ProxyError(_) | AppError::NetworkError(_) | AppError::Timeout(_),
            ) => self.proxies.record_result(proxy, false, None),
            Err(_) => {}
        }
    }
}

#[async_trait]
impl<F, C> SourceAdapter for HtmlSourceAdapter<F, C>
where
    F: Fetcher + 'static,
    C: Cleaner + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, url: &str) -> Result<FetchOutcome, AppError> {
        let html = self.retry.run(url, move |_| self.fetch_once(url)).await?;

        let (records, mut skipped) = self.extractor.extract(&self.name, url, &html, &self.cleaner);
        let found = records.len();
        let mut fresh = Vec::with_capacity(found);
        let mut emitted = HashSet::new();
        for (index, record) in records.into_iter().enumerate() {
            let data = serde_json::Value::Object(record.fields.clone());
            if !self.validate_shape(&data) {
                skipped.push(SkippedElement {
                    index,
                    reason: "unexpected record shape".to_string(),
                });
                continue;
            }
            let id = record.external_id.clone().unwrap_or_default();
            if !self.seen.contains(&id) && emitted.insert(id) {
                fresh.push(record);
            }
        }

        tracing::debug!(
            source = %self.name,
            %url,
            found,
            emitted = fresh.len(),
            skipped = skipped.len(),
            "Extracted listing cards"
        );
        Ok(FetchOutcome {
            records: fresh,
            skipped,
        })
    }

    fn validate_shape(&self, data: &serde_json::Value) -> bool {
        self.shape.matches(data)
    }

    fn commit_seen(&self, ids: &[String]) {
        for id in ids {
            self.seen.mark(id);
        }
    }

    fn clear_session(&self) {
        self.seen.clear();
        *self.identity.lock().unwrap_or_else(|e| e.into_inner()) = random_identity();
        tracing::debug!(source = %self.name, "Adapter session reset");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use trawl_core::proxy::ProxyProtocol;
    use trawl_core::rate_limit::RateLimit;
    use trawl_core::testutil::MockFetcher;

    use super::*;
    use crate::extract::FieldSelector;

    const PAGE: &str = r#"
        <ul>
          <li class="job" data-id="1"><h2>Backend Intern</h2></li>
          <li class="job" data-id="2"><h2>Data Intern</h2></li>
          <li class="job"><h2>Broken card</h2></li>
        </ul>"#;

    fn selectors() -> ListingSelectors {
        ListingSelectors {
            card: "li.job".into(),
            id: FieldSelector::attr(":scope", "data-id"),
            fields: BTreeMap::from([("title".to_string(), FieldSelector::text("h2"))]),
            required: vec!["title".into()],
        }
    }

    fn adapter(fetcher: MockFetcher) -> HtmlSourceAdapter<MockFetcher> {
        HtmlSourceAdapter::new(
            "board",
            fetcher,
            &selectors(),
            RateLimiter::new(RateLimit::new(100, Duration::from_secs(1))),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn partial_page_is_success_and_session_suppresses_repeats() {
        let fetcher = MockFetcher::with_responses(vec![Ok(PAGE.into()), Ok(PAGE.into()), Ok(PAGE.into())]);
        let adapter = adapter(fetcher.clone());

        let first = adapter.fetch("https://board.example.com/jobs").await.unwrap();
        assert_eq!(first.records.len(), 2);
        assert_eq!(first.skipped.len(), 1);

        let ids: Vec<String> = first
            .records
            .iter()
            .filter_map(|r| r.external_id.clone())
            .collect();
        adapter.commit_seen(&ids);
        let second = adapter.fetch("https://board.example.com/jobs").await.unwrap();
        assert!(second.records.is_empty());

        adapter.clear_session();
        let third = adapter.fetch("https://board.example.com/jobs").await.unwrap();
        assert_eq!(third.records.len(), 2);
        assert_eq!(fetcher.call_count(), 3);
    }

    #[tokio::test]
    async fn uncommitted_records_are_emitted_again() {
        let fetcher = MockFetcher::with_responses(vec![Ok(PAGE.into()), Ok(PAGE.into())]);
        let adapter = adapter(fetcher);

        let first = adapter.fetch("https://board.example.com/jobs").await.unwrap();
        assert_eq!(first.records.len(), 2);
        // Nothing committed: the store never saw these.
        let retry = adapter.fetch("https://board.example.com/jobs").await.unwrap();
        assert_eq!(retry.records.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_and_charged_to_proxy() {
        let fetcher = MockFetcher::with_responses(vec![
            Err(AppError::ProxyError("refused".into())),
            Ok(PAGE.into()),
        ]);
        let proxy = ProxyEndpoint::new("10.0.0.1", 8080, ProxyProtocol::Http);
        let pool = ProxyPool::new(vec![proxy.clone()]);
        let adapter = adapter(fetcher.clone()).with_proxies(pool.clone());

        let outcome = adapter.fetch("https://board.example.com/jobs").await.unwrap();
        assert_eq!(outcome.records.len(), 2);

        let requests = fetcher.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].proxy.as_ref(), Some(&proxy));
        assert!(requests[0].identity.is_some());

        let status = pool.status();
        assert!(status[0].health.healthy);
        assert_eq!(status[0].health.consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn http_404_is_not_retried() {
        let fetcher = MockFetcher::with_responses(vec![Err(AppError::HttpError(
            "HTTP 404 for https://board.example.com/jobs".into(),
        ))]);
        let adapter = adapter(fetcher.clone());
        let err = adapter.fetch("https://board.example.com/jobs").await.unwrap_err();
        assert!(matches!(err, AppError::HttpError(_)));
        assert_eq!(fetcher.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn every_attempt_takes_a_rate_limit_slot() {
        let fetcher = MockFetcher::with_responses(vec![
            Err(AppError::Timeout(5)),
            Err(AppError::Timeout(5)),
            Ok(PAGE.into()),
        ]);
        let limiter = RateLimiter::new(RateLimit::new(100, Duration::from_secs(60)));
        let adapter = HtmlSourceAdapter::new("board", fetcher, &selectors(), limiter.clone())
            .unwrap();

        adapter.fetch("https://board.example.com/jobs").await.unwrap();
        assert_eq!(limiter.in_flight("board").await, 3);
    }

    #[tokio::test]
    async fn schema_rejects_wrong_shape() {
        let shape = ShapeCheck::from_schema(&serde_json::json!({
            "type": "object",
            "required": ["title", "salary"]
        }))
        .unwrap();
        let fetcher = MockFetcher::new(PAGE);
        let adapter = adapter(fetcher).with_shape(shape);

        let outcome = adapter.fetch("https://board.example.com/jobs").await.unwrap();
        assert!(outcome.records.is_empty());
        assert_eq!(outcome.skipped.len(), 3);
    }
}
