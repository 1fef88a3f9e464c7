//! The sources file: which listing sources exist and how to reach them.
//!
//! ```json
//! {
//!   "default_rate_limit": {"max_requests": 10, "window_secs": 60},
//!   "sources": {
//!     "board": {
//!       "kind": "html",
//!       "rate_limit": {"max_requests": 30, "window_secs": 60},
//!       "selectors": {"card": "li.job", "id": {"selector": ":scope", "attr": "data-id"},
//!                     "fields": {"title": "h2"}},
//!       "schedules": [{"name": "board-nightly", "cron": "0 0 2 * * *",
//!                      "url": "https://board.example.com/jobs", "kind": "full_scrape"}]
//!     }
//!   }
//! }
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use trawl_client::{
    ApiEndpoint, ApiSourceAdapter, FallbackPolicy, HtmlSourceAdapter, ListingSelectors,
    ReqwestFetcher, ReqwestJsonApi, ShapeCheck,
};
use trawl_core::circuit_breaker::CircuitBreakerConfig;
use trawl_core::config::PipelineConfig;
use trawl_core::error::AppError;
use trawl_core::job::{CreateJobRequest, JobKind};
use trawl_core::normalize::{FieldMap, FieldMapNormalizer};
use trawl_core::proxy::ProxyPool;
use trawl_core::rate_limit::{RateLimit, RateLimiter};
use trawl_core::registry::AdapterRegistry;
use trawl_core::scheduler::parse_schedule;
use trawl_core::traits::{Fetcher, SourceAdapter};

#[derive(Debug, Clone, Deserialize)]
pub struct SourcesFile {
    #[serde(default)]
    pub default_rate_limit: RateLimit,
    pub sources: BTreeMap<String, SourceConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Html,
    Api,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub kind: SourceKind,
    pub rate_limit: Option<RateLimit>,
    /// Listing-page selectors. For API sources these drive the HTML
    /// fallback and must yield the same field names as the API items.
    pub selectors: ListingSelectors,
    /// Raw field names; defaults to the standard map for `kind`.
    pub field_map: Option<FieldMap>,
    /// JSON Schema every extracted item must satisfy.
    pub schema: Option<serde_json::Value>,
    /// Render pages in headless Chromium (needs the `browser` feature).
    #[serde(default)]
    pub browser: bool,
    pub api: Option<ApiConfig>,
    #[serde(default)]
    pub fallback: FallbackConfig,
    #[serde(default)]
    pub schedules: Vec<ScheduleConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub url: String,
    /// Environment variable holding the bearer token.
    pub token_env: String,
    #[serde(default)]
    pub items_pointer: String,
    #[serde(default = "default_id_field")]
    pub id_field: String,
}

fn default_id_field() -> String {
    "id".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum FallbackConfig {
    #[default]
    Always,
    CoolDown {
        cool_down_secs: Option<u64>,
        failure_threshold: Option<u32>,
        max_cool_down_secs: Option<u64>,
    },
}

impl FallbackConfig {
    pub fn policy(&self) -> FallbackPolicy {
        match self {
            FallbackConfig::Always => FallbackPolicy::Always,
            FallbackConfig::CoolDown {
                cool_down_secs,
                failure_threshold,
                max_cool_down_secs,
            } => {
                let defaults = CircuitBreakerConfig::default();
                FallbackPolicy::CoolDown(CircuitBreakerConfig {
                    failure_threshold: failure_threshold.unwrap_or(defaults.failure_threshold),
                    cool_down: cool_down_secs.map_or(defaults.cool_down, Duration::from_secs),
                    max_cool_down: max_cool_down_secs
                        .map_or(defaults.max_cool_down, Duration::from_secs),
                    ..defaults
                })
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    pub name: String,
    /// Cron expression with a seconds field, e.g. `0 0 2 * * *`.
    pub cron: String,
    pub url: String,
    pub kind: JobKind,
    #[serde(default)]
    pub priority: i32,
}

/// A recurring trigger ready for `IngestQueue::enqueue_recurring`.
#[derive(Debug, Clone)]
pub struct Recurring {
    pub name: String,
    pub cron: String,
    pub template: CreateJobRequest,
}

impl SourcesFile {
    pub fn load(path: &Path) -> Result<Self, AppError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::ConfigError(format!("Failed to read sources file {}: {e}", path.display()))
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, AppError> {
        let file: SourcesFile = serde_json::from_str(raw)
            .map_err(|e| AppError::ConfigError(format!("Invalid sources file: {e}")))?;
        file.check()?;
        Ok(file)
    }

    fn check(&self) -> Result<(), AppError> {
        if self.sources.is_empty() {
            return Err(AppError::ConfigError("Sources file declares no sources".into()));
        }
        let mut schedule_names = HashSet::new();
        for (name, source) in &self.sources {
            if source.kind == SourceKind::Api && source.api.is_none() {
                return Err(AppError::ConfigError(format!(
                    "Source '{name}' is kind \"api\" but has no \"api\" block"
                )));
            }
            for schedule in &source.schedules {
                parse_schedule(&schedule.cron)?;
                if !schedule_names.insert(schedule.name.as_str()) {
                    return Err(AppError::ConfigError(format!(
                        "Duplicate schedule name '{}'",
                        schedule.name
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn names(&self) -> Vec<String> {
        self.sources.keys().cloned().collect()
    }

    /// One limiter shared by every adapter, with each source's own budget.
    pub fn rate_limiter(&self) -> RateLimiter {
        self.sources
            .iter()
            .filter_map(|(name, s)| s.rate_limit.map(|limit| (name, limit)))
            .fold(RateLimiter::new(self.default_rate_limit), |limiter, (name, limit)| {
                limiter.with_limit(name.clone(), limit)
            })
    }

    pub fn recurring(&self) -> Vec<Recurring> {
        self.sources
            .iter()
            .flat_map(|(source, config)| {
                config.schedules.iter().map(move |s| Recurring {
                    name: s.name.clone(),
                    cron: s.cron.clone(),
                    template: CreateJobRequest::new(source.clone(), s.url.clone(), s.kind)
                        .with_priority(s.priority),
                })
            })
            .collect()
    }

    /// Build every adapter and its normalizer. `token` resolves the API
    /// token environment variables.
    pub async fn build_registry(
        &self,
        config: &PipelineConfig,
        proxies: &ProxyPool,
        token: impl Fn(&str) -> Option<String>,
    ) -> Result<AdapterRegistry, AppError> {
        let limiter = self.rate_limiter();
        let mut registry = AdapterRegistry::new();

        for (name, source) in &self.sources {
            let shape = match &source.schema {
                Some(schema) => ShapeCheck::from_schema(schema)?,
                None => ShapeCheck::object(),
            };
            let html = html_adapter(name, source, &shape, &limiter, proxies, config).await?;

            let adapter: Arc<dyn SourceAdapter> = match (&source.kind, &source.api) {
                (SourceKind::Api, Some(api)) => {
                    let token = token(&api.token_env).ok_or_else(|| {
                        AppError::ConfigError(format!(
                            "Source '{name}' needs the API token in {}",
                            api.token_env
                        ))
                    })?;
                    let endpoint = ApiEndpoint {
                        url: api.url.clone(),
                        token,
                        items_pointer: api.items_pointer.clone(),
                        id_field: api.id_field.clone(),
                    };
                    Arc::new(
                        ApiSourceAdapter::new(
                            name.clone(),
                            ReqwestJsonApi::new(config.fetch_timeout)?,
                            endpoint,
                            html,
                            limiter.clone(),
                        )
                        .with_policy(source.fallback.policy())
                        .with_shape(shape),
                    )
                }
                _ => html,
            };

            let field_map = source.field_map.clone().unwrap_or_else(|| match source.kind {
                SourceKind::Html => FieldMap::html_listing(),
                SourceKind::Api => FieldMap::api_listing(),
            });
            registry = registry.register(adapter, Arc::new(FieldMapNormalizer::new(field_map)));
        }

        tracing::info!(sources = registry.len(), "Source adapters ready");
        Ok(registry)
    }
}

async fn html_adapter(
    name: &str,
    source: &SourceConfig,
    shape: &ShapeCheck,
    limiter: &RateLimiter,
    proxies: &ProxyPool,
    config: &PipelineConfig,
) -> Result<Arc<dyn SourceAdapter>, AppError> {
    if source.browser {
        return browser_adapter(name, source, shape, limiter, proxies, config).await;
    }
    let fetcher = ReqwestFetcher::with_timeout(config.fetch_timeout)?;
    let adapter = with_fetcher(name, fetcher, source, shape, limiter, config)?
        .with_proxies(proxies.clone());
    Ok(Arc::new(adapter))
}

fn with_fetcher<F: Fetcher + 'static>(
    name: &str,
    fetcher: F,
    source: &SourceConfig,
    shape: &ShapeCheck,
    limiter: &RateLimiter,
    config: &PipelineConfig,
) -> Result<HtmlSourceAdapter<F>, AppError> {
    Ok(
        HtmlSourceAdapter::new(name, fetcher, &source.selectors, limiter.clone())?
            .with_timeout(config.fetch_timeout)
            .with_shape(shape.clone()),
    )
}

/// The browser's proxy is fixed at launch, so the adapter gets no pool of
/// its own; per-request proxy outcomes would be charged to the wrong entry.
#[cfg(feature = "browser")]
async fn browser_adapter(
    name: &str,
    source: &SourceConfig,
    shape: &ShapeCheck,
    limiter: &RateLimiter,
    proxies: &ProxyPool,
    config: &PipelineConfig,
) -> Result<Arc<dyn SourceAdapter>, AppError> {
    let fetcher = trawl_client::BrowserFetcher::launch(
        trawl_client::identity::random_identity(),
        proxies.next(),
        config.fetch_timeout,
    )
    .await?;
    Ok(Arc::new(with_fetcher(name, fetcher, source, shape, limiter, config)?))
}

#[cfg(not(feature = "browser"))]
async fn browser_adapter(
    name: &str,
    _source: &SourceConfig,
    _shape: &ShapeCheck,
    _limiter: &RateLimiter,
    _proxies: &ProxyPool,
    _config: &PipelineConfig,
) -> Result<Arc<dyn SourceAdapter>, AppError> {
    Err(AppError::ConfigError(format!(
        "Source '{name}' renders in a browser; rebuild with `--features browser`"
    )))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const SOURCES: &str = r#"{
        "default_rate_limit": {"max_requests": 5, "window_secs": 60},
        "sources": {
            "board": {
                "kind": "html",
                "rate_limit": {"max_requests": 30, "window_secs": 10},
                "selectors": {
                    "card": "li.job",
                    "id": {"selector": ":scope", "attr": "data-id"},
                    "fields": {"title": "h2", "company": ".org"},
                    "required": ["title"]
                },
                "schedules": [{
                    "name": "board-nightly",
                    "cron": "0 0 2 * * *",
                    "url": "https://board.example.com/jobs",
                    "kind": "full_scrape",
                    "priority": 2
                }]
            },
            "api-board": {
                "kind": "api",
                "selectors": {
                    "card": "div.posting",
                    "id": {"selector": ":scope", "attr": "data-id"},
                    "fields": {"positionTitle": "h3"}
                },
                "api": {"url": "https://api.example.com/search?q={url}", "token_env": "API_BOARD_TOKEN", "items_pointer": "/data"},
                "fallback": {"policy": "cool_down", "cool_down_secs": 600},
                "schema": {"type": "object", "required": ["positionTitle"]}
            }
        }
    }"#;

    fn token(key: &str) -> Option<String> {
        (key == "API_BOARD_TOKEN").then(|| "secret".to_string())
    }

    #[test]
    fn parses_both_kinds_with_defaults() {
        let file = SourcesFile::parse(SOURCES).unwrap();
        assert_eq!(file.names(), vec!["api-board", "board"]);

        let api = &file.sources["api-board"];
        assert_eq!(api.kind, SourceKind::Api);
        assert_eq!(api.api.as_ref().unwrap().id_field, "id");
        match api.fallback.policy() {
            FallbackPolicy::CoolDown(config) => {
                assert_eq!(config.cool_down, Duration::from_secs(600));
                assert_eq!(config.failure_threshold, 3);
            }
            other => panic!("expected cool-down policy, got {other:?}"),
        }
        assert!(matches!(file.sources["board"].fallback, FallbackConfig::Always));
    }

    #[test]
    fn per_source_rate_limits_override_default() {
        let limiter = SourcesFile::parse(SOURCES).unwrap().rate_limiter();
        assert_eq!(limiter.limit_for("board"), RateLimit::new(30, Duration::from_secs(10)));
        assert_eq!(limiter.limit_for("api-board"), RateLimit::new(5, Duration::from_secs(60)));
    }

    #[test]
    fn recurring_templates_carry_source_and_kind() {
        let recurring = SourcesFile::parse(SOURCES).unwrap().recurring();
        assert_eq!(recurring.len(), 1);
        let nightly = &recurring[0];
        assert_eq!(nightly.name, "board-nightly");
        assert_eq!(nightly.template.source, "board");
        assert_eq!(nightly.template.kind, JobKind::FullScrape);
        assert_eq!(nightly.template.priority, 2);
    }

    #[test]
    fn api_kind_without_api_block_is_rejected() {
        let raw = SOURCES.replace(
            r#""api": {"url": "https://api.example.com/search?q={url}", "token_env": "API_BOARD_TOKEN", "items_pointer": "/data"},"#,
            "",
        );
        let err = SourcesFile::parse(&raw).unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
    }

    #[test]
    fn zero_request_budget_is_rejected() {
        let raw = SOURCES.replace(
            r#""max_requests": 30, "window_secs": 10"#,
            r#""max_requests": 0, "window_secs": 10"#,
        );
        let err = SourcesFile::parse(&raw).unwrap_err();
        assert!(err.to_string().contains("max_requests"));
    }

    #[test]
    fn bad_cron_is_rejected() {
        let raw = SOURCES.replace("0 0 2 * * *", "nightly at two");
        let err = SourcesFile::parse(&raw).unwrap_err();
        assert!(matches!(err, AppError::ValidationError(_)));
    }

    #[test]
    fn unknown_schedule_kind_is_rejected() {
        let raw = SOURCES.replace(r#""kind": "full_scrape""#, r#""kind": "deep_crawl""#);
        assert!(SourcesFile::parse(&raw).is_err());
    }

    #[test]
    fn load_reads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SOURCES.as_bytes()).unwrap();
        let loaded = SourcesFile::load(file.path()).unwrap();
        assert_eq!(loaded.sources.len(), 2);

        let err = SourcesFile::load(Path::new("/nonexistent/sources.json")).unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
    }

    #[tokio::test]
    async fn registry_holds_every_source() {
        let file = SourcesFile::parse(SOURCES).unwrap();
        let registry = file
            .build_registry(&PipelineConfig::default(), &ProxyPool::empty(), token)
            .await
            .unwrap();

        assert_eq!(registry.names(), vec!["api-board", "board"]);
        let api = registry.get("api-board").unwrap();
        assert!(api.adapter.validate_shape(&serde_json::json!({"positionTitle": "Intern"})));
        assert!(!api.adapter.validate_shape(&serde_json::json!({"title": "Intern"})));
    }

    #[tokio::test]
    async fn missing_api_token_is_config_error() {
        let file = SourcesFile::parse(SOURCES).unwrap();
        let err = file
            .build_registry(&PipelineConfig::default(), &ProxyPool::empty(), |_| None)
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("API_BOARD_TOKEN"));
    }
}
