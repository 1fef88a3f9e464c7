pub mod api_adapter;
#[cfg(feature = "browser")]
pub mod browser_fetcher;
pub mod cleaner;
pub mod extract;
pub mod fetcher;
pub mod html_adapter;
pub mod identity;
pub mod probe;
pub mod retry;
pub mod schema;
pub mod seen;

pub use api_adapter::{ApiEndpoint, ApiSourceAdapter, FallbackPolicy, JsonApi, ReqwestJsonApi};
#[cfg(feature = "browser")]
pub use browser_fetcher::BrowserFetcher;
pub use cleaner::HtmdCleaner;
pub use extract::{CardExtractor, FieldSelector, ListingSelectors};
pub use fetcher::ReqwestFetcher;
pub use html_adapter::HtmlSourceAdapter;
pub use probe::HttpProxyProber;
pub use retry::RetryPolicy;
pub use schema::ShapeCheck;
