/// Smoke-test for `BrowserFetcher`.
///
/// Launches headless Chromium with a random identity, fetches a page, and
/// prints what the listing extractor finds on it.
///
/// Run with:
///   cargo run -p trawl-client --example browser_smoke --features browser -- <url> <card-selector>
use trawl_client::identity::random_identity;
use trawl_client::{BrowserFetcher, CardExtractor, FieldSelector, HtmdCleaner, ListingSelectors};
use trawl_core::traits::{FetchRequest, Fetcher};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let mut args = std::env::args().skip(1);
    let url = args.next().unwrap_or_else(|| "https://example.com".to_string());
    let card = args.next().unwrap_or_else(|| "body".to_string());

    let identity = random_identity();
    println!("Launching headless browser as {:?}", identity.viewport);
    let fetcher =
        BrowserFetcher::launch(identity.clone(), None, std::time::Duration::from_secs(30)).await?;

    let html = fetcher
        .fetch(&FetchRequest::new(&url).as_identity(identity))
        .await?;
    println!("Got {} bytes of rendered HTML", html.len());

    let extractor = CardExtractor::new(&ListingSelectors {
        card,
        id: FieldSelector::text("h1, h2, h3"),
        fields: [("title".to_string(), FieldSelector::text("h1, h2, h3"))].into(),
        required: vec![],
    })?;
    let (records, skipped) = extractor.extract("smoke", &url, &html, &HtmdCleaner::new());
    println!("{} cards extracted, {} skipped", records.len(), skipped.len());
    for record in records.iter().take(5) {
        println!("  {:?}: {:?}", record.external_id, record.text("title"));
    }
    Ok(())
}
