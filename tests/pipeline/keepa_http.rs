use std::sync::Arc;
use std::time::Duration;

use crate::support::helpers::{init_tracing, sample_catalog, wait_for_catalog_status};
use crate::support::mock_vendor::{MockVendorData, MockVendorServer, MOCK_VENDOR_KEY};
use anyhow::Result;
use enrichflow::{
    CatalogStatus, EnrichmentPipeline, InMemoryStore, ItemStatus, KeepaProvider, PipelineConfig,
    ProviderKind, ProviderOptions,
};
use serde_json::json;

fn keepa_config() -> Result<PipelineConfig> {
    PipelineConfig::builder()
        .provider(ProviderKind::Keepa)
        .batch_size(5)
        .worker_count(2)
        .poll_wait(Duration::from_millis(50))
        .provider_timeout(Duration::from_secs(2))
        .item_retry_attempts(3)
        .retry_initial_backoff(Duration::from_millis(5))
        .retry_max_backoff(Duration::from_millis(20))
        .build()
}

fn mock_provider(server: &MockVendorServer) -> Result<KeepaProvider> {
    let options = ProviderOptions {
        base_url: Some(server.url().to_string()),
        ..ProviderOptions::default()
    };
    KeepaProvider::new(MOCK_VENDOR_KEY, options)
}

fn hub_record(title: &str) -> serde_json::Value {
    json!({
        "title": title,
        "brand": "Anker",
        "categories": ["Electronics"],
        "csv": [1099, -1, 2599],
        "rating": 4.6,
        "reviewCount": 1875,
        "imagesCSV": "71abc123L,61def456M"
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn keepa_provider_enriches_items_over_http() -> Result<()> {
    init_tracing();
    let data = MockVendorData::new();
    data.insert_product("Product 0", "B0HUB00001", hub_record("USB-C Hub 7-in-1"));
    data.insert_product("Product 1", "B0HUB00002", hub_record("USB-C Hub 4-in-1"));
    data.insert_product("Product 2", "B0HUB00003", hub_record("USB-C Dock"));
    let server = MockVendorServer::start(data.clone()).await?;

    let provider = mock_provider(&server)?;
    let store = Arc::new(InMemoryStore::new());
    let mut pipeline =
        EnrichmentPipeline::new(keepa_config()?, Arc::new(provider.clone()), store.clone());

    pipeline.start().await?;
    pipeline.submit_catalog(&sample_catalog("cat-keepa", 3)).await?;
    wait_for_catalog_status(
        &pipeline,
        "cat-keepa",
        CatalogStatus::Completed,
        Duration::from_secs(10),
    )
    .await?;
    pipeline.stop().await?;
    server.shutdown().await;

    let record = store
        .get("cat-keepa", "item-0")
        .await
        .expect("item-0 should be persisted");
    assert_eq!(record.status, ItemStatus::Completed);
    let fields = record.enriched.expect("item-0 should carry vendor fields");
    assert_eq!(fields.source, "keepa");
    assert_eq!(fields.name.as_deref(), Some("USB-C Hub 7-in-1"));
    assert_eq!(fields.brand.as_deref(), Some("Anker"));
    assert_eq!(fields.category.as_deref(), Some("Electronics"));
    assert_eq!(fields.price, Some(25.99));
    assert_eq!(fields.rating, Some(4.6));
    assert_eq!(fields.review_count, Some(1875));
    assert_eq!(fields.vendor_item_id.as_deref(), Some("B0HUB00001"));
    assert_eq!(
        fields.main_image.as_deref(),
        Some("https://m.media-amazon.com/images/I/71abc123L.jpg")
    );
    assert_eq!(fields.images.len(), 2);

    assert_eq!(store.enriched_count("cat-keepa").await, 3);
    assert_eq!(data.search_calls(), 3, "one search per item");
    assert_eq!(data.product_calls(), 3, "one product lookup per item");

    let metrics = provider.metrics();
    assert_eq!(metrics.total_requests, 3);
    assert_eq!(metrics.total_errors, 0);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn transient_search_outages_are_retried_to_success() -> Result<()> {
    init_tracing();
    let data = MockVendorData::new();
    data.insert_product("Product 0", "B0HUB00001", hub_record("USB-C Hub 7-in-1"));
    data.fail_next_searches(2);
    let server = MockVendorServer::start(data.clone()).await?;

    let provider = mock_provider(&server)?;
    let store = Arc::new(InMemoryStore::new());
    let mut pipeline =
        EnrichmentPipeline::new(keepa_config()?, Arc::new(provider.clone()), store.clone());

    pipeline.start().await?;
    pipeline.submit_catalog(&sample_catalog("cat-outage", 1)).await?;
    wait_for_catalog_status(
        &pipeline,
        "cat-outage",
        CatalogStatus::Completed,
        Duration::from_secs(10),
    )
    .await?;
    pipeline.stop().await?;
    server.shutdown().await;

    // two scripted 500s, then the third attempt goes through
    assert_eq!(data.search_calls(), 3);
    assert_eq!(data.product_calls(), 1);
    assert_eq!(pipeline.telemetry().provider_retries(), 2);
    assert_eq!(store.enriched_count("cat-outage").await, 1);

    let metrics = provider.metrics();
    assert_eq!(metrics.total_requests, 3);
    assert_eq!(metrics.total_errors, 2);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unmatched_search_terms_fail_without_retries() -> Result<()> {
    init_tracing();
    let data = MockVendorData::new();
    // only one of the two items has a product behind it
    data.insert_product("Product 0", "B0HUB00001", hub_record("USB-C Hub 7-in-1"));
    let server = MockVendorServer::start(data.clone()).await?;

    let provider = mock_provider(&server)?;
    let store = Arc::new(InMemoryStore::new());
    let mut pipeline =
        EnrichmentPipeline::new(keepa_config()?, Arc::new(provider), store.clone());

    pipeline.start().await?;
    pipeline.submit_catalog(&sample_catalog("cat-miss", 2)).await?;
    wait_for_catalog_status(
        &pipeline,
        "cat-miss",
        CatalogStatus::PartiallyCompleted,
        Duration::from_secs(10),
    )
    .await?;
    pipeline.stop().await?;
    server.shutdown().await;

    assert_eq!(store.enriched_count("cat-miss").await, 1);
    assert_eq!(store.failed_count("cat-miss").await, 1);
    let record = store
        .get("cat-miss", "item-1")
        .await
        .expect("missed item should be persisted");
    assert_eq!(record.status, ItemStatus::Failed);
    assert!(
        record
            .errors
            .iter()
            .any(|err| err.contains("no product matched search term")),
        "error trail should carry the vendor miss, got {:?}",
        record.errors
    );

    // an empty result set is permanent; one search per item, no retries
    assert_eq!(data.search_calls(), 2);
    assert_eq!(data.product_calls(), 1);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rejected_credentials_fail_permanently() -> Result<()> {
    init_tracing();
    let data = MockVendorData::new();
    data.insert_product("Product 0", "B0HUB00001", hub_record("USB-C Hub 7-in-1"));
    let server = MockVendorServer::start(data.clone()).await?;

    let options = ProviderOptions {
        base_url: Some(server.url().to_string()),
        ..ProviderOptions::default()
    };
    let provider = KeepaProvider::new("wrong-key", options)?;
    let store = Arc::new(InMemoryStore::new());
    let mut pipeline =
        EnrichmentPipeline::new(keepa_config()?, Arc::new(provider.clone()), store.clone());

    pipeline.start().await?;
    pipeline.submit_catalog(&sample_catalog("cat-auth", 1)).await?;
    wait_for_catalog_status(
        &pipeline,
        "cat-auth",
        CatalogStatus::PartiallyCompleted,
        Duration::from_secs(10),
    )
    .await?;
    pipeline.stop().await?;
    server.shutdown().await;

    let record = store
        .get("cat-auth", "item-0")
        .await
        .expect("rejected item should be persisted");
    assert_eq!(record.status, ItemStatus::Failed);
    assert!(
        record
            .errors
            .iter()
            .any(|err| err.contains("rejected the configured credentials")),
        "error trail should carry the auth rejection, got {:?}",
        record.errors
    );

    // the mock rejects the key before the search endpoint counts the call,
    // and an auth failure is never retried
    assert_eq!(data.search_calls(), 0);
    assert_eq!(provider.metrics().total_errors, 1);

    Ok(())
}
