use std::sync::Arc;
use std::time::Duration;

use crate::support::helpers::{
    init_tracing, sample_catalog, wait_for_catalog_status, wait_for_dead_letters, wait_for_stall,
    FlakyStore, ItemScript, ScriptedProvider,
};
use anyhow::{bail, Result};
use enrichflow::{
    CatalogStatus, EnrichmentPipeline, InMemoryStore, ItemStatus, PipelineConfig, ProviderKind,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pipeline_enriches_a_catalog_end_to_end() -> Result<()> {
    init_tracing();
    let config = PipelineConfig::builder()
        .provider(ProviderKind::Amazon)
        .batch_size(20)
        .worker_count(4)
        .poll_wait(Duration::from_millis(50))
        .provider_timeout(Duration::from_millis(500))
        .retry_initial_backoff(Duration::from_millis(5))
        .retry_max_backoff(Duration::from_millis(20))
        .build()?;

    let provider = Arc::new(ScriptedProvider::new());
    let store = Arc::new(InMemoryStore::new());
    let mut pipeline = EnrichmentPipeline::new(config, provider.clone(), store.clone());

    pipeline.start().await?;
    let receipt = pipeline.submit_catalog(&sample_catalog("cat-e2e", 45)).await?;
    assert_eq!(receipt.total_items, 45);
    assert_eq!(receipt.total_batches, 3);
    assert_eq!(receipt.batch_ids[0], "cat-e2e:0001");

    wait_for_catalog_status(
        &pipeline,
        "cat-e2e",
        CatalogStatus::Completed,
        Duration::from_secs(10),
    )
    .await?;
    pipeline.stop().await?;

    let progress = pipeline.progress("cat-e2e").await?;
    assert_eq!(progress.items_succeeded, 45);
    assert_eq!(progress.items_failed, 0);
    assert_eq!(progress.batches_reported, 3);
    assert_eq!(progress.batches_dead_lettered, 0);
    assert!((progress.percent_complete - 100.0).abs() < f64::EPSILON);
    assert!(progress.finished_at.is_some());

    assert_eq!(store.enriched_count("cat-e2e").await, 45);
    let items = store.catalog_items("cat-e2e").await;
    assert_eq!(items.len(), 45);
    assert!(items.iter().all(|item| item.status == ItemStatus::Completed));
    let record = store
        .get("cat-e2e", "item-0")
        .await
        .expect("item-0 should be persisted");
    let fields = record.enriched.expect("item-0 should carry enriched fields");
    assert_eq!(fields.name.as_deref(), Some("Enriched item-0"));
    assert_eq!(fields.vendor_item_id.as_deref(), Some("SKU-item-0"));
    assert_eq!(fields.source, "scripted");

    let stats = pipeline.queue_stats().await;
    assert_eq!(stats.visible, 0, "queue should be drained");
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.dead_lettered, 0);

    let telemetry = pipeline.telemetry();
    assert_eq!(telemetry.items_enriched(), 45);
    assert_eq!(telemetry.items_failed(), 0);
    assert_eq!(telemetry.batches_completed(), 3);
    assert_eq!(provider.total_calls(), 45, "one vendor call per item");

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn vendor_misses_leave_the_catalog_partially_completed() -> Result<()> {
    init_tracing();
    let config = PipelineConfig::builder()
        .provider(ProviderKind::Amazon)
        .batch_size(20)
        .worker_count(2)
        .poll_wait(Duration::from_millis(50))
        .provider_timeout(Duration::from_millis(500))
        .retry_initial_backoff(Duration::from_millis(5))
        .retry_max_backoff(Duration::from_millis(20))
        .build()?;

    let provider = Arc::new(ScriptedProvider::new());
    provider.script("item-3", ItemScript::Permanent);
    provider.script("item-21", ItemScript::Permanent);
    let store = Arc::new(InMemoryStore::new());
    let mut pipeline = EnrichmentPipeline::new(config, provider.clone(), store.clone());

    pipeline.start().await?;
    pipeline.submit_catalog(&sample_catalog("cat-partial", 25)).await?;
    wait_for_catalog_status(
        &pipeline,
        "cat-partial",
        CatalogStatus::PartiallyCompleted,
        Duration::from_secs(10),
    )
    .await?;
    pipeline.stop().await?;

    let progress = pipeline.progress("cat-partial").await?;
    assert_eq!(progress.items_succeeded, 23);
    assert_eq!(progress.items_failed, 2);
    assert_eq!(progress.batches_reported, 2);
    assert_eq!(progress.batches_dead_lettered, 0);

    assert_eq!(store.enriched_count("cat-partial").await, 23);
    assert_eq!(store.failed_count("cat-partial").await, 2);
    let record = store
        .get("cat-partial", "item-3")
        .await
        .expect("failed item should still be persisted");
    assert_eq!(record.status, ItemStatus::Failed);
    assert!(record.enriched.is_none());
    assert!(
        record.errors.iter().any(|err| err.contains("no product matched")),
        "error trail should name the vendor miss, got {:?}",
        record.errors
    );

    // a permanent vendor miss is not worth a second call
    assert_eq!(provider.attempts_for("item-3"), 1);
    assert_eq!(pipeline.telemetry().items_failed(), 2);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn transient_vendor_failures_retry_in_place() -> Result<()> {
    init_tracing();
    let config = PipelineConfig::builder()
        .provider(ProviderKind::Amazon)
        .batch_size(20)
        .worker_count(2)
        .poll_wait(Duration::from_millis(50))
        .provider_timeout(Duration::from_millis(500))
        .item_retry_attempts(3)
        .retry_initial_backoff(Duration::from_millis(5))
        .retry_max_backoff(Duration::from_millis(20))
        .build()?;

    let provider = Arc::new(ScriptedProvider::new());
    provider.script("item-4", ItemScript::FailTimes(2));
    let store = Arc::new(InMemoryStore::new());
    let mut pipeline = EnrichmentPipeline::new(config, provider.clone(), store.clone());

    pipeline.start().await?;
    pipeline.submit_catalog(&sample_catalog("cat-retry", 10)).await?;
    wait_for_catalog_status(
        &pipeline,
        "cat-retry",
        CatalogStatus::Completed,
        Duration::from_secs(10),
    )
    .await?;
    pipeline.stop().await?;

    // two connection resets, then the third attempt lands
    assert_eq!(provider.attempts_for("item-4"), 3);
    assert_eq!(pipeline.telemetry().provider_retries(), 2);

    let progress = pipeline.progress("cat-retry").await?;
    assert_eq!(progress.items_succeeded, 10);
    assert_eq!(progress.items_failed, 0);
    assert_eq!(store.enriched_count("cat-retry").await, 10);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn store_outage_requeues_the_batch_without_double_counting() -> Result<()> {
    init_tracing();
    let config = PipelineConfig::builder()
        .provider(ProviderKind::Amazon)
        .batch_size(5)
        .worker_count(2)
        .poll_wait(Duration::from_millis(50))
        .provider_timeout(Duration::from_millis(500))
        .retry_initial_backoff(Duration::from_millis(5))
        .retry_max_backoff(Duration::from_millis(20))
        .build()?;

    let provider = Arc::new(ScriptedProvider::new());
    let store = Arc::new(FlakyStore::new(1));
    let mut pipeline = EnrichmentPipeline::new(config, provider.clone(), store.clone());

    pipeline.start().await?;
    pipeline.submit_catalog(&sample_catalog("cat-flaky", 5)).await?;
    wait_for_catalog_status(
        &pipeline,
        "cat-flaky",
        CatalogStatus::Completed,
        Duration::from_secs(10),
    )
    .await?;
    pipeline.stop().await?;

    // the first delivery loses one write and requeues; the redelivery
    // persists all five items, and the claim gate keeps the tallies single
    let progress = pipeline.progress("cat-flaky").await?;
    assert_eq!(progress.items_succeeded, 5);
    assert_eq!(progress.items_failed, 0);
    assert_eq!(progress.batches_reported, 1);

    let telemetry = pipeline.telemetry();
    assert_eq!(telemetry.batches_requeued(), 1);
    assert_eq!(telemetry.items_enriched(), 5);
    assert_eq!(telemetry.batches_completed(), 1);

    assert_eq!(store.inner().enriched_count("cat-flaky").await, 5);
    assert_eq!(
        store.inner().write_count(),
        9,
        "four writes from the aborted delivery plus five from the redelivery"
    );

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exhausted_batches_dead_letter_and_replay_after_repair() -> Result<()> {
    init_tracing();
    let config = PipelineConfig::builder()
        .provider(ProviderKind::Amazon)
        .batch_size(5)
        .worker_count(2)
        .poll_wait(Duration::from_millis(50))
        .max_delivery_attempts(2)
        .provider_timeout(Duration::from_millis(500))
        .retry_initial_backoff(Duration::from_millis(5))
        .retry_max_backoff(Duration::from_millis(20))
        .build()?;

    let provider = Arc::new(ScriptedProvider::new());
    let store = Arc::new(FlakyStore::new(usize::MAX));
    let mut pipeline = EnrichmentPipeline::new(config, provider.clone(), store.clone());

    pipeline.start().await?;
    let receipt = pipeline.submit_catalog(&sample_catalog("cat-park", 5)).await?;
    let batch_id = receipt.batch_ids[0].clone();

    wait_for_dead_letters(&pipeline, 1, Duration::from_secs(10)).await?;
    let parked = pipeline.dead_letters().await;
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].payload().batch_id, batch_id);
    assert_eq!(parked[0].attempts(), 2);
    assert!(
        parked[0].reason().contains("failed to persist"),
        "park reason should name the store failure, got {:?}",
        parked[0].reason()
    );

    // the reconciler sweep marks the batch, and with its only batch parked
    // the catalog lands on error
    wait_for_catalog_status(
        &pipeline,
        "cat-park",
        CatalogStatus::Error,
        Duration::from_secs(10),
    )
    .await?;
    let progress = pipeline.progress("cat-park").await?;
    assert_eq!(progress.batches_dead_lettered, 1);
    assert_eq!(progress.items_failed, 5);
    assert_eq!(pipeline.telemetry().batches_dead_lettered(), 1);

    // repair the store, replay the batch, and the catalog recovers
    store.heal();
    pipeline.replay_dead_letter(&batch_id).await?;
    wait_for_catalog_status(
        &pipeline,
        "cat-park",
        CatalogStatus::Completed,
        Duration::from_secs(10),
    )
    .await?;
    pipeline.stop().await?;

    let progress = pipeline.progress("cat-park").await?;
    assert_eq!(progress.items_succeeded, 5);
    assert_eq!(progress.batches_reported, 1);
    assert_eq!(progress.batches_dead_lettered, 0);
    assert_eq!(store.inner().enriched_count("cat-park").await, 5);
    assert!(pipeline.dead_letters().await.is_empty());

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hung_vendor_calls_trip_the_stall_watchdog() -> Result<()> {
    init_tracing();
    let config = PipelineConfig::builder()
        .provider(ProviderKind::Amazon)
        .batch_size(5)
        .worker_count(2)
        .poll_wait(Duration::from_millis(50))
        // long enough that the hang is a stall, not a per-call timeout
        .provider_timeout(Duration::from_secs(60))
        .item_retry_attempts(1)
        .retry_initial_backoff(Duration::from_millis(5))
        .retry_max_backoff(Duration::from_millis(20))
        .stall_window(Duration::from_millis(400))
        .build()?;

    let provider = Arc::new(ScriptedProvider::new());
    provider.script("item-0", ItemScript::Hang);
    let store = Arc::new(InMemoryStore::new());
    let mut pipeline = EnrichmentPipeline::new(config, provider.clone(), store.clone());

    pipeline.start().await?;
    pipeline.submit_catalog(&sample_catalog("cat-stall", 5)).await?;
    wait_for_stall(&pipeline, Duration::from_secs(5)).await?;

    let stall = pipeline.current_stall().expect("stall details should be recorded");
    assert_eq!(stall.in_flight, 1, "the hung batch should still be leased");
    assert_eq!(stall.visible, 0);
    assert!(stall.stalled_for >= Duration::from_millis(400));
    assert_eq!(pipeline.telemetry().stall_events(), 1);

    // the healthy items persisted before the stall was flagged
    assert_eq!(store.enriched_count("cat-stall").await, 4);

    // shutdown abandons the hung call instead of waiting out the vendor
    // timeout, and the interrupted batch goes back to the queue
    let Ok(stopped) = tokio::time::timeout(Duration::from_secs(2), pipeline.stop()).await else {
        bail!("pipeline stop did not finish while a vendor call hung");
    };
    stopped?;

    let stats = pipeline.queue_stats().await;
    assert_eq!(stats.visible, 1, "interrupted batch should be requeued");
    assert_eq!(stats.in_flight, 0);
    assert_eq!(pipeline.status("cat-stall").await?, CatalogStatus::Processing);

    Ok(())
}
