use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::support::helpers::{
    init_tracing, sample_catalog, wait_for_catalog_status, ScriptedProvider,
};
use anyhow::{bail, Result};
use chrono::Utc;
use enrichflow::{
    Batch, CatalogStatus, InMemoryStore, LineItem, PipelineConfig, ProviderKind, RawFields, Runner,
};
use tokio::time::sleep;

fn runner_config() -> Result<PipelineConfig> {
    PipelineConfig::builder()
        .provider(ProviderKind::Amazon)
        .batch_size(5)
        .worker_count(2)
        .poll_wait(Duration::from_millis(50))
        .provider_timeout(Duration::from_millis(500))
        .retry_initial_backoff(Duration::from_millis(5))
        .retry_max_backoff(Duration::from_millis(20))
        .build()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn runner_processes_catalogs_across_restarts() -> Result<()> {
    init_tracing();
    let provider = Arc::new(ScriptedProvider::new());
    let store = Arc::new(InMemoryStore::new());
    let mut runner = Runner::new(runner_config()?, provider, store.clone());

    runner.start().await?;
    // a second start is a no-op, not an error
    runner.start().await?;

    runner
        .pipeline()
        .submit_catalog(&sample_catalog("cat-first", 10))
        .await?;
    wait_for_catalog_status(
        runner.pipeline(),
        "cat-first",
        CatalogStatus::Completed,
        Duration::from_secs(10),
    )
    .await?;
    runner.stop().await?;
    assert!(!runner.pipeline().is_running());

    // stop reinitializes the shutdown token, so a fresh run starts clean
    runner.start().await?;
    runner
        .pipeline()
        .submit_catalog(&sample_catalog("cat-second", 10))
        .await?;
    wait_for_catalog_status(
        runner.pipeline(),
        "cat-second",
        CatalogStatus::Completed,
        Duration::from_secs(10),
    )
    .await?;
    runner.stop().await?;

    assert_eq!(store.enriched_count("cat-first").await, 10);
    assert_eq!(store.enriched_count("cat-second").await, 10);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancellation_token_stops_a_background_run() -> Result<()> {
    init_tracing();
    let provider = Arc::new(ScriptedProvider::new());
    let store = Arc::new(InMemoryStore::new());
    let mut runner = Runner::new(runner_config()?, provider, store.clone());

    // submission only needs the queue and the tracker; the workers drain the
    // backlog once the background run starts
    runner
        .pipeline()
        .submit_catalog(&sample_catalog("cat-bg", 5))
        .await?;
    let token = runner.cancellation_token();

    let run = tokio::spawn(async move {
        let result = runner.run_until_ctrl_c().await;
        (runner, result)
    });

    let started = Instant::now();
    while store.enriched_count("cat-bg").await < 5 {
        if started.elapsed() > Duration::from_secs(10) {
            token.cancel();
            bail!("background run did not process the catalog in time");
        }
        sleep(Duration::from_millis(50)).await;
    }

    token.cancel();
    let Ok(joined) = tokio::time::timeout(Duration::from_secs(5), run).await else {
        bail!("cancelling the token did not stop the background run");
    };
    let (runner, result) = joined?;
    result?;

    assert!(!runner.pipeline().is_running());
    assert_eq!(
        runner.pipeline().status("cat-bg").await?,
        CatalogStatus::Completed
    );

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn worker_errors_abort_a_background_run() -> Result<()> {
    init_tracing();
    let provider = Arc::new(ScriptedProvider::new());
    let store = Arc::new(InMemoryStore::new());
    let mut runner = Runner::new(runner_config()?, provider, store);

    // a batch that never went through submission is a wiring bug; the first
    // report against it must take the whole run down
    let ghost = Batch {
        catalog_id: "ghost".to_string(),
        batch_id: "ghost:0001".to_string(),
        user_id: "user-1".to_string(),
        batch_number: 1,
        total_batches: 1,
        total_items: 1,
        enqueued_at: Utc::now(),
        items: vec![LineItem::new("item-0", RawFields::new())],
    };
    runner.pipeline().queue().enqueue(ghost).await;

    let run = tokio::spawn(async move {
        let result = runner.run_until_ctrl_c().await;
        (runner, result)
    });

    let Ok(joined) = tokio::time::timeout(Duration::from_secs(10), run).await else {
        bail!("fatal worker error did not stop the background run");
    };
    let (runner, result) = joined?;
    let err = result.expect_err("unregistered batch should abort the run");
    let chain = format!("{err:#}");
    assert!(
        chain.contains("enrichment pipeline aborted"),
        "unexpected error chain: {chain}"
    );
    assert!(
        chain.contains("not registered"),
        "unexpected error chain: {chain}"
    );
    assert!(!runner.pipeline().is_running());

    Ok(())
}
