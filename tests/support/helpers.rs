use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use anyhow::{bail, Result};
use enrichflow::{
    Catalog, CatalogStatus, CatalogStore, EnrichedFields, EnrichmentPipeline, InMemoryStore,
    ItemEnricher, LineItem, ProviderError, RawFields,
};
use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use serde_json::json;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

static TRACING_SUBSCRIBER: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
});

pub fn init_tracing() {
    Lazy::force(&TRACING_SUBSCRIBER);
}

/// Catalog of `item_count` items named `Product 0..n`, ids `item-0..n`.
pub fn sample_catalog(catalog_id: &str, item_count: usize) -> Catalog {
    let items = (0..item_count)
        .map(|idx| {
            let mut fields = RawFields::new();
            fields.insert("name".to_string(), json!(format!("Product {idx}")));
            LineItem::new(format!("item-{idx}"), fields)
        })
        .collect();
    Catalog::new(catalog_id, "user-1", items)
}

/// Per-item scripts for [`ScriptedProvider`].
#[derive(Clone, Copy)]
pub enum ItemScript {
    Succeed,
    /// Fail with a transient transport error this many times, then succeed.
    FailTimes(usize),
    /// Permanent no-match failure; never retried.
    Permanent,
    /// Never resolves. The per-call timeout decides the outcome.
    Hang,
}

/// Deterministic in-process vendor. Items without a script succeed.
#[derive(Default)]
pub struct ScriptedProvider {
    scripts: Mutex<HashMap<String, ItemScript>>,
    attempts: Mutex<HashMap<String, usize>>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, item_id: &str, script: ItemScript) {
        self.scripts
            .lock()
            .unwrap()
            .insert(item_id.to_string(), script);
    }

    pub fn attempts_for(&self, item_id: &str) -> usize {
        self.attempts
            .lock()
            .unwrap()
            .get(item_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ItemEnricher for ScriptedProvider {
    fn vendor(&self) -> &'static str {
        "scripted"
    }

    fn enrich_item<'a>(&'a self, item: &'a LineItem) -> BoxFuture<'a, Result<EnrichedFields>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let attempt = {
                let mut attempts = self.attempts.lock().unwrap();
                let counter = attempts.entry(item.item_id.clone()).or_insert(0);
                *counter += 1;
                *counter
            };
            let script = self
                .scripts
                .lock()
                .unwrap()
                .get(&item.item_id)
                .copied()
                .unwrap_or(ItemScript::Succeed);

            match script {
                ItemScript::Succeed => Ok(scripted_fields(&item.item_id)),
                ItemScript::FailTimes(failures) if attempt <= failures => {
                    Err(ProviderError::Transport {
                        vendor: "scripted",
                        message: "connection reset".to_string(),
                    }
                    .into())
                }
                ItemScript::FailTimes(_) => Ok(scripted_fields(&item.item_id)),
                ItemScript::Permanent => Err(ProviderError::NoMatch {
                    term: item.item_id.clone(),
                }
                .into()),
                ItemScript::Hang => {
                    futures::future::pending::<()>().await;
                    unreachable!("pending future never resolves")
                }
            }
        })
    }
}

fn scripted_fields(item_id: &str) -> EnrichedFields {
    let mut fields = EnrichedFields::from_source("scripted");
    fields.name = Some(format!("Enriched {item_id}"));
    fields.price = Some(19.99);
    fields.vendor_item_id = Some(format!("SKU-{item_id}"));
    fields
}

/// Store wrapper with a scriptable upsert outage, for forcing batch
/// redelivery and dead-lettering. `mark_item_failed` always forwards.
pub struct FlakyStore {
    inner: InMemoryStore,
    upsert_failures: AtomicUsize,
}

impl FlakyStore {
    /// `failures` upserts will be rejected before writes succeed. Use
    /// `usize::MAX` for a persistent outage and [`Self::heal`] to lift it.
    pub fn new(failures: usize) -> Self {
        Self {
            inner: InMemoryStore::new(),
            upsert_failures: AtomicUsize::new(failures),
        }
    }

    pub fn heal(&self) {
        self.upsert_failures.store(0, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &InMemoryStore {
        &self.inner
    }
}

impl CatalogStore for FlakyStore {
    fn upsert_enriched<'a>(
        &'a self,
        catalog_id: &'a str,
        item_id: &'a str,
        fields: EnrichedFields,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if self.upsert_failures.load(Ordering::SeqCst) == usize::MAX {
                anyhow::bail!("simulated store outage");
            }
            // items within a batch persist concurrently, so the budget has
            // to be claimed atomically
            let claimed_failure = self
                .upsert_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if claimed_failure {
                anyhow::bail!("simulated store outage");
            }
            self.inner.upsert_enriched(catalog_id, item_id, fields).await
        })
    }

    fn mark_item_failed<'a>(
        &'a self,
        catalog_id: &'a str,
        item_id: &'a str,
        errors: Vec<String>,
    ) -> BoxFuture<'a, Result<()>> {
        self.inner.mark_item_failed(catalog_id, item_id, errors)
    }
}

pub async fn wait_for_catalog_status(
    pipeline: &EnrichmentPipeline,
    catalog_id: &str,
    expected: CatalogStatus,
    timeout: Duration,
) -> Result<()> {
    let start = Instant::now();
    loop {
        let status = pipeline.status(catalog_id).await?;
        if status == expected {
            return Ok(());
        }
        if start.elapsed() > timeout {
            let progress = pipeline.progress(catalog_id).await?;
            let stats = pipeline.queue_stats().await;
            bail!(
                "catalog {catalog_id} did not reach {expected:?} within {:?} \
                 (current: {status:?}, items {}+{} of {}, queue visible {} in-flight {} dead {})",
                timeout,
                progress.items_succeeded,
                progress.items_failed,
                progress.total_items,
                stats.visible,
                stats.in_flight,
                stats.dead_lettered,
            );
        }
        sleep(Duration::from_millis(50)).await;
    }
}

pub async fn wait_for_dead_letters(
    pipeline: &EnrichmentPipeline,
    expected: usize,
    timeout: Duration,
) -> Result<()> {
    let start = Instant::now();
    loop {
        let stats = pipeline.queue_stats().await;
        if stats.dead_lettered >= expected {
            return Ok(());
        }
        if start.elapsed() > timeout {
            bail!(
                "dead-letter queue did not reach {expected} entries within {:?} \
                 (visible {} in-flight {} dead {})",
                timeout,
                stats.visible,
                stats.in_flight,
                stats.dead_lettered,
            );
        }
        sleep(Duration::from_millis(50)).await;
    }
}

/// Waits until the stall watchdog has flagged the pipeline.
pub async fn wait_for_stall(pipeline: &EnrichmentPipeline, timeout: Duration) -> Result<()> {
    let start = Instant::now();
    loop {
        if pipeline.is_stalled() {
            return Ok(());
        }
        if start.elapsed() > timeout {
            bail!("pipeline did not report a stall within {:?}", timeout);
        }
        sleep(Duration::from_millis(25)).await;
    }
}
