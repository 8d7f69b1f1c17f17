//! Persistence seam between workers and the primary data store: the
//! `CatalogStore` trait plus an in-memory implementation used by tests and
//! the demo binary.
//!
//! Writes are keyed by `(catalog_id, item_id)` and upsert-style on purpose:
//! the queue redelivers batches after lease expiry, so the same item may be
//! persisted more than once and the second write must land on the same key.

use crate::catalog::item::{EnrichedFields, ItemStatus};
use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

/// One persisted line item: its enrichment outcome plus the error trail for
/// failed attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredItem {
    pub item_id: String,
    pub status: ItemStatus,
    pub enriched: Option<EnrichedFields>,
    pub errors: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

/// Write-side contract workers use to persist enrichment outcomes.
pub trait CatalogStore: Send + Sync {
    fn upsert_enriched<'a>(
        &'a self,
        catalog_id: &'a str,
        item_id: &'a str,
        fields: EnrichedFields,
    ) -> BoxFuture<'a, Result<()>>;

    fn mark_item_failed<'a>(
        &'a self,
        catalog_id: &'a str,
        item_id: &'a str,
        errors: Vec<String>,
    ) -> BoxFuture<'a, Result<()>>;
}

/// In-memory store keyed by `(catalog_id, item_id)`. Tracks the raw write
/// count so redelivery tests can tell an idempotent overwrite from a
/// corrupted record.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    items: RwLock<HashMap<(String, String), StoredItem>>,
    writes: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, catalog_id: &str, item_id: &str) -> Option<StoredItem> {
        let items = self.items.read().await;
        items
            .get(&(catalog_id.to_string(), item_id.to_string()))
            .cloned()
    }

    /// All persisted items for one catalog, ordered by item id for stable
    /// assertions.
    pub async fn catalog_items(&self, catalog_id: &str) -> Vec<StoredItem> {
        let items = self.items.read().await;
        let mut records: Vec<StoredItem> = items
            .iter()
            .filter(|((catalog, _), _)| catalog == catalog_id)
            .map(|(_, record)| record.clone())
            .collect();
        records.sort_by(|a, b| a.item_id.cmp(&b.item_id));
        records
    }

    pub async fn enriched_count(&self, catalog_id: &str) -> usize {
        self.count_with_status(catalog_id, ItemStatus::Completed)
            .await
    }

    pub async fn failed_count(&self, catalog_id: &str) -> usize {
        self.count_with_status(catalog_id, ItemStatus::Failed).await
    }

    async fn count_with_status(&self, catalog_id: &str, status: ItemStatus) -> usize {
        let items = self.items.read().await;
        items
            .iter()
            .filter(|((catalog, _), record)| catalog == catalog_id && record.status == status)
            .count()
    }

    /// Total writes accepted, counting overwrites.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    async fn put(&self, catalog_id: &str, record: StoredItem) {
        let key = (catalog_id.to_string(), record.item_id.clone());
        let mut items = self.items.write().await;
        items.insert(key, record);
        self.writes.fetch_add(1, Ordering::Relaxed);
    }
}

impl CatalogStore for InMemoryStore {
    fn upsert_enriched<'a>(
        &'a self,
        catalog_id: &'a str,
        item_id: &'a str,
        fields: EnrichedFields,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.put(
                catalog_id,
                StoredItem {
                    item_id: item_id.to_string(),
                    status: ItemStatus::Completed,
                    enriched: Some(fields),
                    errors: Vec::new(),
                    updated_at: Utc::now(),
                },
            )
            .await;
            Ok(())
        })
    }

    fn mark_item_failed<'a>(
        &'a self,
        catalog_id: &'a str,
        item_id: &'a str,
        errors: Vec<String>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.put(
                catalog_id,
                StoredItem {
                    item_id: item_id.to_string(),
                    status: ItemStatus::Failed,
                    enriched: None,
                    errors,
                    updated_at: Utc::now(),
                },
            )
            .await;
            Ok(())
        })
    }
}
