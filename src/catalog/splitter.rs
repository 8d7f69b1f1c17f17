use super::item::{Catalog, LineItem};
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One queue message worth of work: a fixed-size slice of a catalog plus the
/// metadata consumers need to report progress without loading the catalog.
///
/// Batches are immutable once enqueued; a redelivered batch keeps the same
/// `batch_id` so retried items stay traceable to their original slice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub catalog_id: String,
    pub batch_id: String,
    pub user_id: String,
    /// 1-based position of this batch within the catalog.
    pub batch_number: usize,
    pub total_batches: usize,
    pub total_items: usize,
    pub enqueued_at: DateTime<Utc>,
    pub items: Vec<LineItem>,
}

impl Batch {
    /// Stable identifier derived from the parent catalog and the batch's
    /// sequence number.
    pub fn derive_id(catalog_id: &str, batch_number: usize) -> String {
        format!("{catalog_id}:{batch_number:04}")
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Partitions a catalog into `ceil(N / batch_size)` batches, preserving item
/// order within each slice.
pub fn split_catalog(catalog: &Catalog, batch_size: usize) -> Result<Vec<Batch>> {
    if batch_size == 0 {
        bail!("batch_size must be greater than 0");
    }
    if catalog.items.is_empty() {
        bail!("catalog {} has no items to enrich", catalog.catalog_id);
    }

    let total_items = catalog.items.len();
    let total_batches = (total_items + batch_size - 1) / batch_size;
    let enqueued_at = Utc::now();

    let batches = catalog
        .items
        .chunks(batch_size)
        .enumerate()
        .map(|(index, chunk)| {
            let batch_number = index + 1;
            Batch {
                catalog_id: catalog.catalog_id.clone(),
                batch_id: Batch::derive_id(&catalog.catalog_id, batch_number),
                user_id: catalog.user_id.clone(),
                batch_number,
                total_batches,
                total_items,
                enqueued_at,
                items: chunk.to_vec(),
            }
        })
        .collect();

    Ok(batches)
}
