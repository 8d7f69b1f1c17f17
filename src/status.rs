//! Per-catalog progress tracking. Results are recorded per batch with atomic
//! counters and merged on read, so concurrent workers never contend on a
//! shared catalog aggregate, and a redelivered batch cannot double-report.
//!
//! Aggregation rules: a batch is resolved once it reported results or was
//! dead-lettered; the catalog stays `processing` until every batch resolves,
//! lands on `error` when every batch was dead-lettered without reporting,
//! `partially_completed` when any item failed or any batch was dead-lettered,
//! and `completed` otherwise.

use crate::catalog::item::CatalogStatus;
use crate::catalog::splitter::Batch;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};

/// Errors surfaced by tracker bookkeeping.
#[derive(Debug, PartialEq, Eq)]
pub enum StatusError {
    UnknownCatalog { catalog_id: String },
    UnknownBatch { catalog_id: String, batch_id: String },
    AlreadyRegistered { catalog_id: String },
    NoBatches { catalog_id: String },
}

impl std::fmt::Display for StatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownCatalog { catalog_id } => {
                write!(f, "catalog {catalog_id} is not registered")
            }
            Self::UnknownBatch {
                catalog_id,
                batch_id,
            } => {
                write!(f, "batch {batch_id} is not registered for catalog {catalog_id}")
            }
            Self::AlreadyRegistered { catalog_id } => {
                write!(f, "catalog {catalog_id} is already registered")
            }
            Self::NoBatches { catalog_id } => {
                write!(f, "catalog {catalog_id} was registered without batches")
            }
        }
    }
}

impl std::error::Error for StatusError {}

/// Point-in-time view of one catalog's enrichment run.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogProgress {
    pub catalog_id: String,
    pub status: CatalogStatus,
    pub total_items: usize,
    pub total_batches: usize,
    pub batches_reported: usize,
    pub batches_dead_lettered: usize,
    pub items_succeeded: usize,
    pub items_failed: usize,
    pub percent_complete: f64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Per-batch status record: final tallies plus the resolution flags.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchStatus {
    pub batch_id: String,
    pub expected_items: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub reported: bool,
    pub dead_lettered: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

/// One batch's slot. Tallies are written exactly once by whichever worker
/// wins the `claimed` gate; `reported` flips only after the tallies landed,
/// so readers holding an `Acquire` load of it see consistent counts.
#[derive(Debug)]
struct BatchEntry {
    expected_items: usize,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    claimed: AtomicBool,
    reported: AtomicBool,
    dead_lettered: AtomicBool,
    updated_at_ms: AtomicI64,
}

impl BatchEntry {
    fn new(expected_items: usize) -> Self {
        Self {
            expected_items,
            succeeded: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            claimed: AtomicBool::new(false),
            reported: AtomicBool::new(false),
            dead_lettered: AtomicBool::new(false),
            updated_at_ms: AtomicI64::new(0),
        }
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        match self.updated_at_ms.load(Ordering::Relaxed) {
            0 => None,
            millis => DateTime::from_timestamp_millis(millis),
        }
    }
}

#[derive(Debug, Default)]
struct Merged {
    batches_reported: usize,
    batches_dead_lettered: usize,
    resolved: usize,
    items_succeeded: usize,
    items_failed: usize,
}

/// One catalog's slot. The batch map is fixed at registration, so reads walk
/// it without locking.
#[derive(Debug)]
struct CatalogEntry {
    total_items: usize,
    total_batches: usize,
    started_at: DateTime<Utc>,
    finished_at_ms: AtomicI64,
    batches: HashMap<String, BatchEntry>,
}

impl CatalogEntry {
    fn merge(&self) -> Merged {
        let mut merged = Merged::default();
        for batch in self.batches.values() {
            let reported = batch.reported.load(Ordering::Acquire);
            let dead_lettered = batch.dead_lettered.load(Ordering::Acquire);

            if reported {
                merged.batches_reported += 1;
                merged.items_succeeded += batch.succeeded.load(Ordering::Relaxed);
                merged.items_failed += batch.failed.load(Ordering::Relaxed);
            } else if dead_lettered {
                // Never reported: every item in the batch counts as failed.
                merged.batches_dead_lettered += 1;
                merged.items_failed += batch.expected_items;
            }
            if reported || dead_lettered {
                merged.resolved += 1;
            }
        }
        merged
    }

    fn status_of(&self, merged: &Merged) -> CatalogStatus {
        if merged.resolved < self.total_batches {
            CatalogStatus::Processing
        } else if merged.batches_dead_lettered == self.total_batches {
            CatalogStatus::Error
        } else if merged.items_failed > 0 || merged.batches_dead_lettered > 0 {
            CatalogStatus::PartiallyCompleted
        } else {
            CatalogStatus::Completed
        }
    }

    /// Stamps the completion time the first time the aggregate turns
    /// terminal.
    fn maybe_finish(&self) {
        let merged = self.merge();
        if self.status_of(&merged).is_terminal() {
            let now = Utc::now().timestamp_millis();
            let _ = self.finished_at_ms.compare_exchange(
                0,
                now,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
    }

    fn finished_at(&self) -> Option<DateTime<Utc>> {
        match self.finished_at_ms.load(Ordering::Relaxed) {
            0 => None,
            millis => DateTime::from_timestamp_millis(millis),
        }
    }
}

/// Shared tracker mutated concurrently by every worker.
#[derive(Debug, Default)]
pub struct StatusTracker {
    catalogs: RwLock<HashMap<String, Arc<CatalogEntry>>>,
    notify: Notify,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the tracker with every batch of a split catalog. Must happen
    /// before the batches are enqueued so reports never race registration.
    pub async fn register_catalog(
        &self,
        catalog_id: &str,
        batches: &[Batch],
    ) -> Result<(), StatusError> {
        if batches.is_empty() {
            return Err(StatusError::NoBatches {
                catalog_id: catalog_id.to_string(),
            });
        }

        let total_items = batches.iter().map(Batch::len).sum();
        let entries = batches
            .iter()
            .map(|batch| (batch.batch_id.clone(), BatchEntry::new(batch.len())))
            .collect();

        let entry = Arc::new(CatalogEntry {
            total_items,
            total_batches: batches.len(),
            started_at: Utc::now(),
            finished_at_ms: AtomicI64::new(0),
            batches: entries,
        });

        let mut catalogs = self.catalogs.write().await;
        if catalogs.contains_key(catalog_id) {
            return Err(StatusError::AlreadyRegistered {
                catalog_id: catalog_id.to_string(),
            });
        }
        catalogs.insert(catalog_id.to_string(), entry);
        Ok(())
    }

    pub async fn is_registered(&self, catalog_id: &str) -> bool {
        self.catalogs.read().await.contains_key(catalog_id)
    }

    /// Records a batch's final tallies. Returns `true` for the first report;
    /// a redelivered batch that reports again is ignored and yields `false`.
    pub async fn record_batch_result(
        &self,
        catalog_id: &str,
        batch_id: &str,
        succeeded: usize,
        failed: usize,
    ) -> Result<bool, StatusError> {
        let entry = self.entry(catalog_id).await?;
        let batch = Self::batch(&entry, catalog_id, batch_id)?;

        if batch
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(false);
        }

        batch.succeeded.store(succeeded, Ordering::Relaxed);
        batch.failed.store(failed, Ordering::Relaxed);
        batch
            .updated_at_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        batch.reported.store(true, Ordering::Release);

        entry.maybe_finish();
        self.notify.notify_waiters();
        Ok(true)
    }

    /// Marks a batch as parked in the dead-letter area. Its items count as
    /// failed unless the batch managed to report before parking.
    pub async fn mark_dead_lettered(
        &self,
        catalog_id: &str,
        batch_id: &str,
    ) -> Result<(), StatusError> {
        let entry = self.entry(catalog_id).await?;
        let batch = Self::batch(&entry, catalog_id, batch_id)?;

        batch
            .updated_at_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        batch.dead_lettered.store(true, Ordering::Release);

        entry.maybe_finish();
        self.notify.notify_waiters();
        Ok(())
    }

    /// Reopens a dead-lettered batch after an operator replay. The catalog
    /// drops back to `processing` until the batch resolves again.
    pub async fn mark_replayed(
        &self,
        catalog_id: &str,
        batch_id: &str,
    ) -> Result<(), StatusError> {
        let entry = self.entry(catalog_id).await?;
        let batch = Self::batch(&entry, catalog_id, batch_id)?;

        let was_dead = batch.dead_lettered.swap(false, Ordering::AcqRel);
        if was_dead && !batch.reported.load(Ordering::Acquire) {
            entry.finished_at_ms.store(0, Ordering::Relaxed);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    pub async fn get_catalog_status(&self, catalog_id: &str) -> Result<CatalogStatus, StatusError> {
        let entry = self.entry(catalog_id).await?;
        let merged = entry.merge();
        Ok(entry.status_of(&merged))
    }

    pub async fn progress(&self, catalog_id: &str) -> Result<CatalogProgress, StatusError> {
        let entry = self.entry(catalog_id).await?;
        let merged = entry.merge();
        let status = entry.status_of(&merged);

        let percent_complete = if entry.total_items == 0 {
            0.0
        } else {
            merged.items_succeeded as f64 / entry.total_items as f64 * 100.0
        };

        Ok(CatalogProgress {
            catalog_id: catalog_id.to_string(),
            status,
            total_items: entry.total_items,
            total_batches: entry.total_batches,
            batches_reported: merged.batches_reported,
            batches_dead_lettered: merged.batches_dead_lettered,
            items_succeeded: merged.items_succeeded,
            items_failed: merged.items_failed,
            percent_complete,
            started_at: entry.started_at,
            finished_at: entry.finished_at(),
        })
    }

    /// Per-batch records sorted by batch id, for operator inspection.
    pub async fn batch_statuses(&self, catalog_id: &str) -> Result<Vec<BatchStatus>, StatusError> {
        let entry = self.entry(catalog_id).await?;
        let mut statuses: Vec<BatchStatus> = entry
            .batches
            .iter()
            .map(|(batch_id, batch)| {
                let reported = batch.reported.load(Ordering::Acquire);
                BatchStatus {
                    batch_id: batch_id.clone(),
                    expected_items: batch.expected_items,
                    succeeded: batch.succeeded.load(Ordering::Relaxed),
                    failed: batch.failed.load(Ordering::Relaxed),
                    reported,
                    dead_lettered: batch.dead_lettered.load(Ordering::Acquire),
                    updated_at: batch.updated_at(),
                }
            })
            .collect();
        statuses.sort_by(|a, b| a.batch_id.cmp(&b.batch_id));
        Ok(statuses)
    }

    /// Blocks until the catalog reaches a terminal status. Callers bound the
    /// wait with `tokio::time::timeout`.
    pub async fn wait_for_catalog(&self, catalog_id: &str) -> Result<CatalogProgress, StatusError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let progress = self.progress(catalog_id).await?;
            if progress.status.is_terminal() {
                return Ok(progress);
            }

            notified.await;
        }
    }

    async fn entry(&self, catalog_id: &str) -> Result<Arc<CatalogEntry>, StatusError> {
        let catalogs = self.catalogs.read().await;
        catalogs
            .get(catalog_id)
            .cloned()
            .ok_or_else(|| StatusError::UnknownCatalog {
                catalog_id: catalog_id.to_string(),
            })
    }

    fn batch<'a>(
        entry: &'a CatalogEntry,
        catalog_id: &str,
        batch_id: &str,
    ) -> Result<&'a BatchEntry, StatusError> {
        entry
            .batches
            .get(batch_id)
            .ok_or_else(|| StatusError::UnknownBatch {
                catalog_id: catalog_id.to_string(),
                batch_id: batch_id.to_string(),
            })
    }
}
