//! Enrichment pipeline orchestration.
//!
//! `EnrichmentPipeline` composes smaller modules so each concern is owned by
//! the component that knows it best:
//! - `catalog::splitter` turns a submitted catalog into fixed-size batches.
//! - `queue` hands batches to workers under at-least-once lease semantics.
//! - `worker` runs the capped pool that calls the vendor and persists results.
//! - `status` aggregates per-batch tallies into catalog-level progress.
//! - `lifecycle` wires run-scoped cancellation, the metrics reporter, the
//!   stall watchdog, and the dead-letter reconciler.
//!
//! The struct defined below orchestrates these pieces so callers interact
//! with a single `EnrichmentPipeline` API while implementation details live
//! in the focused submodules.

use super::lifecycle::{LifecycleHandles, LifecycleSpawnParams};
use crate::catalog::item::{Catalog, CatalogStatus};
use crate::catalog::splitter::{split_catalog, Batch};
use crate::provider::adapter::ItemEnricher;
use crate::queue::lease_queue::{DeadLetter, LeaseQueue, QueueStats};
use crate::runtime::config::PipelineConfig;
use crate::runtime::stall::{PipelineStallError, ProgressClock, StallMonitor};
use crate::runtime::telemetry::Telemetry;
use crate::status::{BatchStatus, CatalogProgress, StatusTracker};
use crate::store::CatalogStore;
use crate::worker::pool::WorkerPool;
use crate::worker::{RetryPolicy, WorkerShared, WorkerSharedParams};
use anyhow::{bail, Context, Result};
use futures::future::join_all;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Summary returned by [`EnrichmentPipeline::submit_catalog`].
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionReceipt {
    pub catalog_id: String,
    pub total_items: usize,
    pub total_batches: usize,
    pub batch_ids: Vec<String>,
}

pub struct EnrichmentPipeline {
    config: PipelineConfig,
    queue: Arc<LeaseQueue<Batch>>,
    tracker: Arc<StatusTracker>,
    store: Arc<dyn CatalogStore>,
    provider: Arc<dyn ItemEnricher>,
    telemetry: Arc<Telemetry>,
    progress_clock: Arc<ProgressClock>,
    stall_monitor: Arc<StallMonitor>,
    worker_pool: WorkerPool,
    lifecycle: Option<LifecycleHandles>,
    running: bool,
    shutdown_root: CancellationToken,
}

impl EnrichmentPipeline {
    /// Creates a new pipeline with the given configuration, provider, and
    /// store.
    ///
    /// The pipeline creates its own root cancellation token. Use
    /// [`Self::with_cancellation_token`] if you need to integrate with an
    /// existing shutdown mechanism.
    pub fn new(
        config: PipelineConfig,
        provider: Arc<dyn ItemEnricher>,
        store: Arc<dyn CatalogStore>,
    ) -> Self {
        Self::with_cancellation_token(config, provider, store, CancellationToken::new())
    }

    /// Creates a new pipeline with the given shutdown token.
    ///
    /// The shutdown token is used to derive per-run cancellation tokens for
    /// workers and the lifecycle tasks.
    pub fn with_cancellation_token(
        config: PipelineConfig,
        provider: Arc<dyn ItemEnricher>,
        store: Arc<dyn CatalogStore>,
        shutdown_token: CancellationToken,
    ) -> Self {
        let queue = Arc::new(LeaseQueue::new(config.queue_params()));
        let worker_pool = WorkerPool::new(config.worker_count());

        Self {
            queue,
            tracker: Arc::new(StatusTracker::new()),
            store,
            provider,
            telemetry: Arc::new(Telemetry::default()),
            progress_clock: Arc::new(ProgressClock::new()),
            stall_monitor: Arc::new(StallMonitor::new()),
            worker_pool,
            lifecycle: None,
            running: false,
            shutdown_root: shutdown_token,
            config,
        }
    }

    /// Returns a reference to the pipeline's configuration.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Returns a reference to the batch queue.
    pub fn queue(&self) -> &Arc<LeaseQueue<Batch>> {
        &self.queue
    }

    /// Returns a reference to the worker task handles.
    pub fn workers(&self) -> &Vec<JoinHandle<()>> {
        self.worker_pool.handles()
    }

    /// Returns a clone of the telemetry handle for observability.
    pub fn telemetry(&self) -> Arc<Telemetry> {
        self.telemetry.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// True while the stall watchdog sees no batch progress inside the
    /// configured window.
    pub fn is_stalled(&self) -> bool {
        self.stall_monitor.is_stalled()
    }

    /// Details of the active stall, if any.
    pub fn current_stall(&self) -> Option<PipelineStallError> {
        self.stall_monitor.current()
    }

    /// Replaces the root shutdown token used to derive per-run cancellation tokens.
    /// This must only be called while the pipeline is idle (i.e. between `stop` and `start`).
    pub fn replace_shutdown_root(&mut self, shutdown: CancellationToken) {
        debug_assert!(
            !self.running,
            "shutdown token should not change while the pipeline is running"
        );
        self.shutdown_root = shutdown;
    }

    /// Splits a catalog into batches, registers them with the status
    /// tracker, and enqueues every batch.
    ///
    /// Catalogs may be submitted before or after `start`; queued batches
    /// simply wait for a worker. Submitting the same catalog id twice is an
    /// error.
    pub async fn submit_catalog(&self, catalog: &Catalog) -> Result<SubmissionReceipt> {
        let batches = split_catalog(catalog, self.config.batch_size())?;

        // Register before the first enqueue: a worker may pick a batch up
        // immediately, and reporting against an unregistered catalog aborts
        // the run.
        self.tracker
            .register_catalog(&catalog.catalog_id, &batches)
            .await
            .with_context(|| format!("failed to register catalog {}", catalog.catalog_id))?;

        let total_batches = batches.len();
        let total_items = catalog.items.len();
        let mut batch_ids = Vec::with_capacity(total_batches);
        for batch in batches {
            batch_ids.push(batch.batch_id.clone());
            self.queue.enqueue(batch).await;
        }

        tracing::info!(
            catalog = %catalog.catalog_id,
            total_items,
            total_batches,
            "catalog submitted for enrichment"
        );

        Ok(SubmissionReceipt {
            catalog_id: catalog.catalog_id.clone(),
            total_items,
            total_batches,
            batch_ids,
        })
    }

    /// Starts the worker pool and the lifecycle tasks.
    ///
    /// Returns an error if the pipeline is already running.
    pub async fn start(&mut self) -> Result<()> {
        if self.running {
            bail!("pipeline already running");
        }

        debug_assert!(
            self.config.validate().is_ok(),
            "PipelineConfig should have been validated at construction time"
        );

        tracing::info!(
            workers = self.worker_pool.worker_count(),
            vendor = self.provider.vendor(),
            "starting enrichment pipeline"
        );

        // the stall window measures from run start, not construction
        self.progress_clock.touch();

        let lifecycle = LifecycleHandles::spawn(LifecycleSpawnParams {
            shutdown_root: &self.shutdown_root,
            telemetry: self.telemetry.clone(),
            queue: self.queue.clone(),
            tracker: self.tracker.clone(),
            progress_clock: self.progress_clock.clone(),
            stall_monitor: self.stall_monitor.clone(),
            metrics_interval: self.config.metrics_interval(),
            stall_window: self.config.stall_window(),
        });
        let fatal_handler = lifecycle.fatal_handler();
        let run_token = lifecycle.run_token.clone();

        let shared = WorkerShared::new(WorkerSharedParams {
            queue: self.queue.clone(),
            provider: self.provider.clone(),
            store: self.store.clone(),
            tracker: self.tracker.clone(),
            telemetry: self.telemetry.clone(),
            progress_clock: self.progress_clock.clone(),
            retry_policy: RetryPolicy {
                initial_backoff: self.config.retry_initial_backoff(),
                max_backoff: self.config.retry_max_backoff(),
                max_attempts: self.config.item_retry_attempts(),
            },
            provider_timeout: self.config.provider_timeout(),
            heartbeat_interval: self.config.heartbeat_interval(),
            lease_extension: self.config.visibility_timeout(),
        });

        self.worker_pool
            .launch(shared, run_token, self.shutdown_root.clone(), fatal_handler);
        self.lifecycle = Some(lifecycle);
        self.running = true;

        Ok(())
    }

    /// Stops the pipeline gracefully.
    ///
    /// Cancels workers, joins every spawned task, and surfaces the first
    /// fatal error captured during the run. Queued batches are kept; they
    /// will be delivered by the next run.
    pub async fn stop(&mut self) -> Result<()> {
        if !self.running {
            return Ok(());
        }

        tracing::info!("stopping enrichment pipeline");

        if let Some(handles) = &self.lifecycle {
            handles.run_token.cancel();
        }

        let worker_handles = self.worker_pool.take_handles();
        let results = join_all(worker_handles).await;
        for (idx, result) in results.into_iter().enumerate() {
            if let Err(err) = result {
                tracing::warn!(worker = idx, error = %err, "worker task terminated unexpectedly");
            }
        }
        tracing::debug!("pipeline stop: worker tasks joined");

        // workers trip the fatal handler before exiting, so after the join
        // the captured error is final
        let final_error = match self.lifecycle.take() {
            Some(handles) => {
                let error = handles.error();
                handles.shutdown().await;
                error
            }
            None => None,
        };
        tracing::debug!("pipeline stop: lifecycle tasks joined");

        self.running = false;

        if let Some(err) = final_error {
            return Err(err).context("enrichment pipeline aborted");
        }

        Ok(())
    }

    /// Current aggregate status of a catalog.
    pub async fn status(&self, catalog_id: &str) -> Result<CatalogStatus> {
        Ok(self.tracker.get_catalog_status(catalog_id).await?)
    }

    /// Point-in-time progress snapshot of a catalog.
    pub async fn progress(&self, catalog_id: &str) -> Result<CatalogProgress> {
        Ok(self.tracker.progress(catalog_id).await?)
    }

    /// Per-batch resolution detail for a catalog.
    pub async fn batch_statuses(&self, catalog_id: &str) -> Result<Vec<BatchStatus>> {
        Ok(self.tracker.batch_statuses(catalog_id).await?)
    }

    /// Waits until the catalog reaches a terminal status and returns the
    /// final progress snapshot.
    pub async fn wait_for_catalog(&self, catalog_id: &str) -> Result<CatalogProgress> {
        Ok(self.tracker.wait_for_catalog(catalog_id).await?)
    }

    /// Visible, leased, and dead-lettered batch counts.
    pub async fn queue_stats(&self) -> QueueStats {
        self.queue.stats().await
    }

    /// Snapshot of the dead-letter area for operator inspection.
    pub async fn dead_letters(&self) -> Vec<DeadLetter<Batch>> {
        self.queue.dead_letters().await
    }

    /// Drops every queued and dead-lettered batch. Leased batches finish or
    /// expire on their own.
    pub async fn purge_queue(&self) -> usize {
        self.queue.purge().await
    }

    /// Returns a dead-lettered batch to the visible queue with a fresh
    /// attempt budget and reopens its slot in the status tracker.
    pub async fn replay_dead_letter(&self, batch_id: &str) -> Result<()> {
        let entry = self
            .find_dead_letter(batch_id)
            .await
            .with_context(|| format!("batch {batch_id} is not in the dead-letter queue"))?;
        let catalog_id = entry.payload().catalog_id.clone();

        self.queue.replay_dead_letter(entry.message_id()).await?;
        self.tracker.mark_replayed(&catalog_id, batch_id).await?;

        tracing::info!(
            catalog = %catalog_id,
            batch = %batch_id,
            "dead-lettered batch replayed"
        );
        Ok(())
    }

    /// Drops a dead-lettered batch for good. The tracker keeps it resolved
    /// as dead-lettered, so the catalog's terminal status reflects the loss.
    pub async fn discard_dead_letter(&self, batch_id: &str) -> Result<()> {
        let entry = self
            .find_dead_letter(batch_id)
            .await
            .with_context(|| format!("batch {batch_id} is not in the dead-letter queue"))?;

        self.queue.discard_dead_letter(entry.message_id()).await?;

        tracing::info!(batch = %batch_id, "dead-lettered batch discarded");
        Ok(())
    }

    async fn find_dead_letter(&self, batch_id: &str) -> Option<DeadLetter<Batch>> {
        self.queue
            .dead_letters()
            .await
            .into_iter()
            .find(|entry| entry.payload().batch_id == batch_id)
    }
}
