use crate::catalog::item::LineItem;
use crate::catalog::splitter::Batch;
use crate::provider::adapter::{ItemEnricher, ProviderError};
use crate::queue::lease_queue::{Delivery, FailureDisposition, Lease, LeaseQueue};
use crate::runtime::stall::ProgressClock;
use crate::runtime::telemetry::Telemetry;
use crate::status::StatusTracker;
use crate::store::CatalogStore;
use anyhow::{Context, Result};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::backoff::{retry_with_backoff, RetryBackoff};
use super::shared::WorkerShared;
use super::types::{
    classify_enrichment_error, BatchTally, ItemOutcome, ProcessingOutcome, RetryPolicy,
};

pub struct Worker {
    pub id: usize,
    pub(super) queue: Arc<LeaseQueue<Batch>>,
    pub(super) provider: Arc<dyn ItemEnricher>,
    pub(super) store: Arc<dyn CatalogStore>,
    pub(super) tracker: Arc<StatusTracker>,
    pub(super) telemetry: Arc<Telemetry>,
    pub(super) progress_clock: Arc<ProgressClock>,
    pub(super) retry_policy: RetryPolicy,
    pub(super) provider_timeout: Duration,
    pub(super) heartbeat_interval: Duration,
    pub(super) lease_extension: Duration,
    pub(super) shutdown: CancellationToken,
}

impl Worker {
    pub(crate) fn new(id: usize, shutdown: CancellationToken, shared: WorkerShared) -> Self {
        let WorkerShared {
            queue,
            provider,
            store,
            tracker,
            telemetry,
            progress_clock,
            retry_policy,
            provider_timeout,
            heartbeat_interval,
            lease_extension,
        } = shared;

        Self {
            id,
            queue,
            provider,
            store,
            tracker,
            telemetry,
            progress_clock,
            retry_policy,
            provider_timeout,
            heartbeat_interval,
            lease_extension,
            shutdown,
        }
    }

    #[tracing::instrument(name = "worker", skip_all, fields(worker = self.id))]
    pub async fn run(self) -> Result<()> {
        tracing::info!(worker = self.id, "worker task started");

        let shutdown = self.shutdown.clone();

        loop {
            if shutdown.is_cancelled() {
                tracing::info!(worker = self.id, "shutdown requested; exiting worker loop");
                break;
            }

            let delivery = tokio::select! {
                delivery = self.queue.dequeue() => delivery,
                _ = shutdown.cancelled() => break,
            };

            // long poll expired without a message; re-check shutdown
            let Some(delivery) = delivery else {
                continue;
            };

            self.handle_delivery(delivery).await?;
        }

        tracing::info!(worker = self.id, "worker task exited");
        Ok(())
    }

    /// Processes one leased batch end to end. Provider and store failures are
    /// absorbed into the lease (requeue or dead-letter); only status-tracker
    /// errors propagate, since those mean a batch was enqueued without
    /// registration and the run must abort.
    pub(super) async fn handle_delivery(&self, delivery: Delivery<Batch>) -> Result<()> {
        let lease = delivery.lease();
        let attempt = delivery.attempt();
        let batch = delivery.into_message();

        if attempt > 1 {
            tracing::info!(
                worker = self.id,
                batch = %batch.batch_id,
                attempt,
                "reprocessing redelivered batch"
            );
        }

        let heartbeat = self.spawn_heartbeat(lease, &batch);
        let outcome = self.process_items(&batch).await;
        heartbeat.abort();

        match outcome {
            Ok(ProcessingOutcome::Completed(tally)) => {
                self.report_and_complete(&batch, lease, tally).await?;
            }
            Ok(ProcessingOutcome::Cancelled) => {
                tracing::info!(
                    worker = self.id,
                    batch = %batch.batch_id,
                    "shutdown interrupted batch; returning it to the queue"
                );
                self.return_to_queue(&batch, lease, "shutdown before batch completed")
                    .await;
            }
            Err(err) => {
                tracing::warn!(
                    worker = self.id,
                    batch = %batch.batch_id,
                    error = format!("{err:#}"),
                    "batch processing failed; returning it to the queue"
                );
                self.return_to_queue(&batch, lease, &format!("{err:#}"))
                    .await;
            }
        }

        Ok(())
    }

    pub(super) async fn process_items(&self, batch: &Batch) -> Result<ProcessingOutcome> {
        let outcomes = join_all(
            batch
                .items
                .iter()
                .map(|item| self.process_item(batch, item)),
        )
        .await;

        let mut tally = BatchTally::default();
        let mut cancelled = false;
        for outcome in outcomes {
            match outcome? {
                ItemOutcome::Enriched => tally.succeeded += 1,
                ItemOutcome::Failed => tally.failed += 1,
                ItemOutcome::Cancelled => cancelled = true,
            }
        }

        if cancelled {
            return Ok(ProcessingOutcome::Cancelled);
        }
        Ok(ProcessingOutcome::Completed(tally))
    }

    async fn process_item(&self, batch: &Batch, item: &LineItem) -> Result<ItemOutcome> {
        let vendor = self.provider.vendor();
        let call_timeout = self.provider_timeout;
        let mut error_trail: Vec<String> = Vec::new();

        let backoff = RetryBackoff::new(
            self.retry_policy.initial_backoff,
            self.retry_policy.max_backoff,
        )
        .with_max_attempts(self.retry_policy.max_attempts)
        .with_cancellation(&self.shutdown);

        let retried = retry_with_backoff(
            backoff,
            |_attempt| {
                let call = self.provider.enrich_item(item);
                async move {
                    match tokio::time::timeout(call_timeout, call).await {
                        Ok(result) => result,
                        Err(_) => Err(ProviderError::Timeout { vendor }.into()),
                    }
                }
            },
            |attempt, delay, error, will_retry| {
                error_trail.push(format!("{error:#}"));
                if will_retry {
                    self.telemetry.record_provider_retry();
                }
                tracing::debug!(
                    worker = self.id,
                    item = %item.item_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    will_retry,
                    "provider call failed"
                );
            },
            |_attempt, error| classify_enrichment_error(error),
        );

        // abandon the in-flight vendor call on shutdown; the redelivery
        // picks the item up again
        let result = tokio::select! {
            result = retried => result,
            _ = self.shutdown.cancelled() => return Ok(ItemOutcome::Cancelled),
        };

        match result {
            Ok(fields) => {
                self.store
                    .upsert_enriched(&batch.catalog_id, &item.item_id, fields)
                    .await
                    .with_context(|| format!("failed to persist enriched item {}", item.item_id))?;
                Ok(ItemOutcome::Enriched)
            }
            Err(error) => {
                // redelivery will retry items dropped by a shutdown
                if self.shutdown.is_cancelled() {
                    return Ok(ItemOutcome::Cancelled);
                }

                let message = format!("{error:#}");
                if error_trail.last() != Some(&message) {
                    error_trail.push(message);
                }

                tracing::debug!(
                    worker = self.id,
                    item = %item.item_id,
                    vendor,
                    error = %error,
                    "item enrichment failed"
                );

                self.store
                    .mark_item_failed(&batch.catalog_id, &item.item_id, error_trail)
                    .await
                    .with_context(|| {
                        format!("failed to record failure for item {}", item.item_id)
                    })?;
                Ok(ItemOutcome::Failed)
            }
        }
    }

    async fn report_and_complete(&self, batch: &Batch, lease: Lease, tally: BatchTally) -> Result<()> {
        // Report before completing the lease: if the lease already expired,
        // the redelivery reports the same counts and the claim gate keeps the
        // first result.
        let first_report = self
            .tracker
            .record_batch_result(
                &batch.catalog_id,
                &batch.batch_id,
                tally.succeeded,
                tally.failed,
            )
            .await
            .with_context(|| format!("failed to record result for batch {}", batch.batch_id))?;

        if let Err(err) = self.queue.complete(lease).await {
            tracing::warn!(
                worker = self.id,
                batch = %batch.batch_id,
                error = %err,
                "lease expired before completion; batch may be redelivered"
            );
        }

        self.telemetry.record_items_enriched(tally.succeeded as u64);
        self.telemetry.record_items_failed(tally.failed as u64);
        self.telemetry.record_batch_completed();
        self.progress_clock.touch();

        tracing::info!(
            worker = self.id,
            batch = %batch.batch_id,
            succeeded = tally.succeeded,
            failed = tally.failed,
            first_report,
            "batch processed"
        );
        Ok(())
    }

    async fn return_to_queue(&self, batch: &Batch, lease: Lease, reason: &str) {
        match self.queue.fail(lease, reason).await {
            Ok(FailureDisposition::Requeued { attempt }) => {
                self.telemetry.record_batch_requeued();
                tracing::info!(
                    worker = self.id,
                    batch = %batch.batch_id,
                    next_attempt = attempt,
                    "batch requeued"
                );
            }
            Ok(FailureDisposition::DeadLettered) => {
                tracing::warn!(
                    worker = self.id,
                    batch = %batch.batch_id,
                    reason,
                    "batch exhausted its delivery attempts; parked in dead-letter queue"
                );
            }
            Err(err) => {
                tracing::warn!(
                    worker = self.id,
                    batch = %batch.batch_id,
                    error = %err,
                    "lease expired before failure was recorded"
                );
            }
        }
        self.progress_clock.touch();
    }

    /// Extends the batch lease at a third of the visibility timeout so slow
    /// provider calls do not trigger a spurious redelivery. The task stops on
    /// its own once the lease is gone.
    fn spawn_heartbeat(&self, lease: Lease, batch: &Batch) -> JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let extension = self.lease_extension;
        let heartbeat_interval = self.heartbeat_interval;
        let worker = self.id;
        let batch_id = batch.batch_id.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick resolves immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                match queue.extend_lease(lease, extension).await {
                    Ok(()) => {
                        tracing::debug!(worker, batch = %batch_id, "extended batch lease");
                    }
                    Err(err) => {
                        tracing::debug!(
                            worker,
                            batch = %batch_id,
                            error = %err,
                            "stopping lease heartbeat"
                        );
                        break;
                    }
                }
            }
        })
    }
}
