//! Lifecycle orchestration for `EnrichmentPipeline`.

use crate::catalog::splitter::Batch;
use crate::queue::lease_queue::LeaseQueue;
use crate::runtime::fatal::FatalErrorHandler;
use crate::runtime::stall::{self, ProgressClock, StallMonitor};
use crate::runtime::telemetry::{self, Telemetry};
use crate::status::StatusTracker;
use anyhow::Error;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Sweep cadence for reconciling dead-lettered batches with the tracker.
pub(crate) const DEAD_LETTER_SWEEP_INTERVAL: Duration = Duration::from_millis(1_000);

pub(crate) struct LifecycleHandles {
    pub run_token: CancellationToken,
    fatal_handler: Arc<FatalErrorHandler>,
    metrics_handle: Option<JoinHandle<()>>,
    stall_handle: Option<JoinHandle<()>>,
    reconciler_handle: Option<JoinHandle<()>>,
}

pub(crate) struct LifecycleSpawnParams<'a> {
    pub shutdown_root: &'a CancellationToken,
    pub telemetry: Arc<Telemetry>,
    pub queue: Arc<LeaseQueue<Batch>>,
    pub tracker: Arc<StatusTracker>,
    pub progress_clock: Arc<ProgressClock>,
    pub stall_monitor: Arc<StallMonitor>,
    pub metrics_interval: Duration,
    pub stall_window: Duration,
}

impl LifecycleHandles {
    pub(crate) fn spawn(params: LifecycleSpawnParams<'_>) -> Self {
        let LifecycleSpawnParams {
            shutdown_root,
            telemetry,
            queue,
            tracker,
            progress_clock,
            stall_monitor,
            metrics_interval,
            stall_window,
        } = params;

        let run_token = shutdown_root.child_token();
        let fatal_handler = Arc::new(FatalErrorHandler::new(
            shutdown_root.clone(),
            run_token.clone(),
        ));
        let metrics_handle = telemetry::spawn_metrics_reporter(
            telemetry.clone(),
            queue.clone(),
            run_token.clone(),
            metrics_interval,
        );
        let stall_handle = stall::spawn_stall_watchdog(
            progress_clock.clone(),
            stall_monitor,
            queue.clone(),
            telemetry.clone(),
            stall_window,
            run_token.clone(),
        );
        let reconciler_handle = spawn_dead_letter_reconciler(
            queue,
            tracker,
            telemetry,
            progress_clock,
            run_token.clone(),
        );

        Self {
            run_token,
            fatal_handler,
            metrics_handle: Some(metrics_handle),
            stall_handle: Some(stall_handle),
            reconciler_handle: Some(reconciler_handle),
        }
    }

    pub(crate) fn fatal_handler(&self) -> Arc<FatalErrorHandler> {
        self.fatal_handler.clone()
    }

    pub(crate) fn error(&self) -> Option<Error> {
        self.fatal_handler.error()
    }

    pub(crate) async fn shutdown(mut self) {
        if let Some(handle) = self.metrics_handle.take() {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "metrics reporter task panicked");
            }
        }

        if let Some(handle) = self.stall_handle.take() {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "stall watchdog task panicked");
            }
        }

        if let Some(handle) = self.reconciler_handle.take() {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "dead-letter reconciler task panicked");
            }
        }
    }
}

/// Watches the dead-letter area and records each newly parked batch with the
/// status tracker, exactly once. Expiry-path dead-lettering happens inside
/// the queue without any worker observing it, so this sweep is the only
/// place those batches get accounted for.
fn spawn_dead_letter_reconciler(
    queue: Arc<LeaseQueue<Batch>>,
    tracker: Arc<StatusTracker>,
    telemetry: Arc<Telemetry>,
    progress_clock: Arc<ProgressClock>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(DEAD_LETTER_SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut recorded: HashSet<u64> = HashSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    break;
                }
                _ = ticker.tick() => {
                    let dead = queue.dead_letters().await;
                    // a replayed entry keeps its message id; pruning lets it
                    // be recorded again if it dead-letters a second time
                    let current: HashSet<u64> =
                        dead.iter().map(|entry| entry.message_id()).collect();
                    recorded.retain(|id| current.contains(id));

                    for entry in dead {
                        if !recorded.insert(entry.message_id()) {
                            continue;
                        }
                        let batch = entry.payload();
                        tracing::error!(
                            catalog = %batch.catalog_id,
                            batch = %batch.batch_id,
                            attempts = entry.attempts(),
                            reason = entry.reason(),
                            "batch exhausted its delivery attempts; operator intervention required"
                        );
                        telemetry.record_batch_dead_lettered();
                        progress_clock.touch();
                        if let Err(err) = tracker
                            .mark_dead_lettered(&batch.catalog_id, &batch.batch_id)
                            .await
                        {
                            tracing::warn!(
                                batch = %batch.batch_id,
                                error = %err,
                                "failed to record dead-lettered batch"
                            );
                        }
                    }
                }
            }
        }

        tracing::info!("dead-letter reconciler stopped");
    })
}
