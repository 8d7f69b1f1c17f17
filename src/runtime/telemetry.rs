use crate::queue::lease_queue::LeaseQueue;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Default interval used by the metrics reporter task.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(5);

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs a basic tracing subscriber (if one is not already active).
///
/// The subscriber honours `RUST_LOG` if it is present, otherwise it falls back to `info`.
/// Calling this function multiple times is harmless.
pub fn init_tracing() {
    if TRACING_INIT.get().is_some() {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();

    let _ = TRACING_INIT.set(());
}

/// Lightweight rolling counters used to derive runtime metrics.
#[derive(Default, Debug)]
pub struct Telemetry {
    items_enriched: AtomicU64,
    items_failed: AtomicU64,
    provider_retries: AtomicU64,
    batches_completed: AtomicU64,
    batches_requeued: AtomicU64,
    batches_dead_lettered: AtomicU64,
    stall_events: AtomicU64,
}

impl Telemetry {
    pub fn record_items_enriched(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.items_enriched.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_items_failed(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.items_failed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_provider_retry(&self) {
        self.provider_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_completed(&self) {
        self.batches_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_requeued(&self) {
        self.batches_requeued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_dead_lettered(&self) {
        self.batches_dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stall(&self) {
        self.stall_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            items_enriched: self.items_enriched.load(Ordering::Relaxed),
            items_failed: self.items_failed.load(Ordering::Relaxed),
            provider_retries: self.provider_retries.load(Ordering::Relaxed),
            batches_completed: self.batches_completed.load(Ordering::Relaxed),
            batches_requeued: self.batches_requeued.load(Ordering::Relaxed),
            batches_dead_lettered: self.batches_dead_lettered.load(Ordering::Relaxed),
            stall_events: self.stall_events.load(Ordering::Relaxed),
        }
    }

    pub fn items_enriched(&self) -> u64 {
        self.items_enriched.load(Ordering::Relaxed)
    }

    pub fn items_failed(&self) -> u64 {
        self.items_failed.load(Ordering::Relaxed)
    }

    pub fn batches_completed(&self) -> u64 {
        self.batches_completed.load(Ordering::Relaxed)
    }

    pub fn batches_requeued(&self) -> u64 {
        self.batches_requeued.load(Ordering::Relaxed)
    }

    pub fn batches_dead_lettered(&self) -> u64 {
        self.batches_dead_lettered.load(Ordering::Relaxed)
    }

    pub fn provider_retries(&self) -> u64 {
        self.provider_retries.load(Ordering::Relaxed)
    }

    pub fn stall_events(&self) -> u64 {
        self.stall_events.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Copy, Clone)]
pub struct TelemetrySnapshot {
    pub items_enriched: u64,
    pub items_failed: u64,
    pub provider_retries: u64,
    pub batches_completed: u64,
    pub batches_requeued: u64,
    pub batches_dead_lettered: u64,
    pub stall_events: u64,
}

/// Spawns a background task that periodically logs item throughput, queue
/// depth, and provider error counters.
pub fn spawn_metrics_reporter<T: Send + 'static>(
    telemetry: Arc<Telemetry>,
    queue: Arc<LeaseQueue<T>>,
    shutdown: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_snapshot = telemetry.snapshot();
        let mut last_tick = Instant::now();

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(target: "enrichflow::metrics", "metrics reporter shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let current_snapshot = telemetry.snapshot();
                    let enriched_delta = current_snapshot
                        .items_enriched
                        .saturating_sub(last_snapshot.items_enriched);
                    let elapsed = last_tick.elapsed().as_secs_f64();
                    let throughput = if elapsed <= f64::EPSILON {
                        0.0
                    } else {
                        enriched_delta as f64 / elapsed
                    };
                    let queue_stats = queue.stats().await;

                    tracing::info!(
                        target: "enrichflow::metrics",
                        throughput = format!("{throughput:.2}"),
                        enriched = current_snapshot.items_enriched,
                        failed = current_snapshot.items_failed,
                        queue_visible = queue_stats.visible,
                        queue_in_flight = queue_stats.in_flight,
                        queue_dead_lettered = queue_stats.dead_lettered,
                        batches_completed = current_snapshot.batches_completed,
                        provider_retries = current_snapshot.provider_retries,
                        "runtime metrics snapshot"
                    );

                    last_snapshot = current_snapshot;
                    last_tick = Instant::now();
                }
            }
        }
    })
}
