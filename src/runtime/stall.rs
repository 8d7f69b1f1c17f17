use crate::queue::lease_queue::LeaseQueue;
use crate::runtime::telemetry::Telemetry;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio::{select, time};
use tokio_util::sync::CancellationToken;

/// Default window after which a pipeline with in-flight work but no batch
/// progress is reported as stalled.
pub const DEFAULT_STALL_WINDOW: Duration = Duration::from_secs(120);

/// Monotonic record of the last time any batch progressed. Workers touch the
/// clock whenever a batch completes, requeues, or dead-letters.
pub struct ProgressClock {
    origin: Instant,
    last_progress_ms: AtomicU64,
}

impl ProgressClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_progress_ms: AtomicU64::new(0),
        }
    }

    pub fn touch(&self) {
        let elapsed = self.origin.elapsed().as_millis() as u64;
        // fetch_max keeps racing touches from moving the clock backwards
        self.last_progress_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let now = self.origin.elapsed().as_millis() as u64;
        let last = self.last_progress_ms.load(Ordering::Relaxed);
        Duration::from_millis(now.saturating_sub(last))
    }
}

impl Default for ProgressClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Raised when batches are waiting or leased but none has progressed within
/// the stall window. Surfaced to operators; the pipeline keeps running.
#[derive(Debug, Clone)]
pub struct PipelineStallError {
    pub stalled_for: Duration,
    pub visible: usize,
    pub in_flight: usize,
}

impl fmt::Display for PipelineStallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pipeline stalled: no batch progressed for {:.0?} with {} visible and {} leased batches",
            self.stalled_for, self.visible, self.in_flight
        )
    }
}

impl std::error::Error for PipelineStallError {}

/// Holds the latest stall observation. Unlike a fatal error the state is
/// reversible: the watchdog clears it as soon as progress resumes.
#[derive(Default)]
pub struct StallMonitor {
    stalled: AtomicBool,
    slot: Mutex<Option<PipelineStallError>>,
}

impl StallMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled.load(Ordering::Acquire)
    }

    pub fn current(&self) -> Option<PipelineStallError> {
        self.slot.lock().unwrap().clone()
    }

    /// Records a stall observation, returning true on the not-stalled to
    /// stalled transition. Repeat reports refresh the stored snapshot.
    fn report(&self, error: PipelineStallError) -> bool {
        *self.slot.lock().unwrap() = Some(error);
        !self.stalled.swap(true, Ordering::AcqRel)
    }

    /// Clears the stall state, returning true if a stall had been recorded.
    fn clear(&self) -> bool {
        if self.stalled.swap(false, Ordering::AcqRel) {
            *self.slot.lock().unwrap() = None;
            true
        } else {
            false
        }
    }
}

/// Spawns the watchdog that compares the progress clock against the queue:
/// work sitting in the queue with no batch progress for a full stall window
/// flips the monitor and logs an error. An empty queue is idle, not stalled.
pub fn spawn_stall_watchdog<T: Send + 'static>(
    clock: Arc<ProgressClock>,
    monitor: Arc<StallMonitor>,
    queue: Arc<LeaseQueue<T>>,
    telemetry: Arc<Telemetry>,
    stall_window: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let check_every = (stall_window / 4).max(Duration::from_millis(50));
        let mut ticker = time::interval(check_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!("stall watchdog shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let stats = queue.stats().await;
                    if stats.visible == 0 && stats.in_flight == 0 {
                        clock.touch();
                        if monitor.clear() {
                            tracing::info!("queue drained; clearing stall state");
                        }
                        continue;
                    }

                    let idle_for = clock.idle_for();
                    if idle_for >= stall_window {
                        let error = PipelineStallError {
                            stalled_for: idle_for,
                            visible: stats.visible,
                            in_flight: stats.in_flight,
                        };
                        if monitor.report(error.clone()) {
                            telemetry.record_stall();
                            tracing::error!(
                                stalled_for_ms = idle_for.as_millis() as u64,
                                visible = stats.visible,
                                in_flight = stats.in_flight,
                                "{error}"
                            );
                        }
                    } else if monitor.clear() {
                        tracing::info!("batch progress resumed; clearing stall state");
                    }
                }
            }
        }
    })
}
