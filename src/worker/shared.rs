use crate::catalog::splitter::Batch;
use crate::provider::adapter::ItemEnricher;
use crate::queue::lease_queue::LeaseQueue;
use crate::runtime::stall::ProgressClock;
use crate::runtime::telemetry::Telemetry;
use crate::status::StatusTracker;
use crate::store::CatalogStore;
use std::sync::Arc;
use std::time::Duration;

use super::types::RetryPolicy;

/// Handles and knobs shared by every worker in the pool.
#[derive(Clone)]
pub struct WorkerShared {
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
}

pub struct WorkerSharedParams {
    pub queue: Arc<LeaseQueue<Batch>>,
    pub provider: Arc<dyn ItemEnricher>,
    pub store: Arc<dyn CatalogStore>,
    pub tracker: Arc<StatusTracker>,
    pub telemetry: Arc<Telemetry>,
    pub progress_clock: Arc<ProgressClock>,
    pub retry_policy: RetryPolicy,
    pub provider_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Duration granted by each heartbeat; normally the visibility timeout.
    pub lease_extension: Duration,
}

impl WorkerShared {
    pub fn new(params: WorkerSharedParams) -> Self {
        Self {
            queue: params.queue,
            provider: params.provider,
            store: params.store,
            tracker: params.tracker,
            telemetry: params.telemetry,
            progress_clock: params.progress_clock,
            retry_policy: params.retry_policy,
            provider_timeout: params.provider_timeout,
            heartbeat_interval: params.heartbeat_interval,
            lease_extension: params.lease_extension,
        }
    }
}
