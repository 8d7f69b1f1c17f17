use crate::provider::adapter::ProviderKind;
use crate::provider::options::ProviderOptions;
use crate::queue::lease_queue::{
    LeaseQueueParams, DEFAULT_MAX_DELIVERY_ATTEMPTS, DEFAULT_POLL_WAIT, DEFAULT_QUEUE_CAPACITY,
    DEFAULT_VISIBILITY_TIMEOUT,
};
use crate::runtime::{stall, telemetry};
use anyhow::{bail, Context, Result};
use std::time::Duration;

const DEFAULT_BATCH_SIZE: usize = 20;
const MIN_BATCH_SIZE: usize = 5;
const MAX_BATCH_SIZE: usize = 50;
const DEFAULT_WORKER_COUNT: usize = 10;
const MAX_WORKER_COUNT: usize = 10;
const DEFAULT_PROVIDER_TIMEOUT_SECS: u64 = 30;
const DEFAULT_ITEM_RETRY_ATTEMPTS: usize = 3;
const DEFAULT_RETRY_INITIAL_BACKOFF_MS: u64 = 250;
const DEFAULT_RETRY_MAX_BACKOFF_MS: u64 = 2_000;
const MIN_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(3);

/// Runtime configuration for the enrichment pipeline.
///
/// All instances must be constructed via [`PipelineConfig::builder`] or
/// [`PipelineConfig::new`] so invariants are validated before any consumer
/// observes the values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    provider: ProviderKind,
    batch_size: usize,
    worker_count: usize,
    queue_capacity: usize,
    visibility_timeout: Duration,
    poll_wait: Duration,
    max_delivery_attempts: u32,
    provider_timeout: Duration,
    item_retry_attempts: usize,
    retry_initial_backoff: Duration,
    retry_max_backoff: Duration,
    stall_window: Duration,
    metrics_interval: Duration,
}

pub struct PipelineConfigParams {
    pub provider: ProviderKind,
    pub batch_size: usize,
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub visibility_timeout: Duration,
    pub poll_wait: Duration,
    pub max_delivery_attempts: u32,
    pub provider_timeout: Duration,
    pub item_retry_attempts: usize,
    pub retry_initial_backoff: Duration,
    pub retry_max_backoff: Duration,
    pub stall_window: Duration,
    pub metrics_interval: Duration,
}

impl PipelineConfig {
    /// Returns a builder to incrementally construct and validate a configuration.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::default()
    }

    /// Constructs a configuration directly from the provided values.
    ///
    /// Prefer [`PipelineConfig::builder`] for ergonomics when many values use
    /// defaults. Callers that already have concrete runtime parameters can use
    /// this method to enforce validation without going through the builder.
    pub fn new(params: PipelineConfigParams) -> Result<Self> {
        let PipelineConfigParams {
            provider,
            batch_size,
            worker_count,
            queue_capacity,
            visibility_timeout,
            poll_wait,
            max_delivery_attempts,
            provider_timeout,
            item_retry_attempts,
            retry_initial_backoff,
            retry_max_backoff,
            stall_window,
            metrics_interval,
        } = params;

        let config = Self {
            provider,
            batch_size,
            worker_count,
            queue_capacity,
            visibility_timeout,
            poll_wait,
            max_delivery_attempts,
            provider_timeout,
            item_retry_attempts,
            retry_initial_backoff,
            retry_max_backoff,
            stall_window,
            metrics_interval,
        };

        config.validate()?;
        Ok(config)
    }

    /// Vendor backing the enrichment workers.
    pub fn provider(&self) -> ProviderKind {
        self.provider
    }

    /// Number of line items packed into one queue message.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of enrichment workers in the pool.
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Maximum messages (visible plus in-flight) held by the batch queue.
    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    /// Lease duration granted on dequeue before a batch is redelivered.
    pub fn visibility_timeout(&self) -> Duration {
        self.visibility_timeout
    }

    /// Lease heartbeat cadence; one third of the visibility timeout.
    pub fn heartbeat_interval(&self) -> Duration {
        self.visibility_timeout / 3
    }

    /// Long-poll wait used by idle workers.
    pub fn poll_wait(&self) -> Duration {
        self.poll_wait
    }

    /// Delivery attempts granted to a batch before it is dead-lettered.
    pub fn max_delivery_attempts(&self) -> u32 {
        self.max_delivery_attempts
    }

    /// Per-call timeout applied to provider lookups.
    pub fn provider_timeout(&self) -> Duration {
        self.provider_timeout
    }

    /// Provider call attempts granted to one item before it is marked failed.
    pub fn item_retry_attempts(&self) -> usize {
        self.item_retry_attempts
    }

    /// First delay of the per-item retry backoff.
    pub fn retry_initial_backoff(&self) -> Duration {
        self.retry_initial_backoff
    }

    /// Ceiling of the per-item retry backoff.
    pub fn retry_max_backoff(&self) -> Duration {
        self.retry_max_backoff
    }

    /// Window after which in-flight work without progress is reported stalled.
    pub fn stall_window(&self) -> Duration {
        self.stall_window
    }

    /// Interval used by the telemetry reporter.
    pub fn metrics_interval(&self) -> Duration {
        self.metrics_interval
    }

    /// Queue parameters derived from this configuration.
    pub fn queue_params(&self) -> LeaseQueueParams {
        LeaseQueueParams {
            visibility_timeout: self.visibility_timeout,
            poll_wait: self.poll_wait,
            max_delivery_attempts: self.max_delivery_attempts,
            capacity: self.queue_capacity,
        }
    }

    /// Provider client options derived from this configuration.
    pub fn provider_options(&self) -> ProviderOptions {
        ProviderOptions {
            request_timeout: self.provider_timeout,
            ..ProviderOptions::default()
        }
    }

    /// Performs validation on an existing configuration instance.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size < MIN_BATCH_SIZE || self.batch_size > MAX_BATCH_SIZE {
            bail!("batch_size must be between {MIN_BATCH_SIZE} and {MAX_BATCH_SIZE}");
        }

        if self.worker_count == 0 || self.worker_count > MAX_WORKER_COUNT {
            bail!("worker_count must be between 1 and {MAX_WORKER_COUNT}");
        }

        if self.queue_capacity == 0 {
            bail!("queue_capacity must be greater than 0");
        }

        if self.visibility_timeout < MIN_VISIBILITY_TIMEOUT {
            bail!("visibility_timeout must be at least 3 seconds");
        }

        if self.poll_wait.is_zero() {
            bail!("poll_wait must be greater than 0");
        }

        if self.max_delivery_attempts == 0 {
            bail!("max_delivery_attempts must be greater than 0");
        }

        if self.provider_timeout.is_zero() {
            bail!("provider_timeout must be greater than 0");
        }

        if self.item_retry_attempts == 0 {
            bail!("item_retry_attempts must be greater than 0");
        }

        if self.retry_initial_backoff.is_zero() {
            bail!("retry_initial_backoff must be greater than 0");
        }

        if self.retry_max_backoff < self.retry_initial_backoff {
            bail!("retry_max_backoff must be at least retry_initial_backoff");
        }

        if self.stall_window.is_zero() {
            bail!("stall_window must be greater than 0");
        }

        if self.metrics_interval.is_zero() {
            bail!("metrics_interval must be greater than 0");
        }

        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct PipelineConfigBuilder {
    provider: Option<ProviderKind>,
    batch_size: Option<usize>,
    worker_count: Option<usize>,
    queue_capacity: Option<usize>,
    visibility_timeout: Option<Duration>,
    poll_wait: Option<Duration>,
    max_delivery_attempts: Option<u32>,
    provider_timeout: Option<Duration>,
    item_retry_attempts: Option<usize>,
    retry_initial_backoff: Option<Duration>,
    retry_max_backoff: Option<Duration>,
    stall_window: Option<Duration>,
    metrics_interval: Option<Duration>,
}

impl PipelineConfigBuilder {
    pub fn provider(mut self, provider: ProviderKind) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    pub fn worker_count(mut self, count: usize) -> Self {
        self.worker_count = Some(count);
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    pub fn visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = Some(timeout);
        self
    }

    pub fn poll_wait(mut self, wait: Duration) -> Self {
        self.poll_wait = Some(wait);
        self
    }

    pub fn max_delivery_attempts(mut self, attempts: u32) -> Self {
        self.max_delivery_attempts = Some(attempts);
        self
    }

    pub fn provider_timeout(mut self, timeout: Duration) -> Self {
        self.provider_timeout = Some(timeout);
        self
    }

    pub fn item_retry_attempts(mut self, attempts: usize) -> Self {
        self.item_retry_attempts = Some(attempts);
        self
    }

    pub fn retry_initial_backoff(mut self, backoff: Duration) -> Self {
        self.retry_initial_backoff = Some(backoff);
        self
    }

    pub fn retry_max_backoff(mut self, backoff: Duration) -> Self {
        self.retry_max_backoff = Some(backoff);
        self
    }

    pub fn stall_window(mut self, window: Duration) -> Self {
        self.stall_window = Some(window);
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = Some(interval);
        self
    }

    pub fn build(self) -> Result<PipelineConfig> {
        let params = PipelineConfigParams {
            provider: self.provider.context("provider is required")?,
            batch_size: self.batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
            worker_count: self.worker_count.unwrap_or(DEFAULT_WORKER_COUNT),
            queue_capacity: self.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY),
            visibility_timeout: self
                .visibility_timeout
                .unwrap_or(DEFAULT_VISIBILITY_TIMEOUT),
            poll_wait: self.poll_wait.unwrap_or(DEFAULT_POLL_WAIT),
            max_delivery_attempts: self
                .max_delivery_attempts
                .unwrap_or(DEFAULT_MAX_DELIVERY_ATTEMPTS),
            provider_timeout: self
                .provider_timeout
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_PROVIDER_TIMEOUT_SECS)),
            item_retry_attempts: self
                .item_retry_attempts
                .unwrap_or(DEFAULT_ITEM_RETRY_ATTEMPTS),
            retry_initial_backoff: self
                .retry_initial_backoff
                .unwrap_or_else(|| Duration::from_millis(DEFAULT_RETRY_INITIAL_BACKOFF_MS)),
            retry_max_backoff: self
                .retry_max_backoff
                .unwrap_or_else(|| Duration::from_millis(DEFAULT_RETRY_MAX_BACKOFF_MS)),
            stall_window: self.stall_window.unwrap_or(stall::DEFAULT_STALL_WINDOW),
            metrics_interval: self
                .metrics_interval
                .unwrap_or(telemetry::DEFAULT_METRICS_INTERVAL),
        };

        PipelineConfig::new(params)
    }
}
