pub mod catalog;
pub mod pipeline;
pub mod provider;
pub mod queue;
pub mod runtime;
pub mod status;
pub mod store;
pub mod worker;

pub use catalog::item::{
    Catalog, CatalogStatus, EnrichedFields, ItemStatus, LineItem, RawFields,
};
pub use catalog::splitter::{split_catalog, Batch};
pub use pipeline::engine::{EnrichmentPipeline, SubmissionReceipt};
pub use provider::adapter::{
    build_provider, ItemEnricher, ProviderCredentials, ProviderError, ProviderKind,
};
pub use provider::amazon::AmazonProvider;
pub use provider::keepa::KeepaProvider;
pub use provider::metrics::ProviderMetricsSnapshot;
pub use provider::options::ProviderOptions;
pub use queue::lease_queue::{
    DeadLetter, Delivery, FailureDisposition, Lease, LeaseQueue, LeaseQueueParams, QueueError,
    QueueStats,
};
pub use runtime::config::{PipelineConfig, PipelineConfigBuilder, PipelineConfigParams};
pub use runtime::runner::Runner;
pub use runtime::stall::PipelineStallError;
pub use runtime::telemetry::{init_tracing, Telemetry, TelemetrySnapshot};
pub use status::{BatchStatus, CatalogProgress, StatusError, StatusTracker};
pub use store::{CatalogStore, InMemoryStore, StoredItem};
pub use worker::Worker;
