//! Vendor adapters that normalize external product-data APIs into the
//! pipeline's common enriched-item shape, plus the capability trait and
//! error taxonomy workers consume.

pub mod adapter;
pub mod amazon;
pub mod keepa;
pub mod metrics;
pub mod options;

pub use adapter::{build_provider, ItemEnricher, ProviderCredentials, ProviderError, ProviderKind};
pub use amazon::AmazonProvider;
pub use keepa::KeepaProvider;
pub use metrics::ProviderMetricsSnapshot;
pub use options::ProviderOptions;
