//! Capability seam between workers and vendor APIs: the `ItemEnricher` trait,
//! the closed vendor set, credential plumbing, and the provider error
//! taxonomy that drives retry decisions.

use crate::catalog::item::{EnrichedFields, LineItem};
use crate::provider::amazon::AmazonProvider;
use crate::provider::keepa::KeepaProvider;
use crate::provider::options::ProviderOptions;
use anyhow::{bail, Context, Result};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;

/// Vendor-call failures. Transient variants are retried with backoff;
/// permanent ones mark the item failed on the first attempt.
#[derive(Debug)]
pub enum ProviderError {
    Timeout { vendor: &'static str },
    RateLimited { vendor: &'static str },
    Transport { vendor: &'static str, message: String },
    Upstream { vendor: &'static str, status: u16 },
    Auth { vendor: &'static str },
    NoMatch { term: String },
    MissingSearchTerm { item_id: String },
    Malformed { vendor: &'static str, message: String },
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::RateLimited { .. } | Self::Transport { .. } => true,
            Self::Upstream { status, .. } => *status >= 500,
            Self::Auth { .. }
            | Self::NoMatch { .. }
            | Self::MissingSearchTerm { .. }
            | Self::Malformed { .. } => false,
        }
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout { vendor } => write!(f, "{vendor} request timed out"),
            Self::RateLimited { vendor } => write!(f, "{vendor} rate limited the request"),
            Self::Transport { vendor, message } => {
                write!(f, "{vendor} transport error: {message}")
            }
            Self::Upstream { vendor, status } => {
                write!(f, "{vendor} returned HTTP status {status}")
            }
            Self::Auth { vendor } => write!(f, "{vendor} rejected the configured credentials"),
            Self::NoMatch { term } => write!(f, "no product matched search term \"{term}\""),
            Self::MissingSearchTerm { item_id } => {
                write!(f, "item {item_id} has no searchable fields")
            }
            Self::Malformed { vendor, message } => {
                write!(f, "{vendor} response could not be decoded: {message}")
            }
        }
    }
}

impl std::error::Error for ProviderError {}

/// Object-safe vendor capability: normalize one raw line item into the
/// common enriched shape or fail with a classified `ProviderError`.
pub trait ItemEnricher: Send + Sync {
    fn vendor(&self) -> &'static str;

    fn enrich_item<'a>(&'a self, item: &'a LineItem) -> BoxFuture<'a, Result<EnrichedFields>>;
}

/// Only test diagnostics (`expect_err` panic messages) format the trait
/// object, so the impl is compiled out of production builds.
#[cfg(test)]
impl std::fmt::Debug for dyn ItemEnricher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemEnricher")
            .field("vendor", &self.vendor())
            .finish()
    }
}

/// Closed set of supported vendors, chosen by configuration before any batch
/// is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Keepa,
    Amazon,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Keepa => "keepa",
            Self::Amazon => "amazon",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "keepa" => Ok(Self::Keepa),
            "amazon" => Ok(Self::Amazon),
            other => bail!("unknown provider \"{other}\" (expected \"keepa\" or \"amazon\")"),
        }
    }
}

const KEEPA_API_KEY_VAR: &str = "KEEPA_API_KEY";
const AMAZON_API_KEY_VAR: &str = "AMAZON_API_KEY";
const AMAZON_API_SECRET_VAR: &str = "AMAZON_API_SECRET";

/// Vendor credentials, typically sourced from the environment.
#[derive(Debug, Clone, Default)]
pub struct ProviderCredentials {
    keepa_api_key: Option<String>,
    amazon_api_key: Option<String>,
    amazon_api_secret: Option<String>,
}

impl ProviderCredentials {
    /// Reads `KEEPA_API_KEY`, `AMAZON_API_KEY`, and `AMAZON_API_SECRET`.
    /// Missing variables stay unset; `build_provider` reports which one a
    /// selected vendor actually needs.
    pub fn from_env() -> Self {
        Self {
            keepa_api_key: read_env(KEEPA_API_KEY_VAR),
            amazon_api_key: read_env(AMAZON_API_KEY_VAR),
            amazon_api_secret: read_env(AMAZON_API_SECRET_VAR),
        }
    }

    pub fn keepa(api_key: impl Into<String>) -> Self {
        Self {
            keepa_api_key: Some(api_key.into()),
            ..Self::default()
        }
    }

    pub fn amazon(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            amazon_api_key: Some(api_key.into()),
            amazon_api_secret: Some(api_secret.into()),
            ..Self::default()
        }
    }
}

fn read_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Builds the configured vendor adapter. Fails when the selected vendor's
/// credentials are absent.
pub fn build_provider(
    kind: ProviderKind,
    credentials: &ProviderCredentials,
    options: ProviderOptions,
) -> Result<Arc<dyn ItemEnricher>> {
    match kind {
        ProviderKind::Keepa => {
            let api_key = credentials
                .keepa_api_key
                .as_deref()
                .with_context(|| format!("{KEEPA_API_KEY_VAR} is required for the keepa provider"))?;
            Ok(Arc::new(KeepaProvider::new(api_key, options)?))
        }
        ProviderKind::Amazon => {
            let api_key = credentials
                .amazon_api_key
                .as_deref()
                .with_context(|| format!("{AMAZON_API_KEY_VAR} is required for the amazon provider"))?;
            let api_secret = credentials.amazon_api_secret.as_deref().with_context(|| {
                format!("{AMAZON_API_SECRET_VAR} is required for the amazon provider")
            })?;
            Ok(Arc::new(AmazonProvider::new(api_key, api_secret)?))
        }
    }
}
