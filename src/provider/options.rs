//! Configurable knobs for vendor HTTP clients along with validation helpers
//! so callers can reason about timeouts and endpoint overrides.

use anyhow::{bail, Result};
use std::time::Duration;

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_USER_AGENT: &str = concat!("enrichflow/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
pub struct ProviderOptions {
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    /// Overrides the vendor's production endpoint; used by tests to point an
    /// adapter at a local mock server.
    pub base_url: Option<String>,
    pub user_agent: String,
}

impl Default for ProviderOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            base_url: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl ProviderOptions {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.request_timeout.is_zero() {
            bail!("request_timeout must be greater than 0");
        }
        if self.connect_timeout.is_zero() {
            bail!("connect_timeout must be greater than 0");
        }
        if let Some(url) = &self.base_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                bail!("base_url must start with http:// or https://");
            }
        }
        if self.user_agent.trim().is_empty() {
            bail!("user_agent must not be empty");
        }
        Ok(())
    }
}
