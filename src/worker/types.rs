use crate::provider::adapter::ProviderError;
use std::time::Duration;

use super::backoff::RetryDisposition;

/// Per-item retry budget applied to provider calls.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_attempts: usize,
}

/// Per-batch result tally handed to the status tracker.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchTally {
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug)]
pub(super) enum ProcessingOutcome {
    Completed(BatchTally),
    Cancelled,
}

#[derive(Debug, PartialEq, Eq)]
pub(super) enum ItemOutcome {
    Enriched,
    Failed,
    Cancelled,
}

/// Transient provider failures are retried; permanent ones abort the retry
/// loop so the item is marked failed on the first verdict. Errors that did
/// not come out of a provider adapter are treated as transient transport
/// problems and stay bounded by the attempt budget.
pub(super) fn classify_enrichment_error(error: &anyhow::Error) -> RetryDisposition {
    match error.downcast_ref::<ProviderError>() {
        Some(provider_error) if provider_error.is_transient() => RetryDisposition::Retry,
        Some(_) => RetryDisposition::Abort,
        None => RetryDisposition::Retry,
    }
}
