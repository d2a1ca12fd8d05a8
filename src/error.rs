use crate::models::SeriesKey;
use thiserror::Error;

/// Failure of one provider's `collect`. Always recovered by the scheduler.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{provider}: request to {endpoint} failed: {source}")]
    Network {
        provider: String,
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{provider}: credentials rejected by {endpoint} (HTTP {status})")]
    Auth {
        provider: String,
        endpoint: String,
        status: u16,
    },

    #[error("{provider}: {endpoint} returned HTTP {status}: {body}")]
    Http {
        provider: String,
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("{provider}: malformed response: {reason}")]
    Malformed { provider: String, reason: String },

    #[error("{provider}: pagination of {endpoint} truncated after page {page}: {reason}")]
    Pagination {
        provider: String,
        endpoint: String,
        page: usize,
        reason: String,
    },
}

/// A negative or non-finite delta reached the counter registry.
///
/// This is a bug in delta computation, never an upstream fault.
#[derive(Debug, Error)]
#[error("invariant violation: delta {delta} for {} {:?}", .key.metric_name(), .key.labels)]
pub struct InvariantViolation {
    pub key: SeriesKey,
    pub delta: f64,
}

/// Why one provider's collection cycle did not apply
#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Invariant(#[from] InvariantViolation),
}
