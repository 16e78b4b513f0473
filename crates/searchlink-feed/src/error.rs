//! Feed pipeline errors.

use thiserror::Error;

/// Failure delivering or serializing a feed.
#[derive(Debug, Error)]
pub enum FeedError {
    /// Feed XML could not be serialized.
    #[error("feed serialization failed: {0}")]
    Compose(#[from] quick_xml::Error),

    /// The outbound HTTP client could not be built.
    #[error("failed to build feed client: {0}")]
    Client(#[source] reqwest::Error),

    /// Transport-level trouble (connect/timeout/5xx) that persisted
    /// through the whole retry budget.
    #[error("feed delivery failed after {attempts} attempts: {message}")]
    Transient { message: String, attempts: usize },

    /// The appliance rejected the feed (4xx) or answered something other
    /// than its success body. Retrying will not help.
    #[error("feed rejected by appliance: {message}")]
    Permanent { message: String },

    /// Shutdown was signalled while the push was in flight.
    #[error("feed delivery interrupted by shutdown")]
    Interrupted,
}

impl FeedError {
    /// True for failures worth handing back to a retry policy.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}
