//! Shared error taxonomy.

use thiserror::Error;

/// A request path that cannot be mapped back to a document identifier.
///
/// Always answered with 404 at the HTTP surface; never alerts.
#[derive(Debug, Error)]
pub enum MalformedIdError {
    /// The path does not start with the configured document base.
    #[error("path {path} lies outside document base {base}")]
    OutsideBase { path: String, base: String },

    /// A percent escape was truncated, invalid hex, or decoded to non-UTF-8.
    #[error("path {path} contains an invalid percent escape")]
    BadEscape { path: String },

    /// The path percent-decodes to an empty identifier.
    #[error("path {path} decodes to an empty document id")]
    Empty { path: String },
}

/// Failure reported by a repository adaptor callback.
///
/// Adaptor faults never kill the long-running controller: a push skips to
/// the next record and a content request answers 500.
#[derive(Debug, Error)]
pub enum AdaptorError {
    /// The adaptor could not produce or authorize the requested work.
    #[error("adaptor fault: {message}")]
    Fault { message: String },

    /// The adaptor observed the shutdown signal and gave up cooperatively.
    #[error("adaptor interrupted")]
    Interrupted,
}

impl AdaptorError {
    /// Convenience constructor for the common fault case.
    pub fn fault(message: impl Into<String>) -> Self {
        Self::Fault {
            message: message.into(),
        }
    }
}
