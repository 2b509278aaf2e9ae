//! Error taxonomy for the log telemetry pipeline
//!
//! Most of the crate propagates `anyhow::Error`. The variants here are the
//! failures callers need to tell apart: configuration problems abort before
//! any work starts, while an unavailable source is a clean "no data" result
//! for read-only analysis.

use thiserror::Error;

/// Typed pipeline failures carried inside `anyhow::Error`
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Invalid flag value, config file content, or missing dependency
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A classification or alert pattern failed to compile
    #[error("invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// The requested service is not configured
    #[error("unknown service '{0}'")]
    UnknownService(String),

    /// The log source could not be read
    #[error("log source for '{service}' unavailable: {reason}")]
    SourceUnavailable { service: String, reason: String },
}

impl PipelineError {
    /// Shorthand for a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        PipelineError::Configuration(msg.into())
    }

    /// Shorthand for an unavailable source
    pub fn unavailable(service: impl Into<String>, reason: impl Into<String>) -> Self {
        PipelineError::SourceUnavailable {
            service: service.into(),
            reason: reason.into(),
        }
    }
}

/// Returns true when the error chain contains a `SourceUnavailable`
pub fn is_source_unavailable(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<PipelineError>(),
            Some(PipelineError::SourceUnavailable { .. })
        )
    })
}
