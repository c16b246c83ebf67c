//! Error taxonomy for broker state operations
//!
//! Transport-agnostic error kinds; the REST layer maps them to HTTP status
//! codes and the worker client reconstructs them from status codes.

use thiserror::Error;

/// Errors returned by the broker state engine
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    #[error("not found: {what}")]
    NotFound { what: String },

    #[error("resource exhausted: {resource}")]
    ResourceExhausted { resource: String },

    #[error("payload too large: {size} bytes (max: {max} bytes)")]
    PayloadTooLarge { size: usize, max: usize },
}

impl BrokerError {
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn resource_exhausted(resource: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            resource: resource.into(),
        }
    }
}
