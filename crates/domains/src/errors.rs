//! # DomainError
//!
//! Centralized error handling for the feedboard ports.
//! Adversarial input is never reported through this type: admission
//! outcomes are plain values (`VerificationResult` and friends).

use thiserror::Error;

use crate::wire::WireError;

/// The primary error type returned by port implementations.
#[derive(Error, Debug)]
pub enum DomainError {
    /// Resource not found (e.g., log, blob, peer)
    #[error("{0} not found with ID {1}")]
    NotFound(String, String),

    /// Validation failure (e.g., reply without a parent thread)
    #[error("validation error: {0}")]
    Validation(String),

    /// Content exceeds a configured size limit
    #[error("{kind} of {size} bytes exceeds the {limit} byte limit")]
    TooLarge {
        kind: &'static str,
        size: usize,
        limit: usize,
    },

    /// Storage layer failure (log append, blob put)
    #[error("storage error: {0}")]
    Storage(String),

    /// The proof system could not produce or check a proof
    #[error("proof error: {0}")]
    Proof(String),

    /// Malformed wire data
    #[error(transparent)]
    Codec(#[from] WireError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        DomainError::Internal(format!("json: {err}"))
    }
}

/// A specialized Result type for port operations.
pub type Result<T> = std::result::Result<T, DomainError>;
