//! Error types for KyroLink.
//!
//! All errors in KyroLink are strongly typed using thiserror.
//! Duplicate ingests are not errors: they surface as a successful
//! [`Ingested`](crate::ledger::Ingested) with `is_new == false`.

use thiserror::Error;

use crate::storage::StorageError;

/// Validation errors that occur during input validation.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Feature set has no attributes")]
    EmptyFeatureSet,

    #[error("Feature set has no recognized attribute kind (got: {})", .kinds.join(", "))]
    UnrecognizedKinds {
        kinds: Vec<String>,
    },

    #[error("Attribute kind cannot be empty")]
    EmptyAttributeKind,

    #[error("Weight {weight} for kind '{kind}' is out of range [0.0, 1.0]")]
    WeightOutOfRange {
        kind: String,
        weight: f64,
    },

    #[error("Merge threshold {value} must be finite and greater than zero")]
    ThresholdOutOfRange {
        value: f64,
    },

    #[error("Source id cannot be empty")]
    EmptySourceId,

    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },
}

/// Errors raised by enrichers.
///
/// These are caught at the registry boundary and degrade to "no
/// enrichment produced". They never change a resolution decision.
#[derive(Debug, Error)]
pub enum EnrichmentError {
    #[error("Enricher '{enricher}' failed: {reason}")]
    Failed {
        enricher: String,
        reason: String,
    },

    #[error("Enricher '{enricher}' did not answer within {duration_ms}ms")]
    Timeout {
        enricher: String,
        duration_ms: u64,
    },

    #[error("Enricher '{enricher}' panicked")]
    Panicked {
        enricher: String,
    },
}

impl EnrichmentError {
    /// Creates a failure for the named enricher.
    #[must_use]
    pub fn failed(enricher: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Failed {
            enricher: enricher.into(),
            reason: reason.into(),
        }
    }
}

/// Top-level error type for KyroLink.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Enrichment error: {0}")]
    Enrichment(#[from] EnrichmentError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl LinkError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if the feature set was rejected before touching the index.
    #[must_use]
    pub const fn is_invalid_feature_set(&self) -> bool {
        matches!(
            self,
            Self::Validation(
                ValidationError::EmptyFeatureSet | ValidationError::UnrecognizedKinds { .. }
            )
        )
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if the durable store failed.
    #[must_use]
    pub const fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    /// Returns true if this error is retryable.
    ///
    /// Storage failures are fatal here and are not retried by the engine.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Enrichment(e) => matches!(e, EnrichmentError::Timeout { .. }),
            Self::Validation(_) | Self::Storage(_) | Self::Internal { .. } => false,
        }
    }
}

/// Result type alias for KyroLink operations.
pub type LinkResult<T> = Result<T, LinkError>;
