//! Error types shared by graph construction, runs and aggregation.

use thiserror::Error;

/// Errors raised by the epidemic core.
///
/// Every variant is a precondition failure: the inputs handed to an operation
/// are incomplete or inconsistent. Nothing in the core retries.
#[derive(Debug, Error)]
pub enum Error {
    /// Required inputs were never provided.
    #[error("Cannot create the graph: {}", missing.join(", "))]
    MissingInput {
        /// One entry per missing input
        missing: Vec<String>,
    },

    /// An input is present but outside its valid range.
    #[error("Invalid input '{field}': {reason}")]
    InvalidInput {
        /// Name of the offending input
        field: &'static str,
        /// Why the value was rejected
        reason: String,
    },

    /// The state transition table cannot drive a run on the given graph.
    #[error("Invalid state transitions: {reason}")]
    InvalidTransitions {
        /// What is missing or malformed
        reason: String,
    },

    /// A reloaded graph does not adhere to the expected configuration.
    #[error("The graph does not adhere to the graph configuration (mismatch in: {})", fields.join(", "))]
    GraphMismatch {
        /// Names of the fields that differ
        fields: Vec<&'static str>,
    },

    /// Configuration text could not be parsed.
    #[error("Configuration parse error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Error::InvalidInput {
            field,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
