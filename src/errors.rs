//! Error types for the governance pipeline
//!
//! Every handler returns [`PipelineResult`]. The dispatcher uses
//! [`PipelineError::is_transient`] to decide between redelivery and dropping.

use thiserror::Error;

/// Main error type for the governance pipeline
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Store operation failed: {operation} - {source}")]
    Store {
        operation: String,
        #[source]
        source: sled::Error,
    },

    #[error("Serialization failed: {context}")]
    Serialization {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Encryption operation failed: {operation}")]
    Encryption { operation: String },

    #[error("Rules engine call failed: {operation} - {message}")]
    RulesEngine {
        operation: String,
        message: String,
        transient: bool,
    },

    #[error("Malformed input: {field} - {message}")]
    Malformed { field: String, message: String },

    #[error("Invocation exceeded its {budget_ms}ms budget during {stage}")]
    Timeout { stage: String, budget_ms: u64 },

    /// `transient` is false only when every failed pack failed permanently.
    #[error("{failed} of {total} packs failed to ingest: {packs:?}")]
    PartialFailure {
        failed: usize,
        total: usize,
        packs: Vec<String>,
        transient: bool,
    },
}

pub type PipelineResult<T> = Result<T, PipelineError>;

impl PipelineError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a store error
    pub fn store(operation: impl Into<String>, source: sled::Error) -> Self {
        Self::Store {
            operation: operation.into(),
            source,
        }
    }

    pub fn serialization(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Serialization {
            context: context.into(),
            source,
        }
    }

    pub fn encryption(operation: impl Into<String>) -> Self {
        Self::Encryption {
            operation: operation.into(),
        }
    }

    /// Create a malformed-input error
    pub fn malformed(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Malformed {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Whether redelivering the same input could succeed.
    ///
    /// Malformed input, bad configuration and undecryptable rows reproduce on
    /// every attempt, so they are never retried.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store { .. } | Self::Timeout { .. } => true,
            Self::RulesEngine { transient, .. } | Self::PartialFailure { transient, .. } => *transient,
            Self::Config { .. }
            | Self::Serialization { .. }
            | Self::Encryption { .. }
            | Self::Malformed { .. } => false,
        }
    }
}

impl From<sled::transaction::TransactionError<PipelineError>> for PipelineError {
    fn from(err: sled::transaction::TransactionError<PipelineError>) -> Self {
        match err {
            sled::transaction::TransactionError::Abort(inner) => inner,
            sled::transaction::TransactionError::Storage(source) => {
                Self::store("transaction", source)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_input_is_never_retried() {
        assert!(!PipelineError::malformed("workloadId", "missing").is_transient());
    }

    #[test]
    fn timeouts_and_partial_failures_are_retried() {
        let timeout = PipelineError::Timeout {
            stage: "pack pack-1".into(),
            budget_ms: 30_000,
        };
        assert!(timeout.is_transient());

        let partial = PipelineError::PartialFailure {
            failed: 1,
            total: 3,
            packs: vec!["pack-2".into()],
            transient: true,
        };
        assert!(partial.is_transient());
    }

    #[test]
    fn permanently_failed_packs_are_not_retried() {
        let partial = PipelineError::PartialFailure {
            failed: 1,
            total: 2,
            packs: vec!["pack-1".into()],
            transient: false,
        };
        assert!(!partial.is_transient());
    }

    #[test]
    fn rules_engine_errors_carry_their_own_classification() {
        let throttled = PipelineError::RulesEngine {
            operation: "list_pack_scores".into(),
            message: "throttled".into(),
            transient: true,
        };
        let rejected = PipelineError::RulesEngine {
            operation: "pack_details".into(),
            message: "no such pack".into(),
            transient: false,
        };
        assert!(throttled.is_transient());
        assert!(!rejected.is_transient());
    }
}
