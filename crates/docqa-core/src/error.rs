use thiserror::Error;

use crate::types::Engine;

/// Failure taxonomy of the retrieval-and-answering pipeline.
///
/// Payloads are strings so the error is `Clone`; a single in-flight answer
/// computation can hand the same failure to every waiter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Retrieval unavailable: {0}")]
    RetrievalUnavailable(String),

    #[error("Embedding failed after {attempts} attempt(s): {message}")]
    EmbeddingFailure { attempts: u32, message: String },

    #[error("{engine} model timed out after {seconds}s")]
    ModelTimeout { engine: Engine, seconds: u64 },

    #[error("{engine} model unavailable: {message}")]
    ModelUnavailable { engine: Engine, message: String },

    #[error("Corrupt cache entry {key}: {message}")]
    CacheCorruption { key: String, message: String },

    #[error("Refusing cloud call: {0}")]
    SanitizationBypassAttempt(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Operation failed: {0}")]
    Operation(String),
}

impl Error {
    /// Network-class failures worth retrying locally with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::RetrievalUnavailable(_)
                | Error::EmbeddingFailure { .. }
                | Error::ModelTimeout { .. }
                | Error::ModelUnavailable { .. }
        )
    }

    /// Failures of a model backend that move the router onto the fallback edge.
    pub fn triggers_fallback(&self) -> bool {
        matches!(self, Error::ModelTimeout { .. } | Error::ModelUnavailable { .. })
    }

    pub fn unavailable(engine: Engine, message: impl std::fmt::Display) -> Self {
        Error::ModelUnavailable { engine, message: message.to_string() }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        let timeout = Error::ModelTimeout { engine: Engine::Cloud, seconds: 5 };
        assert!(timeout.triggers_fallback());
        assert!(timeout.is_transient());

        let bypass = Error::SanitizationBypassAttempt("email left in payload".into());
        assert!(!bypass.triggers_fallback());
        assert!(!bypass.is_transient());

        assert!(!Error::InvalidInput("empty question".into()).is_transient());
    }

    #[test]
    fn messages_name_the_engine() {
        let e = Error::unavailable(Engine::Local, "connection refused");
        assert_eq!(e.to_string(), "local model unavailable: connection refused");
    }
}
