//! Error taxonomy for the knowledge fabric.
//!
//! Adapters retry their own transient failures; everything that crosses a
//! component boundary is one of the variants below. Orchestrators never
//! retry on behalf of an adapter.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, FabricError>;

/// Typed failure modes surfaced across component boundaries.
#[derive(Debug, Error)]
pub enum FabricError {
    /// Missing credentials, invalid dimensions, unknown mode. Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A storage backend timed out or refused the connection after the
    /// adapter-level retries were exhausted.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Embedding dimension mismatch or a property that cannot be coerced.
    /// Fatal for the current unit of work; never retried.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    /// 5xx or timeout from the LLM or embedding provider, surfaced after the
    /// retry budget ran out.
    #[error("transient model backend failure: {0}")]
    LlmTransient(String),

    /// The per-endpoint circuit breaker is open.
    #[error("model endpoint unavailable (circuit open)")]
    LlmUnavailable,

    /// A malformed tuple record. The record is dropped and extraction
    /// continues; this variant only escapes when a whole response is
    /// unusable.
    #[error("malformed extraction record: {0}")]
    ExtractionParse(String),

    /// Unknown message type, missing required field, empty question.
    /// Returned to the caller, never retried.
    #[error("invalid input: {0}")]
    UserInput(String),

    /// The shared cancellation signal fired.
    #[error("operation cancelled")]
    Cancelled,
}

impl FabricError {
    /// Whether a caller holding a retry budget of its own may try again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FabricError::StorageUnavailable(_) | FabricError::LlmTransient(_)
        )
    }

    /// Process exit code for CLI entry points: 0 success, 1 configuration,
    /// 2 storage after retries, 3 model backend after retries.
    pub fn exit_code(&self) -> i32 {
        match self {
            FabricError::Configuration(_)
            | FabricError::UserInput(_)
            | FabricError::ExtractionParse(_)
            | FabricError::SchemaMismatch(_)
            | FabricError::Cancelled => 1,
            FabricError::StorageUnavailable(_) => 2,
            FabricError::LlmTransient(_) | FabricError::LlmUnavailable => 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_the_contract() {
        assert_eq!(FabricError::Configuration("x".into()).exit_code(), 1);
        assert_eq!(FabricError::StorageUnavailable("x".into()).exit_code(), 2);
        assert_eq!(FabricError::LlmTransient("x".into()).exit_code(), 3);
        assert_eq!(FabricError::LlmUnavailable.exit_code(), 3);
    }

    #[test]
    fn transient_classification() {
        assert!(FabricError::StorageUnavailable("x".into()).is_transient());
        assert!(FabricError::LlmTransient("x".into()).is_transient());
        assert!(!FabricError::SchemaMismatch("x".into()).is_transient());
        assert!(!FabricError::UserInput("x".into()).is_transient());
    }
}
