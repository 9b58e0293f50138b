//! Typed error hierarchy for the generation pipeline.
//!
//! `GenerateError` covers everything that can stop a generation request;
//! `OpFailure` is the non-fatal per-operation record produced by the file
//! executor, which never aborts a batch.

use thiserror::Error;

/// Errors that terminate (or refuse) a generation request.
#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("Authentication required")]
    AuthenticationRequired,

    #[error("Insufficient {credit_type} credits: need {needed}, have {available}")]
    InsufficientCredits {
        credit_type: String,
        needed: i64,
        available: i64,
    },

    #[error("Project limit reached for plan {plan}: {limit} projects")]
    ProjectLimitReached { plan: String, limit: i64 },

    #[error("Sandbox {id} not found")]
    SandboxNotFound { id: String },

    #[error(
        "Sandbox {id} unavailable after {attempts} attempts over {elapsed_ms}ms (tried: {strategies})"
    )]
    SandboxUnavailable {
        id: String,
        attempts: u32,
        elapsed_ms: u64,
        strategies: String,
    },

    #[error("Generation engine failed: {0}")]
    GenerationEngineError(String),

    #[error("Model output contained no parseable file operations")]
    MalformedModelOutput,

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A single failed file operation inside an otherwise-continuing batch.
#[derive(Debug, Clone)]
pub struct OpFailure {
    /// Human-readable description of the operation, e.g. `write src/App.jsx`.
    pub operation: String,
    pub message: String,
}

impl std::fmt::Display for OpFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.operation, self.message)
    }
}
