//! Tool-level error type.

use thiserror::Error;

/// Errors returned by a tool's `execute` method.
///
/// The executor uses the variant to decide retry behaviour:
/// - `Retryable` — the attempt is repeated with exponential back-off.
/// - `Fatal`     — the job is immediately reported as failed.
#[derive(Debug, Error, Clone)]
pub enum ToolError {
    /// Transient failure; the executor should re-try the attempt.
    #[error("retryable tool error: {0}")]
    Retryable(String),

    /// Permanent failure; no retry should be attempted.
    #[error("fatal tool error: {0}")]
    Fatal(String),
}
