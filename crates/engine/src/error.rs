//! Engine-level error types.

use thiserror::Error;
use uuid::Uuid;

use crate::records::JobState;

/// Errors surfaced by the engine facade.
///
/// Structural and translation errors are synchronous: they are returned
/// from context creation and no context is created. Transition errors
/// inside the event loop are logged and dropped instead (the offending
/// event never corrupts the record store); this type only reports them
/// when a caller submits a status that is illegal at submission time.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed DAG — cycle, dangling link, bad scatter annotation.
    #[error("structural error: {0}")]
    Structural(#[from] dag::DagError),

    /// The translator could not produce a DAG from the descriptor.
    #[error("translation error: {0}")]
    Translation(#[from] dag::TranslateError),

    #[error("unknown context {0}")]
    UnknownContext(Uuid),

    #[error("unknown job '{job_id}' in context {context_id}")]
    UnknownJob { job_id: String, context_id: Uuid },

    /// The requested state change is illegal for the job's current state.
    #[error("illegal transition for job '{job_id}': {from:?} -> {to:?}")]
    InvalidTransition {
        job_id: String,
        from: JobState,
        to: JobState,
    },

    /// Outputs were requested before the context completed.
    #[error("context {0} has not completed")]
    NotCompleted(Uuid),
}
