//! Execution engine core: the record store, the event-driven state machine,
//! readiness resolution, and scatter/gather bookkeeping.
//!
//! The engine is deliberately backend-agnostic — it decides *which* job
//! instances may run and *what* values flow between them, while an executor
//! collaborator (see the `executor` crate) decides *how* a job runs. The two
//! meet at exactly two points: the dispatch channel carrying [`ReadyJob`]s
//! outward, and [`Engine::submit_status`] carrying lifecycle reports back.

pub mod engine;
pub mod error;
pub mod event;
pub mod ready;
pub mod records;
pub mod scatter;

pub use engine::{Engine, EngineConfig};
pub use error::EngineError;
pub use event::{Event, EventProcessor, IterationCallback};
pub use ready::{resolve_ready, ReadyJob};
pub use records::{
    transition_allowed, ContextRecord, ContextStatus, JobRecord, JobState, LinkRecord, RecordStore,
    VariableRecord,
};
pub use scatter::{RowMapping, ScatterMapping};
