//! `executor` crate — the `ExecutableTool` trait and executor backends.
//!
//! Tools implement [`ExecutableTool`]; an executor backend bridges the
//! engine's dispatch channel to those implementations and reports lifecycle
//! transitions back. One backend ships in-tree: [`LocalExecutor`], which runs
//! every job as an in-process tokio task.

pub mod builtin;
pub mod error;
pub mod local;
pub mod mock;
pub mod traits;

pub use builtin::builtin_registry;
pub use error::ToolError;
pub use local::{ExecutorConfig, LocalExecutor};
pub use traits::{ExecutableTool, ToolContext, ToolRegistry};
