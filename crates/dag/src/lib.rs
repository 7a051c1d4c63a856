//! `dag` crate — the immutable workflow DAG model, pre-execution validation,
//! and the protocol-translator seam.
//!
//! A [`DagNode`] is produced once by a [`ProtocolTranslator`], validated, and
//! then shared read-only with the execution engine. All scatter and
//! link-merge annotation happens here, before execution — the engine never
//! mutates the graph.

pub mod error;
pub mod model;
pub mod translate;
pub mod validate;

pub use error::DagError;
pub use model::{DagNode, Link, LinkMerge, NodeKind, Port, PortKind, PortRef, ScatterMethod};
pub use translate::{GenericTranslator, ProtocolTranslator, TranslateError, TranslatorRegistry};
pub use validate::validate;
