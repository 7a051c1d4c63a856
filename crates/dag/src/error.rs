//! Structural error type for DAG validation.

use thiserror::Error;

use crate::model::PortRef;

/// Errors raised by [`crate::validate`]. All of these are fatal at
/// validation time: the workflow never starts.
#[derive(Debug, Error)]
pub enum DagError {
    /// Two children of one container share an id.
    #[error("duplicate node id '{0}'")]
    DuplicateNodeId(String),

    /// A link endpoint names a port that no node declares.
    #[error("link references unknown port {port} ({side} side)")]
    DanglingLink { port: PortRef, side: &'static str },

    /// The link graph of container `{0}` revisits a node.
    #[error("container '{0}' contains a cycle")]
    CycleDetected(String),

    /// Scatter annotation is inconsistent (method without scattered ports,
    /// scattered ports on a container, unknown method).
    #[error("invalid scatter configuration on node '{node_id}': {reason}")]
    InvalidScatter { node_id: String, reason: String },

    /// A link's merge policy disagrees with its destination port's policy.
    #[error("link into {destination} declares a merge policy that conflicts with the port")]
    MergeConflict { destination: PortRef },
}
