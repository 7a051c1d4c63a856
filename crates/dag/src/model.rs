//! Core DAG model types.
//!
//! These types describe a workflow graph after translation: nodes with
//! ordered ports, directed data links, and containment. They are the source
//! of truth for what the engine executes and are immutable once built —
//! every context that runs the same workflow shares the same `DagNode`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Separator used in hierarchical node ids (`wf.step.substep`) and in
/// scatter instance ids (`wf.step.3`).
pub const ID_SEPARATOR: char = '.';

// ---------------------------------------------------------------------------
// Ports
// ---------------------------------------------------------------------------

/// Which side of a node a port sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortKind {
    Input,
    Output,
}

/// Policy for combining multiple incoming values at one destination port.
///
/// - `Nested` preserves per-source grouping: one positional slot per inbound
///   link, resolved as an ordered array of slot values.
/// - `Flattened` concatenates all slot contents into a single flat sequence,
///   ordered by ascending link position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkMerge {
    #[default]
    Nested,
    Flattened,
}

/// A named input or output port on a node.
///
/// Identity is (`id`, `node_id`, `kind`) — ports are looked up by equality,
/// never by reference, so the same port can be named from a link and from
/// the node declaration interchangeably.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Port {
    /// Port name, unique per node side.
    pub id: String,
    /// Hierarchical id of the owning node.
    pub node_id: String,
    pub kind: PortKind,
    /// Whether the node fans out over this port's collection value.
    pub scatter: bool,
    /// Merge policy, pushed down from the inbound links at translation time
    /// so runtime merge decisions never re-consult the link list.
    pub link_merge: LinkMerge,
}

impl PartialEq for Port {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.node_id == other.node_id && self.kind == other.kind
    }
}

impl Eq for Port {}

impl Port {
    pub fn new(id: impl Into<String>, node_id: impl Into<String>, kind: PortKind) -> Self {
        Self {
            id: id.into(),
            node_id: node_id.into(),
            kind,
            scatter: false,
            link_merge: LinkMerge::default(),
        }
    }

    /// Builder-style scatter flag, used by translators.
    pub fn scattered(mut self) -> Self {
        self.scatter = true;
        self
    }

    /// Builder-style merge policy, used by translators.
    pub fn with_merge(mut self, merge: LinkMerge) -> Self {
        self.link_merge = merge;
        self
    }

    pub fn reference(&self) -> PortRef {
        PortRef {
            node_id: self.node_id.clone(),
            port_id: self.id.clone(),
        }
    }
}

/// Lightweight (node, port) pair naming one endpoint of a link.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortRef {
    pub node_id: String,
    pub port_id: String,
}

impl PortRef {
    pub fn new(node_id: impl Into<String>, port_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            port_id: port_id.into(),
        }
    }
}

impl std::fmt::Display for PortRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.node_id, self.port_id)
    }
}

// ---------------------------------------------------------------------------
// Links
// ---------------------------------------------------------------------------

/// Directed data edge between two ports of a container or its children.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Link {
    pub source: PortRef,
    pub destination: PortRef,
    /// Merge policy of the destination port (duplicated here for lookup
    /// convenience; validation checks the two agree).
    pub merge: LinkMerge,
    /// 1-based ordering slot among all links feeding the same destination.
    pub position: u32,
}

// ---------------------------------------------------------------------------
// Scatter method
// ---------------------------------------------------------------------------

/// How multiple scattered input ports combine into parallel instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScatterMethod {
    /// One instance per shared index: combination `i` takes element `i`
    /// from every scattered port.
    DotProduct,
    /// One instance per Cartesian element; gathered outputs come back as a
    /// single flat sequence in row order.
    FlatCrossProduct,
    /// Cartesian product with gathered outputs grouped by the first
    /// scattered port's index.
    NestedCrossProduct,
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// Leaf/container distinction. A container exclusively owns its children and
/// the links between their ports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeKind {
    /// A dispatchable step (external tool invocation).
    Step,
    /// A nested sub-workflow.
    Container {
        children: Vec<DagNode>,
        links: Vec<Link>,
    },
}

/// One node of the workflow graph: a step or a nested sub-workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagNode {
    /// Globally unique hierarchical id (`wf.align.index`).
    pub id: String,
    /// Ordered input ports.
    pub inputs: Vec<Port>,
    /// Ordered output ports.
    pub outputs: Vec<Port>,
    /// Present iff at least one input port is scattered.
    pub scatter_method: Option<ScatterMethod>,
    /// Opaque application payload handed to the executor (tool description,
    /// command template, …). The engine never inspects it.
    pub payload: Value,
    pub kind: NodeKind,
}

impl DagNode {
    /// Construct a leaf step.
    pub fn step(
        id: impl Into<String>,
        inputs: Vec<Port>,
        outputs: Vec<Port>,
        scatter_method: Option<ScatterMethod>,
        payload: Value,
    ) -> Self {
        Self {
            id: id.into(),
            inputs,
            outputs,
            scatter_method,
            payload,
            kind: NodeKind::Step,
        }
    }

    /// Construct a container node.
    pub fn container(
        id: impl Into<String>,
        inputs: Vec<Port>,
        outputs: Vec<Port>,
        payload: Value,
        children: Vec<DagNode>,
        links: Vec<Link>,
    ) -> Self {
        Self {
            id: id.into(),
            inputs,
            outputs,
            scatter_method: None,
            payload,
            kind: NodeKind::Container { children, links },
        }
    }

    pub fn is_container(&self) -> bool {
        matches!(self.kind, NodeKind::Container { .. })
    }

    pub fn children(&self) -> &[DagNode] {
        match &self.kind {
            NodeKind::Container { children, .. } => children,
            NodeKind::Step => &[],
        }
    }

    pub fn links(&self) -> &[Link] {
        match &self.kind {
            NodeKind::Container { links, .. } => links,
            NodeKind::Step => &[],
        }
    }

    /// Input ports flagged for scatter, in declaration order.
    pub fn scattered_inputs(&self) -> impl Iterator<Item = &Port> {
        self.inputs.iter().filter(|p| p.scatter)
    }

    /// Look up a port by id on the given side.
    pub fn port(&self, port_id: &str, kind: PortKind) -> Option<&Port> {
        let ports = match kind {
            PortKind::Input => &self.inputs,
            PortKind::Output => &self.outputs,
        };
        ports.iter().find(|p| p.id == port_id)
    }

    /// Find a node (self or any descendant) by hierarchical id.
    pub fn find(&self, id: &str) -> Option<&DagNode> {
        if self.id == id {
            return Some(self);
        }
        self.children().iter().find_map(|c| c.find(id))
    }

    /// Visit self and every descendant, depth-first, parents before children.
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a DagNode)) {
        visit(self);
        for child in self.children() {
            child.walk(visit);
        }
    }

    /// Id of a scatter instance of this node at the given 1-based position.
    pub fn instance_id(&self, position: u32) -> String {
        format!("{}{}{}", self.id, ID_SEPARATOR, position)
    }
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_container() -> DagNode {
        let child = DagNode::step(
            "wf.a",
            vec![Port::new("x", "wf.a", PortKind::Input)],
            vec![Port::new("y", "wf.a", PortKind::Output)],
            None,
            json!({"tool": "echo"}),
        );
        DagNode::container(
            "wf",
            vec![Port::new("x", "wf", PortKind::Input)],
            vec![Port::new("y", "wf", PortKind::Output)],
            Value::Null,
            vec![child],
            vec![
                Link {
                    source: PortRef::new("wf", "x"),
                    destination: PortRef::new("wf.a", "x"),
                    merge: LinkMerge::Nested,
                    position: 1,
                },
                Link {
                    source: PortRef::new("wf.a", "y"),
                    destination: PortRef::new("wf", "y"),
                    merge: LinkMerge::Nested,
                    position: 1,
                },
            ],
        )
    }

    #[test]
    fn port_identity_ignores_flags() {
        let a = Port::new("x", "n", PortKind::Input);
        let b = Port::new("x", "n", PortKind::Input).scattered();
        assert_eq!(a, b);
        let c = Port::new("x", "n", PortKind::Output);
        assert_ne!(a, c);
    }

    #[test]
    fn find_resolves_nested_ids() {
        let wf = sample_container();
        assert!(wf.find("wf.a").is_some());
        assert!(wf.find("wf.b").is_none());
        assert_eq!(wf.find("wf").map(|n| n.is_container()), Some(true));
    }

    #[test]
    fn walk_visits_parent_first() {
        let wf = sample_container();
        let mut seen = Vec::new();
        wf.walk(&mut |n| seen.push(n.id.clone()));
        assert_eq!(seen, vec!["wf", "wf.a"]);
    }

    #[test]
    fn instance_ids_are_suffixed() {
        let wf = sample_container();
        assert_eq!(wf.children()[0].instance_id(3), "wf.a.3");
    }
}
