//! DAG validation — run this before any execution state is created.
//!
//! Rules enforced, per container, recursively:
//! 1. Child node ids must be unique.
//! 2. Every link endpoint must name a declared port: the source is either an
//!    input of the container itself or an output of a direct child; the
//!    destination is either an input of a direct child or an output of the
//!    container itself.
//! 3. The child-to-child link graph must be acyclic (Kahn's algorithm).
//! 4. Scatter annotation must be consistent: a scatter method requires at
//!    least one scattered input port, scattered ports belong to steps only.
//! 5. Every link's merge policy must match its destination port's policy
//!    (the policy is pushed down onto the port at translation time).

use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::DagError;
use crate::model::{DagNode, Link, PortKind};

/// Validate a translated workflow DAG.
///
/// # Errors
/// Returns the first [`DagError`] found; see the module docs for the rules.
pub fn validate(root: &DagNode) -> Result<(), DagError> {
    validate_node(root)
}

fn validate_node(node: &DagNode) -> Result<(), DagError> {
    validate_scatter(node)?;

    if !node.is_container() {
        return Ok(());
    }

    // -----------------------------------------------------------------------
    // 1. Child ids are unique.
    // -----------------------------------------------------------------------
    let mut seen: HashSet<&str> = HashSet::new();
    for child in node.children() {
        if !seen.insert(child.id.as_str()) {
            return Err(DagError::DuplicateNodeId(child.id.clone()));
        }
    }

    // -----------------------------------------------------------------------
    // 2. Link endpoints resolve to declared ports.
    // -----------------------------------------------------------------------
    for link in node.links() {
        validate_endpoint(node, link, true)?;
        validate_endpoint(node, link, false)?;
    }

    // -----------------------------------------------------------------------
    // 3. Cycle detection over child-to-child edges (Kahn's algorithm).
    //    Links to/from the container's own ports cannot form cycles.
    // -----------------------------------------------------------------------
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut in_degree: HashMap<&str, usize> = HashMap::new();

    for child in node.children() {
        adjacency.entry(child.id.as_str()).or_default();
        in_degree.entry(child.id.as_str()).or_insert(0);
    }

    for link in node.links() {
        let from = link.source.node_id.as_str();
        let to = link.destination.node_id.as_str();
        if from == node.id || to == node.id || from == to {
            continue;
        }
        adjacency.entry(from).or_default().push(to);
        *in_degree.entry(to).or_insert(0) += 1;
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(&id, _)| id)
        .collect();

    let mut visited = 0usize;
    while let Some(id) = queue.pop_front() {
        visited += 1;
        if let Some(neighbours) = adjacency.get(id) {
            for &next in neighbours {
                let deg = in_degree.entry(next).or_insert(0);
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(next);
                }
            }
        }
    }

    if visited != node.children().len() {
        return Err(DagError::CycleDetected(node.id.clone()));
    }

    // 5. Merge policy agreement between link and destination port.
    for link in node.links() {
        let dest_port = if link.destination.node_id == node.id {
            node.port(&link.destination.port_id, PortKind::Output)
        } else {
            node.children()
                .iter()
                .find(|c| c.id == link.destination.node_id)
                .and_then(|c| c.port(&link.destination.port_id, PortKind::Input))
        };
        if let Some(port) = dest_port {
            if port.link_merge != link.merge {
                return Err(DagError::MergeConflict {
                    destination: link.destination.clone(),
                });
            }
        }
    }

    for child in node.children() {
        validate_node(child)?;
    }
    Ok(())
}

/// Check that one endpoint of `link` names a declared port.
fn validate_endpoint(container: &DagNode, link: &Link, source: bool) -> Result<(), DagError> {
    let (endpoint, side) = if source {
        (&link.source, "source")
    } else {
        (&link.destination, "destination")
    };

    let found = if endpoint.node_id == container.id {
        // A source on the container is one of its inputs flowing inward; a
        // destination on the container is one of its outputs flowing outward.
        let kind = if source { PortKind::Input } else { PortKind::Output };
        container.port(&endpoint.port_id, kind).is_some()
    } else {
        let kind = if source { PortKind::Output } else { PortKind::Input };
        container
            .children()
            .iter()
            .find(|c| c.id == endpoint.node_id)
            .map(|c| c.port(&endpoint.port_id, kind).is_some())
            .unwrap_or(false)
    };

    if found {
        Ok(())
    } else {
        Err(DagError::DanglingLink {
            port: endpoint.clone(),
            side,
        })
    }
}

fn validate_scatter(node: &DagNode) -> Result<(), DagError> {
    let scattered = node.scattered_inputs().count();

    if node.scatter_method.is_some() && scattered == 0 {
        return Err(DagError::InvalidScatter {
            node_id: node.id.clone(),
            reason: "scatter method declared but no input port is scattered".into(),
        });
    }
    if scattered > 0 && node.is_container() {
        return Err(DagError::InvalidScatter {
            node_id: node.id.clone(),
            reason: "scatter on a container is not supported; unroll in the translator".into(),
        });
    }
    Ok(())
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LinkMerge, Port, PortRef, ScatterMethod};
    use serde_json::{json, Value};

    fn step(id: &str, inputs: &[&str], outputs: &[&str]) -> DagNode {
        DagNode::step(
            id,
            inputs
                .iter()
                .map(|p| Port::new(*p, id, PortKind::Input))
                .collect(),
            outputs
                .iter()
                .map(|p| Port::new(*p, id, PortKind::Output))
                .collect(),
            None,
            json!({"tool": "mock"}),
        )
    }

    fn link(from: (&str, &str), to: (&str, &str)) -> Link {
        Link {
            source: PortRef::new(from.0, from.1),
            destination: PortRef::new(to.0, to.1),
            merge: LinkMerge::Nested,
            position: 1,
        }
    }

    fn container(children: Vec<DagNode>, links: Vec<Link>) -> DagNode {
        DagNode::container(
            "wf",
            vec![Port::new("in", "wf", PortKind::Input)],
            vec![Port::new("out", "wf", PortKind::Output)],
            Value::Null,
            children,
            links,
        )
    }

    #[test]
    fn linear_chain_is_valid() {
        let wf = container(
            vec![step("wf.a", &["x"], &["y"]), step("wf.b", &["x"], &["y"])],
            vec![
                link(("wf", "in"), ("wf.a", "x")),
                link(("wf.a", "y"), ("wf.b", "x")),
                link(("wf.b", "y"), ("wf", "out")),
            ],
        );
        assert!(validate(&wf).is_ok());
    }

    #[test]
    fn cycle_is_detected() {
        let wf = container(
            vec![step("wf.a", &["x"], &["y"]), step("wf.b", &["x"], &["y"])],
            vec![
                link(("wf.a", "y"), ("wf.b", "x")),
                link(("wf.b", "y"), ("wf.a", "x")),
            ],
        );
        assert!(matches!(validate(&wf), Err(DagError::CycleDetected(id)) if id == "wf"));
    }

    #[test]
    fn dangling_link_is_rejected() {
        let wf = container(
            vec![step("wf.a", &["x"], &["y"])],
            vec![link(("wf.ghost", "y"), ("wf.a", "x"))],
        );
        assert!(matches!(validate(&wf), Err(DagError::DanglingLink { side: "source", .. })));
    }

    #[test]
    fn unknown_port_on_known_node_is_rejected() {
        let wf = container(
            vec![step("wf.a", &["x"], &["y"])],
            vec![link(("wf", "in"), ("wf.a", "nope"))],
        );
        assert!(matches!(
            validate(&wf),
            Err(DagError::DanglingLink { side: "destination", .. })
        ));
    }

    #[test]
    fn duplicate_child_id_is_rejected() {
        let wf = container(
            vec![step("wf.a", &[], &[]), step("wf.a", &[], &[])],
            vec![],
        );
        assert!(matches!(validate(&wf), Err(DagError::DuplicateNodeId(id)) if id == "wf.a"));
    }

    #[test]
    fn scatter_method_without_scattered_port_is_rejected() {
        let mut s = step("wf.a", &["x"], &["y"]);
        s.scatter_method = Some(ScatterMethod::DotProduct);
        let wf = container(vec![s], vec![]);
        assert!(matches!(validate(&wf), Err(DagError::InvalidScatter { .. })));
    }

    #[test]
    fn scattered_container_is_rejected() {
        let mut inner = container(vec![], vec![]);
        inner.inputs[0].scatter = true;
        assert!(matches!(validate(&inner), Err(DagError::InvalidScatter { .. })));
    }

    #[test]
    fn merge_conflict_is_rejected() {
        let mut child = step("wf.a", &["x"], &["y"]);
        child.inputs[0].link_merge = LinkMerge::Flattened;
        let wf = container(vec![child], vec![link(("wf", "in"), ("wf.a", "x"))]);
        assert!(matches!(validate(&wf), Err(DagError::MergeConflict { .. })));
    }
}
