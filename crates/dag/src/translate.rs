//! The protocol-translator seam and the built-in `generic` dialect.
//!
//! A [`ProtocolTranslator`] turns a dialect-specific workflow descriptor into
//! the engine's generic [`DagNode`]. Translators are responsible for
//! normalizing port identifiers to hierarchical ids, marking scattered ports
//! and their method, and fixing every destination port's link-merge policy —
//! the engine only ever sees the finished, validated graph and never
//! branches on dialect.
//!
//! One dialect ships in-tree: `generic`, a direct JSON rendition of the DAG
//! model (nodes, ports, links, scatter annotations). Richer document
//! dialects live in external binder crates that implement the same trait.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::error::DagError;
use crate::model::{DagNode, Link, LinkMerge, Port, PortKind, PortRef, ScatterMethod, ID_SEPARATOR};
use crate::validate::validate;

/// Errors raised while turning a descriptor into a DAG. Surfaced
/// synchronously to the caller of context creation; no context is created.
#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("no translator registered for dialect '{0}'")]
    UnknownDialect(String),

    #[error("malformed descriptor: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("descriptor produced an invalid DAG: {0}")]
    Structural(#[from] DagError),

    #[error("bad link endpoint '{0}': {1}")]
    BadEndpoint(String, String),
}

/// A pure descriptor → DAG function for one workflow dialect.
pub trait ProtocolTranslator: Send + Sync {
    /// Tag under which this translator is selected (`generic`, `cwl-draft2`, …).
    fn dialect(&self) -> &'static str;

    /// Translate `descriptor` (dialect-specific text) into a validated root
    /// [`DagNode`]. `inputs` is available for dialects whose structure
    /// depends on the supplied input values (e.g. batch unrolling).
    fn translate(
        &self,
        descriptor: &str,
        inputs: &Map<String, Value>,
    ) -> Result<DagNode, TranslateError>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Dialect tag → translator lookup. The submission layer picks the
/// translator; everything downstream works on the generic DAG.
#[derive(Default)]
pub struct TranslatorRegistry {
    translators: HashMap<&'static str, Arc<dyn ProtocolTranslator>>,
}

impl TranslatorRegistry {
    /// Registry with the built-in `generic` dialect pre-registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::default();
        registry.register(Arc::new(GenericTranslator));
        registry
    }

    pub fn register(&mut self, translator: Arc<dyn ProtocolTranslator>) {
        self.translators.insert(translator.dialect(), translator);
    }

    /// Translate `descriptor` using the translator registered for `dialect`.
    pub fn translate(
        &self,
        dialect: &str,
        descriptor: &str,
        inputs: &Map<String, Value>,
    ) -> Result<DagNode, TranslateError> {
        let translator = self
            .translators
            .get(dialect)
            .ok_or_else(|| TranslateError::UnknownDialect(dialect.to_owned()))?;
        translator.translate(descriptor, inputs)
    }
}

// ---------------------------------------------------------------------------
// Generic JSON dialect
// ---------------------------------------------------------------------------

/// Descriptor schema of the `generic` dialect.
///
/// Link endpoints are written `step/port` for a child port or just `port`
/// for a port of the enclosing node. Step ids are local; translation
/// prefixes them with the parent id to form globally unique hierarchical ids.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct NodeSpec {
    id: String,
    #[serde(default)]
    tool: Value,
    #[serde(default)]
    inputs: Vec<PortSpec>,
    #[serde(default)]
    outputs: Vec<PortSpec>,
    #[serde(default)]
    scatter_method: Option<ScatterMethod>,
    #[serde(default)]
    steps: Vec<NodeSpec>,
    #[serde(default)]
    links: Vec<LinkSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct PortSpec {
    id: String,
    #[serde(default)]
    scatter: bool,
    #[serde(default)]
    link_merge: Option<LinkMerge>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct LinkSpec {
    source: String,
    destination: String,
    #[serde(default)]
    position: Option<u32>,
}

/// Translator for the built-in `generic` JSON dialect.
pub struct GenericTranslator;

impl ProtocolTranslator for GenericTranslator {
    fn dialect(&self) -> &'static str {
        "generic"
    }

    fn translate(
        &self,
        descriptor: &str,
        _inputs: &Map<String, Value>,
    ) -> Result<DagNode, TranslateError> {
        let spec: NodeSpec = serde_json::from_str(descriptor)?;
        let node = build_node(spec, None)?;
        validate(&node)?;
        debug!(root = %node.id, "translated generic descriptor");
        Ok(node)
    }
}

fn build_node(spec: NodeSpec, parent_id: Option<&str>) -> Result<DagNode, TranslateError> {
    let id = match parent_id {
        Some(parent) => format!("{parent}{ID_SEPARATOR}{}", spec.id),
        None => spec.id.clone(),
    };

    let inputs: Vec<Port> = spec
        .inputs
        .iter()
        .map(|p| build_port(p, &id, PortKind::Input))
        .collect();
    let outputs: Vec<Port> = spec
        .outputs
        .iter()
        .map(|p| build_port(p, &id, PortKind::Output))
        .collect();

    if spec.steps.is_empty() && spec.links.is_empty() {
        return Ok(DagNode::step(
            id,
            inputs,
            outputs,
            spec.scatter_method,
            spec.tool,
        ));
    }

    let mut children = Vec::with_capacity(spec.steps.len());
    for child in spec.steps {
        children.push(build_node(child, Some(&id))?);
    }

    // Assign link positions per destination in order of appearance when not
    // given explicitly, then push the destination port's merge policy onto
    // the link.
    let mut next_position: HashMap<PortRef, u32> = HashMap::new();
    let mut links = Vec::with_capacity(spec.links.len());
    for link in spec.links {
        let source = parse_endpoint(&link.source, &id)?;
        let destination = parse_endpoint(&link.destination, &id)?;
        let position = match link.position {
            Some(p) => p,
            None => {
                let counter = next_position.entry(destination.clone()).or_insert(0);
                *counter += 1;
                *counter
            }
        };
        let merge = destination_merge(&destination, &id, &outputs, &children);
        links.push(Link {
            source,
            destination,
            merge,
            position,
        });
    }

    let mut node = DagNode::container(id, inputs, outputs, spec.tool, children, links);
    node.scatter_method = spec.scatter_method;
    Ok(node)
}

fn build_port(spec: &PortSpec, node_id: &str, kind: PortKind) -> Port {
    let mut port = Port::new(&spec.id, node_id, kind);
    port.scatter = spec.scatter;
    port.link_merge = spec.link_merge.unwrap_or_default();
    port
}

/// Parse `step/port` (child) or `port` (the enclosing node) into a
/// fully-qualified [`PortRef`].
fn parse_endpoint(raw: &str, container_id: &str) -> Result<PortRef, TranslateError> {
    match raw.split_once('/') {
        Some((step, port)) if !step.is_empty() && !port.is_empty() => Ok(PortRef::new(
            format!("{container_id}{ID_SEPARATOR}{step}"),
            port,
        )),
        Some(_) => Err(TranslateError::BadEndpoint(
            raw.to_owned(),
            "empty step or port segment".into(),
        )),
        None if !raw.is_empty() => Ok(PortRef::new(container_id, raw)),
        None => Err(TranslateError::BadEndpoint(
            raw.to_owned(),
            "empty endpoint".into(),
        )),
    }
}

/// Merge policy of the destination port, defaulting to nested when the
/// endpoint does not resolve (validation reports that case properly).
fn destination_merge(
    destination: &PortRef,
    container_id: &str,
    outputs: &[Port],
    children: &[DagNode],
) -> LinkMerge {
    if destination.node_id == container_id {
        outputs
            .iter()
            .find(|p| p.id == destination.port_id)
            .map(|p| p.link_merge)
            .unwrap_or_default()
    } else {
        children
            .iter()
            .find(|c| c.id == destination.node_id)
            .and_then(|c| c.port(&destination.port_id, PortKind::Input))
            .map(|p| p.link_merge)
            .unwrap_or_default()
    }
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn translate(descriptor: &Value) -> Result<DagNode, TranslateError> {
        GenericTranslator.translate(&descriptor.to_string(), &Map::new())
    }

    #[test]
    fn leaf_tool_translates_to_step() {
        let node = translate(&json!({
            "id": "echo",
            "tool": {"command": "echo"},
            "inputs": [{"id": "message"}],
            "outputs": [{"id": "stdout"}]
        }))
        .expect("leaf should translate");

        assert!(!node.is_container());
        assert_eq!(node.id, "echo");
        assert_eq!(node.inputs[0].node_id, "echo");
        assert_eq!(node.payload["command"], "echo");
    }

    #[test]
    fn child_ids_are_prefixed_and_links_resolved() {
        let node = translate(&json!({
            "id": "wf",
            "inputs": [{"id": "x"}],
            "outputs": [{"id": "out"}],
            "steps": [
                {"id": "a", "tool": {}, "inputs": [{"id": "x"}], "outputs": [{"id": "y"}]}
            ],
            "links": [
                {"source": "x", "destination": "a/x"},
                {"source": "a/y", "destination": "out"}
            ]
        }))
        .expect("workflow should translate");

        assert!(node.is_container());
        assert_eq!(node.children()[0].id, "wf.a");
        assert_eq!(node.links()[0].source, PortRef::new("wf", "x"));
        assert_eq!(node.links()[0].destination, PortRef::new("wf.a", "x"));
    }

    #[test]
    fn merge_policy_is_pushed_down_from_port_to_link() {
        let node = translate(&json!({
            "id": "wf",
            "inputs": [{"id": "x"}],
            "outputs": [{"id": "out", "linkMerge": "flattened"}],
            "steps": [
                {"id": "a", "tool": {}, "inputs": [{"id": "x"}], "outputs": [{"id": "y"}]}
            ],
            "links": [
                {"source": "x", "destination": "a/x"},
                {"source": "a/y", "destination": "out"}
            ]
        }))
        .expect("workflow should translate");

        let gather = node
            .links()
            .iter()
            .find(|l| l.destination.port_id == "out")
            .unwrap();
        assert_eq!(gather.merge, LinkMerge::Flattened);
    }

    #[test]
    fn positions_are_assigned_in_order_per_destination() {
        let node = translate(&json!({
            "id": "wf",
            "inputs": [{"id": "p"}, {"id": "q"}],
            "outputs": [{"id": "out", "linkMerge": "flattened"}],
            "steps": [],
            "links": [
                {"source": "p", "destination": "out"},
                {"source": "q", "destination": "out"}
            ]
        }))
        .expect("workflow should translate");

        let positions: Vec<u32> = node.links().iter().map(|l| l.position).collect();
        assert_eq!(positions, vec![1, 2]);
    }

    #[test]
    fn dangling_descriptor_link_fails_validation() {
        let err = translate(&json!({
            "id": "wf",
            "inputs": [{"id": "x"}],
            "outputs": [{"id": "out"}],
            "steps": [],
            "links": [{"source": "x", "destination": "ghost/in"}]
        }))
        .unwrap_err();
        assert!(matches!(err, TranslateError::Structural(_)));
    }

    #[test]
    fn unknown_dialect_is_reported() {
        let registry = TranslatorRegistry::with_defaults();
        let err = registry
            .translate("cwl-draft99", "{}", &Map::new())
            .unwrap_err();
        assert!(matches!(err, TranslateError::UnknownDialect(d) if d == "cwl-draft99"));
    }

    #[test]
    fn scattered_port_annotation_survives_translation() {
        let node = translate(&json!({
            "id": "split",
            "tool": {},
            "scatterMethod": "dot_product",
            "inputs": [{"id": "xs", "scatter": true}],
            "outputs": [{"id": "ys"}]
        }))
        .expect("scattered leaf should translate");
        assert_eq!(node.scatter_method, Some(ScatterMethod::DotProduct));
        assert!(node.inputs[0].scatter);
    }
}
