//! Execution-state records and the store that owns them.
//!
//! One workflow run ("context") produces one [`ContextRecord`], one
//! [`JobRecord`] per reachable node instance, one [`VariableRecord`] per
//! port value, and one [`LinkRecord`] per materialized DAG link. The
//! [`RecordStore`] exclusively owns all of this mutable state; everything
//! else reads the immutable DAG.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use dag::{DagNode, LinkMerge, PortKind, PortRef};

use crate::scatter::ScatterMapping;

// ---------------------------------------------------------------------------
// Job state machine
// ---------------------------------------------------------------------------

/// Lifecycle state of one job instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Created, inputs not yet satisfied.
    Pending,
    /// All required inputs resolved; eligible for dispatch.
    Ready,
    Running,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// Legal transitions: Pending → Ready → Running → {Completed, Failed}.
/// Running → Running is allowed so executors can re-report progress;
/// Ready → Completed covers zero-work jobs resolved by the engine itself.
pub fn transition_allowed(from: JobState, to: JobState) -> bool {
    use JobState::*;
    matches!(
        (from, to),
        (Pending, Ready)
            | (Pending, Running)
            | (Ready, Running)
            | (Running, Running)
            | (Running, Completed)
            | (Running, Failed)
            | (Ready, Completed)
            | (Pending, Failed)
            | (Ready, Failed)
    )
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Terminal-or-running status of one workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextStatus {
    Running,
    Completed,
    Failed,
}

impl ContextStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ContextStatus::Running)
    }
}

/// One end-to-end workflow run.
#[derive(Debug, Clone)]
pub struct ContextRecord {
    pub id: Uuid,
    pub status: ContextStatus,
    /// Id of the root DAG node.
    pub root_id: String,
    /// Run configuration (e.g. which executor backend to target).
    pub config: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// One instance of a node's execution within a context.
#[derive(Debug, Clone)]
pub struct JobRecord {
    /// Node id, suffixed with the scatter position for instances
    /// (`wf.align.3`).
    pub id: String,
    /// Id of the DAG node this instance executes (equals `id` except for
    /// scatter instances).
    pub node_id: String,
    pub context_id: Uuid,
    pub state: JobState,
    /// Containers and scattered parents are never dispatched; they complete
    /// when their outputs resolve.
    pub container: bool,
    pub scattered: bool,
    /// For scatter instances: (parent job id, 1-based row position).
    pub scatter_source: Option<(String, u32)>,
    /// Enclosing container's job id, if any.
    pub parent_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Variables
// ---------------------------------------------------------------------------

/// One resolved (or resolving) value for one port of one job instance.
///
/// Values accumulate in positional `slots` as links deliver them; once the
/// expected number of slots is filled the record is finalized per the merge
/// policy and never mutated again.
#[derive(Debug, Clone)]
pub struct VariableRecord {
    pub job_id: String,
    pub port_id: String,
    pub kind: PortKind,
    pub context_id: Uuid,
    pub link_merge: LinkMerge,
    /// Position → delivered value. Sparse until resolved.
    pub slots: BTreeMap<u32, Value>,
    /// Number of values this port still expects; `None` while the gather
    /// cardinality of a scattered source is not yet known.
    pub expected: Option<usize>,
    /// Final merged value; `Some` iff the port is resolved.
    pub value: Option<Value>,
}

impl VariableRecord {
    pub fn new(
        job_id: impl Into<String>,
        port_id: impl Into<String>,
        kind: PortKind,
        context_id: Uuid,
        link_merge: LinkMerge,
        expected: Option<usize>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            port_id: port_id.into(),
            kind,
            context_id,
            link_merge,
            slots: BTreeMap::new(),
            expected,
            value: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.value.is_some()
    }

    /// Number of values still missing; effectively unbounded while the
    /// cardinality is unknown.
    pub fn values_left(&self) -> usize {
        self.expected
            .map(|e| e.saturating_sub(self.slots.len()))
            .unwrap_or(usize::MAX)
    }

    /// Store a value at `position`. Duplicate positions overwrite.
    pub fn deliver(&mut self, position: u32, value: Value) {
        debug_assert!(!self.is_resolved(), "delivery to a resolved port");
        self.slots.insert(position, value);
    }

    /// Finalize if every expected slot is filled. Returns whether the record
    /// is resolved after the call.
    pub fn try_finalize(&mut self) -> bool {
        if self.is_resolved() {
            return true;
        }
        let Some(expected) = self.expected else {
            return false;
        };
        if self.values_left() > 0 {
            return false;
        }
        self.value = Some(merge_slots(&self.slots, expected, self.link_merge));
        true
    }

    /// Finalize with an explicitly shaped value (used for gather results,
    /// whose shape is decided by the scatter method, not the merge policy).
    pub fn resolve_with(&mut self, value: Value) {
        self.value = Some(value);
    }
}

/// Merge accumulated slots into the final port value.
///
/// A single expected value resolves bare. Multiple values resolve per the
/// policy: `Nested` keeps one element per slot in ascending position order;
/// `Flattened` concatenates slot contents (arrays are spliced, scalars
/// appended) in ascending position order, independent of arrival order.
fn merge_slots(slots: &BTreeMap<u32, Value>, expected: usize, merge: LinkMerge) -> Value {
    if expected == 0 {
        // Nothing ever feeds this port.
        return Value::Null;
    }
    if expected == 1 {
        return slots.values().next().cloned().unwrap_or(Value::Null);
    }
    match merge {
        LinkMerge::Nested => Value::Array(slots.values().cloned().collect()),
        LinkMerge::Flattened => {
            let mut out = Vec::new();
            for value in slots.values() {
                match value {
                    Value::Array(items) => out.extend(items.iter().cloned()),
                    other => out.push(other.clone()),
                }
            }
            Value::Array(out)
        }
    }
}

// ---------------------------------------------------------------------------
// Links
// ---------------------------------------------------------------------------

/// Materialization of one DAG link within one context.
#[derive(Debug, Clone)]
pub struct LinkRecord {
    pub context_id: Uuid,
    pub source: PortRef,
    /// Which side of the source node the link leaves from: the enclosing
    /// container's input (flowing inward) or a child's output. Carried so
    /// propagation never has to guess — a node may declare the same port id
    /// on both sides.
    pub source_kind: PortKind,
    pub destination: PortRef,
    /// Which side of the destination node the link feeds: one of the
    /// enclosing container's outputs, or a child's input.
    pub destination_kind: PortKind,
    pub merge: LinkMerge,
    pub position: u32,
}

// ---------------------------------------------------------------------------
// Scatter bookkeeping
// ---------------------------------------------------------------------------

/// Per scattered node: the mapping plus lifecycle flags the event processor
/// maintains.
pub struct ScatterState {
    pub mapping: Box<dyn ScatterMapping>,
    /// Set once every scattered input port has resolved and its collection
    /// has been split into the mapping.
    pub sealed: bool,
}

// ---------------------------------------------------------------------------
// Record store
// ---------------------------------------------------------------------------

/// Sole owner of all mutable execution state, keyed by context.
#[derive(Default)]
pub struct RecordStore {
    contexts: HashMap<Uuid, ContextRecord>,
    dags: HashMap<Uuid, Arc<DagNode>>,
    jobs: HashMap<Uuid, HashMap<String, JobRecord>>,
    variables: HashMap<Uuid, HashMap<(String, String, PortKind), VariableRecord>>,
    links: HashMap<Uuid, Vec<LinkRecord>>,
    scatters: HashMap<(Uuid, String), ScatterState>,
    /// Jobs already returned by the readiness resolver; consulted so a job
    /// is never dispatched twice (at-most-once dispatch).
    dispatched: HashSet<(Uuid, String)>,
}

impl RecordStore {
    // ------ contexts ------

    pub fn insert_context(&mut self, context: ContextRecord, dag: Arc<DagNode>) {
        self.dags.insert(context.id, dag);
        self.contexts.insert(context.id, context);
    }

    pub fn context(&self, id: Uuid) -> Option<&ContextRecord> {
        self.contexts.get(&id)
    }

    pub fn context_mut(&mut self, id: Uuid) -> Option<&mut ContextRecord> {
        self.contexts.get_mut(&id)
    }

    pub fn dag(&self, context_id: Uuid) -> Option<&Arc<DagNode>> {
        self.dags.get(&context_id)
    }

    // ------ jobs ------

    pub fn insert_job(&mut self, job: JobRecord) {
        self.jobs
            .entry(job.context_id)
            .or_default()
            .insert(job.id.clone(), job);
    }

    pub fn job(&self, context_id: Uuid, job_id: &str) -> Option<&JobRecord> {
        self.jobs.get(&context_id)?.get(job_id)
    }

    pub fn job_mut(&mut self, context_id: Uuid, job_id: &str) -> Option<&mut JobRecord> {
        self.jobs.get_mut(&context_id)?.get_mut(job_id)
    }

    pub fn jobs(&self, context_id: Uuid) -> impl Iterator<Item = &JobRecord> {
        self.jobs.get(&context_id).into_iter().flat_map(|m| m.values())
    }

    pub fn jobs_mut(&mut self, context_id: Uuid) -> impl Iterator<Item = &mut JobRecord> {
        self.jobs
            .get_mut(&context_id)
            .into_iter()
            .flat_map(|m| m.values_mut())
    }

    // ------ variables ------

    pub fn insert_variable(&mut self, variable: VariableRecord) {
        let key = (
            variable.job_id.clone(),
            variable.port_id.clone(),
            variable.kind,
        );
        self.variables
            .entry(variable.context_id)
            .or_default()
            .insert(key, variable);
    }

    pub fn variable(
        &self,
        context_id: Uuid,
        job_id: &str,
        port_id: &str,
        kind: PortKind,
    ) -> Option<&VariableRecord> {
        self.variables
            .get(&context_id)?
            .get(&(job_id.to_owned(), port_id.to_owned(), kind))
    }

    pub fn variable_mut(
        &mut self,
        context_id: Uuid,
        job_id: &str,
        port_id: &str,
        kind: PortKind,
    ) -> Option<&mut VariableRecord> {
        self.variables
            .get_mut(&context_id)?
            .get_mut(&(job_id.to_owned(), port_id.to_owned(), kind))
    }

    /// Every variable of one context, in no particular order.
    pub fn variables_iter(&self, context_id: Uuid) -> impl Iterator<Item = &VariableRecord> {
        self.variables
            .get(&context_id)
            .into_iter()
            .flat_map(|m| m.values())
    }

    /// All variables of one job on one side, in no particular order.
    pub fn variables_of<'a>(
        &'a self,
        context_id: Uuid,
        job_id: &'a str,
        kind: PortKind,
    ) -> impl Iterator<Item = &'a VariableRecord> + 'a {
        self.variables
            .get(&context_id)
            .into_iter()
            .flat_map(|m| m.values())
            .filter(move |v| v.job_id == job_id && v.kind == kind)
    }

    // ------ links ------

    pub fn insert_link(&mut self, link: LinkRecord) {
        self.links.entry(link.context_id).or_default().push(link);
    }

    /// Links leaving the given (node, port) on the given side, in insertion
    /// order.
    pub fn links_from(&self, context_id: Uuid, source: &PortRef, kind: PortKind) -> Vec<LinkRecord> {
        self.links
            .get(&context_id)
            .into_iter()
            .flatten()
            .filter(|l| &l.source == source && l.source_kind == kind)
            .cloned()
            .collect()
    }

    /// Number of links feeding the given destination port on the given side.
    pub fn inbound_count(&self, context_id: Uuid, destination: &PortRef, kind: PortKind) -> usize {
        self.links
            .get(&context_id)
            .into_iter()
            .flatten()
            .filter(|l| &l.destination == destination && l.destination_kind == kind)
            .count()
    }

    // ------ scatter ------

    pub fn insert_scatter(&mut self, context_id: Uuid, node_id: String, state: ScatterState) {
        self.scatters.insert((context_id, node_id), state);
    }

    pub fn scatter_mut(&mut self, context_id: Uuid, node_id: &str) -> Option<&mut ScatterState> {
        self.scatters.get_mut(&(context_id, node_id.to_owned()))
    }

    // ------ dispatch ledger ------

    pub fn is_dispatched(&self, context_id: Uuid, job_id: &str) -> bool {
        self.dispatched
            .contains(&(context_id, job_id.to_owned()))
    }

    pub fn mark_dispatched(&mut self, context_id: Uuid, job_id: &str) {
        self.dispatched.insert((context_id, job_id.to_owned()));
    }
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn transition_table_matches_lifecycle() {
        use JobState::*;
        assert!(transition_allowed(Pending, Ready));
        assert!(transition_allowed(Ready, Running));
        assert!(transition_allowed(Running, Completed));
        assert!(transition_allowed(Running, Failed));
        assert!(transition_allowed(Running, Running));

        assert!(!transition_allowed(Completed, Running));
        assert!(!transition_allowed(Failed, Running));
        assert!(!transition_allowed(Completed, Failed));
        assert!(!transition_allowed(Running, Pending));
    }

    fn variable(merge: LinkMerge, expected: usize) -> VariableRecord {
        VariableRecord::new(
            "job",
            "port",
            PortKind::Input,
            Uuid::new_v4(),
            merge,
            Some(expected),
        )
    }

    #[test]
    fn single_expected_value_resolves_bare() {
        let mut v = variable(LinkMerge::Nested, 1);
        assert!(!v.try_finalize());
        v.deliver(1, json!({"a": 1}));
        assert!(v.try_finalize());
        assert_eq!(v.value, Some(json!({"a": 1})));
    }

    #[test]
    fn nested_merge_keeps_positional_grouping() {
        let mut v = variable(LinkMerge::Nested, 2);
        v.deliver(2, json!([3, 4]));
        v.deliver(1, json!([1, 2]));
        assert!(v.try_finalize());
        assert_eq!(v.value, Some(json!([[1, 2], [3, 4]])));
    }

    #[test]
    fn flattened_merge_orders_by_position_not_arrival() {
        let mut v = variable(LinkMerge::Flattened, 3);
        v.deliver(2, json!(["b"]));
        v.deliver(3, json!("c"));
        v.deliver(1, json!(["a"]));
        assert!(v.try_finalize());
        assert_eq!(v.value, Some(json!(["a", "b", "c"])));
    }

    #[test]
    fn unknown_cardinality_never_finalizes() {
        let mut v = VariableRecord::new(
            "job",
            "port",
            PortKind::Output,
            Uuid::new_v4(),
            LinkMerge::Nested,
            None,
        );
        v.deliver(1, json!(1));
        assert!(!v.try_finalize());
        v.expected = Some(1);
        assert!(v.try_finalize());
    }

    #[test]
    fn values_left_counts_down_to_finalization() {
        let mut v = variable(LinkMerge::Nested, 2);
        assert_eq!(v.values_left(), 2);
        v.deliver(1, json!(1));
        assert_eq!(v.values_left(), 1);
        assert!(!v.try_finalize());
        v.deliver(2, json!(2));
        assert_eq!(v.values_left(), 0);
        assert!(v.try_finalize());
    }

    #[test]
    fn zero_expected_resolves_to_null() {
        let mut v = variable(LinkMerge::Flattened, 0);
        assert!(v.try_finalize());
        assert_eq!(v.value, Some(Value::Null));
    }

    #[test]
    fn dispatch_ledger_is_per_context() {
        let mut store = RecordStore::default();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        store.mark_dispatched(a, "wf.x");
        assert!(store.is_dispatched(a, "wf.x"));
        assert!(!store.is_dispatched(b, "wf.x"));
    }
}
