//! The event processor — a single logical event queue and the state machine
//! that applies lifecycle events to the record store.
//!
//! Processing is strictly sequential: events are dequeued one at a time and
//! applied in FIFO order; only once the entire queue has drained does the
//! processor invoke every registered [`IterationCallback`] with a
//! monotonically increasing iteration counter. Callbacks may enqueue new
//! events (dispatch triggers future status reports), which drives the next
//! iteration. All record mutations happen on the thread draining the queue,
//! so the state machine needs no internal locking.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use dag::{DagNode, PortKind, PortRef, ScatterMethod};

use crate::records::{
    transition_allowed, ContextRecord, ContextStatus, JobRecord, JobState, LinkRecord,
    RecordStore, ScatterState, VariableRecord,
};
use crate::scatter::mapping_for;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Lifecycle events accepted by the processor.
#[derive(Debug, Clone)]
pub enum Event {
    /// Start a new context from a translated DAG and its external inputs.
    Init {
        context_id: Uuid,
        dag: Arc<DagNode>,
        inputs: Map<String, Value>,
        config: HashMap<String, String>,
    },
    /// An executor reports a job's new state (and outputs on completion).
    JobStatus {
        context_id: Uuid,
        job_id: String,
        state: JobState,
        outputs: Option<Map<String, Value>>,
    },
}

impl Event {
    pub fn context_id(&self) -> Uuid {
        match self {
            Event::Init { context_id, .. } | Event::JobStatus { context_id, .. } => *context_id,
        }
    }
}

/// Observer invoked once per queue-drain cycle. Callbacks run synchronously
/// on the drain thread: long-running work must hand off to worker tasks and
/// return promptly, feeding results back in as new events.
pub trait IterationCallback: Send {
    fn on_iteration(
        &mut self,
        store: &mut RecordStore,
        queue: &mut VecDeque<Event>,
        context_id: Uuid,
        iteration: u64,
    );
}

// ---------------------------------------------------------------------------
// Processor
// ---------------------------------------------------------------------------

/// The control loop: owns the record store, the FIFO queue, and the
/// registered iteration callbacks.
pub struct EventProcessor {
    pub store: RecordStore,
    queue: VecDeque<Event>,
    callbacks: Vec<Box<dyn IterationCallback>>,
    iteration: u64,
}

impl Default for EventProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl EventProcessor {
    pub fn new() -> Self {
        Self {
            store: RecordStore::default(),
            queue: VecDeque::new(),
            callbacks: Vec::new(),
            iteration: 0,
        }
    }

    /// Register an observer; call order is registration order.
    pub fn register_callback(&mut self, callback: Box<dyn IterationCallback>) {
        self.callbacks.push(callback);
    }

    /// Enqueue one event and drain the queue to quiescence.
    pub fn submit(&mut self, event: Event) {
        self.queue.push_back(event);
        self.drain();
    }

    /// Apply queued events until empty, then run callbacks; repeat while
    /// callbacks keep enqueueing.
    fn drain(&mut self) {
        loop {
            let mut touched: Vec<Uuid> = Vec::new();
            while let Some(event) = self.queue.pop_front() {
                let context_id = event.context_id();
                self.apply(event);
                if !touched.contains(&context_id) {
                    touched.push(context_id);
                }
            }
            if touched.is_empty() {
                break;
            }

            self.iteration += 1;
            let iteration = self.iteration;
            // Callbacks are moved out for the duration of the cycle so they
            // can borrow the store and queue mutably.
            let mut callbacks = std::mem::take(&mut self.callbacks);
            for context_id in touched {
                for callback in callbacks.iter_mut() {
                    callback.on_iteration(&mut self.store, &mut self.queue, context_id, iteration);
                }
            }
            self.callbacks = callbacks;

            if self.queue.is_empty() {
                break;
            }
        }
    }

    fn apply(&mut self, event: Event) {
        match event {
            Event::Init {
                context_id,
                dag,
                inputs,
                config,
            } => self.handle_init(context_id, dag, inputs, config),
            Event::JobStatus {
                context_id,
                job_id,
                state,
                outputs,
            } => self.handle_status(context_id, &job_id, state, outputs),
        }
    }

    // -----------------------------------------------------------------------
    // Init
    // -----------------------------------------------------------------------

    fn handle_init(
        &mut self,
        context_id: Uuid,
        dag: Arc<DagNode>,
        inputs: Map<String, Value>,
        config: HashMap<String, String>,
    ) {
        info!(%context_id, root = %dag.id, "initializing context");

        self.store.insert_context(
            ContextRecord {
                id: context_id,
                status: ContextStatus::Running,
                root_id: dag.id.clone(),
                config,
                created_at: Utc::now(),
            },
            dag.clone(),
        );

        // Materialize every link first so inbound counts are available when
        // the variable records are sized. Both endpoint sides are fixed
        // here: an endpoint on the owning container is its input (source
        // side) or output (destination side), an endpoint on a child is the
        // child's output (source side) or input (destination side).
        dag.walk(&mut |node| {
            for link in node.links() {
                let source_kind = if link.source.node_id == node.id {
                    PortKind::Input
                } else {
                    PortKind::Output
                };
                let destination_kind = if link.destination.node_id == node.id {
                    PortKind::Output
                } else {
                    PortKind::Input
                };
                self.store.insert_link(LinkRecord {
                    context_id,
                    source: link.source.clone(),
                    source_kind,
                    destination: link.destination.clone(),
                    destination_kind,
                    merge: link.merge,
                    position: link.position,
                });
            }
        });

        self.create_records(context_id, &dag, None);

        // Ports with nothing to wait for (unlinked inputs, link-less
        // container outputs) resolved during record creation; cascade them
        // before seeding so downstream counts are consistent.
        let pre_resolved: Vec<(String, String, PortKind)> = self
            .store
            .variables_iter(context_id)
            .filter(|v| v.is_resolved())
            .map(|v| (v.job_id.clone(), v.port_id.clone(), v.kind))
            .collect();
        for (node_id, port_id, kind) in pre_resolved {
            self.after_resolve(context_id, &node_id, &port_id, kind);
        }

        // Seed externally supplied root inputs; each seeded port resolves
        // immediately and starts the propagation cascade.
        for port in &dag.inputs {
            let value = match inputs.get(&port.id) {
                Some(v) => v.clone(),
                None => {
                    warn!(port = %port.id, "no value supplied for root input; using null");
                    Value::Null
                }
            };
            if let Some(var) =
                self.store
                    .variable_mut(context_id, &dag.id, &port.id, PortKind::Input)
            {
                var.expected = Some(1);
                var.deliver(1, value);
                var.try_finalize();
            }
            self.after_resolve(context_id, &dag.id, &port.id, PortKind::Input);
        }

        // Steps with no input ports are ready from the start.
        let leaves: Vec<String> = self
            .store
            .jobs(context_id)
            .filter(|j| !j.container && !j.scattered && j.state == JobState::Pending)
            .map(|j| j.id.clone())
            .collect();
        for job_id in leaves {
            self.refresh_readiness(context_id, &job_id);
        }

        self.check_context(context_id);
    }

    /// Create job, variable, and scatter records for `node` and descendants.
    fn create_records(&mut self, context_id: Uuid, node: &DagNode, parent: Option<&str>) {
        let scattered = !node.is_container() && node.scattered_inputs().next().is_some();

        self.store.insert_job(JobRecord {
            id: node.id.clone(),
            node_id: node.id.clone(),
            context_id,
            state: JobState::Pending,
            container: node.is_container(),
            scattered,
            scatter_source: None,
            parent_id: parent.map(str::to_owned),
        });

        for port in &node.inputs {
            let inbound = self
                .store
                .inbound_count(context_id, &port.reference(), PortKind::Input);
            self.store.insert_variable(VariableRecord::new(
                &node.id,
                &port.id,
                PortKind::Input,
                context_id,
                port.link_merge,
                Some(inbound),
            ));
        }

        for port in &node.outputs {
            // A leaf's outputs arrive in one completion report; a scattered
            // leaf's gather cardinality is unknown until its inputs are
            // split; a container's outputs are fed by its internal links.
            let expected = if node.is_container() {
                Some(
                    self.store
                        .inbound_count(context_id, &port.reference(), PortKind::Output),
                )
            } else if scattered {
                None
            } else {
                Some(1)
            };
            let mut var = VariableRecord::new(
                &node.id,
                &port.id,
                PortKind::Output,
                context_id,
                port.link_merge,
                expected,
            );
            if expected == Some(0) {
                // Nothing inside feeds this port; resolve to null so the
                // node can still complete.
                var.try_finalize();
            }
            self.store.insert_variable(var);
        }

        if scattered {
            self.store.insert_scatter(
                context_id,
                node.id.clone(),
                ScatterState {
                    mapping: mapping_for(node),
                    sealed: false,
                },
            );
        }

        // Unlinked input ports of non-root nodes can never receive a value;
        // resolve them to null immediately so they do not block readiness.
        if parent.is_some() {
            for port in &node.inputs {
                if port.scatter {
                    continue;
                }
                if let Some(var) =
                    self.store
                        .variable_mut(context_id, &node.id, &port.id, PortKind::Input)
                {
                    if var.expected == Some(0) && var.try_finalize() {
                        debug!(node = %node.id, port = %port.id, "unlinked input resolved to null");
                    }
                }
            }
        }

        for child in node.children() {
            self.create_records(context_id, child, Some(&node.id));
        }
    }

    // -----------------------------------------------------------------------
    // Job status
    // -----------------------------------------------------------------------

    fn handle_status(
        &mut self,
        context_id: Uuid,
        job_id: &str,
        state: JobState,
        outputs: Option<Map<String, Value>>,
    ) {
        let Some(job) = self.store.job(context_id, job_id) else {
            warn!(%context_id, job_id, "status event for unknown job; dropping");
            return;
        };
        let from = job.state;
        if !transition_allowed(from, state) {
            warn!(
                %context_id, job_id, ?from, to = ?state,
                "illegal state transition; dropping event"
            );
            return;
        }

        let node_id = job.node_id.clone();
        let scatter_source = job.scatter_source.clone();
        debug!(%context_id, job_id, ?from, to = ?state, "job transition");

        if let Some(job) = self.store.job_mut(context_id, job_id) {
            job.state = state;
        }

        match state {
            JobState::Completed => {
                let outputs = outputs.unwrap_or_default();
                match scatter_source {
                    Some((parent_id, position)) => {
                        self.gather_outputs(context_id, &parent_id, position, &outputs)
                    }
                    None => self.complete_outputs(context_id, &node_id, &outputs),
                }
            }
            JobState::Failed => {
                info!(%context_id, job_id, "job failed; failing context");
            }
            _ => {}
        }

        self.check_context(context_id);
    }

    /// Resolve a plain (non-scattered) step's output ports from a
    /// completion report and propagate each value.
    fn complete_outputs(
        &mut self,
        context_id: Uuid,
        node_id: &str,
        outputs: &Map<String, Value>,
    ) {
        let Some(node) = self.node(context_id, node_id) else {
            return;
        };
        let ports: Vec<String> = node.outputs.iter().map(|p| p.id.clone()).collect();
        for port_id in ports {
            let value = outputs.get(&port_id).cloned().unwrap_or(Value::Null);
            if let Some(var) =
                self.store
                    .variable_mut(context_id, node_id, &port_id, PortKind::Output)
            {
                if var.is_resolved() {
                    warn!(node_id, port = %port_id, "output already resolved; ignoring");
                    continue;
                }
                var.deliver(1, value);
                var.try_finalize();
            }
            self.after_resolve(context_id, node_id, &port_id, PortKind::Output);
        }
    }

    /// Accumulate one scatter instance's outputs into the parent node's
    /// gather variables at the instance's row position.
    fn gather_outputs(
        &mut self,
        context_id: Uuid,
        parent_id: &str,
        position: u32,
        outputs: &Map<String, Value>,
    ) {
        let Some(node) = self.node(context_id, parent_id) else {
            return;
        };
        let method = node.scatter_method;
        let ports: Vec<String> = node.outputs.iter().map(|p| p.id.clone()).collect();

        let dims = self
            .store
            .scatter_mut(context_id, parent_id)
            .and_then(|s| s.mapping.dims());

        for port_id in ports {
            let value = outputs.get(&port_id).cloned().unwrap_or(Value::Null);
            let resolved = {
                let Some(var) =
                    self.store
                        .variable_mut(context_id, parent_id, &port_id, PortKind::Output)
                else {
                    continue;
                };
                if var.is_resolved() {
                    warn!(parent_id, port = %port_id, "gather already resolved; ignoring");
                    continue;
                }
                var.deliver(position, value);
                match var.expected {
                    Some(expected) if var.slots.len() >= expected => {
                        let shaped = gather_shape(method, dims.as_deref(), &var.slots);
                        var.resolve_with(shaped);
                        true
                    }
                    _ => false,
                }
            };
            if resolved {
                self.after_resolve(context_id, parent_id, &port_id, PortKind::Output);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Value propagation
    // -----------------------------------------------------------------------

    /// React to a port becoming fully resolved.
    fn after_resolve(&mut self, context_id: Uuid, node_id: &str, port_id: &str, kind: PortKind) {
        let Some(var) = self.store.variable(context_id, node_id, port_id, kind) else {
            return;
        };
        if !var.is_resolved() {
            return;
        }
        let value = var.value.clone().unwrap_or(Value::Null);

        if kind == PortKind::Input {
            let Some(node) = self.node(context_id, node_id) else {
                return;
            };
            let is_container = node.is_container();
            let scattered_port = node
                .port(port_id, PortKind::Input)
                .map(|p| p.scatter)
                .unwrap_or(false);

            if scattered_port {
                self.split_collection(context_id, node_id, port_id, &value);
            }
            if is_container {
                // Container inputs propagate inward along the container's
                // own links.
                self.propagate(context_id, node_id, port_id, PortKind::Input, &value);
            } else {
                self.refresh_readiness(context_id, node_id);
            }
        } else {
            // Outputs propagate along every outgoing link; for container
            // outputs those links live in the enclosing container, which
            // the flat per-context link list already covers.
            self.propagate(context_id, node_id, port_id, PortKind::Output, &value);
        }
    }

    /// Push a resolved value along every link leaving (node, port) on the
    /// resolved side.
    fn propagate(
        &mut self,
        context_id: Uuid,
        node_id: &str,
        port_id: &str,
        kind: PortKind,
        value: &Value,
    ) {
        let links = self
            .store
            .links_from(context_id, &PortRef::new(node_id, port_id), kind);
        for link in links {
            self.deliver(context_id, &link, value.clone());
        }
    }

    /// Deliver one value to a link's destination port.
    fn deliver(&mut self, context_id: Uuid, link: &LinkRecord, value: Value) {
        let dest = &link.destination;
        let kind = link.destination_kind;

        let resolved = {
            let Some(var) =
                self.store
                    .variable_mut(context_id, &dest.node_id, &dest.port_id, kind)
            else {
                warn!(%context_id, destination = %dest, "link delivery to unknown port");
                return;
            };
            if var.is_resolved() {
                warn!(%context_id, destination = %dest, "delivery to resolved port; ignoring");
                return;
            }
            var.deliver(link.position, value);
            var.try_finalize()
        };

        if resolved {
            let (node_id, port_id) = (dest.node_id.clone(), dest.port_id.clone());
            self.after_resolve(context_id, &node_id, &port_id, kind);
        }
    }

    // -----------------------------------------------------------------------
    // Scatter lifecycle
    // -----------------------------------------------------------------------

    /// Split a resolved collection on a scattered port into per-element
    /// `enable` calls, then seal the mapping once every scattered port of
    /// the node has been split.
    fn split_collection(&mut self, context_id: Uuid, node_id: &str, port_id: &str, value: &Value) {
        let Some(node) = self.node(context_id, node_id) else {
            return;
        };
        let scattered_ports: Vec<String> =
            node.scattered_inputs().map(|p| p.id.clone()).collect();

        let elements: Vec<Value> = match value {
            Value::Array(items) => items.clone(),
            other => {
                warn!(node_id, port = %port_id, "scatter over a non-array value; wrapping");
                vec![other.clone()]
            }
        };

        let Some(state) = self.store.scatter_mut(context_id, node_id) else {
            return;
        };
        for (i, element) in elements.into_iter().enumerate() {
            state.mapping.enable(port_id, element, (i + 1) as u32);
        }

        // Seal once every scattered port has resolved (its collection has
        // been fully split).
        let all_split = scattered_ports.iter().all(|p| {
            self.store
                .variable(context_id, node_id, p, PortKind::Input)
                .map(|v| v.is_resolved())
                .unwrap_or(false)
        });
        if !all_split {
            return;
        }

        let row_count = {
            let Some(state) = self.store.scatter_mut(context_id, node_id) else {
                return;
            };
            if state.sealed {
                return;
            }
            state.sealed = true;
            state.mapping.seal();
            // Discover every complete combination so the ledger fixes the
            // gather cardinality; rows stay uncommitted for the resolver.
            state.mapping.enabled_rows();
            state.mapping.row_count()
        };
        debug!(node_id, row_count, "scatter sealed");

        // The gather cardinality is now known.
        let ports: Vec<String> = self
            .node(context_id, node_id)
            .map(|n| n.outputs.iter().map(|p| p.id.clone()).collect())
            .unwrap_or_default();
        for port_id in ports {
            let resolved = {
                let Some(var) =
                    self.store
                        .variable_mut(context_id, node_id, &port_id, PortKind::Output)
                else {
                    continue;
                };
                var.expected = Some(row_count);
                if row_count == 0 {
                    // Empty scatter gathers an empty collection.
                    var.resolve_with(Value::Array(Vec::new()));
                    true
                } else {
                    false
                }
            };
            if resolved {
                self.after_resolve(context_id, node_id, &port_id, PortKind::Output);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Readiness & completion bookkeeping
    // -----------------------------------------------------------------------

    /// Promote a plain step to Ready once every input port has resolved.
    fn refresh_readiness(&mut self, context_id: Uuid, node_id: &str) {
        let Some(job) = self.store.job(context_id, node_id) else {
            return;
        };
        if job.state != JobState::Pending || job.container || job.scattered {
            return;
        }
        let all_resolved = self
            .store
            .variables_of(context_id, node_id, PortKind::Input)
            .all(|v| v.is_resolved());
        if all_resolved {
            if let Some(job) = self.store.job_mut(context_id, node_id) {
                job.state = JobState::Ready;
            }
            debug!(%context_id, node_id, "job ready");
        }
    }

    /// Run after every applied event: auto-complete containers and scattered
    /// parents whose outputs have resolved, then settle the context status.
    fn check_context(&mut self, context_id: Uuid) {
        // Fixpoint: completing a child may complete its parent container.
        loop {
            let candidates: Vec<String> = self
                .store
                .jobs(context_id)
                .filter(|j| {
                    (j.container || (j.scattered && j.scatter_source.is_none()))
                        && !j.state.is_terminal()
                })
                .map(|j| j.id.clone())
                .collect();

            let mut changed = false;
            for job_id in candidates {
                if self.structural_job_done(context_id, &job_id) {
                    if let Some(job) = self.store.job_mut(context_id, &job_id) {
                        job.state = JobState::Completed;
                        changed = true;
                    }
                    debug!(%context_id, job_id, "structural job completed");
                }
            }
            if !changed {
                break;
            }
        }

        let Some(context) = self.store.context(context_id) else {
            return;
        };
        if context.status.is_terminal() {
            return;
        }

        if self
            .store
            .jobs(context_id)
            .any(|j| j.state == JobState::Failed)
        {
            if let Some(context) = self.store.context_mut(context_id) {
                context.status = ContextStatus::Failed;
            }
            info!(%context_id, "context failed");
            return;
        }

        let all_completed = self
            .store
            .jobs(context_id)
            .all(|j| j.state == JobState::Completed);
        if all_completed {
            if let Some(context) = self.store.context_mut(context_id) {
                context.status = ContextStatus::Completed;
            }
            info!(%context_id, "context completed");
        }
    }

    /// Whether a container or scattered parent has finished all the work it
    /// stands for: outputs resolved and every child/instance completed.
    fn structural_job_done(&self, context_id: Uuid, job_id: &str) -> bool {
        let Some(job) = self.store.job(context_id, job_id) else {
            return false;
        };

        let outputs_resolved = self
            .store
            .variables_of(context_id, job_id, PortKind::Output)
            .all(|v| v.is_resolved());
        if !outputs_resolved {
            return false;
        }

        if job.container {
            self.store
                .jobs(context_id)
                .filter(|j| j.parent_id.as_deref() == Some(job_id))
                .all(|j| j.state == JobState::Completed)
        } else {
            // Scattered parent: every materialized instance must have
            // finished, and the instance count must match the ledger.
            let Some(expected) = self
                .store
                .variables_of(context_id, job_id, PortKind::Output)
                .next()
                .and_then(|v| v.expected)
            else {
                // No output ports: fall back to the sealed instance count.
                return self
                    .store
                    .jobs(context_id)
                    .filter(|j| {
                        j.scatter_source
                            .as_ref()
                            .is_some_and(|(parent, _)| parent == job_id)
                    })
                    .all(|j| j.state == JobState::Completed);
            };
            let instances: Vec<&JobRecord> = self
                .store
                .jobs(context_id)
                .filter(|j| {
                    j.scatter_source
                        .as_ref()
                        .is_some_and(|(parent, _)| parent == job_id)
                })
                .collect();
            instances.len() == expected
                && instances.iter().all(|j| j.state == JobState::Completed)
        }
    }

    fn node(&self, context_id: Uuid, node_id: &str) -> Option<DagNode> {
        self.store
            .dag(context_id)
            .and_then(|dag| dag.find(node_id))
            .cloned()
    }
}

/// Shape gathered row outputs per the scatter method: dot-product and flat
/// cross-product gather in ascending row order; nested cross-product groups
/// rows by the first scattered port's index.
fn gather_shape(
    method: Option<ScatterMethod>,
    dims: Option<&[usize]>,
    slots: &std::collections::BTreeMap<u32, Value>,
) -> Value {
    let ordered: Vec<Value> = slots.values().cloned().collect();
    match (method, dims) {
        (Some(ScatterMethod::NestedCrossProduct), Some(dims)) if !dims.is_empty() && dims[0] > 0 => {
            let group = (ordered.len() / dims[0]).max(1);
            Value::Array(
                ordered
                    .chunks(group)
                    .map(|chunk| Value::Array(chunk.to_vec()))
                    .collect(),
            )
        }
        _ => Value::Array(ordered),
    }
}
