//! Readiness resolution — which concrete job instances may be dispatched.
//!
//! Given a context, [`resolve_ready`] returns every job instance whose
//! required inputs are fully satisfied and that has not been handed out
//! before. Returned instances enter the dispatched ledger, so calling this
//! twice without new input arrivals yields disjoint results; a terminal
//! context always yields nothing (fail-fast: no dispatch after a failure).

use std::collections::HashMap;

use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use dag::PortKind;

use crate::records::{ContextStatus, JobRecord, JobState, RecordStore};

/// A dispatchable job: the DAG node's payload bound to resolved input
/// values, addressed by the (job id, context id) pair the executor must
/// report status against.
#[derive(Debug, Clone)]
pub struct ReadyJob {
    /// Job instance id (node id, scatter-suffixed for instances).
    pub job_id: String,
    /// Id of the DAG node being executed.
    pub node_id: String,
    pub context_id: Uuid,
    /// The node's opaque application payload.
    pub payload: Value,
    /// Port id → resolved value.
    pub inputs: Map<String, Value>,
    /// Context configuration (executor backend selection and the like).
    pub config: HashMap<String, String>,
}

/// Compute and claim all newly dispatchable job instances of a context.
pub fn resolve_ready(store: &mut RecordStore, context_id: Uuid) -> Vec<ReadyJob> {
    let Some(context) = store.context(context_id) else {
        return Vec::new();
    };
    if context.status != ContextStatus::Running {
        return Vec::new();
    }
    let config = context.config.clone();
    let Some(dag) = store.dag(context_id).cloned() else {
        return Vec::new();
    };

    let mut out = Vec::new();

    // -----------------------------------------------------------------------
    // Plain steps that reached Ready and were never handed out.
    // -----------------------------------------------------------------------
    let mut ready_ids: Vec<String> = store
        .jobs(context_id)
        .filter(|j| {
            j.state == JobState::Ready
                && !j.container
                && !j.scattered
                && j.scatter_source.is_none()
        })
        .map(|j| j.id.clone())
        .collect();
    ready_ids.sort();

    for job_id in ready_ids {
        if store.is_dispatched(context_id, &job_id) {
            continue;
        }
        let Some(node) = dag.find(&job_id) else {
            continue;
        };
        let inputs: Map<String, Value> = node
            .inputs
            .iter()
            .map(|p| {
                let value = store
                    .variable(context_id, &job_id, &p.id, PortKind::Input)
                    .and_then(|v| v.value.clone())
                    .unwrap_or(Value::Null);
                (p.id.clone(), value)
            })
            .collect();
        store.mark_dispatched(context_id, &job_id);
        debug!(%context_id, job_id, "job claimed for dispatch");
        out.push(ReadyJob {
            job_id: job_id.clone(),
            node_id: job_id,
            context_id,
            payload: node.payload.clone(),
            inputs,
            config: config.clone(),
        });
    }

    // -----------------------------------------------------------------------
    // Scattered steps: materialize one instance per newly enabled row.
    // -----------------------------------------------------------------------
    let mut scattered_ids: Vec<String> = store
        .jobs(context_id)
        .filter(|j| j.scattered && j.scatter_source.is_none() && !j.state.is_terminal())
        .map(|j| j.id.clone())
        .collect();
    scattered_ids.sort();

    for node_id in scattered_ids {
        let Some(node) = dag.find(&node_id) else {
            continue;
        };

        // Every shared (non-scattered) input must be resolved before any
        // instance can be bound.
        let shared: Option<Vec<(String, Value)>> = node
            .inputs
            .iter()
            .filter(|p| !p.scatter)
            .map(|p| {
                store
                    .variable(context_id, &node_id, &p.id, PortKind::Input)
                    .and_then(|v| v.value.clone())
                    .map(|v| (p.id.clone(), v))
            })
            .collect();
        let Some(shared) = shared else {
            continue;
        };

        let rows = match store.scatter_mut(context_id, &node_id) {
            Some(state) => state.mapping.enabled_rows(),
            None => continue,
        };
        if rows.is_empty() {
            continue;
        }

        let parent_id = store
            .job(context_id, &node_id)
            .and_then(|j| j.parent_id.clone());

        for row in &rows {
            let job_id = node.instance_id(row.position);
            if store.is_dispatched(context_id, &job_id) {
                continue;
            }
            let mut inputs = Map::new();
            for port in &node.inputs {
                let value = if port.scatter {
                    row.value(&port.id).cloned().unwrap_or(Value::Null)
                } else {
                    shared
                        .iter()
                        .find(|(id, _)| id == &port.id)
                        .map(|(_, v)| v.clone())
                        .unwrap_or(Value::Null)
                };
                inputs.insert(port.id.clone(), value);
            }

            store.insert_job(JobRecord {
                id: job_id.clone(),
                node_id: node_id.clone(),
                context_id,
                state: JobState::Ready,
                container: false,
                scattered: false,
                scatter_source: Some((node_id.clone(), row.position)),
                parent_id: parent_id.clone(),
            });
            store.mark_dispatched(context_id, &job_id);
            debug!(%context_id, job_id, position = row.position, "scatter instance claimed");
            out.push(ReadyJob {
                job_id,
                node_id: node_id.clone(),
                context_id,
                payload: node.payload.clone(),
                inputs,
                config: config.clone(),
            });
        }

        if let Some(state) = store.scatter_mut(context_id, &node_id) {
            state.mapping.commit(&rows);
        }
    }

    out
}
