//! The `ExecutableTool` trait — the contract every tool must fulfil.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::ToolError;

/// Per-job context passed to every tool during execution.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Job instance id the result will be reported against.
    pub job_id: String,
    /// Id of the workflow run this job belongs to.
    pub context_id: Uuid,
    /// Run configuration copied from the context (backend tag and the like).
    pub config: HashMap<String, String>,
}

/// The core tool trait.
///
/// A tool receives the job's resolved input values (port id → value) and
/// returns its output values (port id → value). Implementations must be
/// side-effect-safe under retries.
#[async_trait]
pub trait ExecutableTool: Send + Sync {
    async fn execute(
        &self,
        inputs: Map<String, Value>,
        ctx: &ToolContext,
    ) -> Result<Map<String, Value>, ToolError>;
}

/// Maps the `cmd` field of a node's payload to a tool implementation.
pub type ToolRegistry = HashMap<String, Arc<dyn ExecutableTool>>;

/// Extract the registry key from a node payload (`{"cmd": "..."}`).
pub fn tool_key(payload: &Value) -> Option<&str> {
    payload.get("cmd").and_then(Value::as_str)
}
