//! Built-in tools shipped with the local backend.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::traits::{ExecutableTool, ToolContext, ToolRegistry};
use crate::ToolError;

/// Passes the job's inputs through as its outputs, port names unchanged.
/// Handy for wiring and demo workflows where no real tool runs.
pub struct IdentityTool;

#[async_trait]
impl ExecutableTool for IdentityTool {
    async fn execute(
        &self,
        inputs: Map<String, Value>,
        _ctx: &ToolContext,
    ) -> Result<Map<String, Value>, ToolError> {
        Ok(inputs)
    }
}

/// Registry with every built-in tool pre-registered.
pub fn builtin_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.insert("identity".to_owned(), Arc::new(IdentityTool));
    registry
}
