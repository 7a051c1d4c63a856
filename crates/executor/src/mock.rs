//! `MockTool` — a test double for `ExecutableTool`.
//!
//! Useful in unit and integration tests where a real tool implementation is
//! either unavailable or irrelevant.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::traits::{ExecutableTool, ToolContext};
use crate::ToolError;

/// Behaviour injected into `MockTool` at construction time.
pub enum MockBehaviour {
    /// Return a specific output map.
    ReturnValue(Map<String, Value>),
    /// Fail with a `Retryable` error.
    FailRetryable(String),
    /// Fail with a `Fatal` error.
    FailFatal(String),
    /// Fail with a `Retryable` error for the first `failures` calls, then
    /// succeed with the given outputs.
    FlakyThenReturn {
        failures: usize,
        outputs: Map<String, Value>,
    },
}

/// A mock tool that records every call it receives and returns a
/// programmer-specified result.
pub struct MockTool {
    /// Label used in test assertions.
    pub name: String,
    /// What the tool will do when `execute` is called.
    pub behaviour: MockBehaviour,
    /// All inputs seen by this tool (in call order).
    pub calls: Arc<Mutex<Vec<Map<String, Value>>>>,
}

impl MockTool {
    /// Create a mock that always succeeds with the given outputs.
    pub fn returning(name: impl Into<String>, outputs: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            behaviour: MockBehaviour::ReturnValue(outputs),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Create a mock that always fails with a `Fatal` error.
    pub fn failing_fatal(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            behaviour: MockBehaviour::FailFatal(msg.into()),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Create a mock that always fails with a `Retryable` error.
    pub fn failing_retryable(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            behaviour: MockBehaviour::FailRetryable(msg.into()),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Create a mock that fails `failures` times, then succeeds.
    pub fn flaky(
        name: impl Into<String>,
        failures: usize,
        outputs: Map<String, Value>,
    ) -> Self {
        Self {
            name: name.into(),
            behaviour: MockBehaviour::FlakyThenReturn { failures, outputs },
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Number of times this tool has been executed.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl ExecutableTool for MockTool {
    async fn execute(
        &self,
        inputs: Map<String, Value>,
        _ctx: &ToolContext,
    ) -> Result<Map<String, Value>, ToolError> {
        let attempt = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(inputs);
            calls.len()
        };

        match &self.behaviour {
            MockBehaviour::ReturnValue(outputs) => Ok(outputs.clone()),
            MockBehaviour::FailRetryable(msg) => Err(ToolError::Retryable(msg.clone())),
            MockBehaviour::FailFatal(msg) => Err(ToolError::Fatal(msg.clone())),
            MockBehaviour::FlakyThenReturn { failures, outputs } => {
                if attempt <= *failures {
                    Err(ToolError::Retryable(format!(
                        "{}: transient failure {attempt}",
                        self.name
                    )))
                } else {
                    Ok(outputs.clone())
                }
            }
        }
    }
}
