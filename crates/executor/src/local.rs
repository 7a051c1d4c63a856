//! Local executor backend.
//!
//! `LocalExecutor` consumes ready jobs from the engine's dispatch channel and
//! runs each in its own tokio task:
//! 1. Reports `Running` for the claimed job.
//! 2. Looks up the tool named by the node payload's `cmd` field.
//! 3. Executes it, handling `ToolError::Retryable` (up to `max_retries` with
//!    exponential back-off) and `ToolError::Fatal` (fail immediately).
//! 4. Reports `Completed` with the tool's outputs, or `Failed`.
//!
//! The executor never touches engine state directly; everything flows back
//! through status reports.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{error, info, instrument, warn};

use engine::{Engine, JobState, ReadyJob};

use crate::traits::{tool_key, ExecutableTool, ToolContext, ToolRegistry};
use crate::ToolError;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tuning knobs for the executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum number of times a retryable tool failure will be retried.
    pub max_retries: u32,
    /// Base delay for exponential back-off between retries.
    pub retry_base_delay: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay: Duration::from_millis(100),
        }
    }
}

// ---------------------------------------------------------------------------
// LocalExecutor
// ---------------------------------------------------------------------------

/// In-process executor backend driving tool implementations.
pub struct LocalExecutor {
    engine: Arc<Engine>,
    registry: Arc<ToolRegistry>,
    config: ExecutorConfig,
}

impl LocalExecutor {
    pub fn new(engine: Arc<Engine>, registry: ToolRegistry, config: ExecutorConfig) -> Self {
        Self {
            engine,
            registry: Arc::new(registry),
            config,
        }
    }

    /// Consume the dispatch channel until the engine drops it. Each job runs
    /// in its own task, so independent jobs execute concurrently.
    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<ReadyJob>) {
        info!("local executor started");
        while let Some(job) = rx.recv().await {
            let engine = self.engine.clone();
            let registry = self.registry.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                run_job(engine, registry, config, job).await;
            });
        }
        info!("dispatch channel closed; local executor stopping");
    }
}

#[instrument(skip_all, fields(job_id = %job.job_id, context_id = %job.context_id))]
async fn run_job(
    engine: Arc<Engine>,
    registry: Arc<ToolRegistry>,
    config: ExecutorConfig,
    job: ReadyJob,
) {
    if let Err(err) = engine.submit_status(&job.job_id, job.context_id, JobState::Running, None) {
        warn!(%err, "could not start job; skipping");
        return;
    }

    let ctx = ToolContext {
        job_id: job.job_id.clone(),
        context_id: job.context_id,
        config: job.config.clone(),
    };

    let tool = tool_key(&job.payload).and_then(|key| registry.get(key).cloned());
    let Some(tool) = tool else {
        error!("no tool registered for payload {}", job.payload);
        report(&engine, &job, JobState::Failed, None);
        return;
    };

    match execute_with_retry(&config, tool.as_ref(), &job, &ctx).await {
        Ok(outputs) => {
            info!("job succeeded");
            report(&engine, &job, JobState::Completed, Some(outputs));
        }
        Err(err) => {
            error!(%err, "job failed");
            report(&engine, &job, JobState::Failed, None);
        }
    }
}

fn report(
    engine: &Engine,
    job: &ReadyJob,
    state: JobState,
    outputs: Option<serde_json::Map<String, serde_json::Value>>,
) {
    if let Err(err) = engine.submit_status(&job.job_id, job.context_id, state, outputs) {
        warn!(%err, "status report rejected");
    }
}

/// Execute one tool with retry logic for `Retryable` failures.
async fn execute_with_retry(
    config: &ExecutorConfig,
    tool: &dyn ExecutableTool,
    job: &ReadyJob,
    ctx: &ToolContext,
) -> Result<serde_json::Map<String, serde_json::Value>, ToolError> {
    let mut attempts = 0u32;

    loop {
        match tool.execute(job.inputs.clone(), ctx).await {
            Ok(outputs) => return Ok(outputs),

            Err(ToolError::Fatal(msg)) => return Err(ToolError::Fatal(msg)),

            Err(ToolError::Retryable(msg)) => {
                attempts += 1;
                if attempts > config.max_retries {
                    return Err(ToolError::Retryable(msg));
                }

                let delay = config.retry_base_delay * 2u32.pow(attempts.saturating_sub(1));
                warn!(
                    "retryable error (attempt {}/{}), retrying in {:?}: {}",
                    attempts, config.max_retries, delay, msg
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTool;
    use engine::{ContextStatus, EngineConfig};
    use serde_json::{json, Map, Value};

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected a JSON object"),
        }
    }

    fn single_step_descriptor(cmd: &str) -> String {
        json!({
            "id": "wf",
            "inputs": [{"id": "x"}],
            "outputs": [{"id": "out"}],
            "steps": [
                {"id": "a", "tool": {"cmd": cmd}, "inputs": [{"id": "x"}], "outputs": [{"id": "y"}]}
            ],
            "links": [
                {"source": "x", "destination": "a/x"},
                {"source": "a/y", "destination": "out"}
            ]
        })
        .to_string()
    }

    fn fast_config() -> ExecutorConfig {
        ExecutorConfig {
            max_retries: 2,
            retry_base_delay: Duration::from_millis(1),
        }
    }

    async fn run_to_end(
        engine: Arc<Engine>,
        registry: ToolRegistry,
        descriptor: &str,
        inputs: Map<String, Value>,
    ) -> (uuid::Uuid, ContextStatus) {
        let rx = engine.attach_dispatcher();
        let executor = LocalExecutor::new(engine.clone(), registry, fast_config());
        tokio::spawn(executor.run(rx));

        let ctx = engine
            .create_context_from_descriptor("generic", descriptor, inputs)
            .expect("context should be created");
        let mut watch = engine.watch(ctx).unwrap();
        let status = *watch
            .wait_for(|s| s.is_terminal())
            .await
            .expect("engine dropped");
        (ctx, status)
    }

    #[tokio::test]
    async fn mock_tool_drives_a_context_to_completion() {
        let engine = Arc::new(Engine::new(EngineConfig::default()));
        let tool = Arc::new(MockTool::returning("double", object(json!({"y": 42}))));
        let mut registry = ToolRegistry::new();
        registry.insert("double".to_owned(), tool.clone());

        let (ctx, status) = run_to_end(
            engine.clone(),
            registry,
            &single_step_descriptor("double"),
            object(json!({"x": 21})),
        )
        .await;

        assert_eq!(status, ContextStatus::Completed);
        assert_eq!(engine.outputs(ctx).unwrap()["out"], json!(42));
        assert_eq!(tool.call_count(), 1);
        assert_eq!(tool.calls.lock().unwrap()[0]["x"], json!(21));
    }

    #[tokio::test]
    async fn retryable_failures_are_retried_then_fail_the_context() {
        let engine = Arc::new(Engine::new(EngineConfig::default()));
        let tool = Arc::new(MockTool::failing_retryable("flaky", "socket reset"));
        let mut registry = ToolRegistry::new();
        registry.insert("flaky".to_owned(), tool.clone());

        let (_, status) = run_to_end(
            engine.clone(),
            registry,
            &single_step_descriptor("flaky"),
            object(json!({"x": 1})),
        )
        .await;

        assert_eq!(status, ContextStatus::Failed);
        // Initial attempt plus max_retries.
        assert_eq!(tool.call_count(), 3);
    }

    #[tokio::test]
    async fn retryable_failure_then_success_completes_the_context() {
        let engine = Arc::new(Engine::new(EngineConfig::default()));
        let tool = Arc::new(MockTool::flaky("flaky", 1, object(json!({"y": 5}))));
        let mut registry = ToolRegistry::new();
        registry.insert("flaky".to_owned(), tool.clone());

        let (ctx, status) = run_to_end(
            engine.clone(),
            registry,
            &single_step_descriptor("flaky"),
            object(json!({"x": 1})),
        )
        .await;

        assert_eq!(status, ContextStatus::Completed);
        assert_eq!(engine.outputs(ctx).unwrap()["out"], json!(5));
        assert_eq!(tool.call_count(), 2);
    }

    #[tokio::test]
    async fn fatal_failure_is_not_retried() {
        let engine = Arc::new(Engine::new(EngineConfig::default()));
        let tool = Arc::new(MockTool::failing_fatal("broken", "bad arguments"));
        let mut registry = ToolRegistry::new();
        registry.insert("broken".to_owned(), tool.clone());

        let (_, status) = run_to_end(
            engine.clone(),
            registry,
            &single_step_descriptor("broken"),
            object(json!({"x": 1})),
        )
        .await;

        assert_eq!(status, ContextStatus::Failed);
        assert_eq!(tool.call_count(), 1);
    }

    #[tokio::test]
    async fn unregistered_tool_fails_the_job() {
        let engine = Arc::new(Engine::new(EngineConfig::default()));
        let (_, status) = run_to_end(
            engine.clone(),
            ToolRegistry::new(),
            &single_step_descriptor("ghost"),
            object(json!({"x": 1})),
        )
        .await;
        assert_eq!(status, ContextStatus::Failed);
    }
}
