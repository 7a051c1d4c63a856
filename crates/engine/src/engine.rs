//! The `Engine` facade — an explicit instance owning its event queue,
//! record store, and callback list.
//!
//! Each engine is self-contained: multiple independent engines can run in
//! one process (useful for tests and embeddings). External producers — an
//! executor reporting status, a submission layer creating contexts — only
//! ever enqueue events through this facade; all record mutation happens on
//! the thread draining the queue.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};
use tracing::{debug, instrument};
use uuid::Uuid;

use dag::{validate, DagNode, PortKind, TranslatorRegistry};

use crate::error::EngineError;
use crate::event::{Event, EventProcessor, IterationCallback};
use crate::ready::{resolve_ready, ReadyJob};
use crate::records::{transition_allowed, ContextStatus, JobState, RecordStore};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Engine construction knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Backend tag copied into every context's configuration; the executor
    /// collaborator decides what it means.
    pub backend: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: "local".to_owned(),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

type WatcherMap = Arc<Mutex<HashMap<Uuid, watch::Sender<ContextStatus>>>>;

/// The workflow execution engine.
pub struct Engine {
    config: EngineConfig,
    processor: Arc<Mutex<EventProcessor>>,
    watchers: WatcherMap,
    translators: TranslatorRegistry,
}

impl Engine {
    /// Build an engine with the default translator registry and the
    /// completion-watch callback registered.
    pub fn new(config: EngineConfig) -> Self {
        let watchers: WatcherMap = Arc::new(Mutex::new(HashMap::new()));
        let mut processor = EventProcessor::new();
        processor.register_callback(Box::new(CompletionCallback {
            watchers: watchers.clone(),
        }));
        Self {
            config,
            processor: Arc::new(Mutex::new(processor)),
            watchers,
            translators: TranslatorRegistry::with_defaults(),
        }
    }

    /// Register an additional workflow dialect.
    pub fn register_translator(&mut self, translator: Arc<dyn dag::ProtocolTranslator>) {
        self.translators.register(translator);
    }

    /// Attach a dispatch channel: every iteration, newly ready jobs of
    /// running contexts are pushed into the returned receiver. Attach
    /// before creating contexts or early jobs are only claimable via
    /// [`Engine::ready_jobs`].
    pub fn attach_dispatcher(&self) -> mpsc::UnboundedReceiver<ReadyJob> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock_processor()
            .register_callback(Box::new(DispatchCallback { tx }));
        rx
    }

    // -----------------------------------------------------------------------
    // Submission surface
    // -----------------------------------------------------------------------

    /// Validate `dag` and start a new context with the given inputs.
    ///
    /// # Errors
    /// [`EngineError::Structural`] if the DAG is malformed; no context is
    /// created in that case.
    #[instrument(skip_all, fields(root = %dag.id))]
    pub fn create_context(
        &self,
        dag: DagNode,
        inputs: Map<String, Value>,
    ) -> Result<Uuid, EngineError> {
        validate(&dag)?;

        let context_id = Uuid::new_v4();
        {
            let (tx, _rx) = watch::channel(ContextStatus::Running);
            self.watchers
                .lock()
                .expect("watcher map poisoned")
                .insert(context_id, tx);
        }

        let mut config = HashMap::new();
        config.insert("backend".to_owned(), self.config.backend.clone());

        self.lock_processor().submit(Event::Init {
            context_id,
            dag: Arc::new(dag),
            inputs,
            config,
        });
        Ok(context_id)
    }

    /// Translate a dialect-specific descriptor and start a context from it.
    ///
    /// # Errors
    /// [`EngineError::Translation`] if the descriptor cannot be translated;
    /// [`EngineError::Structural`] if the resulting DAG is invalid.
    pub fn create_context_from_descriptor(
        &self,
        dialect: &str,
        descriptor: &str,
        inputs: Map<String, Value>,
    ) -> Result<Uuid, EngineError> {
        let dag = self.translators.translate(dialect, descriptor, &inputs)?;
        self.create_context(dag, inputs)
    }

    // -----------------------------------------------------------------------
    // Executor surface
    // -----------------------------------------------------------------------

    /// Event sink for executors: report a dispatched job's new state.
    ///
    /// The transition is checked synchronously against the job's current
    /// state so callers get immediate feedback; the event processor
    /// re-checks on application and drops anything that became illegal in
    /// between.
    pub fn submit_status(
        &self,
        job_id: &str,
        context_id: Uuid,
        state: JobState,
        outputs: Option<Map<String, Value>>,
    ) -> Result<(), EngineError> {
        let mut processor = self.lock_processor();
        let current = processor
            .store
            .job(context_id, job_id)
            .ok_or_else(|| EngineError::UnknownJob {
                job_id: job_id.to_owned(),
                context_id,
            })?
            .state;
        if !transition_allowed(current, state) {
            return Err(EngineError::InvalidTransition {
                job_id: job_id.to_owned(),
                from: current,
                to: state,
            });
        }
        processor.submit(Event::JobStatus {
            context_id,
            job_id: job_id.to_owned(),
            state,
            outputs,
        });
        Ok(())
    }

    /// Pull surface: claim every job instance of `context_id` whose inputs
    /// are satisfied and that has not been handed out before.
    pub fn ready_jobs(&self, context_id: Uuid) -> Result<Vec<ReadyJob>, EngineError> {
        let mut processor = self.lock_processor();
        if processor.store.context(context_id).is_none() {
            return Err(EngineError::UnknownContext(context_id));
        }
        Ok(resolve_ready(&mut processor.store, context_id))
    }

    // -----------------------------------------------------------------------
    // Query surface
    // -----------------------------------------------------------------------

    pub fn context_status(&self, context_id: Uuid) -> Result<ContextStatus, EngineError> {
        self.lock_processor()
            .store
            .context(context_id)
            .map(|c| c.status)
            .ok_or(EngineError::UnknownContext(context_id))
    }

    /// The root node's resolved output values. Only valid once the context
    /// has completed.
    pub fn outputs(&self, context_id: Uuid) -> Result<Map<String, Value>, EngineError> {
        let processor = self.lock_processor();
        let context = processor
            .store
            .context(context_id)
            .ok_or(EngineError::UnknownContext(context_id))?;
        if context.status != ContextStatus::Completed {
            return Err(EngineError::NotCompleted(context_id));
        }
        let root_id = context.root_id.clone();
        Ok(processor
            .store
            .variables_of(context_id, &root_id, PortKind::Output)
            .map(|v| (v.port_id.clone(), v.value.clone().unwrap_or(Value::Null)))
            .collect())
    }

    /// Subscribe to the context's status; the channel observes the terminal
    /// transition without polling.
    pub fn watch(&self, context_id: Uuid) -> Result<watch::Receiver<ContextStatus>, EngineError> {
        self.watchers
            .lock()
            .expect("watcher map poisoned")
            .get(&context_id)
            .map(|tx| tx.subscribe())
            .ok_or(EngineError::UnknownContext(context_id))
    }

    fn lock_processor(&self) -> std::sync::MutexGuard<'_, EventProcessor> {
        self.processor.lock().expect("event processor poisoned")
    }
}

// ---------------------------------------------------------------------------
// Built-in iteration callbacks
// ---------------------------------------------------------------------------

/// Pushes newly ready jobs of running contexts onto the dispatch channel.
struct DispatchCallback {
    tx: mpsc::UnboundedSender<ReadyJob>,
}

impl IterationCallback for DispatchCallback {
    fn on_iteration(
        &mut self,
        store: &mut RecordStore,
        _queue: &mut VecDeque<Event>,
        context_id: Uuid,
        iteration: u64,
    ) {
        let jobs = resolve_ready(store, context_id);
        if jobs.is_empty() {
            return;
        }
        debug!(%context_id, iteration, count = jobs.len(), "dispatching ready jobs");
        for job in jobs {
            // A closed channel means the executor went away; the jobs stay
            // claimed and the context stalls visibly rather than corrupting
            // state.
            let _ = self.tx.send(job);
        }
    }
}

/// Publishes the context status on its watch channel each iteration.
struct CompletionCallback {
    watchers: WatcherMap,
}

impl IterationCallback for CompletionCallback {
    fn on_iteration(
        &mut self,
        store: &mut RecordStore,
        _queue: &mut VecDeque<Event>,
        context_id: Uuid,
        _iteration: u64,
    ) {
        let Some(status) = store.context(context_id).map(|c| c.status) else {
            return;
        };
        if let Some(tx) = self
            .watchers
            .lock()
            .expect("watcher map poisoned")
            .get(&context_id)
        {
            tx.send_replace(status);
        }
    }
}
