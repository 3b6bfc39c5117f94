//! The single-writer-per-execution orchestration loop.
//!
//! Consumes queue messages keyed by execution id. For each message the
//! orchestrator acquires the per-execution lock, loads the
//! (Execution, DedupState) pair, runs the resolution pipeline, persists the
//! pair atomically and only then emits the deduplicated side effects:
//! worker jobs, recirculated task results, subflow creations and the
//! one-shot flow-trigger evaluation.
//!
//! Any error raised while resolving an execution converts that execution to
//! FAILED with a captured diagnostic; the loop keeps consuming events for
//! unrelated executions. Only a failing lock backend propagates out.

mod dedup;
mod executor;

pub use dedup::DedupState;
pub use executor::Executor;

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::OrchestratorConfig;
use crate::error::{EngineError, EngineResult};
use crate::execution::{Execution, StateType};
use crate::flow::Flow;
use crate::queue::{OrchestratorMessage, QueuePublisher, WorkerJob, WorkerTaskResult};
use crate::repository::{ExecutionRepository, FlowRegistry, SubflowLink, SubflowTrackingStore};
use crate::subflow::{SubflowCoordinator, SubflowRequest};
use crate::template::TemplateRenderer;

/// Side effects of one event-processing transaction, emitted after the
/// (Execution, DedupState) pair was persisted.
struct ProcessOutcome {
    execution: Execution,
    state_changed: bool,
    worker_jobs: Vec<WorkerJob>,
    task_results: Vec<WorkerTaskResult>,
    subflow_requests: Vec<SubflowRequest>,
    flow_trigger: bool,
}

impl ProcessOutcome {
    fn quiet(execution: &Execution, state_before: StateType) -> Self {
        Self {
            state_changed: execution.state.current != state_before,
            execution: execution.clone(),
            worker_jobs: Vec::new(),
            task_results: Vec::new(),
            subflow_requests: Vec::new(),
            flow_trigger: false,
        }
    }
}

/// Event loop driving executions forward.
pub struct ExecutionOrchestrator<R, Q, S, G>
where
    R: ExecutionRepository,
    Q: QueuePublisher,
    S: SubflowTrackingStore,
    G: FlowRegistry,
{
    repository: Arc<R>,
    queue: Arc<Q>,
    subflow_store: Arc<S>,
    registry: Arc<G>,
    renderer: TemplateRenderer,
    config: OrchestratorConfig,
}

impl<R, Q, S, G> ExecutionOrchestrator<R, Q, S, G>
where
    R: ExecutionRepository,
    Q: QueuePublisher,
    S: SubflowTrackingStore,
    G: FlowRegistry,
{
    pub fn new(
        repository: Arc<R>,
        queue: Arc<Q>,
        subflow_store: Arc<S>,
        registry: Arc<G>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            repository,
            queue,
            subflow_store,
            registry,
            renderer: TemplateRenderer::new(),
            config,
        }
    }

    /// Consume messages until the channel closes.
    pub async fn run(
        &self,
        mut receiver: mpsc::UnboundedReceiver<OrchestratorMessage>,
    ) -> EngineResult<()> {
        tracing::info!(server_name = %self.config.server_name, "Orchestrator started");
        while let Some(message) = receiver.recv().await {
            if let Err(e) = self.handle_message(message).await {
                match e {
                    // the lock backend being unreachable is the only
                    // non-recoverable case at this layer
                    EngineError::Repository(_) => return Err(e),
                    e => tracing::error!(error = %e, "Failed to process message"),
                }
            }
        }
        tracing::info!("Orchestrator stopped");
        Ok(())
    }

    /// Process one message to completion.
    pub async fn handle_message(&self, message: OrchestratorMessage) -> EngineResult<()> {
        tracing::debug!(execution_id = %message.execution_id(), "<< IN message");
        match message {
            OrchestratorMessage::Execution(execution) => self.on_execution(execution).await,
            OrchestratorMessage::TaskResult(result) => self.on_task_result(result).await,
            OrchestratorMessage::Kill { execution_id } => self.on_kill(&execution_id).await,
            OrchestratorMessage::Resume {
                execution_id,
                task_run_id,
            } => self.on_resume(&execution_id, task_run_id.as_deref()).await,
        }
    }

    fn load_flow(&self, execution: &Execution) -> Option<Arc<Flow>> {
        self.registry
            .find_flow(
                &execution.namespace,
                &execution.flow_id,
                Some(execution.flow_revision),
            )
            .or_else(|| {
                self.registry
                    .find_flow(&execution.namespace, &execution.flow_id, None)
            })
    }

    async fn on_execution(&self, execution: Execution) -> EngineResult<()> {
        self.repository.insert_if_absent(execution.clone()).await?;
        self.process_execution(&execution.id).await
    }

    async fn process_execution(&self, execution_id: &str) -> EngineResult<()> {
        let snapshot = self
            .repository
            .get(execution_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Execution '{}'", execution_id)))?;
        let flow = self.load_flow(&snapshot);
        let renderer = &self.renderer;

        let outcome = self
            .repository
            .lock(execution_id, move |execution, dedup| {
                let state_before = execution.state.current;
                Ok(process_locked(
                    flow.as_deref(),
                    renderer,
                    execution,
                    dedup,
                    state_before,
                ))
            })
            .await?;

        self.emit_outcome(outcome).await
    }

    async fn on_task_result(&self, result: WorkerTaskResult) -> EngineResult<()> {
        let execution_id = result.execution_id().to_string();
        let Some(snapshot) = self.repository.get(&execution_id).await? else {
            tracing::warn!(execution_id = %execution_id, "Task result for unknown execution");
            return Ok(());
        };
        let flow = self.load_flow(&snapshot);
        let renderer = &self.renderer;

        let outcome = self
            .repository
            .lock(&execution_id, move |execution, dedup| {
                let state_before = execution.state.current;
                apply_task_result(execution, &result);
                Ok(process_locked(
                    flow.as_deref(),
                    renderer,
                    execution,
                    dedup,
                    state_before,
                ))
            })
            .await?;

        self.emit_outcome(outcome).await
    }

    /// Kill preempts any pending resolution: every non-terminal task run
    /// goes to KILLED, then the execution itself.
    async fn on_kill(&self, execution_id: &str) -> EngineResult<()> {
        let outcome = self
            .repository
            .lock(execution_id, |execution, _dedup| {
                let state_before = execution.state.current;
                if !execution.state.is_terminated() {
                    for run in execution.task_runs.iter_mut() {
                        if !run.state.is_terminated() {
                            run.state = run.state.with_state(StateType::Killed);
                        }
                    }
                    execution.transition(StateType::Killed);
                    tracing::info!(execution_id = %execution.id, "Execution killed");
                }
                Ok(ProcessOutcome::quiet(execution, state_before))
            })
            .await?;

        // propagate the kill to pending child executions
        for link in self.subflow_store.list_by_parent(execution_id).await? {
            if let Some(child) = self.repository.get(&link.child_execution_id).await? {
                if !child.state.is_terminated() {
                    self.queue
                        .emit(OrchestratorMessage::Kill {
                            execution_id: link.child_execution_id.clone(),
                        })
                        .await?;
                }
            }
        }

        self.emit_outcome(outcome).await
    }

    /// Resume appends a RUNNING history entry to a paused task run and
    /// re-enables resolution.
    async fn on_resume(
        &self,
        execution_id: &str,
        task_run_id: Option<&str>,
    ) -> EngineResult<()> {
        let snapshot = self
            .repository
            .get(execution_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Execution '{}'", execution_id)))?;
        let flow = self.load_flow(&snapshot);
        let renderer = &self.renderer;
        let target = task_run_id.map(|s| s.to_string());

        let outcome = self
            .repository
            .lock(execution_id, move |execution, dedup| {
                let state_before = execution.state.current;

                let paused_run_id = match &target {
                    Some(id) => execution.find_task_run(id).map(|r| r.id.clone()),
                    None => execution
                        .task_runs
                        .iter()
                        .find(|r| r.state.current.is_paused())
                        .map(|r| r.id.clone()),
                };
                if let Some(id) = paused_run_id {
                    if let Some(run) = execution.find_task_run_mut(&id) {
                        if run.state.current.is_paused() {
                            run.state = run.state.with_state(StateType::Running);
                            tracing::info!(
                                execution_id = %execution.id,
                                task_run_id = %id,
                                "Task run resumed"
                            );
                        }
                    }
                }
                if execution.state.is_paused() {
                    execution.transition(StateType::Running);
                }

                Ok(process_locked(
                    flow.as_deref(),
                    renderer,
                    execution,
                    dedup,
                    state_before,
                ))
            })
            .await?;

        self.emit_outcome(outcome).await
    }

    /// Emit the collected side effects; runs after the pair was persisted.
    async fn emit_outcome(&self, outcome: ProcessOutcome) -> EngineResult<()> {
        for job in outcome.worker_jobs {
            tracing::debug!(
                execution_id = %job.execution_id,
                task_run_id = %job.task_run.id,
                task_id = %job.task_run.task_id,
                ">> OUT worker job"
            );
            self.queue.emit_worker_job(job).await?;
        }
        for result in outcome.task_results {
            self.queue
                .emit(OrchestratorMessage::TaskResult(result))
                .await?;
        }
        if !outcome.subflow_requests.is_empty() {
            self.handle_subflow_requests(&outcome.execution, outcome.subflow_requests)
                .await?;
        }
        if outcome.flow_trigger {
            self.queue
                .emit_flow_trigger_evaluation(outcome.execution.clone())
                .await?;
        }
        if outcome.state_changed {
            self.queue
                .emit(OrchestratorMessage::Execution(outcome.execution.clone()))
                .await?;
            self.notify_parent(&outcome.execution).await?;
        }
        Ok(())
    }

    /// When a child execution changes state, report back into its parent's
    /// waiting task run.
    async fn notify_parent(&self, child: &Execution) -> EngineResult<()> {
        let Some(link) = self.subflow_store.find_by_child(&child.id).await? else {
            return Ok(());
        };
        if !link.wait {
            return Ok(());
        }
        let Some(parent_execution) = self.repository.get(&link.parent_execution_id).await? else {
            return Ok(());
        };
        let Some(parent_run) = parent_execution.find_task_run(&link.parent_task_run_id) else {
            return Ok(());
        };
        if parent_run.state.is_terminated() {
            return Ok(());
        }

        let result = if link.batch_index.is_some() {
            let links: Vec<SubflowLink> = self
                .subflow_store
                .list_by_parent(&link.parent_execution_id)
                .await?
                .into_iter()
                .filter(|l| l.parent_task_run_id == link.parent_task_run_id)
                .collect();
            let mut states = Vec::new();
            for l in &links {
                if let Some(child) = self.repository.get(&l.child_execution_id).await? {
                    states.push(child.state.current);
                }
            }
            let total = link.batch_total.unwrap_or(links.len() as u32);
            Some(SubflowCoordinator::iterations_result(
                parent_run,
                &states,
                total,
                link.transmit_failed,
            ))
        } else {
            SubflowCoordinator::subflow_result(&link, child, parent_run, &self.renderer)
        };

        if let Some(result) = result {
            self.queue
                .emit(OrchestratorMessage::TaskResult(result))
                .await?;
        }
        Ok(())
    }

    /// Create child executions for executable task runs.
    ///
    /// The tracking link is persisted before any emission; an existing link
    /// means the child was already created (or the process crashed between
    /// persist and emit) and is recovered instead of duplicated.
    async fn handle_subflow_requests(
        &self,
        parent_execution: &Execution,
        requests: Vec<SubflowRequest>,
    ) -> EngineResult<()> {
        let Some(parent_flow) = self.load_flow(parent_execution) else {
            return Ok(());
        };

        for request in requests {
            let created = SubflowCoordinator::create_children(
                &request,
                &parent_flow,
                parent_execution,
                self.registry.as_ref(),
                &self.renderer,
            );
            match created {
                Ok(children) if children.is_empty() => {
                    // nothing to launch, the task run succeeds immediately
                    self.queue
                        .emit(OrchestratorMessage::TaskResult(WorkerTaskResult::new(
                            request.task_run.with_state(StateType::Success),
                        )))
                        .await?;
                }
                Ok(children) => {
                    for (link, child) in children {
                        if let Some(existing) = self
                            .subflow_store
                            .find_link(&parent_execution.id, &request.task_run.id, link.batch_index)
                            .await?
                        {
                            if let Some(stored) =
                                self.repository.get(&existing.child_execution_id).await?
                            {
                                if stored.state.is_terminated() {
                                    self.notify_parent(&stored).await?;
                                } else {
                                    self.queue
                                        .emit(OrchestratorMessage::Execution(stored))
                                        .await?;
                                }
                            }
                            continue;
                        }

                        self.subflow_store.save(link.clone()).await?;
                        self.repository.insert_if_absent(child.clone()).await?;
                        tracing::info!(
                            parent_execution_id = %parent_execution.id,
                            child_execution_id = %child.id,
                            namespace = %child.namespace,
                            flow_id = %child.flow_id,
                            "Created subflow execution"
                        );
                        self.queue
                            .emit(OrchestratorMessage::Execution(child))
                            .await?;
                    }
                    if !request.waits() {
                        self.queue
                            .emit(OrchestratorMessage::TaskResult(WorkerTaskResult::new(
                                request.task_run.with_state(StateType::Success),
                            )))
                            .await?;
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        execution_id = %parent_execution.id,
                        task_id = %request.task.id,
                        error = %e,
                        "Unable to create subflow executions"
                    );
                    self.queue
                        .emit(OrchestratorMessage::TaskResult(WorkerTaskResult::new(
                            request.task_run.with_state(StateType::Failed),
                        )))
                        .await?;
                }
            }
        }
        Ok(())
    }
}

/// Run the pipeline over a locked pair; resolution failures convert the
/// execution to FAILED instead of stalling it.
fn process_locked(
    flow: Option<&Flow>,
    renderer: &TemplateRenderer,
    execution: &mut Execution,
    dedup: &mut DedupState,
    state_before: StateType,
) -> ProcessOutcome {
    let result = match flow {
        None => Err(EngineError::NotFound(format!(
            "Flow '{}.{}' revision {}",
            execution.namespace, execution.flow_id, execution.flow_revision
        ))),
        Some(flow) => {
            // structural validation before the first task run is created
            let validation = if execution.task_runs.is_empty() && !execution.state.is_terminated()
            {
                flow.validate()
            } else {
                Ok(())
            };
            match validation {
                Err(e) => Err(e),
                Ok(()) => {
                    let mut pipeline = Executor::new(flow, renderer, &mut *execution, &mut *dedup);
                    match pipeline.process() {
                        Ok(()) => Ok((
                            std::mem::take(&mut pipeline.worker_jobs),
                            std::mem::take(&mut pipeline.task_results),
                            std::mem::take(&mut pipeline.subflow_requests),
                            pipeline.flow_trigger,
                        )),
                        Err(e) => Err(e),
                    }
                }
            }
        }
    };

    match result {
        Ok((worker_jobs, task_results, subflow_requests, flow_trigger)) => ProcessOutcome {
            state_changed: execution.state.current != state_before,
            execution: execution.clone(),
            worker_jobs,
            task_results,
            subflow_requests,
            flow_trigger,
        },
        Err(e) => {
            tracing::error!(
                execution_id = %execution.id,
                error = %e,
                "Execution failed from the orchestrator"
            );
            execution.error = Some(e.to_string());
            if !execution.state.is_terminated() {
                for run in execution.task_runs.iter_mut() {
                    if !run.state.is_terminated() {
                        run.state = run.state.with_state(StateType::Failed);
                    }
                }
                execution.transition(StateType::Failed);
            }
            ProcessOutcome::quiet(execution, state_before)
        }
    }
}

/// Merge a task result into the execution. Terminal task runs are
/// immutable; results for them are duplicates and ignored.
fn apply_task_result(execution: &mut Execution, result: &WorkerTaskResult) {
    let incoming = &result.task_run;
    match execution.find_task_run_mut(&incoming.id) {
        Some(existing) => {
            if existing.state.is_terminated() {
                tracing::debug!(
                    execution_id = %execution.id,
                    task_run_id = %incoming.id,
                    "Ignoring result for a terminal task run"
                );
                return;
            }
            *existing = incoming.clone();
        }
        None => {
            tracing::warn!(
                execution_id = %execution.id,
                task_run_id = %incoming.id,
                "Result for unknown task run"
            );
            return;
        }
    }

    // execution-level pause bookkeeping
    if incoming.state.current.is_paused()
        && !execution.state.is_paused()
        && !execution.state.is_terminated()
    {
        execution.transition(StateType::Paused);
    }
    if incoming.state.current.is_running() && execution.state.is_paused() {
        execution.transition(StateType::Running);
    }
}
