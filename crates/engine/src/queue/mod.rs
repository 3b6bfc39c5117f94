//! Queue collaborator: at-least-once delivery of orchestrator messages.
//!
//! The orchestrator consumes messages keyed by execution id and emits worker
//! jobs for leaf tasks. Delivery may duplicate messages; correctness under
//! duplicates is the orchestrator's job (dedup state), not the queue's.

mod memory;
mod nats;

pub use memory::{memory_queue, MemoryQueue, MemoryQueueReceiver};
pub use nats::NatsJobPublisher;

use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::error::EngineResult;
use crate::execution::{Execution, TaskRun};

/// A worker's (or the orchestrator's own) report about one task run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerTaskResult {
    pub task_run: TaskRun,
}

impl WorkerTaskResult {
    pub fn new(task_run: TaskRun) -> Self {
        Self { task_run }
    }

    pub fn execution_id(&self) -> &str {
        &self.task_run.execution_id
    }
}

/// A unit of dispatched work for one worker (leaf) task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerJob {
    pub execution_id: String,
    pub task_run: TaskRun,

    /// Worker group routing hint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_group: Option<String>,

    /// Task configuration forwarded to the worker.
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
}

/// Messages consumed by the orchestrator, keyed by execution id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OrchestratorMessage {
    /// An execution was created or changed state.
    Execution(Execution),
    /// A task run progressed.
    TaskResult(WorkerTaskResult),
    /// Out-of-band kill signal.
    Kill { execution_id: String },
    /// External resume of a paused task run.
    Resume {
        execution_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        task_run_id: Option<String>,
    },
}

impl OrchestratorMessage {
    /// The execution id the message is keyed by.
    pub fn execution_id(&self) -> &str {
        match self {
            OrchestratorMessage::Execution(execution) => &execution.id,
            OrchestratorMessage::TaskResult(result) => result.execution_id(),
            OrchestratorMessage::Kill { execution_id } => execution_id,
            OrchestratorMessage::Resume { execution_id, .. } => execution_id,
        }
    }
}

/// Emission side of the queue.
pub trait QueuePublisher: Send + Sync + 'static {
    /// Emit an orchestrator message.
    fn emit(
        &self,
        message: OrchestratorMessage,
    ) -> impl Future<Output = EngineResult<()>> + Send;

    /// Dispatch a worker job.
    fn emit_worker_job(&self, job: WorkerJob) -> impl Future<Output = EngineResult<()>> + Send;

    /// Signal that flow triggers should be evaluated for a terminated
    /// execution. Fired at most once per execution.
    fn emit_flow_trigger_evaluation(
        &self,
        execution: Execution,
    ) -> impl Future<Output = EngineResult<()>> + Send;
}
