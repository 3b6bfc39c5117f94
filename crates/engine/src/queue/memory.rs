//! In-process queue over tokio channels, for tests and single-node
//! deployments.

use tokio::sync::mpsc;

use crate::error::{EngineError, EngineResult};
use crate::execution::Execution;

use super::{OrchestratorMessage, QueuePublisher, WorkerJob};

/// Publisher half of the in-memory queue.
#[derive(Clone)]
pub struct MemoryQueue {
    messages: mpsc::UnboundedSender<OrchestratorMessage>,
    worker_jobs: mpsc::UnboundedSender<WorkerJob>,
    flow_triggers: mpsc::UnboundedSender<Execution>,
}

/// Consumer half of the in-memory queue.
pub struct MemoryQueueReceiver {
    pub messages: mpsc::UnboundedReceiver<OrchestratorMessage>,
    pub worker_jobs: mpsc::UnboundedReceiver<WorkerJob>,
    pub flow_triggers: mpsc::UnboundedReceiver<Execution>,
}

/// Create a connected (publisher, receiver) pair.
pub fn memory_queue() -> (MemoryQueue, MemoryQueueReceiver) {
    let (messages_tx, messages_rx) = mpsc::unbounded_channel();
    let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
    let (triggers_tx, triggers_rx) = mpsc::unbounded_channel();

    (
        MemoryQueue {
            messages: messages_tx,
            worker_jobs: jobs_tx,
            flow_triggers: triggers_tx,
        },
        MemoryQueueReceiver {
            messages: messages_rx,
            worker_jobs: jobs_rx,
            flow_triggers: triggers_rx,
        },
    )
}

impl QueuePublisher for MemoryQueue {
    async fn emit(&self, message: OrchestratorMessage) -> EngineResult<()> {
        self.messages
            .send(message)
            .map_err(|e| EngineError::Queue(format!("Message channel closed: {}", e)))
    }

    async fn emit_worker_job(&self, job: WorkerJob) -> EngineResult<()> {
        self.worker_jobs
            .send(job)
            .map_err(|e| EngineError::Queue(format!("Worker job channel closed: {}", e)))
    }

    async fn emit_flow_trigger_evaluation(&self, execution: Execution) -> EngineResult<()> {
        self.flow_triggers
            .send(execution)
            .map_err(|e| EngineError::Queue(format!("Flow trigger channel closed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_and_receive() {
        let (queue, mut receiver) = memory_queue();
        let execution = Execution::new("demo", "flow", 1, serde_json::Map::new());
        let id = execution.id.clone();

        queue
            .emit(OrchestratorMessage::Execution(execution))
            .await
            .unwrap();

        let message = receiver.messages.recv().await.unwrap();
        assert_eq!(message.execution_id(), id);
    }

    #[tokio::test]
    async fn test_emit_fails_when_receiver_dropped() {
        let (queue, receiver) = memory_queue();
        drop(receiver);

        let execution = Execution::new("demo", "flow", 1, serde_json::Map::new());
        let result = queue.emit(OrchestratorMessage::Execution(execution)).await;
        assert!(result.is_err());
    }
}
