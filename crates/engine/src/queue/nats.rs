//! NATS JetStream publisher for worker-job notifications.
//!
//! Multi-node deployments publish worker jobs over JetStream so worker pools
//! can subscribe from anywhere. The orchestrator message loop itself stays
//! on the repository lock for ordering; only the worker-job fan-out goes
//! through NATS.
//!
//! This is an optional component - single-node deployments use the
//! in-memory queue.

use async_nats::jetstream::{self, Context};
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};

use super::WorkerJob;

/// Default NATS subject for worker-job notifications.
pub const DEFAULT_SUBJECT: &str = "oxflow.jobs";

/// Default JetStream stream name.
pub const DEFAULT_STREAM: &str = "oxflow_jobs";

/// JetStream publisher for worker jobs.
#[derive(Clone)]
pub struct NatsJobPublisher {
    /// JetStream context.
    js: Context,

    /// Subject to publish to.
    subject: String,
}

impl NatsJobPublisher {
    /// Create a new publisher from an existing client.
    ///
    /// Ensures the JetStream stream exists before returning.
    pub async fn new(
        client: Arc<async_nats::Client>,
        subject: Option<&str>,
        stream_name: Option<&str>,
    ) -> EngineResult<Self> {
        let subject = subject.unwrap_or(DEFAULT_SUBJECT).to_string();
        let stream = stream_name.unwrap_or(DEFAULT_STREAM);

        let js = jetstream::new((*client).clone());

        Self::ensure_stream(&js, stream, &subject).await?;

        Ok(Self { js, subject })
    }

    /// Ensure the JetStream stream exists.
    async fn ensure_stream(js: &Context, stream: &str, subject: &str) -> EngineResult<()> {
        match js.get_stream(stream).await {
            Ok(_) => {
                tracing::debug!(stream = %stream, "Using existing NATS stream");
                Ok(())
            }
            Err(_) => {
                let config = jetstream::stream::Config {
                    name: stream.to_string(),
                    subjects: vec![subject.to_string()],
                    max_age: std::time::Duration::from_secs(3600),
                    storage: jetstream::stream::StorageType::File,
                    ..Default::default()
                };

                js.create_stream(config)
                    .await
                    .map_err(|e| EngineError::Queue(format!("JetStream error: {}", e)))?;

                tracing::info!(stream = %stream, subject = %subject, "Created NATS stream");
                Ok(())
            }
        }
    }

    /// Publish a worker-job notification.
    pub async fn publish_job(&self, job: &WorkerJob) -> EngineResult<()> {
        let payload = serde_json::to_vec(job)
            .map_err(|e| EngineError::Queue(format!("Serialization error: {}", e)))?;

        self.js
            .publish(self.subject.clone(), payload.into())
            .await
            .map_err(|e| EngineError::Queue(format!("Publish error: {}", e)))?
            .await
            .map_err(|e| EngineError::Queue(format!("Publish ack error: {}", e)))?;

        tracing::debug!(
            execution_id = %job.execution_id,
            task_run_id = %job.task_run.id,
            task_id = %job.task_run.task_id,
            "Published worker job"
        );

        Ok(())
    }
}
