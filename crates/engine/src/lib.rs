//! Oxflow Engine
//!
//! The execution core of the Oxflow workflow orchestrator:
//!
//! - **Flow definitions**: declarative task trees (sequential, parallel,
//!   DAG, switch/if, for-each, wait-for, pause, allow-failure, subflows)
//! - **Flow-control resolution**: per-variant logic computing next child
//!   task runs and aggregate states
//! - **Orchestration loop**: single-writer-per-execution event processing,
//!   idempotent under at-least-once delivery
//! - **Subflow coordination**: child executions with output extraction,
//!   failure propagation and item batching
//!
//! ## Architecture
//!
//! Executions are driven forward exclusively by the orchestrator, one
//! event-processing transaction at a time under a per-execution lock. All
//! side effects (new task runs, worker jobs, subflow creations, the
//! flow-trigger evaluation) are deduplicated against per-execution state
//! persisted together with the execution, so duplicate queue deliveries are
//! harmless. Storage, queueing and flow lookup are narrow collaborator
//! traits with in-memory implementations.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use oxflow_engine::config::OrchestratorConfig;
//! use oxflow_engine::execution::Execution;
//! use oxflow_engine::flow::Flow;
//! use oxflow_engine::orchestrator::ExecutionOrchestrator;
//! use oxflow_engine::queue::{memory_queue, OrchestratorMessage};
//! use oxflow_engine::repository::{
//!     MemoryExecutionRepository, MemoryFlowRegistry, MemorySubflowStore,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let registry = Arc::new(MemoryFlowRegistry::new());
//!     registry.register(Flow::from_yaml(include_str!("../flow.yaml"))?)?;
//!
//!     let (queue, receiver) = memory_queue();
//!     let orchestrator = ExecutionOrchestrator::new(
//!         Arc::new(MemoryExecutionRepository::new()),
//!         Arc::new(queue.clone()),
//!         Arc::new(MemorySubflowStore::new()),
//!         registry,
//!         OrchestratorConfig::from_env()?,
//!     );
//!
//!     let execution = Execution::new("demo", "my-flow", 1, Default::default());
//!     queue.emit(OrchestratorMessage::Execution(execution)).await?;
//!     orchestrator.run(receiver.messages).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod execution;
pub mod flow;
pub mod orchestrator;
pub mod queue;
pub mod repository;
pub mod resolver;
pub mod subflow;
pub mod telemetry;
pub mod template;

pub use error::{EngineError, EngineResult};
