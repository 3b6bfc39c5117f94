//! Storage collaborators.
//!
//! The engine never talks to a concrete storage backend; it consumes three
//! narrow interfaces: the execution repository (an atomic read-modify-write
//! keyed by execution id), the subflow-tracking store (durable linkage for
//! crash recovery), and the read-only flow registry. In-memory
//! implementations back tests and single-node deployments; a distributed
//! backend only has to honor "at most one concurrent resolver evaluation per
//! execution id".

mod memory;

pub use memory::{MemoryExecutionRepository, MemoryFlowRegistry, MemorySubflowStore};

use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::EngineResult;
use crate::execution::Execution;
use crate::flow::Flow;
use crate::orchestrator::DedupState;

/// Atomic read-modify-write over the (Execution, DedupState) pair.
///
/// The pair is the unit of mutual exclusion: `lock` must guarantee at most
/// one concurrent closure evaluation per execution id, and must persist the
/// mutated pair atomically before returning.
pub trait ExecutionRepository: Send + Sync + 'static {
    /// Run `f` under the exclusive per-execution lock.
    fn lock<F, T>(
        &self,
        execution_id: &str,
        f: F,
    ) -> impl Future<Output = EngineResult<T>> + Send
    where
        F: FnOnce(&mut Execution, &mut DedupState) -> EngineResult<T> + Send,
        T: Send;

    /// Store a new execution; returns false when the id already exists.
    fn insert_if_absent(
        &self,
        execution: Execution,
    ) -> impl Future<Output = EngineResult<bool>> + Send;

    /// Read a snapshot of an execution.
    fn get(
        &self,
        execution_id: &str,
    ) -> impl Future<Output = EngineResult<Option<Execution>>> + Send;
}

/// Durable linkage between a parent task run and a child execution.
///
/// Persisted before the child execution message is emitted, so a crash
/// between persist and emit can be recovered without creating a duplicate
/// child.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubflowLink {
    pub parent_execution_id: String,
    pub parent_task_run_id: String,
    pub child_execution_id: String,

    /// Batch index for ForEachItem children.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_index: Option<u32>,

    /// Total batch count for ForEachItem children.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_total: Option<u32>,

    pub wait: bool,
    pub transmit_failed: bool,

    /// Child outputs to extract into the parent task run outputs.
    #[serde(default)]
    pub outputs_spec: serde_json::Map<String, serde_json::Value>,
}

/// Durable map of pending subflow linkage.
pub trait SubflowTrackingStore: Send + Sync + 'static {
    fn save(&self, link: SubflowLink) -> impl Future<Output = EngineResult<()>> + Send;

    fn find_by_child(
        &self,
        child_execution_id: &str,
    ) -> impl Future<Output = EngineResult<Option<SubflowLink>>> + Send;

    /// Find an existing link for a (parent task run, batch) pair.
    fn find_link(
        &self,
        parent_execution_id: &str,
        parent_task_run_id: &str,
        batch_index: Option<u32>,
    ) -> impl Future<Output = EngineResult<Option<SubflowLink>>> + Send;

    fn list_by_parent(
        &self,
        parent_execution_id: &str,
    ) -> impl Future<Output = EngineResult<Vec<SubflowLink>>> + Send;

    fn delete(
        &self,
        child_execution_id: &str,
    ) -> impl Future<Output = EngineResult<()>> + Send;
}

/// Read-only flow lookup.
///
/// Definitions are refreshed out-of-band; the orchestrator only ever reads.
pub trait FlowRegistry: Send + Sync + 'static {
    /// Find a flow, pinned to a revision or the latest one.
    fn find_flow(&self, namespace: &str, flow_id: &str, revision: Option<u32>)
        -> Option<Arc<Flow>>;
}
