//! In-memory collaborator implementations.
//!
//! A process-local mutex map satisfies the locking contract for single-node
//! deployments and tests.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::error::{EngineError, EngineResult};
use crate::execution::Execution;
use crate::flow::Flow;
use crate::orchestrator::DedupState;

use super::{ExecutionRepository, FlowRegistry, SubflowLink, SubflowTrackingStore};

type Entry = Arc<Mutex<(Execution, DedupState)>>;

/// Execution store keyed by a per-execution async mutex.
#[derive(Default, Clone)]
pub struct MemoryExecutionRepository {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
}

impl MemoryExecutionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExecutionRepository for MemoryExecutionRepository {
    async fn lock<F, T>(&self, execution_id: &str, f: F) -> EngineResult<T>
    where
        F: FnOnce(&mut Execution, &mut DedupState) -> EngineResult<T> + Send,
        T: Send,
    {
        let entry = self
            .entries
            .read()
            .await
            .get(execution_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("Execution '{}'", execution_id)))?;

        let mut guard = entry.lock().await;
        let (execution, dedup) = &mut *guard;
        f(execution, dedup)
    }

    async fn insert_if_absent(&self, execution: Execution) -> EngineResult<bool> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&execution.id) {
            return Ok(false);
        }
        entries.insert(
            execution.id.clone(),
            Arc::new(Mutex::new((execution, DedupState::default()))),
        );
        Ok(true)
    }

    async fn get(&self, execution_id: &str) -> EngineResult<Option<Execution>> {
        let entry = self.entries.read().await.get(execution_id).cloned();
        match entry {
            Some(entry) => Ok(Some(entry.lock().await.0.clone())),
            None => Ok(None),
        }
    }
}

/// In-memory subflow linkage, keyed by child execution id.
#[derive(Default, Clone)]
pub struct MemorySubflowStore {
    links: Arc<RwLock<HashMap<String, SubflowLink>>>,
}

impl MemorySubflowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SubflowTrackingStore for MemorySubflowStore {
    async fn save(&self, link: SubflowLink) -> EngineResult<()> {
        self.links
            .write()
            .await
            .insert(link.child_execution_id.clone(), link);
        Ok(())
    }

    async fn find_by_child(&self, child_execution_id: &str) -> EngineResult<Option<SubflowLink>> {
        Ok(self.links.read().await.get(child_execution_id).cloned())
    }

    async fn find_link(
        &self,
        parent_execution_id: &str,
        parent_task_run_id: &str,
        batch_index: Option<u32>,
    ) -> EngineResult<Option<SubflowLink>> {
        Ok(self
            .links
            .read()
            .await
            .values()
            .find(|link| {
                link.parent_execution_id == parent_execution_id
                    && link.parent_task_run_id == parent_task_run_id
                    && link.batch_index == batch_index
            })
            .cloned())
    }

    async fn list_by_parent(&self, parent_execution_id: &str) -> EngineResult<Vec<SubflowLink>> {
        Ok(self
            .links
            .read()
            .await
            .values()
            .filter(|link| link.parent_execution_id == parent_execution_id)
            .cloned()
            .collect())
    }

    async fn delete(&self, child_execution_id: &str) -> EngineResult<()> {
        self.links.write().await.remove(child_execution_id);
        Ok(())
    }
}

/// In-memory flow registry; registration validates the definition.
#[derive(Default, Clone)]
pub struct MemoryFlowRegistry {
    flows: Arc<std::sync::RwLock<HashMap<String, Arc<Flow>>>>,
}

impl MemoryFlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and store a flow revision.
    pub fn register(&self, flow: Flow) -> EngineResult<()> {
        flow.validate()?;
        let key = flow.uid();
        self.flows
            .write()
            .expect("flow registry lock poisoned")
            .insert(key, Arc::new(flow));
        Ok(())
    }
}

impl FlowRegistry for MemoryFlowRegistry {
    fn find_flow(
        &self,
        namespace: &str,
        flow_id: &str,
        revision: Option<u32>,
    ) -> Option<Arc<Flow>> {
        let flows = self.flows.read().expect("flow registry lock poisoned");
        match revision {
            Some(revision) => flows
                .get(&format!("{}/{}/{}", namespace, flow_id, revision))
                .cloned(),
            None => flows
                .values()
                .filter(|flow| flow.namespace == namespace && flow.id == flow_id)
                .max_by_key(|flow| flow.revision)
                .cloned(),
        }
    }
}
