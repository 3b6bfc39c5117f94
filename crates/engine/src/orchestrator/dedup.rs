//! Per-execution side-effect deduplication.
//!
//! Co-located with the execution under the same lock, so recording an
//! emission and persisting the execution are one atomic step. This is what
//! makes the orchestrator correct under at-least-once delivery.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::execution::{StateType, TaskRun};

/// Deduplication state for one execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DedupState {
    /// Child dedup key -> task run id of the first honored proposal.
    #[serde(default)]
    pub child_dedup: HashMap<String, String>,

    /// Task run id -> last emitted state for worker-job dispatch.
    #[serde(default)]
    pub worker_dedup: HashMap<String, StateType>,

    /// One-shot flow-trigger evaluation flag.
    #[serde(default)]
    pub flow_trigger_fired: bool,
}

impl DedupState {
    /// Key identifying one proposed child: parent, task, iteration context.
    pub fn child_key(task_run: &TaskRun) -> String {
        format!(
            "{}-{}-{}-{}",
            task_run.parent_task_run_id.as_deref().unwrap_or("root"),
            task_run.task_id,
            task_run.value.as_deref().unwrap_or(""),
            task_run
                .iteration
                .map(|i| i.to_string())
                .unwrap_or_default()
        )
    }

    /// Record a next-task-run proposal; true when it is the first for its
    /// key and should be honored.
    pub fn deduplicate_next(&mut self, task_run: &TaskRun) -> bool {
        let key = Self::child_key(task_run);
        if self.child_dedup.contains_key(&key) {
            tracing::trace!(
                task_run_id = %task_run.id,
                key = %key,
                "Duplicate next task run suppressed"
            );
            false
        } else {
            self.child_dedup.insert(key, task_run.id.clone());
            true
        }
    }

    /// Record a worker-job emission; identical repeats are suppressed,
    /// genuine state transitions re-emitted.
    pub fn deduplicate_worker_job(&mut self, task_run: &TaskRun) -> bool {
        match self.worker_dedup.get(&task_run.id) {
            Some(state) if *state == task_run.state.current => {
                tracing::trace!(
                    task_run_id = %task_run.id,
                    state = %task_run.state.current,
                    "Duplicate worker job suppressed"
                );
                false
            }
            _ => {
                self.worker_dedup
                    .insert(task_run.id.clone(), task_run.state.current);
                true
            }
        }
    }

    /// Set the one-shot flow-trigger flag; true on the first call only.
    pub fn fire_flow_trigger(&mut self) -> bool {
        if self.flow_trigger_fired {
            false
        } else {
            self.flow_trigger_fired = true;
            true
        }
    }
}
