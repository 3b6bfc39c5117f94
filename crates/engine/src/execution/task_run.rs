//! Task runs and their ephemeral resolution bindings.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::flow::Task;

use super::state::{State, StateType};
use super::Execution;

/// Runtime record of a single task instance within an execution.
///
/// Loop/each iterations produce one task run per (task, value, iteration)
/// combination. A task run is immutable once terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRun {
    pub id: String,
    pub execution_id: String,
    pub task_id: String,

    /// Tree edge: the task run of the owning composite task, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_task_run_id: Option<String>,

    /// Iteration value for each/loop variants.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    /// Loop iteration number for WaitFor re-runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,

    pub state: State,

    #[serde(default)]
    pub outputs: serde_json::Map<String, serde_json::Value>,

    /// Attempt counter, incremented by worker retries.
    #[serde(default)]
    pub attempt: u32,
}

impl TaskRun {
    /// Clone with a state transition appended.
    pub fn with_state(&self, state: StateType) -> TaskRun {
        let mut run = self.clone();
        run.state = self.state.with_state(state);
        run
    }

    /// Clone with outputs merged in.
    pub fn with_outputs(&self, outputs: serde_json::Map<String, serde_json::Value>) -> TaskRun {
        let mut run = self.clone();
        for (k, v) in outputs {
            run.outputs.insert(k, v);
        }
        run
    }

    /// Short form used in log lines.
    pub fn to_string_state(&self) -> String {
        format!(
            "TaskRun(id={}, taskId={}, value={:?}, state={})",
            self.id, self.task_id, self.value, self.state.current
        )
    }
}

/// A declared task bound to a parent/iteration context.
///
/// Recomputed on demand by the resolver; never persisted.
#[derive(Debug, Clone)]
pub struct ResolvedTask<'a> {
    pub task: &'a Task,
    pub value: Option<String>,
    pub iteration: Option<u32>,
    pub parent_task_run_id: Option<String>,
}

impl<'a> ResolvedTask<'a> {
    pub fn new(task: &'a Task, parent: Option<&TaskRun>) -> Self {
        Self {
            task,
            value: None,
            iteration: None,
            parent_task_run_id: parent.map(|p| p.id.clone()),
        }
    }

    pub fn with_value(mut self, value: String) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_iteration(mut self, iteration: u32) -> Self {
        self.iteration = Some(iteration);
        self
    }

    /// Whether the given task run was created from this binding.
    pub fn matches(&self, task_run: &TaskRun, parent: Option<&TaskRun>) -> bool {
        self.task.id == task_run.task_id
            && (parent.is_none()
                || parent.map(|p| p.id.as_str()) == task_run.parent_task_run_id.as_deref())
            && (self.value.is_none() || self.value == task_run.value)
            && (self.iteration.is_none() || self.iteration == task_run.iteration)
    }

    /// Propose a new task run for this binding.
    pub fn to_next_task_run(&self, execution: &Execution) -> NextTaskRun<'a> {
        NextTaskRun {
            task: self.task,
            task_run: TaskRun {
                id: Uuid::new_v4().to_string(),
                execution_id: execution.id.clone(),
                task_id: self.task.id.clone(),
                parent_task_run_id: self.parent_task_run_id.clone(),
                value: self.value.clone(),
                iteration: self.iteration,
                state: State::new(StateType::Created),
                outputs: serde_json::Map::new(),
                attempt: 0,
            },
        }
    }
}

/// A proposed, not-yet-persisted task run paired with its declared task.
#[derive(Debug, Clone)]
pub struct NextTaskRun<'a> {
    pub task: &'a Task,
    pub task_run: TaskRun,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{Task, TaskKind, WorkerSpec};

    fn worker_task(id: &str) -> Task {
        Task {
            id: id.to_string(),
            kind: TaskKind::Worker(WorkerSpec::default()),
        }
    }

    fn empty_execution() -> Execution {
        Execution::new("demo", "flow", 1, serde_json::Map::new())
    }

    #[test]
    fn test_to_next_task_run_inherits_context() {
        let task = worker_task("t1");
        let execution = empty_execution();
        let parent = TaskRun {
            id: "parent-run".to_string(),
            execution_id: execution.id.clone(),
            task_id: "each".to_string(),
            parent_task_run_id: None,
            value: None,
            iteration: None,
            state: State::new(StateType::Running),
            outputs: serde_json::Map::new(),
            attempt: 0,
        };

        let resolved = ResolvedTask::new(&task, Some(&parent)).with_value("a".to_string());
        let next = resolved.to_next_task_run(&execution);

        assert_eq!(next.task_run.task_id, "t1");
        assert_eq!(next.task_run.parent_task_run_id.as_deref(), Some("parent-run"));
        assert_eq!(next.task_run.value.as_deref(), Some("a"));
        assert_eq!(next.task_run.state.current, StateType::Created);
    }

    #[test]
    fn test_matches_is_value_aware() {
        let task = worker_task("t1");
        let execution = empty_execution();
        let resolved_a = ResolvedTask::new(&task, None).with_value("a".to_string());
        let resolved_b = ResolvedTask::new(&task, None).with_value("b".to_string());

        let run_a = resolved_a.to_next_task_run(&execution).task_run;

        assert!(resolved_a.matches(&run_a, None));
        assert!(!resolved_b.matches(&run_a, None));
    }
}
