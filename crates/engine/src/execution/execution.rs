//! The execution aggregate and its query helpers.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};

use super::state::{State, StateType};
use super::task_run::{ResolvedTask, TaskRun};

/// One running instance of a flow definition.
///
/// Mutated only by the orchestrator, under the per-execution lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub namespace: String,
    pub flow_id: String,
    pub flow_revision: u32,
    pub state: State,

    #[serde(default)]
    pub task_runs: Vec<TaskRun>,

    #[serde(default)]
    pub inputs: serde_json::Map<String, serde_json::Value>,

    #[serde(default)]
    pub labels: HashMap<String, String>,

    #[serde(default)]
    pub variables: serde_json::Map<String, serde_json::Value>,

    /// Set when this execution was created by a subflow task.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_execution_id: Option<String>,

    /// Diagnostic captured when the orchestrator converts the execution to
    /// FAILED after a resolution error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Execution {
    /// Create a new execution in CREATED state.
    pub fn new(
        namespace: &str,
        flow_id: &str,
        flow_revision: u32,
        inputs: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            namespace: namespace.to_string(),
            flow_id: flow_id.to_string(),
            flow_revision,
            state: State::new(StateType::Created),
            task_runs: Vec::new(),
            inputs,
            labels: HashMap::new(),
            variables: serde_json::Map::new(),
            parent_execution_id: None,
            error: None,
        }
    }

    pub fn find_task_run(&self, task_run_id: &str) -> Option<&TaskRun> {
        self.task_runs.iter().find(|t| t.id == task_run_id)
    }

    pub fn find_task_run_mut(&mut self, task_run_id: &str) -> Option<&mut TaskRun> {
        self.task_runs.iter_mut().find(|t| t.id == task_run_id)
    }

    /// Append a task run, enforcing id uniqueness and parent existence.
    pub fn add_task_run(&mut self, task_run: TaskRun) -> EngineResult<()> {
        if self.find_task_run(&task_run.id).is_some() {
            return Err(EngineError::Internal(format!(
                "Duplicate task run id '{}' on execution '{}'",
                task_run.id, self.id
            )));
        }
        if let Some(parent_id) = &task_run.parent_task_run_id {
            if self.find_task_run(parent_id).is_none() {
                return Err(EngineError::Internal(format!(
                    "Task run '{}' references unknown parent '{}'",
                    task_run.id, parent_id
                )));
            }
        }
        self.task_runs.push(task_run);
        Ok(())
    }

    /// Replace an existing task run with an updated copy.
    pub fn update_task_run(&mut self, task_run: TaskRun) -> EngineResult<()> {
        match self.task_runs.iter_mut().find(|t| t.id == task_run.id) {
            Some(existing) => {
                *existing = task_run;
                Ok(())
            }
            None => Err(EngineError::NotFound(format!(
                "Task run '{}' on execution '{}'",
                task_run.id, self.id
            ))),
        }
    }

    /// Transition the execution state.
    pub fn transition(&mut self, state: StateType) {
        self.state = self.state.with_state(state);
    }

    /// Task runs created from the given resolved tasks, in execution order.
    pub fn find_task_runs_for<'e>(
        &'e self,
        tasks: &[ResolvedTask<'_>],
        parent: Option<&TaskRun>,
    ) -> Vec<&'e TaskRun> {
        self.task_runs
            .iter()
            .filter(|run| tasks.iter().any(|t| t.matches(run, parent)))
            .collect()
    }

    pub fn has_created_for(&self, tasks: &[ResolvedTask<'_>], parent: Option<&TaskRun>) -> bool {
        self.find_task_runs_for(tasks, parent)
            .iter()
            .any(|run| run.state.current.is_created())
    }

    pub fn has_running_for(&self, tasks: &[ResolvedTask<'_>], parent: Option<&TaskRun>) -> bool {
        self.find_task_runs_for(tasks, parent)
            .iter()
            .any(|run| run.state.current.is_running())
    }

    pub fn has_failed_for(&self, tasks: &[ResolvedTask<'_>], parent: Option<&TaskRun>) -> bool {
        self.find_task_runs_for(tasks, parent)
            .iter()
            .any(|run| run.state.is_failed())
    }

    pub fn has_warning_for(&self, tasks: &[ResolvedTask<'_>], parent: Option<&TaskRun>) -> bool {
        self.find_task_runs_for(tasks, parent)
            .iter()
            .any(|run| run.state.current == StateType::Warning)
    }

    /// Whether every resolved task has a terminal run.
    pub fn is_terminated_for(&self, tasks: &[ResolvedTask<'_>], parent: Option<&TaskRun>) -> bool {
        let terminated = self
            .find_task_runs_for(tasks, parent)
            .iter()
            .filter(|run| run.state.is_terminated())
            .count();
        terminated == tasks.len()
    }

    /// Select the branch to resolve: the nominal tasks, or the error branch
    /// once an error run exists or a nominal child has failed.
    pub fn find_task_depending_flow_state<'a>(
        &self,
        tasks: Vec<ResolvedTask<'a>>,
        errors: Vec<ResolvedTask<'a>>,
        parent: Option<&TaskRun>,
    ) -> Vec<ResolvedTask<'a>> {
        let error_branch_started = !self.find_task_runs_for(&errors, parent).is_empty();
        if error_branch_started || self.has_failed_for(&tasks, parent) {
            errors
        } else {
            tasks
        }
    }

    /// Aggregate a final state from the terminal runs of the given tasks.
    ///
    /// KILLED dominates, then FAILED, then WARNING, then PAUSED; all-success
    /// yields SUCCESS. With `allow_failure`, a failed aggregation is softened
    /// to WARNING.
    pub fn guess_final_state(
        &self,
        tasks: &[ResolvedTask<'_>],
        parent: Option<&TaskRun>,
        allow_failure: bool,
    ) -> StateType {
        let runs = self.find_task_runs_for(tasks, parent);

        let state = if runs.iter().any(|r| r.state.current == StateType::Killed) {
            StateType::Killed
        } else if runs.iter().any(|r| r.state.current == StateType::Failed) {
            StateType::Failed
        } else if runs.iter().any(|r| r.state.current == StateType::Warning) {
            StateType::Warning
        } else if runs.iter().any(|r| r.state.current == StateType::Paused) {
            StateType::Paused
        } else {
            StateType::Success
        };

        if allow_failure && state.is_failed() {
            StateType::Warning
        } else {
            state
        }
    }

    /// All transitive descendants of the given task run.
    pub fn descendants(&self, parent_task_run_id: &str) -> Vec<&TaskRun> {
        let mut result = Vec::new();
        let mut frontier = vec![parent_task_run_id.to_string()];
        while let Some(current) = frontier.pop() {
            for run in &self.task_runs {
                if run.parent_task_run_id.as_deref() == Some(current.as_str()) {
                    result.push(run);
                    frontier.push(run.id.clone());
                }
            }
        }
        result
    }

    /// Whether any descendant of the given task run is non-terminal.
    pub fn has_non_terminal_descendant(&self, parent_task_run_id: &str) -> bool {
        self.descendants(parent_task_run_id)
            .iter()
            .any(|run| !run.state.is_terminated())
    }

    /// Whether any task run of the execution is non-terminal.
    pub fn has_non_terminal_task_run(&self) -> bool {
        self.task_runs.iter().any(|run| !run.state.is_terminated())
    }
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

    fn run_for(execution: &Execution, task: &Task, state: StateType) -> TaskRun {
        let mut run = ResolvedTask::new(task, None)
            .to_next_task_run(execution)
            .task_run;
        run.state = State::new(StateType::Created).with_state(state);
        run
    }

    #[test]
    fn test_add_task_run_rejects_unknown_parent() {
        let mut execution = Execution::new("demo", "flow", 1, serde_json::Map::new());
        let task = worker_task("a");
        let mut run = run_for(&execution, &task, StateType::Created);
        run.parent_task_run_id = Some("missing".to_string());

        assert!(execution.add_task_run(run).is_err());
    }

    #[test]
    fn test_guess_final_state_priorities() {
        let mut execution = Execution::new("demo", "flow", 1, serde_json::Map::new());
        let a = worker_task("a");
        let b = worker_task("b");
        execution
            .add_task_run(run_for(&execution, &a, StateType::Success))
            .unwrap();
        execution
            .add_task_run(run_for(&execution, &b, StateType::Failed))
            .unwrap();

        let resolved = vec![ResolvedTask::new(&a, None), ResolvedTask::new(&b, None)];
        assert_eq!(
            execution.guess_final_state(&resolved, None, false),
            StateType::Failed
        );
        assert_eq!(
            execution.guess_final_state(&resolved, None, true),
            StateType::Warning
        );
    }

    #[test]
    fn test_error_branch_selection() {
        let mut execution = Execution::new("demo", "flow", 1, serde_json::Map::new());
        let a = worker_task("a");
        let rescue = worker_task("rescue");
        execution
            .add_task_run(run_for(&execution, &a, StateType::Failed))
            .unwrap();

        let tasks = vec![ResolvedTask::new(&a, None)];
        let errors = vec![ResolvedTask::new(&rescue, None)];
        let current = execution.find_task_depending_flow_state(tasks, errors, None);

        assert_eq!(current.len(), 1);
        assert_eq!(current[0].task.id, "rescue");
    }

    #[test]
    fn test_is_terminated_for_requires_all_runs() {
        let mut execution = Execution::new("demo", "flow", 1, serde_json::Map::new());
        let a = worker_task("a");
        let b = worker_task("b");
        execution
            .add_task_run(run_for(&execution, &a, StateType::Success))
            .unwrap();

        let resolved = vec![ResolvedTask::new(&a, None), ResolvedTask::new(&b, None)];
        assert!(!execution.is_terminated_for(&resolved, None));
    }

    #[test]
    fn test_descendants_are_transitive() {
        let mut execution = Execution::new("demo", "flow", 1, serde_json::Map::new());
        let root = worker_task("root");
        let child = worker_task("child");
        let grandchild = worker_task("grandchild");

        let root_run = run_for(&execution, &root, StateType::Running);
        let root_id = root_run.id.clone();
        execution.add_task_run(root_run).unwrap();

        let mut child_run = run_for(&execution, &child, StateType::Running);
        child_run.parent_task_run_id = Some(root_id.clone());
        let child_id = child_run.id.clone();
        execution.add_task_run(child_run).unwrap();

        let mut grandchild_run = run_for(&execution, &grandchild, StateType::Created);
        grandchild_run.parent_task_run_id = Some(child_id);
        execution.add_task_run(grandchild_run).unwrap();

        assert_eq!(execution.descendants(&root_id).len(), 2);
        assert!(execution.has_non_terminal_descendant(&root_id));
    }
}
