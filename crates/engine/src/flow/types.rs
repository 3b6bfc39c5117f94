//! Flow and task type definitions.
//!
//! Tasks form a closed tagged-variant type: one enum variant per composite
//! flow-control construct plus the `worker` leaf dispatched to workers. Each
//! variant carries its own spec struct; control-flow semantics live in the
//! resolver, not here.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

use super::dag::validate_dag;

/// Complete workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub namespace: String,
    pub id: String,

    #[serde(default = "default_revision")]
    pub revision: u32,

    #[serde(default)]
    pub labels: HashMap<String, String>,

    /// Default input values, overridable per execution.
    #[serde(default)]
    pub inputs: serde_json::Map<String, serde_json::Value>,

    /// Flow-scoped variables available to templates.
    #[serde(default)]
    pub variables: serde_json::Map<String, serde_json::Value>,

    /// Root task list, resolved sequentially.
    pub tasks: Vec<Task>,

    /// Error branch started when a root task fails.
    #[serde(default)]
    pub errors: Vec<Task>,

    /// Tasks resolved sequentially once the execution reaches a terminal
    /// state.
    #[serde(default)]
    pub listeners: Vec<Task>,
}

fn default_revision() -> u32 {
    1
}

impl Flow {
    /// Parse a flow from its YAML source.
    pub fn from_yaml(source: &str) -> EngineResult<Flow> {
        let flow: Flow = serde_yaml::from_str(source)?;
        flow.validate()?;
        Ok(flow)
    }

    /// `namespace/id/revision` identifier.
    pub fn uid(&self) -> String {
        format!("{}/{}/{}", self.namespace, self.id, self.revision)
    }

    /// Find a task anywhere in the tree by id.
    pub fn find_task(&self, task_id: &str) -> Option<&Task> {
        let mut stack: Vec<&Task> = self
            .tasks
            .iter()
            .chain(self.errors.iter())
            .chain(self.listeners.iter())
            .collect();
        while let Some(task) = stack.pop() {
            if task.id == task_id {
                return Some(task);
            }
            stack.extend(task.all_children());
        }
        None
    }

    /// Structural validation, run at registration time and defensively
    /// before an execution starts.
    ///
    /// Checks: non-empty root, unique task ids, per-variant branch
    /// constraints, DAG dependency integrity.
    pub fn validate(&self) -> EngineResult<()> {
        if self.tasks.is_empty() {
            return Err(EngineError::Validation(format!(
                "Flow '{}' has no tasks",
                self.uid()
            )));
        }

        let mut seen: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&Task> = self
            .tasks
            .iter()
            .chain(self.errors.iter())
            .chain(self.listeners.iter())
            .collect();

        while let Some(task) = stack.pop() {
            if !seen.insert(task.id.as_str()) {
                return Err(EngineError::Validation(format!(
                    "Duplicate task id '{}' on flow '{}'",
                    task.id,
                    self.uid()
                )));
            }
            task.validate()?;
            stack.extend(task.all_children());
        }

        Ok(())
    }
}

/// A declared task: an id plus its variant-specific spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,

    #[serde(flatten)]
    pub kind: TaskKind,
}

/// Closed set of task variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    /// Leaf task dispatched to a worker.
    Worker(WorkerSpec),
    /// Children run one at a time, in declared order.
    Sequential(SequentialSpec),
    /// Children run concurrently, optionally bounded.
    Parallel(ParallelSpec),
    /// Children ordered by explicit `depends_on` edges.
    Dag(DagSpec),
    /// One branch selected by a rendered value.
    Switch(SwitchSpec),
    /// Then/else branch selected by a rendered condition.
    If(IfSpec),
    /// One isolated child set per rendered list item.
    ForEach(ForEachSpec),
    /// Re-run children until a condition holds.
    WaitFor(WaitForSpec),
    /// Hold the execution until resumed or a delay elapses.
    Pause(PauseSpec),
    /// Sequential whose failure is softened to WARNING.
    AllowFailure(AllowFailureSpec),
    /// Launch a child execution of another flow.
    Subflow(SubflowSpec),
    /// Launch one child execution per item batch.
    ForEachItem(ForEachItemSpec),
}

/// Worker task configuration, opaque to the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerSpec {
    /// Worker group routing hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_group: Option<String>,

    /// Task-specific configuration forwarded to the worker.
    #[serde(flatten)]
    pub config: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequentialSpec {
    pub tasks: Vec<Task>,

    #[serde(default)]
    pub errors: Vec<Task>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelSpec {
    pub tasks: Vec<Task>,

    /// Maximum concurrently running children; 0 means unlimited.
    #[serde(default)]
    pub concurrency_limit: usize,

    #[serde(default)]
    pub errors: Vec<Task>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagSpec {
    pub tasks: Vec<DagEntry>,

    /// Maximum concurrently running children; 0 means unlimited.
    #[serde(default)]
    pub concurrency_limit: usize,

    #[serde(default)]
    pub errors: Vec<Task>,
}

/// One DAG node: a task plus the sibling ids it depends on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagEntry {
    pub task: Task,

    #[serde(default)]
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchSpec {
    /// Expression rendered once per owning task run.
    pub value: String,

    pub cases: HashMap<String, Vec<Task>>,

    #[serde(default)]
    pub defaults: Vec<Task>,

    #[serde(default)]
    pub errors: Vec<Task>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IfSpec {
    /// Condition rendered once per owning task run.
    pub condition: String,

    pub then: Vec<Task>,

    #[serde(default, rename = "else")]
    pub r#else: Vec<Task>,

    #[serde(default)]
    pub errors: Vec<Task>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForEachSpec {
    /// A literal list, or an expression rendering to a JSON list.
    pub values: serde_json::Value,

    pub tasks: Vec<Task>,

    /// Maximum simultaneously active iterations; 1 degenerates to strict
    /// sequential across iterations, 0 means unlimited.
    #[serde(default = "default_foreach_concurrency")]
    pub concurrency_limit: usize,

    #[serde(default)]
    pub errors: Vec<Task>,
}

fn default_foreach_concurrency() -> usize {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitForSpec {
    /// Condition evaluated after each full run of the children.
    pub condition: String,

    pub tasks: Vec<Task>,

    #[serde(default)]
    pub max_iterations: Option<u32>,

    #[serde(default)]
    pub max_duration_seconds: Option<f64>,

    /// End FAILED once a limit is reached.
    #[serde(default)]
    pub fail_on_max_reached: bool,

    #[serde(default)]
    pub errors: Vec<Task>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PauseSpec {
    /// Auto-resume after this many seconds.
    #[serde(default)]
    pub delay_seconds: Option<f64>,

    /// Fail if not resumed within this many seconds.
    #[serde(default)]
    pub timeout_seconds: Option<f64>,

    /// Legacy nested tasks, resolved sequentially after the resume.
    #[serde(default)]
    pub tasks: Vec<Task>,

    #[serde(default)]
    pub errors: Vec<Task>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowFailureSpec {
    pub tasks: Vec<Task>,

    #[serde(default)]
    pub errors: Vec<Task>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubflowSpec {
    pub namespace: String,
    pub flow_id: String,

    /// Pin a flow revision; latest when unset.
    #[serde(default)]
    pub revision: Option<u32>,

    /// Child inputs, rendered against the parent context.
    #[serde(default)]
    pub inputs: serde_json::Map<String, serde_json::Value>,

    /// Keep the owning task run open until the child terminates.
    #[serde(default)]
    pub wait: bool,

    /// Propagate child failure/kill into the owning task run.
    #[serde(default)]
    pub transmit_failed: bool,

    /// Copy the parent execution labels onto the child.
    #[serde(default)]
    pub inherit_labels: bool,

    /// Child outputs to extract into the owning task run outputs,
    /// rendered against the child outputs context.
    #[serde(default)]
    pub outputs: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForEachItemSpec {
    /// Expression rendering to the item list to split.
    pub items: String,

    #[serde(default)]
    pub batch: BatchSpec,

    pub namespace: String,
    pub flow_id: String,

    #[serde(default)]
    pub revision: Option<u32>,

    #[serde(default)]
    pub inputs: serde_json::Map<String, serde_json::Value>,

    #[serde(default = "default_true")]
    pub wait: bool,

    #[serde(default)]
    pub transmit_failed: bool,

    #[serde(default)]
    pub inherit_labels: bool,
}

fn default_true() -> bool {
    true
}

/// How to split items into child executions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSpec {
    /// Items per batch.
    #[serde(default = "default_batch_rows")]
    pub rows: usize,

    /// Serialized-size cap per batch, overrides `rows` when set.
    #[serde(default)]
    pub bytes: Option<usize>,

    /// Fixed number of batches, overrides `rows`/`bytes` when set.
    #[serde(default)]
    pub partitions: Option<usize>,
}

fn default_batch_rows() -> usize {
    1
}

impl Default for BatchSpec {
    fn default() -> Self {
        Self {
            rows: default_batch_rows(),
            bytes: None,
            partitions: None,
        }
    }
}

impl Task {
    /// Whether the task is a composite whose children the resolver drives.
    pub fn is_flowable(&self) -> bool {
        !matches!(
            self.kind,
            TaskKind::Worker(_) | TaskKind::Subflow(_) | TaskKind::ForEachItem(_)
        )
    }

    /// Whether the task creates child executions.
    pub fn is_executable(&self) -> bool {
        matches!(self.kind, TaskKind::Subflow(_) | TaskKind::ForEachItem(_))
    }

    pub fn is_worker(&self) -> bool {
        matches!(self.kind, TaskKind::Worker(_))
    }

    /// The variant's error branch.
    pub fn errors(&self) -> &[Task] {
        match &self.kind {
            TaskKind::Sequential(s) => &s.errors,
            TaskKind::Parallel(s) => &s.errors,
            TaskKind::Dag(s) => &s.errors,
            TaskKind::Switch(s) => &s.errors,
            TaskKind::If(s) => &s.errors,
            TaskKind::ForEach(s) => &s.errors,
            TaskKind::WaitFor(s) => &s.errors,
            TaskKind::Pause(s) => &s.errors,
            TaskKind::AllowFailure(s) => &s.errors,
            TaskKind::Worker(_) | TaskKind::Subflow(_) | TaskKind::ForEachItem(_) => &[],
        }
    }

    /// Every declared child across all branches.
    pub fn all_children(&self) -> Vec<&Task> {
        let mut children: Vec<&Task> = match &self.kind {
            TaskKind::Sequential(s) => s.tasks.iter().collect(),
            TaskKind::Parallel(s) => s.tasks.iter().collect(),
            TaskKind::Dag(s) => s.tasks.iter().map(|e| &e.task).collect(),
            TaskKind::Switch(s) => s
                .cases
                .values()
                .flatten()
                .chain(s.defaults.iter())
                .collect(),
            TaskKind::If(s) => s.then.iter().chain(s.r#else.iter()).collect(),
            TaskKind::ForEach(s) => s.tasks.iter().collect(),
            TaskKind::WaitFor(s) => s.tasks.iter().collect(),
            TaskKind::Pause(s) => s.tasks.iter().collect(),
            TaskKind::AllowFailure(s) => s.tasks.iter().collect(),
            TaskKind::Worker(_) | TaskKind::Subflow(_) | TaskKind::ForEachItem(_) => Vec::new(),
        };
        children.extend(self.errors().iter());
        children
    }

    /// Per-variant structural constraints.
    pub fn validate(&self) -> EngineResult<()> {
        match &self.kind {
            TaskKind::Sequential(s) if s.tasks.is_empty() => Err(empty_tasks(&self.id)),
            TaskKind::Parallel(s) if s.tasks.is_empty() => Err(empty_tasks(&self.id)),
            TaskKind::ForEach(s) if s.tasks.is_empty() => Err(empty_tasks(&self.id)),
            TaskKind::WaitFor(s) if s.tasks.is_empty() => Err(empty_tasks(&self.id)),
            TaskKind::AllowFailure(s) if s.tasks.is_empty() => Err(empty_tasks(&self.id)),
            TaskKind::If(s) if s.then.is_empty() => Err(EngineError::Validation(format!(
                "Task '{}' has an empty 'then' branch",
                self.id
            ))),
            TaskKind::Switch(s) if s.cases.is_empty() && s.defaults.is_empty() => {
                Err(EngineError::Validation(format!(
                    "Task '{}' has an empty branch set",
                    self.id
                )))
            }
            TaskKind::Dag(s) => validate_dag(&self.id, &s.tasks),
            _ => Ok(()),
        }
    }
}

fn empty_tasks(task_id: &str) -> EngineError {
    EngineError::Validation(format!("Task '{}' has no child tasks", task_id))
}
