//! Per-variant flow-control resolution.
//!
//! Each composite task variant answers three questions against the current
//! execution: which child tasks exist in this context (`child_tasks`), which
//! task runs should start now (`resolve_nexts`), and what the aggregate
//! state is (`resolve_state`, `None` while still running). Dispatch is a
//! plain match over the closed [`TaskKind`] enum; shared algorithms live in
//! [`flow_control`].

mod context;
pub mod flow_control;

pub use context::RunContext;

use chrono::Utc;

use crate::error::{EngineError, EngineResult};
use crate::execution::{NextTaskRun, ResolvedTask, StateType, TaskRun};
use crate::flow::{IfSpec, SwitchSpec, Task, TaskKind, WaitForSpec};

use flow_control::{
    resolve_concurrent_nexts, resolve_dag_nexts, resolve_each_tasks, resolve_parallel_nexts,
    resolve_sequential_nexts, resolve_tasks,
};

/// Child tasks of a composite, bound to the owning task run.
///
/// Branching variants (Switch/If) return only the chosen branch; ForEach
/// returns one task set per iteration value; WaitFor returns the children of
/// the current iteration.
pub fn child_tasks<'a>(
    task: &'a Task,
    ctx: &RunContext<'_>,
    parent: &TaskRun,
) -> EngineResult<Vec<ResolvedTask<'a>>> {
    match &task.kind {
        TaskKind::Sequential(spec) => Ok(resolve_tasks(&spec.tasks, Some(parent))),
        TaskKind::Parallel(spec) => Ok(resolve_tasks(&spec.tasks, Some(parent))),
        TaskKind::Dag(spec) => Ok(spec
            .tasks
            .iter()
            .map(|entry| ResolvedTask::new(&entry.task, Some(parent)))
            .collect()),
        TaskKind::Switch(spec) => switch_branch(spec, ctx, parent),
        TaskKind::If(spec) => if_branch(spec, ctx, parent),
        TaskKind::ForEach(spec) => resolve_each_tasks(ctx, parent, &spec.tasks, &spec.values),
        TaskKind::WaitFor(spec) => Ok(wait_for_children(
            spec,
            parent,
            wait_for_iteration(ctx, parent),
        )),
        TaskKind::Pause(spec) => Ok(resolve_tasks(&spec.tasks, Some(parent))),
        TaskKind::AllowFailure(spec) => Ok(resolve_tasks(&spec.tasks, Some(parent))),
        TaskKind::Worker(_) | TaskKind::Subflow(_) | TaskKind::ForEachItem(_) => Ok(Vec::new()),
    }
}

/// Next task runs to start for a composite.
pub fn resolve_nexts<'a>(
    task: &'a Task,
    ctx: &RunContext<'_>,
    parent: &TaskRun,
) -> EngineResult<Vec<NextTaskRun<'a>>> {
    let execution = ctx.execution;
    match &task.kind {
        TaskKind::Sequential(spec) => Ok(resolve_sequential_nexts(
            execution,
            resolve_tasks(&spec.tasks, Some(parent)),
            resolve_tasks(&spec.errors, Some(parent)),
            Some(parent),
        )),
        TaskKind::AllowFailure(spec) => Ok(resolve_sequential_nexts(
            execution,
            resolve_tasks(&spec.tasks, Some(parent)),
            resolve_tasks(&spec.errors, Some(parent)),
            Some(parent),
        )),
        TaskKind::Parallel(spec) => Ok(resolve_parallel_nexts(
            execution,
            resolve_tasks(&spec.tasks, Some(parent)),
            resolve_tasks(&spec.errors, Some(parent)),
            Some(parent),
            spec.concurrency_limit,
        )),
        TaskKind::Dag(spec) => resolve_dag_nexts(execution, spec, &task.id, Some(parent)),
        TaskKind::Switch(spec) => Ok(resolve_sequential_nexts(
            execution,
            switch_branch(spec, ctx, parent)?,
            resolve_tasks(&spec.errors, Some(parent)),
            Some(parent),
        )),
        TaskKind::If(spec) => Ok(resolve_sequential_nexts(
            execution,
            if_branch(spec, ctx, parent)?,
            resolve_tasks(&spec.errors, Some(parent)),
            Some(parent),
        )),
        TaskKind::ForEach(spec) => Ok(resolve_concurrent_nexts(
            execution,
            resolve_each_tasks(ctx, parent, &spec.tasks, &spec.values)?,
            resolve_tasks(&spec.errors, Some(parent)),
            Some(parent),
            spec.concurrency_limit,
        )),
        TaskKind::WaitFor(spec) => wait_for_nexts(spec, ctx, parent),
        TaskKind::Pause(spec) => {
            if need_pause(parent) || parent.state.current.is_paused() {
                return Ok(Vec::new());
            }
            Ok(resolve_sequential_nexts(
                execution,
                resolve_tasks(&spec.tasks, Some(parent)),
                resolve_tasks(&spec.errors, Some(parent)),
                Some(parent),
            ))
        }
        TaskKind::Worker(_) | TaskKind::Subflow(_) | TaskKind::ForEachItem(_) => Ok(Vec::new()),
    }
}

/// Aggregate state of a composite; `None` while still running.
///
/// A terminal result is withheld while any descendant task run of the owning
/// task run is non-terminal.
pub fn resolve_state(
    task: &Task,
    ctx: &RunContext<'_>,
    parent: &TaskRun,
) -> EngineResult<Option<StateType>> {
    let execution = ctx.execution;
    let resolved = match &task.kind {
        TaskKind::Sequential(spec) => flow_control::resolve_state(
            execution,
            resolve_tasks(&spec.tasks, Some(parent)),
            resolve_tasks(&spec.errors, Some(parent)),
            Some(parent),
            false,
        ),
        TaskKind::Parallel(spec) => flow_control::resolve_state(
            execution,
            resolve_tasks(&spec.tasks, Some(parent)),
            resolve_tasks(&spec.errors, Some(parent)),
            Some(parent),
            false,
        ),
        TaskKind::Dag(spec) => flow_control::resolve_state(
            execution,
            spec.tasks
                .iter()
                .map(|entry| ResolvedTask::new(&entry.task, Some(parent)))
                .collect(),
            resolve_tasks(&spec.errors, Some(parent)),
            Some(parent),
            false,
        ),
        TaskKind::Switch(spec) => flow_control::resolve_state(
            execution,
            switch_branch(spec, ctx, parent)?,
            resolve_tasks(&spec.errors, Some(parent)),
            Some(parent),
            false,
        ),
        TaskKind::If(spec) => flow_control::resolve_state(
            execution,
            if_branch(spec, ctx, parent)?,
            resolve_tasks(&spec.errors, Some(parent)),
            Some(parent),
            false,
        ),
        TaskKind::ForEach(spec) => {
            let children = resolve_each_tasks(ctx, parent, &spec.tasks, &spec.values)?;
            if children.is_empty() {
                // empty value list resolves immediately
                Some(StateType::Success)
            } else {
                flow_control::resolve_state(
                    execution,
                    children,
                    resolve_tasks(&spec.errors, Some(parent)),
                    Some(parent),
                    false,
                )
            }
        }
        TaskKind::WaitFor(spec) => wait_for_state(spec, ctx, parent)?,
        TaskKind::Pause(spec) => {
            if need_pause(parent) {
                Some(StateType::Paused)
            } else if spec.tasks.is_empty() {
                Some(StateType::Success)
            } else {
                flow_control::resolve_state(
                    execution,
                    resolve_tasks(&spec.tasks, Some(parent)),
                    resolve_tasks(&spec.errors, Some(parent)),
                    Some(parent),
                    false,
                )
            }
        }
        TaskKind::AllowFailure(spec) => flow_control::resolve_state(
            execution,
            resolve_tasks(&spec.tasks, Some(parent)),
            resolve_tasks(&spec.errors, Some(parent)),
            Some(parent),
            true,
        ),
        TaskKind::Worker(_) | TaskKind::Subflow(_) | TaskKind::ForEachItem(_) => None,
    };

    // a composite never terminates ahead of its descendants
    if let Some(state) = resolved {
        if state.is_terminated() && execution.has_non_terminal_descendant(&parent.id) {
            return Ok(None);
        }
    }

    Ok(resolved)
}

/// Outputs stored on a composite task run.
///
/// Computed when the run is materialized and refreshed on each visit;
/// Switch/If read back their stored selection so the choice is rendered
/// exactly once per task run.
pub fn flowable_outputs(
    task: &Task,
    ctx: &RunContext<'_>,
    parent: &TaskRun,
) -> EngineResult<serde_json::Map<String, serde_json::Value>> {
    let mut outputs = serde_json::Map::new();
    match &task.kind {
        TaskKind::Switch(spec) => {
            let (value, defaults) = switch_selection(spec, ctx, parent)?;
            outputs.insert("value".to_string(), serde_json::Value::String(value));
            outputs.insert("defaults".to_string(), serde_json::Value::Bool(defaults));
        }
        TaskKind::If(spec) => {
            let truthy = if_condition(spec, ctx, parent)?;
            outputs.insert("condition".to_string(), serde_json::Value::Bool(truthy));
        }
        TaskKind::WaitFor(_) => {
            let iteration = wait_for_iteration(ctx, parent);
            outputs.insert(
                "iteration_count".to_string(),
                serde_json::Value::Number(iteration.into()),
            );
        }
        _ => {}
    }
    Ok(outputs)
}

// ============================================================================
// Switch / If
// ============================================================================

/// Selected case value and whether it fell through to the defaults.
///
/// The stored output wins over re-rendering, so a partially executed branch
/// can never change selection.
fn switch_selection(
    spec: &SwitchSpec,
    ctx: &RunContext<'_>,
    parent: &TaskRun,
) -> EngineResult<(String, bool)> {
    let value = match parent.outputs.get("value").and_then(|v| v.as_str()) {
        Some(stored) => stored.to_string(),
        None => ctx.render(&spec.value)?,
    };
    let defaults = !spec.cases.contains_key(&value);
    Ok((value, defaults))
}

fn switch_branch<'a>(
    spec: &'a SwitchSpec,
    ctx: &RunContext<'_>,
    parent: &TaskRun,
) -> EngineResult<Vec<ResolvedTask<'a>>> {
    let (value, _) = switch_selection(spec, ctx, parent)?;
    let branch: &'a [Task] = match spec.cases.get(&value) {
        Some(tasks) => tasks,
        None if !spec.defaults.is_empty() => &spec.defaults,
        None => {
            return Err(EngineError::Template(format!(
                "No case matches value '{}' and no defaults are declared",
                value
            )))
        }
    };
    Ok(resolve_tasks(branch, Some(parent)))
}

fn if_condition(spec: &IfSpec, ctx: &RunContext<'_>, parent: &TaskRun) -> EngineResult<bool> {
    match parent.outputs.get("condition").and_then(|v| v.as_bool()) {
        Some(stored) => Ok(stored),
        None => ctx.evaluate_condition(&spec.condition),
    }
}

fn if_branch<'a>(
    spec: &'a IfSpec,
    ctx: &RunContext<'_>,
    parent: &TaskRun,
) -> EngineResult<Vec<ResolvedTask<'a>>> {
    let branch: &'a [Task] = if if_condition(spec, ctx, parent)? {
        &spec.then
    } else {
        &spec.r#else
    };
    Ok(resolve_tasks(branch, Some(parent)))
}

// ============================================================================
// Pause
// ============================================================================

/// Pause fires once per run: the task run is RUNNING and has never been
/// PAUSED. A resumed run keeps its PAUSED history entry and never re-pauses.
fn need_pause(parent: &TaskRun) -> bool {
    parent.state.current == StateType::Running && !parent.state.has_history(StateType::Paused)
}

// ============================================================================
// WaitFor
// ============================================================================

/// Current loop iteration: the highest child iteration, 1 before any child
/// was started.
fn wait_for_iteration(ctx: &RunContext<'_>, parent: &TaskRun) -> u32 {
    ctx.execution
        .task_runs
        .iter()
        .filter(|run| run.parent_task_run_id.as_deref() == Some(parent.id.as_str()))
        .filter_map(|run| run.iteration)
        .max()
        .unwrap_or(1)
}

fn wait_for_children<'a>(
    spec: &'a WaitForSpec,
    parent: &TaskRun,
    iteration: u32,
) -> Vec<ResolvedTask<'a>> {
    spec.tasks
        .iter()
        .map(|task| ResolvedTask::new(task, Some(parent)).with_iteration(iteration))
        .collect()
}

/// Whether `max_iterations` or `max_duration_seconds` (from the first
/// RUNNING history entry) was reached. Checked lazily on each visit.
fn wait_for_maxed(spec: &WaitForSpec, parent: &TaskRun, iteration: u32) -> bool {
    if let Some(max) = spec.max_iterations {
        if iteration >= max {
            return true;
        }
    }
    if let Some(max_seconds) = spec.max_duration_seconds {
        if let Some(started) = parent.state.started_date() {
            let elapsed = (Utc::now() - started).num_milliseconds() as f64 / 1000.0;
            if elapsed >= max_seconds {
                return true;
            }
        }
    }
    false
}

fn wait_for_nexts<'a>(
    spec: &'a WaitForSpec,
    ctx: &RunContext<'_>,
    parent: &TaskRun,
) -> EngineResult<Vec<NextTaskRun<'a>>> {
    let execution = ctx.execution;
    let iteration = wait_for_iteration(ctx, parent);
    let children = wait_for_children(spec, parent, iteration);
    let errors = resolve_tasks(&spec.errors, Some(parent));

    // current iteration still in flight
    if !execution.is_terminated_for(&children, Some(parent)) {
        return Ok(resolve_sequential_nexts(
            execution,
            children,
            errors,
            Some(parent),
        ));
    }

    if execution.has_failed_for(&children, Some(parent)) {
        return Ok(Vec::new());
    }
    if ctx.evaluate_condition(&spec.condition)? {
        return Ok(Vec::new());
    }
    if wait_for_maxed(spec, parent, iteration) {
        return Ok(Vec::new());
    }

    // propose the next run of the subgraph
    let next_children = wait_for_children(spec, parent, iteration + 1);
    Ok(vec![next_children[0].to_next_task_run(execution)])
}

fn wait_for_state(
    spec: &WaitForSpec,
    ctx: &RunContext<'_>,
    parent: &TaskRun,
) -> EngineResult<Option<StateType>> {
    let execution = ctx.execution;
    let iteration = wait_for_iteration(ctx, parent);
    let children = wait_for_children(spec, parent, iteration);
    let errors = resolve_tasks(&spec.errors, Some(parent));

    if execution.is_terminated_for(&children, Some(parent))
        && !execution.has_failed_for(&children, Some(parent))
    {
        let satisfied = ctx.evaluate_condition(&spec.condition)?;
        let maxed = wait_for_maxed(spec, parent, iteration);
        if !satisfied && !maxed {
            // keep looping
            return Ok(None);
        }
        if !satisfied && maxed && spec.fail_on_max_reached {
            return Ok(Some(StateType::Failed));
        }
    }

    Ok(flow_control::resolve_state(
        execution,
        children,
        errors,
        Some(parent),
        false,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{Execution, State};
    use crate::flow::{
        AllowFailureSpec, Flow, ForEachSpec, PauseSpec, SequentialSpec, WorkerSpec,
    };
    use crate::template::TemplateRenderer;

    fn worker_task(id: &str) -> Task {
        Task {
            id: id.to_string(),
            kind: TaskKind::Worker(WorkerSpec::default()),
        }
    }

    fn flow_with(tasks: Vec<Task>) -> Flow {
        Flow {
            namespace: "demo".to_string(),
            id: "resolver".to_string(),
            revision: 1,
            labels: Default::default(),
            inputs: serde_json::Map::new(),
            variables: serde_json::Map::new(),
            tasks,
            errors: Vec::new(),
            listeners: Vec::new(),
        }
    }

    fn running_run(execution: &Execution, task: &Task) -> TaskRun {
        let mut run = ResolvedTask::new(task, None)
            .to_next_task_run(execution)
            .task_run;
        run.state = State::new(StateType::Created).with_state(StateType::Running);
        run
    }

    fn child_run(
        execution: &Execution,
        task: &Task,
        parent: &TaskRun,
        state: StateType,
    ) -> TaskRun {
        let mut run = ResolvedTask::new(task, Some(parent))
            .to_next_task_run(execution)
            .task_run;
        run.state = State::new(StateType::Created).with_state(state);
        run
    }

    #[test]
    fn test_switch_selection_is_stable_once_stored() {
        let switch = Task {
            id: "decide".to_string(),
            kind: TaskKind::Switch(SwitchSpec {
                value: "{{ inputs.mode }}".to_string(),
                cases: [("fast".to_string(), vec![worker_task("quick")])]
                    .into_iter()
                    .collect(),
                defaults: vec![worker_task("fallback")],
                errors: Vec::new(),
            }),
        };
        let flow = flow_with(vec![switch.clone()]);

        let mut inputs = serde_json::Map::new();
        inputs.insert("mode".to_string(), serde_json::json!("fast"));
        let mut execution = Execution::new("demo", "resolver", 1, inputs);

        let mut parent = running_run(&execution, &switch);
        // selection recorded at creation time
        parent
            .outputs
            .insert("value".to_string(), serde_json::json!("fast"));
        execution.add_task_run(parent.clone()).unwrap();

        // the underlying input changes, the stored selection wins
        execution
            .inputs
            .insert("mode".to_string(), serde_json::json!("slow"));

        let renderer = TemplateRenderer::new();
        let ctx = RunContext::new(&renderer, &flow, &execution, Some(&parent));
        let nexts = resolve_nexts(&switch, &ctx, &parent).unwrap();

        assert_eq!(nexts.len(), 1);
        assert_eq!(nexts[0].task_run.task_id, "quick");
    }

    #[test]
    fn test_switch_without_match_or_defaults_errors() {
        let switch = Task {
            id: "decide".to_string(),
            kind: TaskKind::Switch(SwitchSpec {
                value: "nomatch".to_string(),
                cases: [("fast".to_string(), vec![worker_task("quick")])]
                    .into_iter()
                    .collect(),
                defaults: Vec::new(),
                errors: Vec::new(),
            }),
        };
        let flow = flow_with(vec![switch.clone()]);
        let mut execution = Execution::new("demo", "resolver", 1, serde_json::Map::new());
        let parent = running_run(&execution, &switch);
        execution.add_task_run(parent.clone()).unwrap();

        let renderer = TemplateRenderer::new();
        let ctx = RunContext::new(&renderer, &flow, &execution, Some(&parent));
        assert!(resolve_nexts(&switch, &ctx, &parent).is_err());
    }

    #[test]
    fn test_if_false_with_empty_else_succeeds() {
        let task = Task {
            id: "gate".to_string(),
            kind: TaskKind::If(IfSpec {
                condition: "false".to_string(),
                then: vec![worker_task("guarded")],
                r#else: Vec::new(),
                errors: Vec::new(),
            }),
        };
        let flow = flow_with(vec![task.clone()]);
        let mut execution = Execution::new("demo", "resolver", 1, serde_json::Map::new());
        let parent = running_run(&execution, &task);
        execution.add_task_run(parent.clone()).unwrap();

        let renderer = TemplateRenderer::new();
        let ctx = RunContext::new(&renderer, &flow, &execution, Some(&parent));

        assert!(resolve_nexts(&task, &ctx, &parent).unwrap().is_empty());
        assert_eq!(
            resolve_state(&task, &ctx, &parent).unwrap(),
            Some(StateType::Success)
        );
    }

    #[test]
    fn test_pause_fires_once_per_run() {
        let task = Task {
            id: "approval".to_string(),
            kind: TaskKind::Pause(PauseSpec::default()),
        };
        let flow = flow_with(vec![task.clone()]);
        let mut execution = Execution::new("demo", "resolver", 1, serde_json::Map::new());
        let parent = running_run(&execution, &task);
        execution.add_task_run(parent.clone()).unwrap();

        let renderer = TemplateRenderer::new();
        let ctx = RunContext::new(&renderer, &flow, &execution, Some(&parent));

        // first RUNNING episode with no PAUSED history: pause
        assert_eq!(
            resolve_state(&task, &ctx, &parent).unwrap(),
            Some(StateType::Paused)
        );
        assert!(resolve_nexts(&task, &ctx, &parent).unwrap().is_empty());

        // resumed: PAUSED history entry present, no re-pause
        let resumed = parent
            .with_state(StateType::Paused)
            .with_state(StateType::Running);
        assert_eq!(
            resolve_state(&task, &ctx, &resumed).unwrap(),
            Some(StateType::Success)
        );
    }

    #[test]
    fn test_allow_failure_softens_child_failure() {
        let child = worker_task("fragile");
        let task = Task {
            id: "tolerant".to_string(),
            kind: TaskKind::AllowFailure(AllowFailureSpec {
                tasks: vec![child.clone()],
                errors: Vec::new(),
            }),
        };
        let flow = flow_with(vec![task.clone()]);
        let mut execution = Execution::new("demo", "resolver", 1, serde_json::Map::new());
        let parent = running_run(&execution, &task);
        execution.add_task_run(parent.clone()).unwrap();
        let failed = child_run(&execution, &child, &parent, StateType::Failed);
        execution.add_task_run(failed).unwrap();

        let renderer = TemplateRenderer::new();
        let ctx = RunContext::new(&renderer, &flow, &execution, Some(&parent));

        assert_eq!(
            resolve_state(&task, &ctx, &parent).unwrap(),
            Some(StateType::Warning)
        );
    }

    #[test]
    fn test_foreach_empty_values_is_success() {
        let task = Task {
            id: "each".to_string(),
            kind: TaskKind::ForEach(ForEachSpec {
                values: serde_json::json!([]),
                tasks: vec![worker_task("item")],
                concurrency_limit: 1,
                errors: Vec::new(),
            }),
        };
        let flow = flow_with(vec![task.clone()]);
        let mut execution = Execution::new("demo", "resolver", 1, serde_json::Map::new());
        let parent = running_run(&execution, &task);
        execution.add_task_run(parent.clone()).unwrap();

        let renderer = TemplateRenderer::new();
        let ctx = RunContext::new(&renderer, &flow, &execution, Some(&parent));

        assert_eq!(
            resolve_state(&task, &ctx, &parent).unwrap(),
            Some(StateType::Success)
        );
    }

    #[test]
    fn test_wait_for_proposes_next_iteration() {
        let child = worker_task("probe");
        let task = Task {
            id: "poll".to_string(),
            kind: TaskKind::WaitFor(WaitForSpec {
                condition: "{{ outputs.probe.ready | default(false) }}".to_string(),
                tasks: vec![child.clone()],
                max_iterations: Some(5),
                max_duration_seconds: None,
                fail_on_max_reached: false,
                errors: Vec::new(),
            }),
        };
        let flow = flow_with(vec![task.clone()]);
        let mut execution = Execution::new("demo", "resolver", 1, serde_json::Map::new());
        let parent = running_run(&execution, &task);
        execution.add_task_run(parent.clone()).unwrap();

        // iteration 1 finished, condition still false
        let mut done = child_run(&execution, &child, &parent, StateType::Success);
        done.iteration = Some(1);
        execution.add_task_run(done).unwrap();

        let renderer = TemplateRenderer::new();
        let ctx = RunContext::new(&renderer, &flow, &execution, Some(&parent));

        let nexts = resolve_nexts(&task, &ctx, &parent).unwrap();
        assert_eq!(nexts.len(), 1);
        assert_eq!(nexts[0].task_run.iteration, Some(2));
        assert_eq!(resolve_state(&task, &ctx, &parent).unwrap(), None);
    }

    #[test]
    fn test_wait_for_stops_at_max_iterations() {
        let child = worker_task("probe");
        let task = Task {
            id: "poll".to_string(),
            kind: TaskKind::WaitFor(WaitForSpec {
                condition: "false".to_string(),
                tasks: vec![child.clone()],
                max_iterations: Some(2),
                max_duration_seconds: None,
                fail_on_max_reached: true,
                errors: Vec::new(),
            }),
        };
        let flow = flow_with(vec![task.clone()]);
        let mut execution = Execution::new("demo", "resolver", 1, serde_json::Map::new());
        let parent = running_run(&execution, &task);
        execution.add_task_run(parent.clone()).unwrap();

        for iteration in 1..=2 {
            let mut done = child_run(&execution, &child, &parent, StateType::Success);
            done.iteration = Some(iteration);
            execution.add_task_run(done).unwrap();
        }

        let renderer = TemplateRenderer::new();
        let ctx = RunContext::new(&renderer, &flow, &execution, Some(&parent));

        assert!(resolve_nexts(&task, &ctx, &parent).unwrap().is_empty());
        assert_eq!(
            resolve_state(&task, &ctx, &parent).unwrap(),
            Some(StateType::Failed)
        );
    }

    #[test]
    fn test_sequential_state_withheld_while_grandchild_runs() {
        let leaf = worker_task("leaf");
        let inner = Task {
            id: "inner".to_string(),
            kind: TaskKind::Sequential(SequentialSpec {
                tasks: vec![leaf.clone()],
                errors: Vec::new(),
            }),
        };
        let outer = Task {
            id: "outer".to_string(),
            kind: TaskKind::Sequential(SequentialSpec {
                tasks: vec![inner.clone()],
                errors: Vec::new(),
            }),
        };
        let flow = flow_with(vec![outer.clone()]);
        let mut execution = Execution::new("demo", "resolver", 1, serde_json::Map::new());

        let outer_run = running_run(&execution, &outer);
        execution.add_task_run(outer_run.clone()).unwrap();

        // inner claims success while its own leaf still runs; the guard
        // withholds the terminal state
        let inner_run = child_run(&execution, &inner, &outer_run, StateType::Success);
        execution.add_task_run(inner_run.clone()).unwrap();
        let mut leaf_run = ResolvedTask::new(&leaf, Some(&inner_run))
            .to_next_task_run(&execution)
            .task_run;
        leaf_run.state = State::new(StateType::Created).with_state(StateType::Running);
        execution.add_task_run(leaf_run).unwrap();

        let renderer = TemplateRenderer::new();
        let ctx = RunContext::new(&renderer, &flow, &execution, Some(&outer_run));
        assert_eq!(resolve_state(&outer, &ctx, &outer_run).unwrap(), None);
    }
}
