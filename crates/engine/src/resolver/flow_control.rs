//! Shared flow-control resolution helpers.
//!
//! These functions implement the common "what starts next / what is the
//! aggregate state" algorithms that variant resolvers compose: sequential
//! progression, bounded parallel starts, per-iteration concurrency,
//! DAG wavefronts, and the aggregate state rule.

use crate::error::EngineResult;
use crate::execution::{Execution, NextTaskRun, ResolvedTask, StateType, TaskRun};
use crate::flow::{validate_dag, DagSpec, Task};

use super::context::RunContext;

/// Bind declared tasks to a parent context.
pub fn resolve_tasks<'a>(tasks: &'a [Task], parent: Option<&TaskRun>) -> Vec<ResolvedTask<'a>> {
    tasks
        .iter()
        .map(|task| ResolvedTask::new(task, parent))
        .collect()
}

/// Sequential next-task rule: start the first child with no run yet, one at
/// a time, switching to the error branch after a failure.
pub fn resolve_sequential_nexts<'a>(
    execution: &Execution,
    tasks: Vec<ResolvedTask<'a>>,
    errors: Vec<ResolvedTask<'a>>,
    parent: Option<&TaskRun>,
) -> Vec<NextTaskRun<'a>> {
    let current = execution.find_task_depending_flow_state(tasks, errors, parent);
    inner_sequential_nexts(execution, &current, parent)
}

pub(crate) fn inner_sequential_nexts<'a>(
    execution: &Execution,
    current: &[ResolvedTask<'a>],
    parent: Option<&TaskRun>,
) -> Vec<NextTaskRun<'a>> {
    if current.is_empty() {
        return Vec::new();
    }

    let runs = execution.find_task_runs_for(current, parent);

    // nothing started yet
    if runs.is_empty() {
        return vec![current[0].to_next_task_run(execution)];
    }

    // a proposal is still pending, or a child is in flight
    if runs.iter().any(|r| r.state.current.is_created())
        || runs.iter().any(|r| r.state.current.is_running())
    {
        return Vec::new();
    }

    // last terminated child decides the next one
    if let Some(last) = runs.iter().rev().find(|r| r.state.is_terminated()) {
        if let Some(pos) = current.iter().position(|t| t.matches(last, parent)) {
            if pos + 1 < current.len() {
                let candidate = &current[pos + 1];
                if !runs.iter().any(|r| candidate.matches(r, parent)) {
                    return vec![candidate.to_next_task_run(execution)];
                }
            }
        }
    }

    Vec::new()
}

/// Parallel next-task rule: start up to (limit - running) children in
/// declared order; limit 0 means unlimited.
pub fn resolve_parallel_nexts<'a>(
    execution: &Execution,
    tasks: Vec<ResolvedTask<'a>>,
    errors: Vec<ResolvedTask<'a>>,
    parent: Option<&TaskRun>,
    concurrency_limit: usize,
) -> Vec<NextTaskRun<'a>> {
    let current = execution.find_task_depending_flow_state(tasks, errors, parent);
    let runs = execution.find_task_runs_for(&current, parent);

    let running = runs
        .iter()
        .filter(|r| r.state.current.is_running())
        .count();
    if concurrency_limit > 0 && running >= concurrency_limit {
        return Vec::new();
    }

    // wait for pending proposals before starting more
    if runs.iter().any(|r| r.state.current.is_created()) {
        return Vec::new();
    }

    let mut nexts: Vec<NextTaskRun<'a>> = current
        .iter()
        .filter(|t| !runs.iter().any(|r| t.matches(r, parent)))
        .map(|t| t.to_next_task_run(execution))
        .collect();

    if concurrency_limit > 0 {
        nexts.truncate(concurrency_limit - running);
    }
    nexts
}

/// ForEach next-task rule: iterations are independent groups keyed by value;
/// at most `limit` iterations may be simultaneously active (0 = unlimited),
/// and children within one iteration progress sequentially.
pub fn resolve_concurrent_nexts<'a>(
    execution: &Execution,
    tasks: Vec<ResolvedTask<'a>>,
    errors: Vec<ResolvedTask<'a>>,
    parent: Option<&TaskRun>,
    concurrency_limit: usize,
) -> Vec<NextTaskRun<'a>> {
    let current = execution.find_task_depending_flow_state(tasks, errors, parent);
    if current.is_empty() {
        return Vec::new();
    }

    // group by iteration value, preserving declared order
    let mut groups: Vec<(Option<String>, Vec<ResolvedTask<'a>>)> = Vec::new();
    for task in current {
        match groups.iter_mut().find(|(value, _)| *value == task.value) {
            Some((_, group)) => group.push(task),
            None => groups.push((task.value.clone(), vec![task])),
        }
    }

    let mut nexts = Vec::new();
    let mut active = 0usize;
    let mut pending: Vec<&Vec<ResolvedTask<'a>>> = Vec::new();

    for (_, group) in &groups {
        let runs = execution.find_task_runs_for(group, parent);
        if runs.is_empty() {
            pending.push(group);
            continue;
        }
        let done = runs.iter().filter(|r| r.state.is_terminated()).count() == group.len();
        if !done {
            active += 1;
            nexts.extend(inner_sequential_nexts(execution, group, parent));
        }
    }

    for group in pending {
        if concurrency_limit > 0 && active >= concurrency_limit {
            break;
        }
        nexts.push(group[0].to_next_task_run(execution));
        active += 1;
    }

    nexts
}

/// DAG next-task rule: a child is eligible once all its `depends_on`
/// siblings hold a terminal-success run; every eligible child may start in
/// the same cycle, bounded by the concurrency limit.
pub fn resolve_dag_nexts<'a>(
    execution: &Execution,
    spec: &'a DagSpec,
    task_id: &str,
    parent: Option<&TaskRun>,
) -> EngineResult<Vec<NextTaskRun<'a>>> {
    // defensive re-check; registration already validated
    validate_dag(task_id, &spec.tasks)?;

    let tasks: Vec<ResolvedTask<'a>> = spec
        .tasks
        .iter()
        .map(|entry| ResolvedTask::new(&entry.task, parent))
        .collect();
    let errors = resolve_tasks(&spec.errors, parent);

    let error_branch_started = !execution.find_task_runs_for(&errors, parent).is_empty();
    if error_branch_started || execution.has_failed_for(&tasks, parent) {
        return Ok(inner_sequential_nexts(execution, &errors, parent));
    }

    let runs = execution.find_task_runs_for(&tasks, parent);
    if runs.iter().any(|r| r.state.current.is_created()) {
        return Ok(Vec::new());
    }
    let running = runs
        .iter()
        .filter(|r| r.state.current.is_running())
        .count();

    let mut nexts: Vec<NextTaskRun<'a>> = Vec::new();
    for (entry, resolved) in spec.tasks.iter().zip(tasks.iter()) {
        if runs.iter().any(|r| resolved.matches(r, parent)) {
            continue;
        }
        let satisfied = entry.depends_on.iter().all(|dep| {
            runs.iter().any(|r| {
                r.task_id == *dep
                    && matches!(r.state.current, StateType::Success | StateType::Warning)
            })
        });
        if satisfied {
            nexts.push(resolved.to_next_task_run(execution));
        }
    }

    if spec.concurrency_limit > 0 {
        nexts.truncate(spec.concurrency_limit.saturating_sub(running));
    }
    Ok(nexts)
}

/// Aggregate state rule shared by all composite variants.
///
/// `None` means still running. An empty declared set resolves SUCCESS
/// immediately; otherwise the final state is aggregated once the active
/// branch is fully terminated, or as soon as a failure occurred with no
/// error branch to run.
pub fn resolve_state(
    execution: &Execution,
    tasks: Vec<ResolvedTask<'_>>,
    errors: Vec<ResolvedTask<'_>>,
    parent: Option<&TaskRun>,
    allow_failure: bool,
) -> Option<StateType> {
    if tasks.is_empty() {
        return Some(StateType::Success);
    }

    let current = execution.find_task_depending_flow_state(tasks.clone(), errors, parent);

    if !current.is_empty() {
        if execution.is_terminated_for(&current, parent) {
            return Some(execution.guess_final_state(&tasks, parent, allow_failure));
        }
    } else if execution.has_failed_for(&tasks, parent) {
        // failure with no error branch declared
        return Some(execution.guess_final_state(&tasks, parent, allow_failure));
    }

    None
}

/// Split a ForEach value list into per-iteration resolved tasks.
///
/// A string renders to a JSON list; a literal list is used as-is. Values are
/// deduplicated and nulls rejected. The result is iteration-major: all tasks
/// of the first value, then all tasks of the second.
pub fn resolve_each_tasks<'a>(
    ctx: &RunContext<'_>,
    parent: &TaskRun,
    tasks: &'a [Task],
    values: &serde_json::Value,
) -> EngineResult<Vec<ResolvedTask<'a>>> {
    let items: Vec<serde_json::Value> = match values {
        serde_json::Value::String(expr) => match ctx.render_to_value(expr)? {
            serde_json::Value::Array(arr) => arr,
            other => {
                return Err(crate::error::EngineError::Template(format!(
                    "ForEach values must render to a list, got: {}",
                    other
                )))
            }
        },
        serde_json::Value::Array(arr) => arr.clone(),
        other => {
            return Err(crate::error::EngineError::Template(format!(
                "ForEach values must be a list or an expression, got: {}",
                other
            )))
        }
    };

    let mut distinct: Vec<String> = Vec::new();
    for item in &items {
        if item.is_null() {
            return Err(crate::error::EngineError::Template(
                "Found null values on ForEach".to_string(),
            ));
        }
        let rendered = match item {
            serde_json::Value::String(s) => s.clone(),
            other => serde_json::to_string(other)?,
        };
        if !distinct.contains(&rendered) {
            distinct.push(rendered);
        }
    }

    let mut result = Vec::new();
    for value in &distinct {
        for task in tasks {
            result.push(ResolvedTask::new(task, Some(parent)).with_value(value.clone()));
        }
    }
    Ok(result)
}
