//! Structural validation for DAG task lists.

use std::collections::{HashMap, HashSet};

use crate::error::{EngineError, EngineResult};

use super::types::DagEntry;

/// Traversal marker for cycle detection.
#[derive(Clone, Copy, PartialEq)]
enum Mark {
    /// On the current expansion path.
    InProgress,
    /// Fully expanded, known cycle-free.
    Done,
}

/// Validate a DAG entry list: every `depends_on` id must name a declared
/// sibling, and the dependency graph must be acyclic.
///
/// Cycle detection is an iterative traversal sharing one visited map across
/// the whole validation pass, with an explicit in-progress marker; a cycle is
/// reported as soon as an entry is reachable from itself.
pub fn validate_dag(task_id: &str, entries: &[DagEntry]) -> EngineResult<()> {
    let by_id: HashMap<&str, &DagEntry> = entries
        .iter()
        .map(|entry| (entry.task.id.as_str(), entry))
        .collect();

    let missing: Vec<&str> = entries
        .iter()
        .flat_map(|entry| entry.depends_on.iter())
        .map(|dep| dep.as_str())
        .filter(|dep| !by_id.contains_key(dep))
        .collect();

    if !missing.is_empty() {
        return Err(EngineError::Validation(format!(
            "Unknown dependencies on task '{}': {}",
            task_id,
            missing.join(", ")
        )));
    }

    let mut marks: HashMap<&str, Mark> = HashMap::new();

    for entry in entries {
        if marks.get(entry.task.id.as_str()) == Some(&Mark::Done) {
            continue;
        }

        // Depth-first expansion with an explicit stack; the second visit of a
        // frame finalizes it.
        let mut stack: Vec<(&str, bool)> = vec![(entry.task.id.as_str(), false)];
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                marks.insert(id, Mark::Done);
                continue;
            }
            match marks.get(id) {
                Some(Mark::Done) => continue,
                Some(Mark::InProgress) => {
                    return Err(EngineError::Validation(format!(
                        "Cyclic dependency detected on task '{}' around '{}'",
                        task_id, id
                    )));
                }
                None => {}
            }
            marks.insert(id, Mark::InProgress);
            stack.push((id, true));
            if let Some(node) = by_id.get(id) {
                for dep in &node.depends_on {
                    match marks.get(dep.as_str()) {
                        Some(Mark::Done) => {}
                        Some(Mark::InProgress) => {
                            return Err(EngineError::Validation(format!(
                                "Cyclic dependency detected on task '{}' around '{}'",
                                task_id, dep
                            )));
                        }
                        None => stack.push((dep.as_str(), false)),
                    }
                }
            }
        }
    }

    Ok(())
}

/// Duplicate-free dependency closure check used by tests and tooling: the
/// set of entries transitively reachable from `start`.
#[allow(dead_code)]
pub(crate) fn transitive_dependencies<'a>(
    start: &'a DagEntry,
    entries: &'a [DagEntry],
) -> HashSet<&'a str> {
    let by_id: HashMap<&str, &DagEntry> = entries
        .iter()
        .map(|entry| (entry.task.id.as_str(), entry))
        .collect();

    let mut visited: HashSet<&str> = HashSet::new();
    let mut frontier: Vec<&str> = start.depends_on.iter().map(|s| s.as_str()).collect();
    while let Some(id) = frontier.pop() {
        if !visited.insert(id) {
            continue;
        }
        if let Some(node) = by_id.get(id) {
            frontier.extend(node.depends_on.iter().map(|s| s.as_str()));
        }
    }
    visited
}
