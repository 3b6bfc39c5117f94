//! Subflow coordination: child executions for Subflow and ForEachItem tasks.
//!
//! Creation is pure (registry lookups plus rendering); persistence ordering
//! (tracking-store save before queue emission) is the orchestrator's job.

use std::collections::HashMap;

use crate::error::{EngineError, EngineResult};
use crate::execution::{Execution, StateType, TaskRun};
use crate::flow::{BatchSpec, Flow, Task, TaskKind};
use crate::queue::WorkerTaskResult;
use crate::repository::{FlowRegistry, SubflowLink};
use crate::resolver::RunContext;
use crate::template::TemplateRenderer;

/// An executable task run waiting for its child executions.
#[derive(Debug, Clone)]
pub struct SubflowRequest {
    pub task_run: TaskRun,
    pub task: Task,
}

impl SubflowRequest {
    /// Whether the owning task run waits for the children to terminate.
    pub fn waits(&self) -> bool {
        match &self.task.kind {
            TaskKind::Subflow(spec) => spec.wait,
            TaskKind::ForEachItem(spec) => spec.wait,
            _ => false,
        }
    }
}

/// Creates and monitors child executions.
pub struct SubflowCoordinator;

impl SubflowCoordinator {
    /// Build the child executions (and their tracking links) for a request.
    ///
    /// Inputs are rendered against the parent context. ForEachItem splits
    /// the rendered item list into batches, one child execution each.
    pub fn create_children(
        request: &SubflowRequest,
        parent_flow: &Flow,
        parent_execution: &Execution,
        registry: &dyn FlowRegistry,
        renderer: &TemplateRenderer,
    ) -> EngineResult<Vec<(SubflowLink, Execution)>> {
        let ctx = RunContext::new(
            renderer,
            parent_flow,
            parent_execution,
            Some(&request.task_run),
        );

        match &request.task.kind {
            TaskKind::Subflow(spec) => {
                let flow = registry
                    .find_flow(&spec.namespace, &spec.flow_id, spec.revision)
                    .ok_or_else(|| {
                        EngineError::NotFound(format!(
                            "Flow '{}.{}'",
                            spec.namespace, spec.flow_id
                        ))
                    })?;

                let inputs = ctx.render_map(&spec.inputs)?;
                let mut child =
                    Execution::new(&spec.namespace, &spec.flow_id, flow.revision, inputs);
                child.parent_execution_id = Some(parent_execution.id.clone());
                if spec.inherit_labels {
                    child.labels = parent_execution.labels.clone();
                }

                let link = SubflowLink {
                    parent_execution_id: parent_execution.id.clone(),
                    parent_task_run_id: request.task_run.id.clone(),
                    child_execution_id: child.id.clone(),
                    batch_index: None,
                    batch_total: None,
                    wait: spec.wait,
                    transmit_failed: spec.transmit_failed,
                    outputs_spec: spec.outputs.clone(),
                };
                Ok(vec![(link, child)])
            }
            TaskKind::ForEachItem(spec) => {
                let flow = registry
                    .find_flow(&spec.namespace, &spec.flow_id, spec.revision)
                    .ok_or_else(|| {
                        EngineError::NotFound(format!(
                            "Flow '{}.{}'",
                            spec.namespace, spec.flow_id
                        ))
                    })?;

                let items = match ctx.render_to_value(&spec.items)? {
                    serde_json::Value::Array(items) => items,
                    other => {
                        return Err(EngineError::Template(format!(
                            "ForEachItem items must render to a list, got: {}",
                            other
                        )))
                    }
                };

                let batches = split_batches(&items, &spec.batch)?;
                let total = batches.len() as u32;
                let mut children = Vec::new();

                for (index, batch) in batches.into_iter().enumerate() {
                    let mut inputs = ctx.render_map(&spec.inputs)?;
                    inputs.insert("items".to_string(), serde_json::Value::Array(batch));

                    let mut child =
                        Execution::new(&spec.namespace, &spec.flow_id, flow.revision, inputs);
                    child.parent_execution_id = Some(parent_execution.id.clone());
                    if spec.inherit_labels {
                        child.labels = parent_execution.labels.clone();
                    }

                    let link = SubflowLink {
                        parent_execution_id: parent_execution.id.clone(),
                        parent_task_run_id: request.task_run.id.clone(),
                        child_execution_id: child.id.clone(),
                        batch_index: Some(index as u32 + 1),
                        batch_total: Some(total),
                        wait: spec.wait,
                        transmit_failed: spec.transmit_failed,
                        outputs_spec: serde_json::Map::new(),
                    };
                    children.push((link, child));
                }
                Ok(children)
            }
            _ => Err(EngineError::Internal(format!(
                "Task '{}' is not executable",
                request.task.id
            ))),
        }
    }

    /// Parent task-run result for a terminated single subflow.
    ///
    /// Extracts declared outputs from the child; an extraction error fails
    /// the parent task run.
    pub fn subflow_result(
        link: &SubflowLink,
        child: &Execution,
        parent_run: &TaskRun,
        renderer: &TemplateRenderer,
    ) -> Option<WorkerTaskResult> {
        if !child.state.is_terminated() {
            return None;
        }

        let mut outputs = serde_json::Map::new();
        outputs.insert(
            "execution_id".to_string(),
            serde_json::json!(child.id.clone()),
        );
        outputs.insert(
            "state".to_string(),
            serde_json::json!(child.state.current.to_string()),
        );

        let state = if link.transmit_failed
            && (child.state.is_failed() || child.state.current == StateType::Warning)
        {
            child.state.current
        } else {
            StateType::Success
        };

        if !link.outputs_spec.is_empty() {
            let mut child_outputs = serde_json::Map::new();
            for run in &child.task_runs {
                if !run.outputs.is_empty() {
                    child_outputs.insert(
                        run.task_id.clone(),
                        serde_json::Value::Object(run.outputs.clone()),
                    );
                }
            }
            let mut context = HashMap::new();
            context.insert(
                "outputs".to_string(),
                serde_json::Value::Object(child_outputs),
            );

            match renderer.render_value(
                &serde_json::Value::Object(link.outputs_spec.clone()),
                &context,
            ) {
                Ok(serde_json::Value::Object(rendered)) => {
                    outputs.insert("outputs".to_string(), serde_json::Value::Object(rendered));
                }
                Ok(_) | Err(_) => {
                    tracing::warn!(
                        child_execution_id = %child.id,
                        parent_task_run_id = %parent_run.id,
                        "Failed to extract outputs from subflow execution"
                    );
                    return Some(WorkerTaskResult::new(
                        parent_run.with_outputs(outputs).with_state(StateType::Failed),
                    ));
                }
            }
        }

        Some(WorkerTaskResult::new(
            parent_run.with_outputs(outputs).with_state(state),
        ))
    }

    /// Parent task-run result for a batch of ForEachItem children.
    ///
    /// The `iterations` counter output (count per state plus `max`) is
    /// updated on every child report; the final state is resolved once all
    /// batches have terminated.
    pub fn iterations_result(
        parent_run: &TaskRun,
        states: &[StateType],
        total: u32,
        transmit_failed: bool,
    ) -> WorkerTaskResult {
        let mut iterations = serde_json::Map::new();
        for state in [
            StateType::Created,
            StateType::Running,
            StateType::Paused,
            StateType::Retrying,
            StateType::Success,
            StateType::Warning,
            StateType::Failed,
            StateType::Killed,
        ] {
            let count = states.iter().filter(|s| **s == state).count();
            if count > 0 {
                iterations.insert(state.to_string(), serde_json::json!(count));
            }
        }
        iterations.insert("max".to_string(), serde_json::json!(total));

        let mut outputs = serde_json::Map::new();
        outputs.insert(
            "iterations".to_string(),
            serde_json::Value::Object(iterations),
        );
        let run = parent_run.with_outputs(outputs);

        let terminated = states.iter().filter(|s| s.is_terminated()).count() as u32;
        if terminated >= total {
            let state = if !transmit_failed {
                StateType::Success
            } else if states.contains(&StateType::Killed) {
                StateType::Killed
            } else if states.contains(&StateType::Failed) {
                StateType::Failed
            } else if states.contains(&StateType::Warning) {
                StateType::Warning
            } else {
                StateType::Success
            };
            WorkerTaskResult::new(run.with_state(state))
        } else {
            WorkerTaskResult::new(run)
        }
    }
}

/// Split items into batches by partitions, byte size or row count.
pub fn split_batches(
    items: &[serde_json::Value],
    batch: &BatchSpec,
) -> EngineResult<Vec<Vec<serde_json::Value>>> {
    if items.is_empty() {
        return Ok(Vec::new());
    }

    if let Some(partitions) = batch.partitions {
        if partitions == 0 {
            return Err(EngineError::Validation(
                "Batch partitions must be greater than zero".to_string(),
            ));
        }
        let size = items.len().div_ceil(partitions);
        return Ok(items.chunks(size).map(|chunk| chunk.to_vec()).collect());
    }

    if let Some(max_bytes) = batch.bytes {
        let mut batches = Vec::new();
        let mut current: Vec<serde_json::Value> = Vec::new();
        let mut current_bytes = 0usize;
        for item in items {
            let size = serde_json::to_string(item)?.len();
            if !current.is_empty() && current_bytes + size > max_bytes {
                batches.push(std::mem::take(&mut current));
                current_bytes = 0;
            }
            current_bytes += size;
            current.push(item.clone());
        }
        if !current.is_empty() {
            batches.push(current);
        }
        return Ok(batches);
    }

    if batch.rows == 0 {
        return Err(EngineError::Validation(
            "Batch rows must be greater than zero".to_string(),
        ));
    }
    Ok(items.chunks(batch.rows).map(|chunk| chunk.to_vec()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::State;

    fn items(n: usize) -> Vec<serde_json::Value> {
        (0..n).map(|i| serde_json::json!(i)).collect()
    }

    fn parent_run() -> TaskRun {
        TaskRun {
            id: "parent-run".to_string(),
            execution_id: "parent-exec".to_string(),
            task_id: "scatter".to_string(),
            parent_task_run_id: None,
            value: None,
            iteration: None,
            state: State::new(StateType::Created).with_state(StateType::Running),
            outputs: serde_json::Map::new(),
            attempt: 0,
        }
    }

    #[test]
    fn test_split_by_rows() {
        let batches = split_batches(
            &items(7),
            &BatchSpec {
                rows: 3,
                bytes: None,
                partitions: None,
            },
        )
        .unwrap();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 3);
        assert_eq!(batches[2].len(), 1);
    }

    #[test]
    fn test_split_by_partitions() {
        let batches = split_batches(
            &items(10),
            &BatchSpec {
                rows: 1,
                bytes: None,
                partitions: Some(4),
            },
        )
        .unwrap();
        assert_eq!(batches.len(), 4);
        assert_eq!(batches.iter().map(Vec::len).sum::<usize>(), 10);
    }

    #[test]
    fn test_split_by_bytes_keeps_every_item() {
        let batches = split_batches(
            &items(6),
            &BatchSpec {
                rows: 1,
                bytes: Some(2),
                partitions: None,
            },
        )
        .unwrap();
        assert_eq!(batches.iter().map(Vec::len).sum::<usize>(), 6);
        // every item alone is already at the cap
        assert_eq!(batches.len(), 6);
    }

    #[test]
    fn test_split_empty_is_empty() {
        let batches = split_batches(&[], &BatchSpec::default()).unwrap();
        assert!(batches.is_empty());
    }

    #[test]
    fn test_iterations_counter_while_in_flight() {
        let result = SubflowCoordinator::iterations_result(
            &parent_run(),
            &[StateType::Success, StateType::Running],
            3,
            true,
        );
        let run = result.task_run;
        // still waiting for the third batch
        assert_eq!(run.state.current, StateType::Running);
        let iterations = run.outputs.get("iterations").unwrap();
        assert_eq!(iterations.get("SUCCESS"), Some(&serde_json::json!(1)));
        assert_eq!(iterations.get("RUNNING"), Some(&serde_json::json!(1)));
        assert_eq!(iterations.get("max"), Some(&serde_json::json!(3)));
    }

    #[test]
    fn test_iterations_final_state_transmits_failure() {
        let states = [StateType::Success, StateType::Failed, StateType::Success];
        let result = SubflowCoordinator::iterations_result(&parent_run(), &states, 3, true);
        assert_eq!(result.task_run.state.current, StateType::Failed);

        let result = SubflowCoordinator::iterations_result(&parent_run(), &states, 3, false);
        assert_eq!(result.task_run.state.current, StateType::Success);
    }

    #[test]
    fn test_subflow_result_waits_for_terminal_child() {
        let link = SubflowLink {
            parent_execution_id: "parent-exec".to_string(),
            parent_task_run_id: "parent-run".to_string(),
            child_execution_id: "child".to_string(),
            batch_index: None,
            batch_total: None,
            wait: true,
            transmit_failed: true,
            outputs_spec: serde_json::Map::new(),
        };
        let renderer = TemplateRenderer::new();

        let mut child = Execution::new("demo", "sub", 1, serde_json::Map::new());
        assert!(SubflowCoordinator::subflow_result(&link, &child, &parent_run(), &renderer)
            .is_none());

        child.transition(StateType::Running);
        child.transition(StateType::Failed);
        let result =
            SubflowCoordinator::subflow_result(&link, &child, &parent_run(), &renderer).unwrap();
        assert_eq!(result.task_run.state.current, StateType::Failed);
    }

    #[test]
    fn test_subflow_result_extracts_declared_outputs() {
        let mut outputs_spec = serde_json::Map::new();
        outputs_spec.insert(
            "report_uri".to_string(),
            serde_json::json!("{{ outputs.build.uri }}"),
        );
        let link = SubflowLink {
            parent_execution_id: "parent-exec".to_string(),
            parent_task_run_id: "parent-run".to_string(),
            child_execution_id: "child".to_string(),
            batch_index: None,
            batch_total: None,
            wait: true,
            transmit_failed: false,
            outputs_spec,
        };
        let renderer = TemplateRenderer::new();

        let mut child = Execution::new("demo", "sub", 1, serde_json::Map::new());
        let mut run = parent_run();
        run.execution_id = child.id.clone();
        run.task_id = "build".to_string();
        run.parent_task_run_id = None;
        run.outputs
            .insert("uri".to_string(), serde_json::json!("s3://bucket/report"));
        run.state = run.state.with_state(StateType::Success);
        child.task_runs.push(run);
        child.transition(StateType::Running);
        child.transition(StateType::Success);

        let result =
            SubflowCoordinator::subflow_result(&link, &child, &parent_run(), &renderer).unwrap();
        assert_eq!(result.task_run.state.current, StateType::Success);
        let extracted = result.task_run.outputs.get("outputs").unwrap();
        assert_eq!(
            extracted.get("report_uri"),
            Some(&serde_json::json!("s3://bucket/report"))
        );
    }
}
