//! Rendering context for one (flow, execution, task run) triple.

use std::collections::HashMap;

use crate::error::EngineResult;
use crate::execution::{Execution, TaskRun};
use crate::flow::Flow;
use crate::template::TemplateRenderer;

/// Everything a resolver needs to render expressions: the flow definition,
/// the execution, and the owning task run (if any).
///
/// The renderer is passed in explicitly; resolvers never reach for global
/// state.
pub struct RunContext<'a> {
    renderer: &'a TemplateRenderer,
    pub flow: &'a Flow,
    pub execution: &'a Execution,
    pub task_run: Option<&'a TaskRun>,
}

impl<'a> RunContext<'a> {
    pub fn new(
        renderer: &'a TemplateRenderer,
        flow: &'a Flow,
        execution: &'a Execution,
        task_run: Option<&'a TaskRun>,
    ) -> Self {
        Self {
            renderer,
            flow,
            execution,
            task_run,
        }
    }

    pub fn render(&self, template: &str) -> EngineResult<String> {
        self.renderer.render(template, &self.variables())
    }

    pub fn render_to_value(&self, template: &str) -> EngineResult<serde_json::Value> {
        self.renderer.render_to_value(template, &self.variables())
    }

    /// Render every value of a map recursively.
    pub fn render_map(
        &self,
        map: &serde_json::Map<String, serde_json::Value>,
    ) -> EngineResult<serde_json::Map<String, serde_json::Value>> {
        let variables = self.variables();
        let mut result = serde_json::Map::new();
        for (k, v) in map {
            result.insert(k.clone(), self.renderer.render_value(v, &variables)?);
        }
        Ok(result)
    }

    pub fn evaluate_condition(&self, condition: &str) -> EngineResult<bool> {
        self.renderer.evaluate_condition(condition, &self.variables())
    }

    /// Build the variable map for template rendering.
    ///
    /// Exposes `inputs`, `vars`, `execution`, `outputs.<task_id>` (last
    /// write wins across iterations), `taskrun` and `parent.taskrun`.
    pub fn variables(&self) -> HashMap<String, serde_json::Value> {
        let mut context = HashMap::new();

        let mut inputs = self.flow.inputs.clone();
        for (k, v) in &self.execution.inputs {
            inputs.insert(k.clone(), v.clone());
        }
        context.insert("inputs".to_string(), serde_json::Value::Object(inputs));

        let mut vars = self.flow.variables.clone();
        for (k, v) in &self.execution.variables {
            vars.insert(k.clone(), v.clone());
        }
        context.insert("vars".to_string(), serde_json::Value::Object(vars));

        context.insert(
            "execution".to_string(),
            serde_json::json!({
                "id": self.execution.id,
                "namespace": self.execution.namespace,
                "flow_id": self.execution.flow_id,
            }),
        );

        let mut outputs = serde_json::Map::new();
        for run in &self.execution.task_runs {
            if !run.outputs.is_empty() {
                outputs.insert(
                    run.task_id.clone(),
                    serde_json::Value::Object(run.outputs.clone()),
                );
            }
        }
        context.insert("outputs".to_string(), serde_json::Value::Object(outputs));

        if let Some(run) = self.task_run {
            context.insert(
                "taskrun".to_string(),
                serde_json::json!({
                    "id": run.id,
                    "task_id": run.task_id,
                    "value": run.value,
                    "iteration": run.iteration,
                    "attempt": run.attempt,
                }),
            );

            if let Some(parent_id) = &run.parent_task_run_id {
                if let Some(parent) = self.execution.find_task_run(parent_id) {
                    context.insert(
                        "parent".to_string(),
                        serde_json::json!({
                            "taskrun": {
                                "id": parent.id,
                                "value": self.nearest_value(parent),
                                "iteration": parent.iteration,
                            }
                        }),
                    );
                }
            }
        }

        context
    }

    /// The iteration value of the given run, or of its nearest ancestor
    /// carrying one.
    fn nearest_value(&self, run: &TaskRun) -> Option<String> {
        let mut current = Some(run);
        while let Some(run) = current {
            if run.value.is_some() {
                return run.value.clone();
            }
            current = run
                .parent_task_run_id
                .as_deref()
                .and_then(|id| self.execution.find_task_run(id));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{ResolvedTask, StateType};
    use crate::flow::{Task, TaskKind, WorkerSpec};

    fn worker_task(id: &str) -> Task {
        Task {
            id: id.to_string(),
            kind: TaskKind::Worker(WorkerSpec::default()),
        }
    }

    fn flow_with(tasks: Vec<Task>) -> Flow {
        Flow {
            namespace: "demo".to_string(),
            id: "ctx".to_string(),
            revision: 1,
            labels: Default::default(),
            inputs: serde_json::Map::new(),
            variables: serde_json::Map::new(),
            tasks,
            errors: Vec::new(),
            listeners: Vec::new(),
        }
    }

    #[test]
    fn test_outputs_are_exposed_by_task_id() {
        let task = worker_task("probe");
        let flow = flow_with(vec![task.clone()]);
        let mut execution = Execution::new("demo", "ctx", 1, serde_json::Map::new());

        let mut run = ResolvedTask::new(&task, None)
            .to_next_task_run(&execution)
            .task_run;
        run.state = run.state.with_state(StateType::Success);
        run.outputs
            .insert("status".to_string(), serde_json::json!(200));
        execution.add_task_run(run).unwrap();

        let renderer = TemplateRenderer::new();
        let ctx = RunContext::new(&renderer, &flow, &execution, None);

        assert_eq!(ctx.render("{{ outputs.probe.status }}").unwrap(), "200");
    }

    #[test]
    fn test_parent_value_resolves_through_ancestors() {
        let each = worker_task("each");
        let child = worker_task("child");
        let flow = flow_with(vec![each.clone(), child.clone()]);
        let mut execution = Execution::new("demo", "ctx", 1, serde_json::Map::new());

        let each_run = ResolvedTask::new(&each, None)
            .with_value("item-1".to_string())
            .to_next_task_run(&execution)
            .task_run;
        let each_id = each_run.id.clone();
        execution.add_task_run(each_run).unwrap();

        let mut child_run = ResolvedTask::new(&child, None)
            .to_next_task_run(&execution)
            .task_run;
        child_run.parent_task_run_id = Some(each_id);
        let child_id = child_run.id.clone();
        execution.add_task_run(child_run).unwrap();

        let renderer = TemplateRenderer::new();
        let run = execution.find_task_run(&child_id).unwrap();
        let ctx = RunContext::new(&renderer, &flow, &execution, Some(run));

        assert_eq!(
            ctx.render("{{ parent.taskrun.value }}").unwrap(),
            "item-1"
        );
    }

    #[test]
    fn test_execution_inputs_override_flow_defaults() {
        let task = worker_task("t");
        let mut flow = flow_with(vec![task]);
        flow.inputs
            .insert("mode".to_string(), serde_json::json!("default"));

        let mut inputs = serde_json::Map::new();
        inputs.insert("mode".to_string(), serde_json::json!("override"));
        let execution = Execution::new("demo", "ctx", 1, inputs);

        let renderer = TemplateRenderer::new();
        let ctx = RunContext::new(&renderer, &flow, &execution, None);
        assert_eq!(ctx.render("{{ inputs.mode }}").unwrap(), "override");
    }
}
