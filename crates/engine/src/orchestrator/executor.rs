//! One event-processing transaction over a locked execution.
//!
//! The [`Executor`] runs the whole resolution pipeline synchronously while
//! the per-execution lock is held: end detection, root and child next-task
//! resolution, composite state resolution, pause expiry, listeners, worker
//! job collection and executable-task handoff. Side effects are collected
//! and emitted by the orchestrator after the pair is persisted.

use chrono::Utc;

use crate::error::EngineResult;
use crate::execution::{Execution, NextTaskRun, StateType, TaskRun};
use crate::flow::{Flow, TaskKind};
use crate::queue::{WorkerJob, WorkerTaskResult};
use crate::resolver::{self, flow_control, RunContext};
use crate::subflow::SubflowRequest;
use crate::template::TemplateRenderer;

use super::dedup::DedupState;

/// Pipeline over one locked (Execution, DedupState) pair.
pub struct Executor<'a> {
    flow: &'a Flow,
    renderer: &'a TemplateRenderer,
    pub execution: &'a mut Execution,
    pub dedup: &'a mut DedupState,

    /// Worker jobs to dispatch, already deduplicated.
    pub worker_jobs: Vec<WorkerJob>,

    /// Task-run transitions to recirculate through the queue.
    pub task_results: Vec<WorkerTaskResult>,

    /// Executable tasks needing child executions.
    pub subflow_requests: Vec<SubflowRequest>,

    /// Flow-trigger evaluation fired this transaction.
    pub flow_trigger: bool,
}

impl<'a> Executor<'a> {
    pub fn new(
        flow: &'a Flow,
        renderer: &'a TemplateRenderer,
        execution: &'a mut Execution,
        dedup: &'a mut DedupState,
    ) -> Self {
        Self {
            flow,
            renderer,
            execution,
            dedup,
            worker_jobs: Vec::new(),
            task_results: Vec::new(),
            subflow_requests: Vec::new(),
            flow_trigger: false,
        }
    }

    /// Run the full pipeline once.
    pub fn process(&mut self) -> EngineResult<()> {
        // fully finished executions need no further processing
        if self.is_terminated_with_listeners() && self.dedup.flow_trigger_fired {
            return Ok(());
        }

        self.handle_end()?;
        self.handle_next()?;
        self.refresh_flowable_outputs();
        self.handle_child_next()?;
        self.handle_child_state();
        self.handle_pause_expiry();
        self.handle_listeners()?;
        self.handle_worker_jobs();
        self.handle_executable()?;
        self.handle_flow_trigger();

        Ok(())
    }

    /// Terminal, and every listener task run is terminal too.
    fn is_terminated_with_listeners(&self) -> bool {
        if !self.execution.state.is_terminated() {
            return false;
        }
        if self.flow.listeners.is_empty() {
            return true;
        }
        let listeners = flow_control::resolve_tasks(&self.flow.listeners, None);
        self.execution.is_terminated_for(&listeners, None)
    }

    /// Detect the end of the execution and set its final state.
    fn handle_end(&mut self) -> EngineResult<()> {
        if self.execution.state.is_terminated() || self.execution.state.is_paused() {
            return Ok(());
        }

        let final_state = {
            let execution = &*self.execution;
            let tasks = flow_control::resolve_tasks(&self.flow.tasks, None);
            let errors = flow_control::resolve_tasks(&self.flow.errors, None);
            match flow_control::resolve_state(execution, tasks, errors, None, false) {
                // never set a terminal state while a descendant is open
                Some(state) if !execution.has_non_terminal_task_run() => Some(state),
                _ => None,
            }
        };

        if let Some(state) = final_state {
            // a CREATED execution with no runs yet resolves no final state
            if self.execution.task_runs.is_empty() {
                return Ok(());
            }
            self.execution.transition(state);
            tracing::info!(
                namespace = %self.execution.namespace,
                flow_id = %self.execution.flow_id,
                execution_id = %self.execution.id,
                state = %state,
                "Flow completed"
            );
        }
        Ok(())
    }

    /// Root-level sequential resolution over the flow task list.
    fn handle_next(&mut self) -> EngineResult<()> {
        if self.execution.state.is_terminated() || self.execution.state.is_paused() {
            return Ok(());
        }

        let runs = {
            let execution = &*self.execution;
            let nexts = flow_control::resolve_sequential_nexts(
                execution,
                flow_control::resolve_tasks(&self.flow.tasks, None),
                flow_control::resolve_tasks(&self.flow.errors, None),
                None,
            );
            self.materialize(nexts)
        };

        if runs.is_empty() {
            return Ok(());
        }

        let appended = self.append_nexts(runs)?;
        if appended && self.execution.state.current == StateType::Created {
            self.execution.transition(StateType::Running);
            tracing::info!(
                namespace = %self.execution.namespace,
                flow_id = %self.execution.flow_id,
                execution_id = %self.execution.id,
                "Flow started"
            );
        }
        Ok(())
    }

    /// Keep flowable task run outputs current (WaitFor iteration counter;
    /// Switch/If selections read back their stored value and stay stable).
    fn refresh_flowable_outputs(&mut self) {
        let updates: Vec<(String, serde_json::Map<String, serde_json::Value>)> = {
            let execution = &*self.execution;
            let mut updates = Vec::new();
            for parent in execution
                .task_runs
                .iter()
                .filter(|r| r.state.current.is_running())
            {
                let Some(task) = self.flow.find_task(&parent.task_id) else {
                    continue;
                };
                if !task.is_flowable() {
                    continue;
                }
                let ctx = RunContext::new(self.renderer, self.flow, execution, Some(parent));
                match resolver::flowable_outputs(task, &ctx, parent) {
                    Ok(outputs) if !outputs.is_empty() => updates.push((parent.id.clone(), outputs)),
                    Ok(_) => {}
                    Err(e) => tracing::warn!(
                        execution_id = %execution.id,
                        task_id = %parent.task_id,
                        error = %e,
                        "Unable to compute outputs on task run"
                    ),
                }
            }
            updates
        };

        for (run_id, outputs) in updates {
            if let Some(run) = self.execution.find_task_run_mut(&run_id) {
                for (k, v) in outputs {
                    run.outputs.insert(k, v);
                }
            }
        }
    }

    /// Resolve next task runs for every running composite.
    fn handle_child_next(&mut self) -> EngineResult<()> {
        let runs = {
            let execution = &*self.execution;
            let mut collected = Vec::new();
            for parent in execution
                .task_runs
                .iter()
                .filter(|r| r.state.current.is_running())
            {
                let Some(task) = self.flow.find_task(&parent.task_id) else {
                    continue;
                };
                if !task.is_flowable() {
                    continue;
                }
                let ctx = RunContext::new(self.renderer, self.flow, execution, Some(parent));
                match resolver::resolve_nexts(task, &ctx, parent) {
                    Ok(nexts) => collected.extend(self.materialize(nexts)),
                    Err(e) => tracing::warn!(
                        execution_id = %execution.id,
                        task_id = %parent.task_id,
                        error = %e,
                        "Unable to resolve the next tasks to run"
                    ),
                }
            }
            collected
        };

        self.append_nexts(runs)?;
        Ok(())
    }

    /// Resolve aggregate state for every running composite; a resolution
    /// error fails the owning task run rather than the orchestrator.
    fn handle_child_state(&mut self) {
        let results: Vec<WorkerTaskResult> = {
            let execution = &*self.execution;
            let mut results = Vec::new();
            for parent in execution
                .task_runs
                .iter()
                .filter(|r| r.state.current.is_running())
            {
                let Some(task) = self.flow.find_task(&parent.task_id) else {
                    continue;
                };
                if !task.is_flowable() {
                    continue;
                }
                let ctx = RunContext::new(self.renderer, self.flow, execution, Some(parent));
                match resolver::resolve_state(task, &ctx, parent) {
                    Ok(Some(state)) => {
                        results.push(WorkerTaskResult::new(parent.with_state(state)));
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::error!(
                            execution_id = %execution.id,
                            task_id = %parent.task_id,
                            error = %e,
                            "Unable to resolve the state of a composite task"
                        );
                        results.push(WorkerTaskResult::new(parent.with_state(StateType::Failed)));
                    }
                }
            }
            results
        };

        self.task_results.extend(results);
    }

    /// Lazily re-check paused task runs against their delay/timeout.
    ///
    /// Wall-clock comparison on each visit; no timer threads.
    fn handle_pause_expiry(&mut self) {
        let now = Utc::now();
        let results: Vec<WorkerTaskResult> = {
            let execution = &*self.execution;
            let mut results = Vec::new();
            for run in execution
                .task_runs
                .iter()
                .filter(|r| r.state.current.is_paused())
            {
                let Some(task) = self.flow.find_task(&run.task_id) else {
                    continue;
                };
                let TaskKind::Pause(spec) = &task.kind else {
                    continue;
                };
                let Some(paused_at) = run.state.last_date_of(StateType::Paused) else {
                    continue;
                };
                let elapsed = (now - paused_at).num_milliseconds() as f64 / 1000.0;

                if let Some(delay) = spec.delay_seconds {
                    if elapsed >= delay {
                        results.push(WorkerTaskResult::new(run.with_state(StateType::Running)));
                        continue;
                    }
                }
                if let Some(timeout) = spec.timeout_seconds {
                    if elapsed >= timeout {
                        tracing::warn!(
                            execution_id = %execution.id,
                            task_id = %run.task_id,
                            "Pause timed out"
                        );
                        results.push(WorkerTaskResult::new(run.with_state(StateType::Failed)));
                    }
                }
            }
            results
        };

        self.task_results.extend(results);
    }

    /// Start listener tasks once the execution is terminal.
    fn handle_listeners(&mut self) -> EngineResult<()> {
        if !self.execution.state.is_terminated() || self.flow.listeners.is_empty() {
            return Ok(());
        }

        let runs = {
            let execution = &*self.execution;
            let nexts = flow_control::resolve_sequential_nexts(
                execution,
                flow_control::resolve_tasks(&self.flow.listeners, None),
                Vec::new(),
                None,
            );
            self.materialize(nexts)
        };

        self.append_nexts(runs)?;
        Ok(())
    }

    /// Collect worker jobs for created leaf runs, and start flowable runs.
    fn handle_worker_jobs(&mut self) {
        let mut jobs: Vec<WorkerJob> = Vec::new();
        let mut results: Vec<WorkerTaskResult> = Vec::new();
        {
            let execution = &*self.execution;
            for run in execution.task_runs.iter().filter(|r| {
                r.state.current.is_created() || r.state.current == StateType::Retrying
            }) {
                let Some(task) = self.flow.find_task(&run.task_id) else {
                    tracing::warn!(
                        execution_id = %execution.id,
                        task_id = %run.task_id,
                        "No declared task for task run"
                    );
                    continue;
                };
                match &task.kind {
                    TaskKind::Worker(spec) => jobs.push(WorkerJob {
                        execution_id: execution.id.clone(),
                        task_run: run.clone(),
                        worker_group: spec.worker_group.clone(),
                        config: spec.config.clone(),
                    }),
                    _ if task.is_flowable() => {
                        // composites start running immediately
                        results.push(WorkerTaskResult::new(run.with_state(StateType::Running)));
                    }
                    _ => {} // executables are handled separately
                }
            }
        }

        // dedup under the lock: re-delivery cannot double-dispatch
        let jobs: Vec<WorkerJob> = jobs
            .into_iter()
            .filter(|job| self.dedup.deduplicate_worker_job(&job.task_run))
            .collect();
        let results: Vec<WorkerTaskResult> = results
            .into_iter()
            .filter(|result| self.dedup.deduplicate_worker_job(&result.task_run))
            .collect();

        self.worker_jobs.extend(jobs);
        self.task_results.extend(results);
    }

    /// Hand executable (subflow) task runs to the coordinator; created runs
    /// are marked running first so they are not re-proposed.
    fn handle_executable(&mut self) -> EngineResult<()> {
        let pending: Vec<(TaskRun, crate::flow::Task, bool)> = {
            let execution = &*self.execution;
            execution
                .task_runs
                .iter()
                .filter(|r| r.state.current.is_created() || r.state.current.is_running())
                .filter_map(|run| {
                    let task = self.flow.find_task(&run.task_id)?;
                    task.is_executable().then(|| {
                        (run.clone(), task.clone(), run.state.current.is_created())
                    })
                })
                .collect()
        };

        for (run, task, created) in pending {
            let run = if created {
                let running = run.with_state(StateType::Running);
                self.execution.update_task_run(running.clone())?;
                running
            } else {
                run
            };
            self.subflow_requests.push(SubflowRequest { task_run: run, task });
        }
        Ok(())
    }

    /// One-shot flow-trigger evaluation once terminated with listeners.
    fn handle_flow_trigger(&mut self) {
        if self.is_terminated_with_listeners() && self.dedup.fire_flow_trigger() {
            self.flow_trigger = true;
        }
    }

    /// Turn proposed next task runs into concrete ones, storing flowable
    /// outputs (Switch/If selection, WaitFor counter) at creation time.
    fn materialize(&self, nexts: Vec<NextTaskRun<'_>>) -> Vec<TaskRun> {
        let mut runs = Vec::new();
        for next in nexts {
            let mut run = next.task_run;
            if next.task.is_flowable() {
                let ctx = RunContext::new(self.renderer, self.flow, &*self.execution, Some(&run));
                match resolver::flowable_outputs(next.task, &ctx, &run) {
                    Ok(outputs) => run = run.with_outputs(outputs),
                    Err(e) => tracing::warn!(
                        execution_id = %self.execution.id,
                        task_id = %run.task_id,
                        error = %e,
                        "Unable to save outputs on task run"
                    ),
                }
            }
            runs.push(run);
        }
        runs
    }

    /// Append proposals, honoring only the first per dedup key.
    fn append_nexts(&mut self, runs: Vec<TaskRun>) -> EngineResult<bool> {
        let mut appended = false;
        for run in runs {
            if !self.dedup.deduplicate_next(&run) {
                continue;
            }
            tracing::debug!(
                execution_id = %self.execution.id,
                task_id = %run.task_id,
                task_run_id = %run.id,
                value = ?run.value,
                "Next task run"
            );
            self.execution.add_task_run(run)?;
            appended = true;
        }
        Ok(appended)
    }
}
