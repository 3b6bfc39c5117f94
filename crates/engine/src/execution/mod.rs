//! Runtime representation of a running workflow instance.
//!
//! An [`Execution`] is one running instance of a flow definition; it owns an
//! ordered list of [`TaskRun`]s forming a tree via `parent_task_run_id`.
//! State transitions are recorded in append-only [`State`] histories.

mod execution;
mod state;
mod task_run;

pub use execution::Execution;
pub use state::{State, StateHistory, StateType};
pub use task_run::{NextTaskRun, ResolvedTask, TaskRun};
