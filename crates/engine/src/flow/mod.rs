//! Declarative flow definitions.
//!
//! A flow is a read-only tree of tasks consumed by the resolver. Definitions
//! are declared in YAML and validated on registration.

mod dag;
mod types;

pub use dag::validate_dag;
pub use types::{
    AllowFailureSpec, BatchSpec, DagEntry, DagSpec, Flow, ForEachItemSpec, ForEachSpec, IfSpec,
    ParallelSpec, PauseSpec, SequentialSpec, SubflowSpec, SwitchSpec, Task, TaskKind, WaitForSpec,
    WorkerSpec,
};
