//! Expression rendering for flow definitions.
//!
//! Switch/If conditions, ForEach value lists, WaitFor conditions and subflow
//! inputs are Jinja2-style expressions rendered against the execution
//! context.

mod jinja;

pub use jinja::TemplateRenderer;
