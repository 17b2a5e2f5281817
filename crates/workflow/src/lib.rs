pub mod dag;
pub mod engine;

pub use dag::{topological_order, validate_graph};
pub use engine::{StepOptions, WorkflowEngine};
