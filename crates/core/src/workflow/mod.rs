pub mod dag;
pub mod executor;
pub mod partition;

pub use dag::build_dag;
pub use executor::{WorkflowExecutor, WorkflowExecutorConfig};
