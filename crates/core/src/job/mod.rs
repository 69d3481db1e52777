pub mod registry;
pub mod runtime;

pub use registry::{HandlerRegistry, JobHandler};
pub use runtime::{JobRunContext, JobRuntime, JobRuntimeConfig};
