mod aggregate;
pub mod executor;
pub mod governor;
pub mod graph;
pub mod prompt;

pub use executor::Executor;
pub use governor::Governor;
pub use graph::{PipelineGraph, TaskNode};
