pub mod config;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use config::PipelineConfig;
pub use error::{BackendError, Result, TroupeError};
pub use event::EventBus;
pub use types::*;
