use thiserror::Error;

/// A generation backend failure, split by whether retrying can help.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BackendError {
    /// Rate limits, server errors, timeouts. Safe to retry.
    #[error("Transient backend error: {0}")]
    Transient(String),

    /// Auth failures, malformed requests, unknown models. Retrying cannot help.
    #[error("Fatal backend error: {0}")]
    Fatal(String),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transient(m) | Self::Fatal(m) => m,
        }
    }
}

#[derive(Debug, Error)]
pub enum TroupeError {
    // Graph validation errors
    #[error("Duplicate agent id: {0}")]
    DuplicateAgent(String),

    #[error("Duplicate task id: {0}")]
    DuplicateTask(String),

    #[error("Task {task} references unknown agent: {agent}")]
    UnknownAgent { task: String, agent: String },

    #[error("Task {task} depends on unknown task: {dependency}")]
    UnknownDependency { task: String, dependency: String },

    #[error("Dependency cycle: {}", .members.join(" -> "))]
    DependencyCycle { members: Vec<String> },

    // Governor errors
    #[error("Agent {agent} exhausted its iteration budget ({limit})")]
    IterationBudgetExceeded { agent: String, limit: u32 },

    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    // Backend errors
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("Backend provider not supported: {0}")]
    UnsupportedProvider(String),

    // Tool errors
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Tool timeout after {timeout_secs}s: {tool}")]
    ToolTimeout { tool: String, timeout_secs: u64 },

    #[error("Tool input validation failed: {0}")]
    ToolValidation(String),

    // Run control
    #[error("Run cancelled")]
    Cancelled,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TroupeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_error_names_members() {
        let err = TroupeError::DependencyCycle {
            members: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Dependency cycle: a -> b -> a");
    }

    #[test]
    fn test_backend_error_classification() {
        assert!(BackendError::Transient("HTTP 429".into()).is_transient());
        assert!(!BackendError::Fatal("HTTP 401".into()).is_transient());
    }
}
