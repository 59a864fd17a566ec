use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TroupeError;

/// Placeholder expanded into agent and task text before a run.
pub const TOPIC_PLACEHOLDER: &str = "{topic}";

/// An agent definition: persona plus resource limits.
///
/// Immutable once the pipeline graph is built; many tasks may share one agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentSpec {
    pub id: String,
    pub role: String,
    pub goal: String,
    #[serde(default)]
    pub backstory: String,
    /// Tool names this agent may call during generation.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Backend invocations allowed per run.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Backend invocations allowed per one-minute window.
    #[serde(default = "default_max_calls_per_minute")]
    pub max_calls_per_minute: u32,
    /// Retries per invocation on transient backend errors.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_iterations() -> u32 { 25 }
fn default_max_calls_per_minute() -> u32 { 30 }
fn default_max_retries() -> u32 { 2 }

impl AgentSpec {
    pub fn new(id: impl Into<String>, role: impl Into<String>, goal: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: role.into(),
            goal: goal.into(),
            backstory: String::new(),
            capabilities: Vec::new(),
            max_iterations: default_max_iterations(),
            max_calls_per_minute: default_max_calls_per_minute(),
            max_retries: default_max_retries(),
        }
    }

    pub fn with_backstory(mut self, backstory: impl Into<String>) -> Self {
        self.backstory = backstory.into();
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_max_calls_per_minute(mut self, max_calls_per_minute: u32) -> Self {
        self.max_calls_per_minute = max_calls_per_minute;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Expand `{topic}` in the persona fields.
    pub fn apply_topic(&mut self, topic: &str) {
        self.goal = self.goal.replace(TOPIC_PLACEHOLDER, topic);
        self.backstory = self.backstory.replace(TOPIC_PLACEHOLDER, topic);
    }

    pub fn needs_topic(&self) -> bool {
        self.goal.contains(TOPIC_PLACEHOLDER) || self.backstory.contains(TOPIC_PLACEHOLDER)
    }
}

/// A unit of work bound to one agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSpec {
    pub id: String,
    pub description: String,
    /// Id of the agent that executes this task.
    pub agent: String,
    /// Upstream task ids whose outputs feed this task's context, in order.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Prompt-only hint describing the desired output shape.
    #[serde(default)]
    pub expected_output: Option<String>,
}

impl TaskSpec {
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        agent: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            agent: agent.into(),
            depends_on: Vec::new(),
            expected_output: None,
        }
    }

    pub fn with_depends_on(mut self, depends_on: Vec<String>) -> Self {
        self.depends_on = depends_on;
        self
    }

    pub fn with_expected_output(mut self, expected_output: impl Into<String>) -> Self {
        self.expected_output = Some(expected_output.into());
        self
    }

    /// Expand `{topic}` in the prompt fields.
    pub fn apply_topic(&mut self, topic: &str) {
        self.description = self.description.replace(TOPIC_PLACEHOLDER, topic);
        if let Some(ref mut hint) = self.expected_output {
            *hint = hint.replace(TOPIC_PLACEHOLDER, topic);
        }
    }

    pub fn needs_topic(&self) -> bool {
        self.description.contains(TOPIC_PLACEHOLDER)
            || self
                .expected_output
                .as_deref()
                .is_some_and(|h| h.contains(TOPIC_PLACEHOLDER))
    }
}

/// Lifecycle of a task within one run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting on at least one dependency.
    Pending,
    /// All dependencies succeeded; eligible to run.
    Ready,
    Running,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Why a task ended in `Failed`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskFailure {
    /// Fatal backend error, not retried.
    Backend { message: String },
    /// Transient errors persisted past the retry limit.
    RetriesExhausted { attempts: u32, last: String },
    /// The agent's per-run invocation budget ran out.
    IterationBudget { limit: u32 },
    /// A dependency (direct or transitive) failed; this task never ran.
    Upstream { failed_task: String },
    Cancelled,
}

impl TaskFailure {
    /// Record an execution error as a per-task failure reason.
    pub fn from_error(err: &TroupeError) -> Self {
        match err {
            TroupeError::IterationBudgetExceeded { limit, .. } => {
                Self::IterationBudget { limit: *limit }
            }
            TroupeError::RetriesExhausted { attempts, last } => Self::RetriesExhausted {
                attempts: *attempts,
                last: last.clone(),
            },
            TroupeError::Cancelled => Self::Cancelled,
            other => Self::Backend {
                message: other.to_string(),
            },
        }
    }
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Backend { message } => write!(f, "{}", message),
            Self::RetriesExhausted { attempts, last } => {
                write!(f, "retries exhausted after {} attempts: {}", attempts, last)
            }
            Self::IterationBudget { limit } => {
                write!(f, "iteration budget exhausted (limit {})", limit)
            }
            Self::Upstream { failed_task } => {
                write!(f, "upstream task {} failed", failed_task)
            }
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Final record for one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: String,
    pub agent_id: String,
    /// Set only on success, then immutable.
    pub output: Option<String>,
    pub failure: Option<TaskFailure>,
    pub elapsed_ms: u64,
}

impl TaskOutcome {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}

/// Run verdict across all tasks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Succeeded,
    PartialFailure,
    Failed,
}

impl std::fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::PartialFailure => write!(f, "partial failure"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// What a pipeline run returns. Produced for every run, including failed ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub overall: OverallStatus,
    /// Terminal-task outputs concatenated in declaration order.
    pub final_output: String,
    /// One entry per task, in declaration order.
    pub outcomes: Vec<TaskOutcome>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_elapsed_ms: u64,
}

impl PipelineResult {
    pub fn succeeded(&self) -> bool {
        self.overall == OverallStatus::Succeeded
    }

    /// Output of a single task, if it succeeded.
    pub fn output_of(&self, task_id: &str) -> Option<&str> {
        self.outcomes
            .iter()
            .find(|o| o.task_id == task_id)
            .and_then(|o| o.output.as_deref())
    }

    pub fn outcome_of(&self, task_id: &str) -> Option<&TaskOutcome> {
        self.outcomes.iter().find(|o| o.task_id == task_id)
    }
}

/// One governed backend invocation on behalf of an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub agent_id: String,
    /// System framing built from the agent's persona.
    pub system: String,
    /// Task prompt including upstream context.
    pub prompt: String,
    /// Tools the agent may call; execution happens inside the backend.
    pub tools: Vec<ToolDefinition>,
}

/// Result of a tool execution.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// Tool definition for sending to the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Pipeline event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// Run started.
    RunStarted { tasks: usize },
    /// A task entered Running.
    TaskStarted { task: String, agent: String },
    /// A task succeeded.
    TaskCompleted { task: String, elapsed_ms: u64 },
    /// A task failed during execution.
    TaskFailed { task: String, reason: String },
    /// A task was failed without running because an upstream task failed.
    TaskSkipped { task: String, failed_upstream: String },
    /// An agent hit its rate window; the call is delayed, not dropped.
    RateLimited { agent: String, wait_ms: u64 },
    /// A transient backend error triggered a retry.
    RetryScheduled { agent: String, attempt: u32, backoff_ms: u64 },
    /// Run finished; a result is always available.
    RunComplete { overall: OverallStatus, elapsed_ms: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_topic_expands_all_prompt_fields() {
        let mut agent = AgentSpec::new("r", "Analyst", "Research {topic} trends")
            .with_backstory("You study {topic}.");
        agent.apply_topic("Rust");
        assert_eq!(agent.goal, "Research Rust trends");
        assert_eq!(agent.backstory, "You study Rust.");
        assert!(!agent.needs_topic());

        let mut task = TaskSpec::new("t", "Summarize {topic}", "r")
            .with_expected_output("Bullets about {topic}");
        assert!(task.needs_topic());
        task.apply_topic("Rust");
        assert_eq!(task.description, "Summarize Rust");
        assert_eq!(task.expected_output.as_deref(), Some("Bullets about Rust"));
    }

    #[test]
    fn test_task_failure_from_error() {
        let err = TroupeError::RetriesExhausted {
            attempts: 3,
            last: "HTTP 503".into(),
        };
        assert_eq!(
            TaskFailure::from_error(&err),
            TaskFailure::RetriesExhausted {
                attempts: 3,
                last: "HTTP 503".into()
            }
        );

        let err = TroupeError::IterationBudgetExceeded {
            agent: "r".into(),
            limit: 5,
        };
        assert_eq!(
            TaskFailure::from_error(&err),
            TaskFailure::IterationBudget { limit: 5 }
        );
    }

    #[test]
    fn test_agent_spec_defaults() {
        let agent = AgentSpec::new("r", "Analyst", "goal");
        assert_eq!(agent.max_iterations, 25);
        assert_eq!(agent.max_calls_per_minute, 30);
        assert_eq!(agent.max_retries, 2);
        assert!(agent.capabilities.is_empty());
    }
}
