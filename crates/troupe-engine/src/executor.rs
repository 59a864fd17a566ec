//! Pipeline execution.
//!
//! [`Executor::run`] drives a validated [`PipelineGraph`] to completion
//! and always returns a [`PipelineResult`], even when every task fails.
//! Sequential mode walks the topological order one task at a time;
//! concurrent mode runs every ready task up to a permit limit and lets
//! completion order emerge from the graph shape.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use troupe_core::config::{RunConfig, RunMode};
use troupe_core::error::{Result, TroupeError};
use troupe_core::event::EventBus;
use troupe_core::traits::GenerationBackend;
use troupe_core::types::{
    GenerationRequest, PipelineEvent, PipelineResult, TaskFailure, TaskStatus, ToolDefinition,
};

use crate::aggregate;
use crate::governor::Governor;
use crate::graph::PipelineGraph;
use crate::prompt;

/// Mutable per-task record for one run.
#[derive(Debug, Clone)]
pub(crate) struct TaskState {
    pub(crate) status: TaskStatus,
    pub(crate) output: Option<String>,
    pub(crate) failure: Option<TaskFailure>,
    pub(crate) elapsed_ms: u64,
}

pub struct Executor {
    graph: Arc<PipelineGraph>,
    backend: Arc<dyn GenerationBackend>,
    governor: Arc<Governor>,
    run: RunConfig,
    events: Arc<EventBus>,
    cancel: CancellationToken,
    tool_defs: HashMap<String, Vec<ToolDefinition>>,
}

impl Executor {
    pub fn new(
        graph: PipelineGraph,
        backend: Arc<dyn GenerationBackend>,
        run: RunConfig,
        events: Arc<EventBus>,
    ) -> Self {
        let governor = Arc::new(Governor::new(
            graph.agents().iter().cloned(),
            &run,
            events.clone(),
        ));
        Self {
            graph: Arc::new(graph),
            backend,
            governor,
            run,
            events,
            cancel: CancellationToken::new(),
            tool_defs: HashMap::new(),
        }
    }

    /// Tool definitions per agent id, resolved from each agent's
    /// capability list. Agents without an entry run with no tools.
    pub fn with_tool_definitions(
        mut self,
        tool_defs: HashMap<String, Vec<ToolDefinition>>,
    ) -> Self {
        self.tool_defs = tool_defs;
        self
    }

    /// Token that aborts the run when cancelled. Clone it before calling
    /// [`Executor::run`].
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn graph(&self) -> &PipelineGraph {
        &self.graph
    }

    /// Execute the pipeline to completion. Never fails: task errors are
    /// recorded per task and folded into the overall status.
    pub async fn run(&self) -> PipelineResult {
        let started_at = Utc::now();
        let run_start = Instant::now();

        info!(
            tasks = self.graph.len(),
            mode = ?self.run.mode,
            "Pipeline run started"
        );
        self.events.publish(PipelineEvent::RunStarted {
            tasks: self.graph.len(),
        });

        let mut states: Vec<TaskState> = self
            .graph
            .tasks()
            .iter()
            .map(|node| TaskState {
                status: if node.deps.is_empty() {
                    TaskStatus::Ready
                } else {
                    TaskStatus::Pending
                },
                output: None,
                failure: None,
                elapsed_ms: 0,
            })
            .collect();

        match self.run.mode {
            RunMode::Sequential => self.run_sequential(&mut states).await,
            RunMode::Concurrent => self.run_concurrent(&mut states).await,
        }

        if self.cancel.is_cancelled() {
            mark_unfinished(&mut states, TaskFailure::Cancelled);
        } else {
            // Only reachable if an execution task panicked.
            mark_unfinished(
                &mut states,
                TaskFailure::Backend {
                    message: "task aborted before completion".to_string(),
                },
            );
        }

        let result = aggregate::collect(&self.graph, &states, started_at, run_start.elapsed());
        self.events.publish(PipelineEvent::RunComplete {
            overall: result.overall,
            elapsed_ms: result.total_elapsed_ms,
        });
        info!(
            status = %result.overall,
            elapsed_ms = result.total_elapsed_ms,
            "Pipeline run complete"
        );
        result
    }

    /// One task at a time, in topological order. Ties in readiness fall
    /// back to declaration order, so reruns of the same pipeline visit
    /// tasks identically.
    async fn run_sequential(&self, states: &mut [TaskState]) {
        for &idx in self.graph.topo_order() {
            if self.cancel.is_cancelled() {
                break;
            }
            // Anything not Ready here was failed by upstream propagation.
            if states[idx].status != TaskStatus::Ready {
                continue;
            }

            states[idx].status = TaskStatus::Running;
            let request = self.build_request(idx, states);
            self.publish_started(idx);

            let agent_id = self.graph.task(idx).agent.id.clone();
            let task_start = Instant::now();
            let result = tokio::select! {
                result = self.governor.execute(&agent_id, &self.backend, request) => result,
                _ = self.cancel.cancelled() => Err(TroupeError::Cancelled),
            };
            let elapsed_ms = task_start.elapsed().as_millis() as u64;
            self.apply_outcome(idx, result, elapsed_ms, states);
        }
    }

    /// Claim every ready task a permit allows, then apply completions as
    /// they land. The semaphore caps in-flight tasks; the governor still
    /// serializes tasks that share an agent.
    async fn run_concurrent(&self, states: &mut [TaskState]) {
        let permits = self.run.max_concurrent_tasks.max(1);
        let semaphore = Arc::new(Semaphore::new(permits));
        let mut join_set: JoinSet<(usize, Result<String>, u64)> = JoinSet::new();

        loop {
            if self.cancel.is_cancelled() {
                join_set.abort_all();
                break;
            }

            for idx in 0..states.len() {
                if states[idx].status != TaskStatus::Ready {
                    continue;
                }
                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => break,
                };

                states[idx].status = TaskStatus::Running;
                let request = self.build_request(idx, states);
                self.publish_started(idx);

                let governor = self.governor.clone();
                let backend = self.backend.clone();
                let cancel = self.cancel.clone();
                join_set.spawn(async move {
                    let _permit = permit;
                    let agent_id = request.agent_id.clone();
                    let task_start = Instant::now();
                    let result = tokio::select! {
                        result = governor.execute(&agent_id, &backend, request) => result,
                        _ = cancel.cancelled() => Err(TroupeError::Cancelled),
                    };
                    (idx, result, task_start.elapsed().as_millis() as u64)
                });
            }

            if join_set.is_empty() {
                break;
            }

            match join_set.join_next().await {
                Some(Ok((idx, result, elapsed_ms))) => {
                    self.apply_outcome(idx, result, elapsed_ms, states);
                }
                Some(Err(join_err)) => {
                    error!(error = %join_err, "Task execution aborted");
                }
                None => break,
            }
        }
    }

    /// Assemble the governed request: persona framing, dependency
    /// context in `depends_on` order, and the agent's tool definitions.
    fn build_request(&self, idx: usize, states: &[TaskState]) -> GenerationRequest {
        let node = self.graph.task(idx);
        let mut sections = Vec::with_capacity(node.deps.len());
        for &dep_idx in &node.deps {
            let dep = self.graph.task(dep_idx);
            // Every dependency has succeeded by the time a task is claimed.
            let output = states[dep_idx].output.as_deref().unwrap_or("");
            sections.push(prompt::ContextSection {
                task_id: &dep.spec.id,
                description: &dep.spec.description,
                output,
            });
        }

        GenerationRequest {
            agent_id: node.agent.id.clone(),
            system: prompt::system_framing(&node.agent),
            prompt: prompt::task_prompt(
                &node.spec.description,
                node.spec.expected_output.as_deref(),
                &sections,
            ),
            tools: self
                .tool_defs
                .get(&node.agent.id)
                .cloned()
                .unwrap_or_default(),
        }
    }

    fn publish_started(&self, idx: usize) {
        let node = self.graph.task(idx);
        info!(task = %node.spec.id, agent = %node.agent.id, "Task started");
        self.events.publish(PipelineEvent::TaskStarted {
            task: node.spec.id.clone(),
            agent: node.agent.id.clone(),
        });
    }

    fn apply_outcome(
        &self,
        idx: usize,
        result: Result<String>,
        elapsed_ms: u64,
        states: &mut [TaskState],
    ) {
        let task_id = &self.graph.task(idx).spec.id;
        states[idx].elapsed_ms = elapsed_ms;
        match result {
            Ok(output) => {
                states[idx].status = TaskStatus::Succeeded;
                states[idx].output = Some(output);
                info!(task = %task_id, elapsed_ms, "Task completed");
                self.events.publish(PipelineEvent::TaskCompleted {
                    task: task_id.clone(),
                    elapsed_ms,
                });
                self.mark_ready_dependents(idx, states);
            }
            Err(err) => {
                let failure = TaskFailure::from_error(&err);
                warn!(task = %task_id, error = %err, "Task failed");
                self.events.publish(PipelineEvent::TaskFailed {
                    task: task_id.clone(),
                    reason: failure.to_string(),
                });
                states[idx].status = TaskStatus::Failed;
                states[idx].failure = Some(failure);
                self.propagate_upstream_failure(idx, states);
            }
        }
    }

    /// Promote dependents whose dependencies have all succeeded.
    fn mark_ready_dependents(&self, idx: usize, states: &mut [TaskState]) {
        for &dependent in self.graph.dependents_of(idx) {
            if states[dependent].status != TaskStatus::Pending {
                continue;
            }
            let ready = self
                .graph
                .task(dependent)
                .deps
                .iter()
                .all(|&dep| states[dep].status == TaskStatus::Succeeded);
            if ready {
                states[dependent].status = TaskStatus::Ready;
            }
        }
    }

    /// Fail every transitive dependent of `failed_idx` without running
    /// it, naming the task that originally failed. A task that already
    /// carries a failure keeps its first root.
    fn propagate_upstream_failure(&self, failed_idx: usize, states: &mut [TaskState]) {
        let root = self.graph.task(failed_idx).spec.id.clone();
        let mut stack: Vec<usize> = self.graph.dependents_of(failed_idx).to_vec();
        while let Some(idx) = stack.pop() {
            if !matches!(states[idx].status, TaskStatus::Pending | TaskStatus::Ready) {
                continue;
            }
            states[idx].status = TaskStatus::Failed;
            states[idx].failure = Some(TaskFailure::Upstream {
                failed_task: root.clone(),
            });
            let task_id = &self.graph.task(idx).spec.id;
            info!(task = %task_id, failed_upstream = %root, "Task skipped, upstream failure");
            self.events.publish(PipelineEvent::TaskSkipped {
                task: task_id.clone(),
                failed_upstream: root.clone(),
            });
            stack.extend_from_slice(self.graph.dependents_of(idx));
        }
    }
}

fn mark_unfinished(states: &mut [TaskState], failure: TaskFailure) {
    for state in states.iter_mut() {
        if !state.status.is_terminal() {
            state.status = TaskStatus::Failed;
            state.failure = Some(failure.clone());
        }
    }
}
