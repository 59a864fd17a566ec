//! Per-agent call governance.
//!
//! Every backend invocation flows through [`Governor::execute`], which
//! enforces three independent limits declared on the agent:
//!
//! - an iteration budget over the whole run (fail fast when spent),
//! - a fixed one-minute rate window (full window delays the call, never
//!   drops it),
//! - bounded retries with exponential backoff, applied to transient
//!   backend errors only.
//!
//! An optional run-wide rate window caps the pipeline's total call rate
//! across all agents on top of the per-agent windows.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use troupe_core::config::RunConfig;
use troupe_core::error::{BackendError, Result, TroupeError};
use troupe_core::event::EventBus;
use troupe_core::traits::GenerationBackend;
use troupe_core::types::{AgentSpec, GenerationRequest, PipelineEvent};

const RATE_WINDOW: Duration = Duration::from_secs(60);

struct AgentBudget {
    iterations_used: u32,
    window_start: Instant,
    calls_in_window: u32,
}

struct AgentSlot {
    spec: Arc<AgentSpec>,
    budget: Mutex<AgentBudget>,
}

struct RateWindow {
    window_start: Instant,
    calls_in_window: u32,
}

pub struct Governor {
    agents: HashMap<String, AgentSlot>,
    run_window: Option<Mutex<RateWindow>>,
    run_cap: u32,
    initial_backoff_ms: u64,
    max_backoff_ms: u64,
    events: Arc<EventBus>,
}

impl Governor {
    pub fn new<I>(agents: I, run: &RunConfig, events: Arc<EventBus>) -> Self
    where
        I: IntoIterator<Item = Arc<AgentSpec>>,
    {
        let now = Instant::now();
        let agents = agents
            .into_iter()
            .map(|spec| {
                let slot = AgentSlot {
                    spec: spec.clone(),
                    budget: Mutex::new(AgentBudget {
                        iterations_used: 0,
                        window_start: now,
                        calls_in_window: 0,
                    }),
                };
                (spec.id.clone(), slot)
            })
            .collect();

        let run_window = (run.max_calls_per_minute > 0).then(|| {
            Mutex::new(RateWindow {
                window_start: now,
                calls_in_window: 0,
            })
        });

        Self {
            agents,
            run_window,
            run_cap: run.max_calls_per_minute,
            initial_backoff_ms: run.initial_backoff_ms,
            max_backoff_ms: run.max_backoff_ms,
            events,
        }
    }

    /// Run one governed backend invocation on behalf of `agent_id`.
    ///
    /// The agent's budget lock is held for the whole invocation, so
    /// concurrent tasks sharing an agent take turns against its limits.
    /// The iteration budget is charged once per invocation; each retry
    /// attempt that reaches the backend consumes a rate window slot of
    /// its own.
    pub async fn execute(
        &self,
        agent_id: &str,
        backend: &Arc<dyn GenerationBackend>,
        request: GenerationRequest,
    ) -> Result<String> {
        let slot = self
            .agents
            .get(agent_id)
            .ok_or_else(|| TroupeError::Config(format!("no budget for agent: {agent_id}")))?;

        let mut budget = slot.budget.lock().await;

        if budget.iterations_used >= slot.spec.max_iterations {
            return Err(TroupeError::IterationBudgetExceeded {
                agent: agent_id.to_string(),
                limit: slot.spec.max_iterations,
            });
        }
        budget.iterations_used += 1;

        let mut attempt: u32 = 0;
        loop {
            self.admit(&mut budget, &slot.spec).await;

            debug!(agent = %agent_id, attempt, "Dispatching backend call");
            match backend.generate(request.clone()).await {
                Ok(text) => return Ok(text),
                Err(err) => {
                    let message = match &err {
                        TroupeError::Backend(BackendError::Transient(message)) => message.clone(),
                        _ => return Err(err),
                    };

                    attempt += 1;
                    if attempt > slot.spec.max_retries {
                        return Err(TroupeError::RetriesExhausted {
                            attempts: attempt,
                            last: message,
                        });
                    }

                    let backoff =
                        calculate_backoff(attempt - 1, self.initial_backoff_ms, self.max_backoff_ms);
                    warn!(
                        agent = %agent_id,
                        attempt,
                        max_retries = slot.spec.max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %message,
                        "Transient backend error, retrying"
                    );
                    self.events.publish(PipelineEvent::RetryScheduled {
                        agent: agent_id.to_string(),
                        attempt,
                        backoff_ms: backoff.as_millis() as u64,
                    });
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    /// Wait until both the agent window and the run-wide window (when
    /// configured) have room, then charge one slot to each. Slots are
    /// never dropped: a full window means sleeping until it resets.
    async fn admit(&self, budget: &mut AgentBudget, spec: &AgentSpec) {
        loop {
            let now = Instant::now();
            if now.duration_since(budget.window_start) >= RATE_WINDOW {
                budget.window_start = now;
                budget.calls_in_window = 0;
            }
            if budget.calls_in_window < spec.max_calls_per_minute {
                budget.calls_in_window += 1;
                break;
            }
            let wait = RATE_WINDOW - now.duration_since(budget.window_start);
            debug!(
                agent = %spec.id,
                wait_ms = wait.as_millis() as u64,
                "Agent rate window full, delaying call"
            );
            self.events.publish(PipelineEvent::RateLimited {
                agent: spec.id.clone(),
                wait_ms: wait.as_millis() as u64,
            });
            tokio::time::sleep(wait).await;
        }

        if let Some(run_window) = &self.run_window {
            loop {
                let mut window = run_window.lock().await;
                let now = Instant::now();
                if now.duration_since(window.window_start) >= RATE_WINDOW {
                    window.window_start = now;
                    window.calls_in_window = 0;
                }
                if window.calls_in_window < self.run_cap {
                    window.calls_in_window += 1;
                    break;
                }
                let wait = RATE_WINDOW - now.duration_since(window.window_start);
                drop(window);
                debug!(
                    agent = %spec.id,
                    wait_ms = wait.as_millis() as u64,
                    "Run rate window full, delaying call"
                );
                self.events.publish(PipelineEvent::RateLimited {
                    agent: spec.id.clone(),
                    wait_ms: wait.as_millis() as u64,
                });
                tokio::time::sleep(wait).await;
            }
        }
    }
}

/// Exponential backoff with jitter: `initial * 2^attempt` capped at
/// `max`, then scaled by a random factor in `[0.8, 1.2)`.
fn calculate_backoff(attempt: u32, initial_ms: u64, max_ms: u64) -> Duration {
    let base = initial_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(max_ms);
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((base as f64 * jitter) as u64)
}
