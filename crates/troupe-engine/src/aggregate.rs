//! Result aggregation.
//!
//! Folds the per-task states of a finished run into a [`PipelineResult`]:
//! one outcome per task in declaration order, the terminal-task outputs
//! joined into the final output, and the overall verdict. Partial
//! successes are always kept retrievable, whatever the verdict.

use std::time::Duration;

use chrono::{DateTime, Utc};

use troupe_core::types::{OverallStatus, PipelineResult, TaskOutcome, TaskStatus};

use crate::executor::TaskState;
use crate::graph::PipelineGraph;

pub(crate) fn collect(
    graph: &PipelineGraph,
    states: &[TaskState],
    started_at: DateTime<Utc>,
    elapsed: Duration,
) -> PipelineResult {
    let outcomes: Vec<TaskOutcome> = graph
        .tasks()
        .iter()
        .zip(states)
        .map(|(node, state)| TaskOutcome {
            task_id: node.spec.id.clone(),
            agent_id: node.agent.id.clone(),
            output: state.output.clone(),
            failure: state.failure.clone(),
            elapsed_ms: state.elapsed_ms,
        })
        .collect();

    let terminals = graph.terminal_indices();

    // Succeeded terminal outputs in declaration order. A single output
    // stands alone; several get labeled with the task that produced them.
    let produced: Vec<(&str, &str)> = terminals
        .iter()
        .filter_map(|&i| {
            states[i]
                .output
                .as_deref()
                .map(|output| (graph.task(i).spec.id.as_str(), output))
        })
        .collect();
    let final_output = match produced.as_slice() {
        [] => String::new(),
        [(_, only)] => (*only).to_string(),
        many => many
            .iter()
            .map(|(id, output)| format!("## {}\n\n{}", id, output))
            .collect::<Vec<_>>()
            .join("\n\n"),
    };

    let overall = if states.iter().all(|s| s.status == TaskStatus::Succeeded) {
        OverallStatus::Succeeded
    } else if terminals
        .iter()
        .all(|&i| states[i].status == TaskStatus::Failed)
    {
        OverallStatus::Failed
    } else {
        OverallStatus::PartialFailure
    };

    PipelineResult {
        overall,
        final_output,
        outcomes,
        started_at,
        finished_at: Utc::now(),
        total_elapsed_ms: elapsed.as_millis() as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use troupe_core::types::TaskFailure;
    use troupe_test_utils::{agent, task};

    fn graph(tasks: Vec<troupe_core::types::TaskSpec>) -> PipelineGraph {
        PipelineGraph::build(vec![agent("worker")], tasks).unwrap()
    }

    fn succeeded(output: &str) -> TaskState {
        TaskState {
            status: TaskStatus::Succeeded,
            output: Some(output.to_string()),
            failure: None,
            elapsed_ms: 5,
        }
    }

    fn failed(failure: TaskFailure) -> TaskState {
        TaskState {
            status: TaskStatus::Failed,
            output: None,
            failure: Some(failure),
            elapsed_ms: 5,
        }
    }

    #[test]
    fn test_single_terminal_output_is_unlabeled() {
        let graph = graph(vec![
            task("a", "worker"),
            task("b", "worker").with_depends_on(vec!["a".to_string()]),
        ]);
        let states = vec![succeeded("upstream"), succeeded("the result")];

        let result = collect(&graph, &states, Utc::now(), Duration::from_millis(10));

        assert_eq!(result.overall, OverallStatus::Succeeded);
        assert_eq!(result.final_output, "the result");
        assert_eq!(result.total_elapsed_ms, 10);
    }

    #[test]
    fn test_multiple_terminal_outputs_are_labeled_in_order() {
        let graph = graph(vec![task("left", "worker"), task("right", "worker")]);
        let states = vec![succeeded("l-out"), succeeded("r-out")];

        let result = collect(&graph, &states, Utc::now(), Duration::ZERO);

        assert_eq!(
            result.final_output,
            "## left\n\nl-out\n\n## right\n\nr-out"
        );
    }

    #[test]
    fn test_failed_terminal_beside_succeeded_is_partial() {
        let graph = graph(vec![task("ok", "worker"), task("bad", "worker")]);
        let states = vec![
            succeeded("kept"),
            failed(TaskFailure::Backend {
                message: "HTTP 400".to_string(),
            }),
        ];

        let result = collect(&graph, &states, Utc::now(), Duration::ZERO);

        assert_eq!(result.overall, OverallStatus::PartialFailure);
        // The surviving branch's output is still the final output.
        assert_eq!(result.final_output, "kept");
        assert_eq!(result.output_of("ok"), Some("kept"));
    }

    #[test]
    fn test_all_terminals_failed_is_failed_but_keeps_partials() {
        let graph = graph(vec![
            task("a", "worker"),
            task("b", "worker").with_depends_on(vec!["a".to_string()]),
        ]);
        // The intermediate task succeeded before the terminal one failed.
        let states = vec![
            succeeded("partial work"),
            failed(TaskFailure::RetriesExhausted {
                attempts: 3,
                last: "HTTP 503".to_string(),
            }),
        ];

        let result = collect(&graph, &states, Utc::now(), Duration::ZERO);

        assert_eq!(result.overall, OverallStatus::Failed);
        assert_eq!(result.final_output, "");
        assert_eq!(result.output_of("a"), Some("partial work"));
    }
}
