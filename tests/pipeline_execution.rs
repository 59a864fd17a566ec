use std::sync::Arc;

use troupe_core::config::{RunConfig, RunMode};
use troupe_core::event::EventBus;
use troupe_core::types::{OverallStatus, PipelineResult, TaskFailure};
use troupe_engine::{Executor, PipelineGraph};
use troupe_test_utils::{agent, task, MockBackend, MockOutcome};

fn research_graph() -> PipelineGraph {
    let agents = vec![agent("researcher"), agent("analyst"), agent("reporter")];
    let tasks = vec![
        task("research", "researcher"),
        task("analysis", "analyst").with_depends_on(vec!["research".to_string()]),
        task("report", "reporter")
            .with_depends_on(vec!["research".to_string(), "analysis".to_string()]),
    ];
    PipelineGraph::build(agents, tasks).expect("valid pipeline")
}

#[tokio::test]
async fn test_chain_feeds_context_downstream_and_aggregates() {
    let backend = Arc::new(
        MockBackend::new()
            .with_keyed_outcome("research work", MockOutcome::Text("r1".into()))
            .with_keyed_outcome("analysis work", MockOutcome::Text("r2".into()))
            .with_keyed_outcome("report work", MockOutcome::Text("r3".into())),
    );
    let events = Arc::new(EventBus::default());
    let executor = Executor::new(
        research_graph(),
        backend.clone(),
        RunConfig::default(),
        events,
    );

    let result = executor.run().await;

    assert_eq!(result.overall, OverallStatus::Succeeded);
    assert_eq!(result.final_output, "r3");
    assert_eq!(result.output_of("research"), Some("r1"));
    assert_eq!(result.output_of("analysis"), Some("r2"));
    assert_eq!(backend.call_count(), 3);

    // The report prompt carries both upstream outputs, in dependency order.
    let requests = backend.requests();
    let report = requests
        .iter()
        .find(|r| r.prompt.starts_with("report work"))
        .expect("report request recorded");
    let r1 = report.prompt.find("r1").expect("research output in context");
    let r2 = report.prompt.find("r2").expect("analysis output in context");
    assert!(r1 < r2, "context sections must follow depends_on order");
}

#[tokio::test]
async fn test_root_failure_fails_every_downstream_task() {
    let backend = Arc::new(MockBackend::new().with_keyed_outcome(
        "research work",
        MockOutcome::Fatal("HTTP 401 invalid key".into()),
    ));
    let events = Arc::new(EventBus::default());
    let executor = Executor::new(
        research_graph(),
        backend.clone(),
        RunConfig::default(),
        events,
    );

    let result = executor.run().await;

    assert_eq!(result.overall, OverallStatus::Failed);
    assert_eq!(result.final_output, "");
    // Downstream tasks never reach the backend.
    assert_eq!(backend.call_count(), 1);

    let research = result.outcome_of("research").expect("research outcome");
    assert!(matches!(
        research.failure,
        Some(TaskFailure::Backend { .. })
    ));

    // Skips carry the root failed task, not the nearest dependency.
    for skipped in ["analysis", "report"] {
        let outcome = result.outcome_of(skipped).expect("outcome present");
        assert!(outcome.output.is_none());
        assert_eq!(
            outcome.failure,
            Some(TaskFailure::Upstream {
                failed_task: "research".to_string()
            })
        );
    }
}

async fn run_diamond(mode: RunMode) -> PipelineResult {
    let agents = vec![agent("a"), agent("b"), agent("c"), agent("d")];
    let tasks = vec![
        task("gather", "a"),
        task("east", "b").with_depends_on(vec!["gather".to_string()]),
        task("west", "c").with_depends_on(vec!["gather".to_string()]),
        task("merge", "d").with_depends_on(vec!["east".to_string(), "west".to_string()]),
    ];
    let graph = PipelineGraph::build(agents, tasks).expect("valid pipeline");

    let backend = Arc::new(
        MockBackend::new()
            .with_keyed_outcome("gather work", MockOutcome::Text("g-out".into()))
            .with_keyed_outcome("east work", MockOutcome::Text("e-out".into()))
            .with_keyed_outcome("west work", MockOutcome::Text("w-out".into()))
            .with_keyed_outcome("merge work", MockOutcome::Text("m-out".into())),
    );
    let run = RunConfig {
        mode,
        ..RunConfig::default()
    };
    let events = Arc::new(EventBus::default());
    Executor::new(graph, backend, run, events).run().await
}

#[tokio::test]
async fn test_concurrent_mode_matches_sequential_output() {
    let sequential = run_diamond(RunMode::Sequential).await;
    let concurrent = run_diamond(RunMode::Concurrent).await;

    assert_eq!(sequential.overall, OverallStatus::Succeeded);
    assert_eq!(concurrent.overall, OverallStatus::Succeeded);
    assert_eq!(sequential.final_output, "m-out");
    assert_eq!(sequential.final_output, concurrent.final_output);

    let order = |result: &PipelineResult| -> Vec<String> {
        result.outcomes.iter().map(|o| o.task_id.clone()).collect()
    };
    // Outcomes report in declaration order regardless of execution mode.
    assert_eq!(order(&sequential), order(&concurrent));
    assert_eq!(order(&sequential), vec!["gather", "east", "west", "merge"]);
}
