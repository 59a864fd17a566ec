//! Pipeline graph construction and validation.
//!
//! [`PipelineGraph::build`] takes the declared agents and tasks, resolves
//! every reference, rejects cycles, and fixes a deterministic topological
//! order. Everything downstream (executor, aggregator) works against the
//! validated graph and never re-checks these invariants.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use troupe_core::error::{Result, TroupeError};
use troupe_core::types::{AgentSpec, TaskSpec};

/// A validated task with its agent and dependency references resolved
/// to graph indices.
#[derive(Debug, Clone)]
pub struct TaskNode {
    pub spec: TaskSpec,
    pub agent: Arc<AgentSpec>,
    /// Dependency indices in `depends_on` order, deduplicated.
    pub deps: Vec<usize>,
}

/// Immutable task graph. Indices are declaration positions; the
/// topological order breaks ties by declaration position, so a given
/// pipeline always yields the same order.
#[derive(Debug)]
pub struct PipelineGraph {
    tasks: Vec<TaskNode>,
    index: HashMap<String, usize>,
    dependents: Vec<Vec<usize>>,
    topo: Vec<usize>,
    agents: Vec<Arc<AgentSpec>>,
}

impl PipelineGraph {
    pub fn build(agents: Vec<AgentSpec>, tasks: Vec<TaskSpec>) -> Result<Self> {
        if tasks.is_empty() {
            return Err(TroupeError::Config("pipeline defines no tasks".to_string()));
        }

        let mut agent_map: HashMap<String, Arc<AgentSpec>> = HashMap::with_capacity(agents.len());
        let mut agent_list = Vec::with_capacity(agents.len());
        for agent in agents {
            validate_limits(&agent)?;
            let id = agent.id.clone();
            let agent = Arc::new(agent);
            if agent_map.insert(id.clone(), agent.clone()).is_some() {
                return Err(TroupeError::DuplicateAgent(id));
            }
            agent_list.push(agent);
        }

        let mut index = HashMap::with_capacity(tasks.len());
        for (i, task) in tasks.iter().enumerate() {
            if index.insert(task.id.clone(), i).is_some() {
                return Err(TroupeError::DuplicateTask(task.id.clone()));
            }
        }

        let mut nodes = Vec::with_capacity(tasks.len());
        let mut dependents = vec![Vec::new(); tasks.len()];
        for (i, task) in tasks.into_iter().enumerate() {
            let agent = agent_map.get(&task.agent).cloned().ok_or_else(|| {
                TroupeError::UnknownAgent {
                    task: task.id.clone(),
                    agent: task.agent.clone(),
                }
            })?;

            let mut deps = Vec::with_capacity(task.depends_on.len());
            for dep_id in &task.depends_on {
                let dep_idx =
                    index
                        .get(dep_id)
                        .copied()
                        .ok_or_else(|| TroupeError::UnknownDependency {
                            task: task.id.clone(),
                            dependency: dep_id.clone(),
                        })?;
                if !deps.contains(&dep_idx) {
                    deps.push(dep_idx);
                    dependents[dep_idx].push(i);
                }
            }

            nodes.push(TaskNode { spec: task, agent, deps });
        }

        if let Some(members) = find_cycle(&nodes) {
            return Err(TroupeError::DependencyCycle { members });
        }

        let topo = topo_order(&nodes, &dependents);

        Ok(Self {
            tasks: nodes,
            index,
            dependents,
            topo,
            agents: agent_list,
        })
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn task(&self, idx: usize) -> &TaskNode {
        &self.tasks[idx]
    }

    pub fn tasks(&self) -> &[TaskNode] {
        &self.tasks
    }

    pub fn index_of(&self, task_id: &str) -> Option<usize> {
        self.index.get(task_id).copied()
    }

    /// Tasks that list `idx` as a dependency, in declaration order.
    pub fn dependents_of(&self, idx: usize) -> &[usize] {
        &self.dependents[idx]
    }

    pub fn topo_order(&self) -> &[usize] {
        &self.topo
    }

    /// Terminal tasks (no dependents), in declaration order. Their
    /// outputs form the pipeline's final output.
    pub fn terminal_indices(&self) -> Vec<usize> {
        (0..self.tasks.len())
            .filter(|&i| self.dependents[i].is_empty())
            .collect()
    }

    pub fn agents(&self) -> &[Arc<AgentSpec>] {
        &self.agents
    }
}

fn validate_limits(agent: &AgentSpec) -> Result<()> {
    if agent.max_iterations == 0 {
        return Err(TroupeError::Config(format!(
            "agent {}: max_iterations must be positive",
            agent.id
        )));
    }
    if agent.max_calls_per_minute == 0 {
        return Err(TroupeError::Config(format!(
            "agent {}: max_calls_per_minute must be positive",
            agent.id
        )));
    }
    Ok(())
}

/// Depth-first search over dependency edges with an explicit path stack.
/// Returns the ids of the tasks forming the first cycle found, with the
/// entry task repeated at the end so the error reads as a closed loop.
fn find_cycle(nodes: &[TaskNode]) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InStack,
        Done,
    }

    fn visit(
        idx: usize,
        nodes: &[TaskNode],
        marks: &mut [Mark],
        stack: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        marks[idx] = Mark::InStack;
        stack.push(idx);
        for &dep in &nodes[idx].deps {
            match marks[dep] {
                Mark::InStack => {
                    let pos = stack.iter().position(|&i| i == dep).unwrap_or(0);
                    let mut cycle = stack[pos..].to_vec();
                    cycle.push(dep);
                    return Some(cycle);
                }
                Mark::Unvisited => {
                    if let Some(cycle) = visit(dep, nodes, marks, stack) {
                        return Some(cycle);
                    }
                }
                Mark::Done => {}
            }
        }
        stack.pop();
        marks[idx] = Mark::Done;
        None
    }

    let mut marks = vec![Mark::Unvisited; nodes.len()];
    let mut stack = Vec::new();
    for idx in 0..nodes.len() {
        if marks[idx] == Mark::Unvisited {
            if let Some(cycle) = visit(idx, nodes, &mut marks, &mut stack) {
                return Some(
                    cycle
                        .into_iter()
                        .map(|i| nodes[i].spec.id.clone())
                        .collect(),
                );
            }
        }
    }
    None
}

/// Kahn's algorithm with a min-heap on declaration index, so tasks that
/// become runnable together always appear in declaration order.
fn topo_order(nodes: &[TaskNode], dependents: &[Vec<usize>]) -> Vec<usize> {
    let mut in_degree: Vec<usize> = nodes.iter().map(|n| n.deps.len()).collect();
    let mut heap: BinaryHeap<Reverse<usize>> = (0..nodes.len())
        .filter(|&i| in_degree[i] == 0)
        .map(Reverse)
        .collect();
    let mut order = Vec::with_capacity(nodes.len());

    while let Some(Reverse(idx)) = heap.pop() {
        order.push(idx);
        for &dependent in &dependents[idx] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                heap.push(Reverse(dependent));
            }
        }
    }

    debug_assert_eq!(order.len(), nodes.len(), "cycle detection must run first");
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use troupe_test_utils::{agent, task};

    fn ids(graph: &PipelineGraph, indices: &[usize]) -> Vec<String> {
        indices
            .iter()
            .map(|&i| graph.task(i).spec.id.clone())
            .collect()
    }

    #[test]
    fn test_build_diamond_orders_by_declaration() {
        let agents = vec![agent("worker")];
        let tasks = vec![
            task("a", "worker"),
            task("b", "worker").with_depends_on(vec!["a".to_string()]),
            task("c", "worker").with_depends_on(vec!["a".to_string()]),
            task("d", "worker").with_depends_on(vec!["b".to_string(), "c".to_string()]),
        ];

        let graph = PipelineGraph::build(agents, tasks).unwrap();
        assert_eq!(ids(&graph, graph.topo_order()), vec!["a", "b", "c", "d"]);
        assert_eq!(graph.dependents_of(0), &[1, 2]);
        assert_eq!(ids(&graph, &graph.terminal_indices()), vec!["d"]);
    }

    #[test]
    fn test_declaration_order_breaks_ties_among_roots() {
        let agents = vec![agent("worker")];
        let tasks = vec![task("z_first", "worker"), task("a_second", "worker")];

        let graph = PipelineGraph::build(agents, tasks).unwrap();
        assert_eq!(
            ids(&graph, graph.topo_order()),
            vec!["z_first", "a_second"]
        );
    }

    #[test]
    fn test_two_task_cycle_names_both_tasks() {
        let agents = vec![agent("worker")];
        let tasks = vec![
            task("t1", "worker").with_depends_on(vec!["t2".to_string()]),
            task("t2", "worker").with_depends_on(vec!["t1".to_string()]),
        ];

        let err = PipelineGraph::build(agents, tasks).unwrap_err();
        match err {
            TroupeError::DependencyCycle { ref members } => {
                assert!(members.contains(&"t1".to_string()));
                assert!(members.contains(&"t2".to_string()));
            }
            other => panic!("expected DependencyCycle, got {other:?}"),
        }
        let message = err.to_string();
        assert!(message.contains("t1"), "message should name t1: {message}");
        assert!(message.contains("t2"), "message should name t2: {message}");
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let agents = vec![agent("worker")];
        let tasks = vec![task("solo", "worker").with_depends_on(vec!["solo".to_string()])];

        let err = PipelineGraph::build(agents, tasks).unwrap_err();
        assert!(matches!(err, TroupeError::DependencyCycle { .. }));
    }

    #[test]
    fn test_duplicate_task_rejected() {
        let agents = vec![agent("worker")];
        let tasks = vec![task("same", "worker"), task("same", "worker")];

        let err = PipelineGraph::build(agents, tasks).unwrap_err();
        assert!(matches!(err, TroupeError::DuplicateTask(ref id) if id == "same"));
    }

    #[test]
    fn test_duplicate_agent_rejected() {
        let agents = vec![agent("twin"), agent("twin")];
        let tasks = vec![task("t", "twin")];

        let err = PipelineGraph::build(agents, tasks).unwrap_err();
        assert!(matches!(err, TroupeError::DuplicateAgent(ref id) if id == "twin"));
    }

    #[test]
    fn test_unknown_agent_rejected() {
        let err = PipelineGraph::build(vec![agent("real")], vec![task("t", "ghost")]).unwrap_err();
        match err {
            TroupeError::UnknownAgent { task, agent } => {
                assert_eq!(task, "t");
                assert_eq!(agent, "ghost");
            }
            other => panic!("expected UnknownAgent, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let agents = vec![agent("worker")];
        let tasks = vec![task("t", "worker").with_depends_on(vec!["missing".to_string()])];

        let err = PipelineGraph::build(agents, tasks).unwrap_err();
        match err {
            TroupeError::UnknownDependency { task, dependency } => {
                assert_eq!(task, "t");
                assert_eq!(dependency, "missing");
            }
            other => panic!("expected UnknownDependency, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_pipeline_rejected() {
        let err = PipelineGraph::build(vec![agent("worker")], vec![]).unwrap_err();
        assert!(matches!(err, TroupeError::Config(_)));
    }

    #[test]
    fn test_zero_iteration_limit_rejected() {
        let bad = agent("worker").with_max_iterations(0);
        let err = PipelineGraph::build(vec![bad], vec![task("t", "worker")]).unwrap_err();
        assert!(matches!(err, TroupeError::Config(_)));
    }

    #[test]
    fn test_repeated_dependency_deduplicated() {
        let agents = vec![agent("worker")];
        let tasks = vec![
            task("a", "worker"),
            task("b", "worker").with_depends_on(vec!["a".to_string(), "a".to_string()]),
        ];

        let graph = PipelineGraph::build(agents, tasks).unwrap();
        assert_eq!(graph.task(1).deps, vec![0]);
        assert_eq!(graph.dependents_of(0), &[1]);
    }
}
