//! Prompt assembly for task execution.
//!
//! The system framing comes from the agent's persona fields; the task
//! prompt is the task description followed by the outputs of its
//! dependencies, in `depends_on` order, each labeled with the task that
//! produced it.

use troupe_core::types::AgentSpec;

pub fn system_framing(agent: &AgentSpec) -> String {
    let mut framing = format!("You are {}.", agent.role);
    if !agent.backstory.is_empty() {
        framing.push_str("\n\n");
        framing.push_str(&agent.backstory);
    }
    if !agent.goal.is_empty() {
        framing.push_str("\n\nYour personal goal: ");
        framing.push_str(&agent.goal);
    }
    framing
}

/// One dependency's contribution to a task prompt.
pub struct ContextSection<'a> {
    pub task_id: &'a str,
    pub description: &'a str,
    pub output: &'a str,
}

pub fn task_prompt(
    description: &str,
    expected_output: Option<&str>,
    context: &[ContextSection<'_>],
) -> String {
    let mut prompt = description.to_string();

    if !context.is_empty() {
        prompt.push_str("\n\n## Context\n");
        for section in context {
            prompt.push_str(&format!(
                "\n### {}: {}\n\n{}\n",
                section.task_id, section.description, section.output
            ));
        }
    }

    if let Some(hint) = expected_output {
        prompt.push_str("\n\nExpected output: ");
        prompt.push_str(hint);
    }

    prompt
}
