use futures::future::join_all;
use tracing::debug;

use troupe_core::types::{ToolDefinition, ToolResult};
use troupe_tools::ToolRegistry;

/// A tool invocation requested by the model, after argument parsing.
#[derive(Debug, Clone)]
pub(crate) struct PendingToolCall {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

/// Execute the model's tool calls against the registry.
///
/// Calls run in parallel. A call naming a tool outside `allowed` or failing
/// in any way becomes an error result fed back to the model; nothing here
/// aborts the enclosing generation.
pub(crate) async fn execute_tool_calls(
    registry: &ToolRegistry,
    allowed: &[ToolDefinition],
    calls: Vec<PendingToolCall>,
) -> Vec<(PendingToolCall, ToolResult)> {
    let futures = calls.into_iter().map(|call| async move {
        debug!(tool = %call.name, "Executing tool call");
        let result = if !allowed.iter().any(|t| t.name == call.name) {
            ToolResult::error(format!("Tool not available: {}", call.name))
        } else {
            match registry.execute(&call.name, call.input.clone()).await {
                Ok(result) => result,
                Err(e) => ToolResult::error(e.to_string()),
            }
        };
        (call, result)
    });

    join_all(futures).await
}

#[cfg(test)]
mod tests {
    use super::*;

    use futures::future::BoxFuture;
    use serde_json::json;
    use troupe_core::error::Result;
    use troupe_core::traits::Tool;

    struct EchoTool;

    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echoes its input back"
        }

        fn input_schema(&self) -> serde_json::Value {
            json!({"type": "object", "properties": {"text": {"type": "string"}}})
        }

        fn execute(&self, input: serde_json::Value) -> BoxFuture<'_, Result<ToolResult>> {
            Box::pin(async move {
                Ok(ToolResult::success(
                    input["text"].as_str().unwrap_or("").to_string(),
                ))
            })
        }
    }

    fn call(name: &str, input: serde_json::Value) -> PendingToolCall {
        PendingToolCall {
            id: "call_1".into(),
            name: name.into(),
            input,
        }
    }

    #[tokio::test]
    async fn test_executes_allowed_tool() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        let allowed = vec![EchoTool.definition()];

        let results =
            execute_tool_calls(&registry, &allowed, vec![call("echo", json!({"text": "hi"}))])
                .await;
        assert_eq!(results.len(), 1);
        assert!(!results[0].1.is_error);
        assert_eq!(results[0].1.content, "hi");
    }

    #[tokio::test]
    async fn test_rejects_tool_outside_capability_set() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);

        // Registered but not in the allowed set for this agent.
        let results =
            execute_tool_calls(&registry, &[], vec![call("echo", json!({"text": "hi"}))]).await;
        assert!(results[0].1.is_error);
        assert!(results[0].1.content.contains("not available"));
    }

    #[tokio::test]
    async fn test_unknown_tool_becomes_error_result() {
        let registry = ToolRegistry::new();
        let allowed = vec![EchoTool.definition()];

        let results =
            execute_tool_calls(&registry, &allowed, vec![call("echo", json!({}))]).await;
        assert!(results[0].1.is_error);
    }
}
