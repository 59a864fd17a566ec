use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use troupe_core::config::SearchConfig;
use troupe_core::error::{Result, TroupeError};
use troupe_core::traits::Tool;
use troupe_core::types::{ToolDefinition, ToolResult};

/// Registry of available tools.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool.
    pub fn register(&mut self, tool: impl Tool) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// List all registered tools.
    pub fn list(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    /// Resolve an agent's capability names into tool definitions.
    ///
    /// Fails on the first capability with no registered tool, so a bad
    /// pipeline is rejected before anything runs.
    pub fn definitions_for(&self, names: &[String]) -> Result<Vec<ToolDefinition>> {
        names
            .iter()
            .map(|name| {
                self.get(name)
                    .map(|t| t.definition())
                    .ok_or_else(|| TroupeError::ToolNotFound(name.clone()))
            })
            .collect()
    }

    /// Execute a tool by name.
    pub async fn execute(&self, name: &str, input: serde_json::Value) -> Result<ToolResult> {
        let tool = self
            .get(name)
            .ok_or_else(|| TroupeError::ToolNotFound(name.to_string()))?;

        let timeout = std::time::Duration::from_secs(tool.timeout_secs());

        match tokio::time::timeout(timeout, tool.execute(input)).await {
            Ok(result) => result,
            Err(_) => Err(TroupeError::ToolTimeout {
                tool: name.to_string(),
                timeout_secs: tool.timeout_secs(),
            }),
        }
    }

    /// Create a registry with the built-in web tools registered.
    ///
    /// `web_fetch` is always available; `web_search` needs a search config
    /// with an API key.
    pub fn with_builtins(search: Option<&SearchConfig>) -> Self {
        let mut registry = Self::new();

        registry.register(crate::builtin::web_fetch::WebFetchTool::new());

        if let Some(search) = search {
            match search.provider.as_str() {
                "serper" => {
                    registry.register(crate::builtin::web_search::WebSearchTool::new(
                        &search.api_key,
                    ));
                }
                other => {
                    warn!(provider = %other, "Unknown search provider, web_search disabled");
                }
            }
        }

        registry
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
