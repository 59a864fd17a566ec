use futures::future::BoxFuture;
use serde_json::json;

use troupe_core::error::{Result, TroupeError};
use troupe_core::traits::Tool;
use troupe_core::types::ToolResult;

const SERPER_API_URL: &str = "https://google.serper.dev/search";

/// Web search backed by the Serper API.
pub struct WebSearchTool {
    api_key: String,
    http: reqwest::Client,
}

impl WebSearchTool {
    pub fn new(api_key: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            http: reqwest::Client::new(),
        }
    }
}

/// Format Serper organic results as titled snippet blocks.
fn format_organic(body: &serde_json::Value, max: usize) -> String {
    let results = body["organic"].as_array().map(|arr| {
        arr.iter()
            .take(max)
            .map(|r| {
                format!(
                    "**{}**\n{}\nURL: {}",
                    r["title"].as_str().unwrap_or(""),
                    r["snippet"].as_str().unwrap_or(""),
                    r["link"].as_str().unwrap_or("")
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n---\n\n")
    });

    match results {
        Some(text) if !text.is_empty() => text,
        _ => "No results found.".to_string(),
    }
}

impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web for current information. Returns relevant results with snippets."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Search query"
                },
                "max_results": {
                    "type": "integer",
                    "description": "Maximum number of results (default 5)",
                    "default": 5
                }
            },
            "required": ["query"]
        })
    }

    fn execute(&self, input: serde_json::Value) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let query = input["query"]
                .as_str()
                .ok_or_else(|| TroupeError::ToolValidation("'query' must be a string".into()))?;
            let max = input["max_results"].as_u64().unwrap_or(5) as usize;

            let resp = self
                .http
                .post(SERPER_API_URL)
                .header("X-API-KEY", &self.api_key)
                .json(&json!({
                    "q": query,
                    "num": max,
                }))
                .send()
                .await
                .map_err(|e| TroupeError::ToolExecution {
                    tool: "web_search".into(),
                    message: e.to_string(),
                })?;

            if !resp.status().is_success() {
                return Ok(ToolResult::error(format!(
                    "Search request failed: HTTP {}",
                    resp.status()
                )));
            }

            let body: serde_json::Value =
                resp.json().await.map_err(|e| TroupeError::ToolExecution {
                    tool: "web_search".into(),
                    message: e.to_string(),
                })?;

            Ok(ToolResult::success(format_organic(&body, max)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_organic() {
        let body = json!({
            "organic": [
                {"title": "Rust", "snippet": "A systems language.", "link": "https://rust-lang.org"},
                {"title": "Crates", "snippet": "The registry.", "link": "https://crates.io"}
            ]
        });
        let text = format_organic(&body, 5);
        assert!(text.starts_with("**Rust**\nA systems language.\nURL: https://rust-lang.org"));
        assert!(text.contains("\n\n---\n\n"));
        assert!(text.contains("**Crates**"));
    }

    #[test]
    fn test_format_organic_respects_max() {
        let body = json!({
            "organic": [
                {"title": "a", "snippet": "", "link": ""},
                {"title": "b", "snippet": "", "link": ""}
            ]
        });
        let text = format_organic(&body, 1);
        assert!(text.contains("**a**"));
        assert!(!text.contains("**b**"));
    }

    #[test]
    fn test_format_organic_empty() {
        assert_eq!(format_organic(&json!({}), 5), "No results found.");
    }
}
