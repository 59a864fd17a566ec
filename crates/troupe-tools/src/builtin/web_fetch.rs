use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::debug;

use troupe_core::error::{Result, TroupeError};
use troupe_core::traits::Tool;
use troupe_core::types::ToolResult;

/// Fetch a URL and return its readable text.
pub struct WebFetchTool {
    http: reqwest::Client,
}

impl WebFetchTool {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl Default for WebFetchTool {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Deserialize)]
struct WebFetchInput {
    url: String,
    #[serde(default)]
    max_length: Option<usize>,
}

impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        "web_fetch"
    }

    fn timeout_secs(&self) -> u64 {
        60
    }

    fn description(&self) -> &str {
        "Fetch content from a URL. Strips HTML tags and returns plain text, truncated to max_length."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "The URL to fetch content from"
                },
                "max_length": {
                    "type": "integer",
                    "description": "Maximum characters to return (default: 30000)"
                }
            },
            "required": ["url"]
        })
    }

    fn execute(&self, input: serde_json::Value) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let params: WebFetchInput = serde_json::from_value(input)
                .map_err(|e| TroupeError::ToolValidation(e.to_string()))?;

            let max_length = params.max_length.unwrap_or(30_000);

            debug!(url = %params.url, "Fetching URL");

            let resp = self
                .http
                .get(&params.url)
                .timeout(std::time::Duration::from_secs(30))
                .header("User-Agent", "troupe/0.3")
                .send()
                .await
                .map_err(|e| TroupeError::ToolExecution {
                    tool: "web_fetch".to_string(),
                    message: format!("Request failed: {}", e),
                })?;

            let status = resp.status();
            if !status.is_success() {
                return Ok(ToolResult::error(format!(
                    "HTTP {} {}",
                    status.as_u16(),
                    status.canonical_reason().unwrap_or("Unknown")
                )));
            }

            let content_type = resp
                .headers()
                .get("content-type")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();

            let body = resp.text().await.map_err(|e| TroupeError::ToolExecution {
                tool: "web_fetch".to_string(),
                message: format!("Failed to read response body: {}", e),
            })?;

            // Strip HTML tags if content is HTML
            let text = if content_type.contains("html") {
                strip_html_tags(&body)
            } else {
                body
            };

            Ok(ToolResult::success(truncate_at(&text, max_length)))
        })
    }
}

/// Basic HTML tag stripping using regex.
fn strip_html_tags(html: &str) -> String {
    // Remove script, style, and comment blocks entirely
    let re_script = regex::Regex::new(r"(?is)<script[^>]*>.*?</script>").unwrap();
    let cleaned = re_script.replace_all(html, "");
    let re_style = regex::Regex::new(r"(?is)<style[^>]*>.*?</style>").unwrap();
    let cleaned = re_style.replace_all(&cleaned, "");
    let re_comment = regex::Regex::new(r"(?s)<!--.*?-->").unwrap();
    let cleaned = re_comment.replace_all(&cleaned, "");

    // Remove HTML tags
    let re_tags = regex::Regex::new(r"<[^>]+>").unwrap();
    let text = re_tags.replace_all(&cleaned, "");

    // Decode common HTML entities
    let text = text
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ");

    // Collapse multiple whitespace/newlines
    let re_whitespace = regex::Regex::new(r"\n{3,}").unwrap();
    let text = re_whitespace.replace_all(&text, "\n\n");

    text.trim().to_string()
}

/// Truncate at a char boundary at or below `max_length` bytes.
fn truncate_at(text: &str, max_length: usize) -> String {
    if text.len() <= max_length {
        return text.to_string();
    }
    let mut cut = max_length;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}\n\n[truncated at {} chars]", &text[..cut], max_length)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_html_tags() {
        let html = r#"<html><head><style>body { color: red }</style></head>
<body><!-- nav --><script>alert(1)</script><h1>Title</h1><p>Hello &amp; welcome</p></body></html>"#;
        let text = strip_html_tags(html);
        assert!(text.contains("Title"));
        assert!(text.contains("Hello & welcome"));
        assert!(!text.contains("alert"));
        assert!(!text.contains("color: red"));
        assert!(!text.contains("nav"));
    }

    #[test]
    fn test_truncate_at_char_boundary() {
        // 'é' is two bytes; a cut at byte 1 would split it.
        let text = "é".repeat(10);
        let out = truncate_at(&text, 3);
        assert!(out.starts_with('é'));
        assert!(out.contains("[truncated at 3 chars]"));
    }

    #[test]
    fn test_truncate_noop_when_short() {
        assert_eq!(truncate_at("short", 100), "short");
    }
}
