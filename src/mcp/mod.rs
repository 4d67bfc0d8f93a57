//! Model Context Protocol client side.
//!
//! Only the stdio transport is implemented: the tool server runs as a child
//! process and speaks newline-delimited JSON-RPC 2.0 over its stdin/stdout.

mod jsonrpc;
mod stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Result;
use crate::types::Tool;

pub use stdio::{DEFAULT_REQUEST_TIMEOUT, McpServerStdio, McpStdioParams};

pub const MCP_PROTOCOL_VERSION: &str = "2025-06-18";

/// A connected (or connectable) tool provider.
#[async_trait]
pub trait McpServer: Send + Sync {
    fn name(&self) -> &str;

    async fn connect(&self) -> Result<()>;

    async fn list_tools(&self) -> Result<Vec<McpTool>>;

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<McpToolOutput>;

    /// Releases the session. Calling it more than once is a no-op.
    async fn cleanup(&self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpTool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, rename = "inputSchema")]
    pub input_schema: Value,
}

impl McpTool {
    pub fn to_tool(&self) -> Tool {
        Tool {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.input_schema.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct McpToolOutput {
    pub content: String,
    pub is_error: bool,
}

impl McpToolOutput {
    /// Flattens a `tools/call` result: text parts are joined with newlines,
    /// other parts are kept as JSON.
    pub fn from_call_result(result: &Value) -> Self {
        let is_error = result
            .get("isError")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let mut chunks = Vec::<String>::new();
        if let Some(parts) = result.get("content").and_then(Value::as_array) {
            for part in parts {
                match (
                    part.get("type").and_then(Value::as_str),
                    part.get("text").and_then(Value::as_str),
                ) {
                    (Some("text"), Some(text)) => chunks.push(text.to_string()),
                    _ => chunks.push(part.to_string()),
                }
            }
        }
        if chunks.is_empty() {
            if let Some(structured) = result.get("structuredContent") {
                chunks.push(structured.to_string());
            }
        }

        Self {
            content: chunks.join("\n"),
            is_error,
        }
    }
}
