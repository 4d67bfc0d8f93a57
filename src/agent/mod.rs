//! Agent definition, tool loop and runner.

pub mod definition;
pub mod runner;
pub mod tool_loop;
pub mod types;

pub use definition::{AgentDefinition, ModelSettings};
pub use runner::{AgentRunner, McpToolRouter, RunConfig, RunResult, Runner};
pub use tool_loop::{ToolExecutor, ToolLoopAgent};
pub use types::{ToolCall, ToolLoopOutcome, ToolLoopState, ToolLoopStopReason, ToolResult};
