use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::Instrument as _;

use crate::mcp::McpServer;
use crate::types::{GenerateRequest, GenerateResponse, Message, Tool};
use crate::{Error, Result};

use super::definition::AgentDefinition;
use super::tool_loop::{ToolExecutor, ToolLoopAgent};
use super::types::{ToolCall, ToolLoopStopReason, ToolResult};

/// Per-run options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    pub workflow_name: String,
    /// When false, tool arguments, tool outputs and model text stay out of the logs.
    pub trace_include_sensitive_data: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            workflow_name: "Agent workflow".to_string(),
            trace_include_sensitive_data: true,
        }
    }
}

/// Outcome of one user turn.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub final_output: String,
    pub messages: Vec<Message>,
    pub turns: usize,
    pub last_response: Option<GenerateResponse>,
}

impl RunResult {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            final_output: text.into(),
            messages: Vec::new(),
            turns: 0,
            last_response: None,
        }
    }
}

#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(
        &self,
        agent: &AgentDefinition,
        input: &str,
        max_turns: usize,
        config: &RunConfig,
    ) -> Result<RunResult>;
}

/// Routes model tool calls to the MCP server that exposes the tool.
pub struct McpToolRouter {
    routes: BTreeMap<String, Arc<dyn McpServer>>,
    log_payloads: bool,
}

impl McpToolRouter {
    /// Lists tools on every server. On a name clash the earlier server keeps the tool.
    pub async fn discover(servers: &[Arc<dyn McpServer>]) -> Result<(Self, Vec<Tool>)> {
        let mut routes = BTreeMap::<String, Arc<dyn McpServer>>::new();
        let mut tools = Vec::<Tool>::new();

        for server in servers {
            for tool in server.list_tools().await? {
                if let Some(owner) = routes.get(&tool.name) {
                    tracing::warn!(
                        tool = %tool.name,
                        kept = owner.name(),
                        skipped = server.name(),
                        "duplicate mcp tool name"
                    );
                    continue;
                }
                routes.insert(tool.name.clone(), Arc::clone(server));
                tools.push(tool.to_tool());
            }
        }

        Ok((
            Self {
                routes,
                log_payloads: true,
            },
            tools,
        ))
    }

    pub fn with_log_payloads(mut self, log_payloads: bool) -> Self {
        self.log_payloads = log_payloads;
        self
    }
}

#[async_trait]
impl ToolExecutor for McpToolRouter {
    async fn execute(&self, call: ToolCall) -> Result<ToolResult> {
        let Some(server) = self.routes.get(&call.name) else {
            tracing::warn!(tool = %call.name, "model called an unknown tool");
            return Ok(ToolResult::error(
                call.id,
                format!("unknown tool: {}", call.name),
            ));
        };

        let arguments = match call.arguments {
            Value::String(raw) => match serde_json::from_str::<Value>(&raw) {
                Ok(parsed) => parsed,
                Err(err) => {
                    return Ok(ToolResult::error(
                        call.id,
                        format!("tool arguments are not valid JSON: {err}"),
                    ));
                }
            },
            other => other,
        };

        if self.log_payloads {
            tracing::info!(tool = %call.name, server = server.name(), %arguments, "calling tool");
        } else {
            tracing::info!(tool = %call.name, server = server.name(), "calling tool");
        }

        match server.call_tool(&call.name, arguments).await {
            Ok(output) => {
                if self.log_payloads {
                    tracing::debug!(tool = %call.name, is_error = output.is_error, content = %output.content, "tool returned");
                } else {
                    tracing::debug!(tool = %call.name, is_error = output.is_error, bytes = output.content.len(), "tool returned");
                }
                Ok(ToolResult {
                    tool_call_id: call.id,
                    content: output.content,
                    is_error: output.is_error.then_some(true),
                })
            }
            Err(err) => {
                tracing::warn!(tool = %call.name, error = %err, "tool call failed");
                Ok(ToolResult::error(call.id, format!("tool call failed: {err}")))
            }
        }
    }
}

/// Runs an agent through the tool loop against its MCP servers.
#[derive(Debug, Clone, Copy, Default)]
pub struct Runner;

impl Runner {
    fn build_request(agent: &AgentDefinition, input: &str, tools: Vec<Tool>) -> GenerateRequest {
        let mut messages = Vec::with_capacity(2);
        if !agent.instructions().trim().is_empty() {
            messages.push(Message::system(agent.instructions().trim()));
        }
        messages.push(Message::user(input));

        let settings = agent.model_settings();
        let mut request = GenerateRequest::from(messages);
        request.temperature = settings.temperature;
        request.top_p = settings.top_p;
        if !tools.is_empty() {
            request.tools = Some(tools);
            request.tool_choice = settings.tool_choice.clone();
        }
        request
    }
}

#[async_trait]
impl AgentRunner for Runner {
    async fn run(
        &self,
        agent: &AgentDefinition,
        input: &str,
        max_turns: usize,
        config: &RunConfig,
    ) -> Result<RunResult> {
        let span = tracing::info_span!(
            "agent_run",
            workflow = %config.workflow_name,
            agent = %agent.name(),
            max_turns
        );

        async move {
            if max_turns == 0 {
                return Err(Error::Config("max_turns must be greater than 0".to_string()));
            }

            let (router, tools) = McpToolRouter::discover(agent.mcp_servers()).await?;
            let router = router.with_log_payloads(config.trace_include_sensitive_data);
            tracing::debug!(tools = tools.len(), "agent tools resolved");

            let request = Self::build_request(agent, input, tools);
            let outcome = ToolLoopAgent::new(Arc::clone(agent.model()), router)
                .with_max_steps(max_turns)
                .run(request)
                .await?;

            if outcome.stop_reason == ToolLoopStopReason::MaxSteps {
                return Err(Error::MaxTurnsExceeded { max_turns });
            }

            let final_output = outcome
                .last_response
                .as_ref()
                .map(GenerateResponse::text)
                .unwrap_or_default();
            if config.trace_include_sensitive_data {
                tracing::debug!(turns = outcome.steps, output = %final_output, "agent run finished");
            } else {
                tracing::debug!(turns = outcome.steps, "agent run finished");
            }

            Ok(RunResult {
                final_output,
                messages: outcome.messages,
                turns: outcome.steps,
                last_response: outcome.last_response,
            })
        }
        .instrument(span)
        .await
    }
}
