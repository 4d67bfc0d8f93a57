use async_trait::async_trait;

use crate::model::LanguageModel;
use crate::types::{ContentPart, Message, Role};
use crate::{Error, Result};

use super::types::{ToolCall, ToolLoopOutcome, ToolLoopState, ToolLoopStopReason, ToolResult};

const DEFAULT_MAX_STEPS: usize = 10;

#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, call: ToolCall) -> Result<ToolResult>;
}

/// Alternates model calls and tool execution until the model answers
/// without calling a tool or `max_steps` model calls have been made.
pub struct ToolLoopAgent<M, E> {
    model: M,
    executor: E,
    max_steps: usize,
}

impl<M, E> ToolLoopAgent<M, E>
where
    M: LanguageModel,
    E: ToolExecutor,
{
    pub fn new(model: M, executor: E) -> Self {
        Self {
            model,
            executor,
            max_steps: DEFAULT_MAX_STEPS,
        }
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub async fn run(&self, request: crate::types::GenerateRequest) -> Result<ToolLoopOutcome> {
        if self.max_steps == 0 {
            return Err(Error::Config(
                "tool loop max_steps must be greater than 0".to_string(),
            ));
        }

        let mut state = ToolLoopState::new(request);

        for step in 0..self.max_steps {
            state.step = step + 1;

            let response = self.model.generate(state.request.clone()).await?;
            state.last_tool_calls = collect_tool_calls(&response.content);
            if !response.content.is_empty() {
                state.request.messages.push(Message {
                    role: Role::Assistant,
                    content: response.content.clone(),
                });
            }
            state.last_response = Some(response);

            if state.last_tool_calls.is_empty() {
                return Ok(state.into_outcome(ToolLoopStopReason::NoToolCalls));
            }

            tracing::debug!(
                step = state.step,
                tool_calls = state.last_tool_calls.len(),
                "model requested tool calls"
            );
            for call in &state.last_tool_calls {
                let result = self.executor.execute(call.clone()).await?;
                let result = normalize_result(call, result);
                state.request.messages.push(result.into_message());
            }
        }

        Ok(state.into_outcome(ToolLoopStopReason::MaxSteps))
    }
}

fn collect_tool_calls(parts: &[ContentPart]) -> Vec<ToolCall> {
    parts.iter().filter_map(ToolCall::from_content).collect()
}

fn normalize_result(call: &ToolCall, mut result: ToolResult) -> ToolResult {
    if result.tool_call_id != call.id {
        result.tool_call_id = call.id.clone();
    }
    result
}
