//! Interactive session: connect the tool server, list its tools, then
//! read questions and print the agent's answers until the user leaves.

use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt as _, AsyncWrite, AsyncWriteExt as _};

use crate::Result;
use crate::agent::{AgentDefinition, AgentRunner, RunConfig};
use crate::mcp::{McpServer, McpTool};
use crate::settings::DEFAULT_MAX_TURNS;

pub const CONNECTING: &str = "正在连接本地MCP数据库工具服务...";
pub const CONNECTED: &str = "连接成功！";
pub const PROMPT: &str = "\n请输入数据库分析/查询需求（quit退出）：";
pub const GOODBYE: &str = "感谢使用，再见！";
pub const EMPTY_INPUT: &str = "输入不能为空";
pub const RUNNING: &str = "正在分析并执行，请稍候...";
pub const RESULT_HEADER: &str = "\n【分析结果】";
pub const CLOSED: &str = "MCP数据库工具服务已关闭。";
const NO_DESCRIPTION: &str = "无";
const EXIT_KEYWORDS: [&str; 2] = ["quit", "exit"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputAction {
    Empty,
    Exit,
    Query(String),
}

pub fn classify_input(line: &str) -> InputAction {
    let text = line.trim();
    if text.is_empty() {
        InputAction::Empty
    } else if EXIT_KEYWORDS
        .iter()
        .any(|keyword| text.eq_ignore_ascii_case(keyword))
    {
        InputAction::Exit
    } else {
        InputAction::Query(text.to_string())
    }
}

/// Why a session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Exit,
    EndOfInput,
    /// Connecting, listing tools or building the agent failed.
    StartupFailed,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub max_turns: usize,
    pub run_config: RunConfig,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            max_turns: DEFAULT_MAX_TURNS,
            run_config: RunConfig {
                workflow_name: "DBSmartAgent session".to_string(),
                trace_include_sensitive_data: false,
            },
        }
    }
}

enum LoopState {
    AwaitingInput,
    Running(String),
    Terminated(SessionEnd),
}

/// Connects `server`, runs the interaction loop, and releases the server.
///
/// `cleanup` runs exactly once whatever happens before it; a failure to
/// write to `output` is returned only after the server has been released.
pub async fn run_session<R, W, F>(
    server: Arc<dyn McpServer>,
    build_agent: F,
    runner: &dyn AgentRunner,
    options: &SessionOptions,
    input: &mut R,
    output: &mut W,
) -> Result<SessionEnd>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
    F: FnOnce(Arc<dyn McpServer>) -> Result<AgentDefinition>,
{
    let outcome = start_and_loop(&server, build_agent, runner, options, input, output).await;

    match server.cleanup().await {
        Ok(()) => say(output, CLOSED).await?,
        Err(err) => {
            tracing::error!(server = server.name(), error = %err, "mcp cleanup failed");
            report_error(output, &err).await?;
        }
    }

    outcome
}

async fn start_and_loop<R, W, F>(
    server: &Arc<dyn McpServer>,
    build_agent: F,
    runner: &dyn AgentRunner,
    options: &SessionOptions,
    input: &mut R,
    output: &mut W,
) -> Result<SessionEnd>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
    F: FnOnce(Arc<dyn McpServer>) -> Result<AgentDefinition>,
{
    say(output, CONNECTING).await?;
    if let Err(err) = server.connect().await {
        tracing::error!(server = server.name(), error = %err, "mcp connect failed");
        report_error(output, &err).await?;
        return Ok(SessionEnd::StartupFailed);
    }
    say(output, CONNECTED).await?;

    let tools = match server.list_tools().await {
        Ok(tools) => tools,
        Err(err) => {
            tracing::error!(server = server.name(), error = %err, "listing mcp tools failed");
            report_error(output, &err).await?;
            return Ok(SessionEnd::StartupFailed);
        }
    };
    print_tools(output, &tools).await?;

    let agent = match build_agent(Arc::clone(server)) {
        Ok(agent) => agent,
        Err(err) => {
            tracing::error!(error = %err, "building agent failed");
            report_error(output, &err).await?;
            return Ok(SessionEnd::StartupFailed);
        }
    };

    interaction_loop(&agent, runner, options, input, output).await
}

/// Reads questions until the exit keyword or end of input.
///
/// A failed turn, or a line that is not valid UTF-8, is reported and the
/// loop keeps going. Read and write failures on the streams end it.
pub async fn interaction_loop<R, W>(
    agent: &AgentDefinition,
    runner: &dyn AgentRunner,
    options: &SessionOptions,
    input: &mut R,
    output: &mut W,
) -> Result<SessionEnd>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let mut state = LoopState::AwaitingInput;
    let mut buf = Vec::<u8>::new();

    loop {
        state = match state {
            LoopState::AwaitingInput => {
                output.write_all(PROMPT.as_bytes()).await?;
                output.flush().await?;

                buf.clear();
                if input.read_until(b'\n', &mut buf).await? == 0 {
                    say(output, "").await?;
                    LoopState::Terminated(SessionEnd::EndOfInput)
                } else {
                    match String::from_utf8(std::mem::take(&mut buf)) {
                        Err(err) => {
                            tracing::warn!(error = %err, "input line is not valid utf-8");
                            report_error(output, &err).await?;
                            LoopState::AwaitingInput
                        }
                        Ok(line) => match classify_input(&line) {
                            InputAction::Empty => {
                                say(output, EMPTY_INPUT).await?;
                                LoopState::AwaitingInput
                            }
                            InputAction::Exit => {
                                say(output, GOODBYE).await?;
                                LoopState::Terminated(SessionEnd::Exit)
                            }
                            InputAction::Query(query) => LoopState::Running(query),
                        },
                    }
                }
            }
            LoopState::Running(query) => {
                say(output, RUNNING).await?;
                match runner
                    .run(agent, &query, options.max_turns, &options.run_config)
                    .await
                {
                    Ok(result) => {
                        tracing::info!(turns = result.turns, "turn finished");
                        say(output, RESULT_HEADER).await?;
                        say(output, &result.final_output).await?;
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "turn failed");
                        report_error(output, &err).await?;
                    }
                }
                LoopState::AwaitingInput
            }
            LoopState::Terminated(end) => return Ok(end),
        };
    }
}

async fn print_tools<W>(output: &mut W, tools: &[McpTool]) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    say(output, &format!("数据库MCP服务可用工具（共{}个）：", tools.len())).await?;
    for tool in tools {
        let description = tool
            .description
            .as_deref()
            .filter(|description| !description.trim().is_empty())
            .unwrap_or(NO_DESCRIPTION);
        let parameters = if tool.input_schema.is_null() {
            "{}".to_string()
        } else {
            tool.input_schema.to_string()
        };
        say(output, &format!("- 工具名称: {}", tool.name)).await?;
        say(output, &format!("  描述: {description}")).await?;
        say(output, &format!("  输入参数: {parameters}")).await?;
        say(output, &"-".repeat(40)).await?;
    }
    Ok(())
}

async fn report_error<W>(output: &mut W, err: &(dyn std::error::Error + 'static)) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    say(output, &format!("发生异常: {err}")).await?;
    let mut source = err.source();
    while let Some(cause) = source {
        say(output, &format!("  caused by: {cause}")).await?;
        source = cause.source();
    }
    Ok(())
}

async fn say<W>(output: &mut W, text: &str) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    output.write_all(text.as_bytes()).await?;
    output.write_all(b"\n").await?;
    output.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_trims_and_detects_exit_keywords() {
        assert_eq!(classify_input(""), InputAction::Empty);
        assert_eq!(classify_input("   \t\n"), InputAction::Empty);
        for keyword in ["quit", "QUIT", "Quit", " exit ", "EXIT", "eXiT\n"] {
            assert_eq!(classify_input(keyword), InputAction::Exit, "{keyword:?}");
        }
        assert_eq!(
            classify_input("  列出所有表 \n"),
            InputAction::Query("列出所有表".to_string())
        );
        assert_eq!(
            classify_input("quit now"),
            InputAction::Query("quit now".to_string())
        );
    }

    #[test]
    fn default_options_keep_payloads_out_of_logs() {
        let options = SessionOptions::default();
        assert_eq!(options.max_turns, 10);
        assert!(!options.run_config.trace_include_sensitive_data);
    }
}
