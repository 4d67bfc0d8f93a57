use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::{Value, json};

use dbsmart::agent::{
    AgentDefinition, AgentRunner, ModelSettings, RunConfig, Runner, ToolCall, ToolExecutor,
    ToolLoopAgent, ToolLoopStopReason, ToolResult,
};
use dbsmart::mcp::{McpServer, McpTool, McpToolOutput};
use dbsmart::{
    ContentPart, Error, FinishReason, GenerateRequest, GenerateResponse, LanguageModel, Message,
    Result, Role, Tool, ToolChoice,
};

fn lock_or_err<'a, T>(mutex: &'a Mutex<T>, context: &str) -> Result<MutexGuard<'a, T>> {
    mutex
        .lock()
        .map_err(|_| Error::InvalidResponse(format!("{context} lock poisoned")))
}

#[derive(Clone)]
struct StubModel {
    responses: Arc<Mutex<VecDeque<GenerateResponse>>>,
    requests: Arc<Mutex<Vec<GenerateRequest>>>,
}

impl StubModel {
    fn new(responses: Vec<GenerateResponse>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.into())),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn requests(&self) -> Arc<Mutex<Vec<GenerateRequest>>> {
        self.requests.clone()
    }
}

#[async_trait]
impl LanguageModel for StubModel {
    fn provider(&self) -> &str {
        "stub"
    }

    fn model_id(&self) -> &str {
        "stub-model"
    }

    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse> {
        lock_or_err(&self.requests, "stub model requests")?.push(request);
        let mut responses = lock_or_err(&self.responses, "stub model responses")?;
        responses
            .pop_front()
            .ok_or_else(|| Error::InvalidResponse("stub model has no responses left".to_string()))
    }
}

#[derive(Clone, Default)]
struct StubToolExecutor {
    calls: Arc<Mutex<Vec<ToolCall>>>,
}

#[async_trait]
impl ToolExecutor for StubToolExecutor {
    async fn execute(&self, call: ToolCall) -> Result<ToolResult> {
        lock_or_err(&self.calls, "stub tool calls")?.push(call.clone());
        Ok(ToolResult {
            tool_call_id: "ignored".to_string(),
            content: json!({ "rows": 2 }).to_string(),
            is_error: None,
        })
    }
}

/// In-memory tool server exposing a fixed tool list.
struct FakeDbServer {
    name: String,
    tools: Vec<McpTool>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl FakeDbServer {
    fn new(name: &str, tool_names: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            tools: tool_names
                .iter()
                .map(|tool| McpTool {
                    name: tool.to_string(),
                    description: Some(format!("{tool} on {name}")),
                    input_schema: json!({
                        "type": "object",
                        "properties": { "connection": { "type": "string" } },
                        "required": ["connection"]
                    }),
                })
                .collect(),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> Result<Vec<(String, Value)>> {
        Ok(lock_or_err(&self.calls, "fake server calls")?.clone())
    }
}

#[async_trait]
impl McpServer for FakeDbServer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn list_tools(&self) -> Result<Vec<McpTool>> {
        Ok(self.tools.clone())
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<McpToolOutput> {
        lock_or_err(&self.calls, "fake server calls")?.push((name.to_string(), arguments));
        if name == "dbutils-run-query" {
            return Err(Error::McpRpc {
                code: -32602,
                message: "write statements are not allowed".to_string(),
            });
        }
        Ok(McpToolOutput {
            content: format!("{}: users\norders", self.name),
            is_error: false,
        })
    }

    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }
}

fn tool_call_response(id: &str, name: &str, args: Value) -> GenerateResponse {
    GenerateResponse {
        content: vec![ContentPart::ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            arguments: args,
        }],
        finish_reason: FinishReason::ToolCalls,
        ..GenerateResponse::default()
    }
}

fn text_response(text: &str) -> GenerateResponse {
    GenerateResponse {
        content: vec![ContentPart::Text {
            text: text.to_string(),
        }],
        finish_reason: FinishReason::Stop,
        ..GenerateResponse::default()
    }
}

fn tool_results(request: &GenerateRequest) -> Vec<(String, String, Option<bool>)> {
    request
        .messages
        .iter()
        .filter(|message| message.role == Role::Tool)
        .flat_map(|message| message.content.iter())
        .filter_map(|part| match part {
            ContentPart::ToolResult {
                tool_call_id,
                content,
                is_error,
            } => Some((tool_call_id.clone(), content.clone(), *is_error)),
            _ => None,
        })
        .collect()
}

fn agent_with(model: StubModel, servers: Vec<Arc<dyn McpServer>>) -> AgentDefinition {
    AgentDefinition::new("DBSmartAgent", Arc::new(model))
        .with_instructions("\n只读分析。\n")
        .with_mcp_servers(servers)
        .with_model_settings(ModelSettings {
            temperature: Some(0.2),
            top_p: Some(0.9),
            tool_choice: Some(ToolChoice::Auto),
        })
}

#[tokio::test]
async fn tool_loop_executes_tools_and_stops_on_text() -> Result<()> {
    let model = StubModel::new(vec![
        tool_call_response("call_1", "dbutils-list-tables", json!({"connection": "localhost_3306"})),
        text_response("done"),
    ]);
    let requests = model.requests();
    let executor = StubToolExecutor::default();
    let calls = executor.calls.clone();

    let mut request: GenerateRequest = vec![Message::user("list tables")].into();
    request.tools = Some(vec![Tool {
        name: "dbutils-list-tables".to_string(),
        description: None,
        parameters: json!({ "type": "object" }),
    }]);

    let outcome = ToolLoopAgent::new(model, executor).run(request).await?;

    assert_eq!(outcome.stop_reason, ToolLoopStopReason::NoToolCalls);
    assert_eq!(outcome.steps, 2);
    assert_eq!(
        outcome.last_response.as_ref().map(GenerateResponse::text),
        Some("done".to_string())
    );

    let calls = lock_or_err(&calls, "stub tool calls")?;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].arguments["connection"], "localhost_3306");

    let requests = lock_or_err(&requests, "stub model requests")?;
    assert_eq!(requests.len(), 2);
    // result ids are rewritten to match the originating call
    assert_eq!(
        tool_results(&requests[1]),
        [("call_1".to_string(), "{\"rows\":2}".to_string(), None)]
    );
    Ok(())
}

#[tokio::test]
async fn tool_loop_reports_max_steps() -> Result<()> {
    let model = StubModel::new(vec![
        tool_call_response("call_1", "dbutils-list-tables", json!({})),
        tool_call_response("call_2", "dbutils-list-tables", json!({})),
    ]);
    let outcome = ToolLoopAgent::new(model, StubToolExecutor::default())
        .with_max_steps(2)
        .run(vec![Message::user("loop")].into())
        .await?;
    assert_eq!(outcome.stop_reason, ToolLoopStopReason::MaxSteps);
    assert_eq!(outcome.steps, 2);
    Ok(())
}

#[tokio::test]
async fn tool_loop_rejects_zero_steps() {
    let outcome = ToolLoopAgent::new(StubModel::new(Vec::new()), StubToolExecutor::default())
        .with_max_steps(0)
        .run(vec![Message::user("nothing")].into())
        .await;
    assert!(matches!(outcome, Err(Error::Config(_))));
}

#[tokio::test]
async fn runner_routes_tool_calls_through_mcp() -> Result<()> {
    let server = Arc::new(FakeDbServer::new("dbutils", &["dbutils-list-tables"]));
    let model = StubModel::new(vec![
        tool_call_response(
            "call_1",
            "dbutils-list-tables",
            Value::String("{\"connection\":\"localhost_3306\"}".to_string()),
        ),
        text_response("Tables: users, orders"),
    ]);
    let requests = model.requests();
    let agent = agent_with(model, vec![server.clone() as Arc<dyn McpServer>]);

    let result = Runner
        .run(&agent, "是否列出我数据库中的所有表？", 10, &RunConfig::default())
        .await?;

    assert_eq!(result.final_output, "Tables: users, orders");
    assert_eq!(result.turns, 2);
    assert_eq!(
        server.calls()?,
        [(
            "dbutils-list-tables".to_string(),
            json!({ "connection": "localhost_3306" })
        )]
    );

    let requests = lock_or_err(&requests, "stub model requests")?;
    let first = &requests[0];
    assert_eq!(first.messages[0], Message::system("只读分析。"));
    assert_eq!(first.messages[1], Message::user("是否列出我数据库中的所有表？"));
    assert_eq!(first.temperature, Some(0.2));
    assert_eq!(first.top_p, Some(0.9));
    assert_eq!(first.tool_choice, Some(ToolChoice::Auto));
    let tools = first.tools.clone().unwrap_or_default();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "dbutils-list-tables");
    assert_eq!(tools[0].parameters["required"], json!(["connection"]));

    assert_eq!(
        tool_results(&requests[1]),
        [(
            "call_1".to_string(),
            "dbutils: users\norders".to_string(),
            None
        )]
    );
    Ok(())
}

#[tokio::test]
async fn runner_feeds_tool_failures_back_to_the_model() -> Result<()> {
    let server = Arc::new(FakeDbServer::new(
        "dbutils",
        &["dbutils-list-tables", "dbutils-run-query"],
    ));
    let model = StubModel::new(vec![
        GenerateResponse {
            content: vec![
                ContentPart::ToolCall {
                    id: "call_1".to_string(),
                    name: "drop_everything".to_string(),
                    arguments: json!({}),
                },
                ContentPart::ToolCall {
                    id: "call_2".to_string(),
                    name: "dbutils-run-query".to_string(),
                    arguments: json!({ "sql": "DELETE FROM users" }),
                },
                ContentPart::ToolCall {
                    id: "call_3".to_string(),
                    name: "dbutils-list-tables".to_string(),
                    arguments: Value::String("{not json".to_string()),
                },
            ],
            finish_reason: FinishReason::ToolCalls,
            ..GenerateResponse::default()
        },
        text_response("无法执行写操作"),
    ]);
    let requests = model.requests();
    let agent = agent_with(model, vec![server.clone() as Arc<dyn McpServer>]);

    let result = Runner
        .run(&agent, "删除用户表", 10, &RunConfig::default())
        .await?;
    assert_eq!(result.final_output, "无法执行写操作");

    // only the well-formed call to a known tool reaches the server
    assert_eq!(server.calls()?.len(), 1);

    let requests = lock_or_err(&requests, "stub model requests")?;
    let results = tool_results(&requests[1]);
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|(_, _, is_error)| *is_error == Some(true)));
    assert!(results[0].1.contains("unknown tool: drop_everything"));
    assert!(results[1].1.contains("write statements are not allowed"));
    assert!(results[2].1.contains("not valid JSON"));
    Ok(())
}

#[tokio::test]
async fn runner_errors_when_turns_run_out() -> Result<()> {
    let server = Arc::new(FakeDbServer::new("dbutils", &["dbutils-list-tables"]));
    let model = StubModel::new(vec![
        tool_call_response("call_1", "dbutils-list-tables", json!({})),
        tool_call_response("call_2", "dbutils-list-tables", json!({})),
    ]);
    let agent = agent_with(model, vec![server as Arc<dyn McpServer>]);

    let outcome = Runner.run(&agent, "loop", 2, &RunConfig::default()).await;
    assert!(matches!(
        outcome,
        Err(Error::MaxTurnsExceeded { max_turns: 2 })
    ));

    let zero = Runner.run(&agent, "loop", 0, &RunConfig::default()).await;
    assert!(matches!(zero, Err(Error::Config(_))));
    Ok(())
}

#[tokio::test]
async fn runner_keeps_first_server_on_duplicate_tool_names() -> Result<()> {
    let primary = Arc::new(FakeDbServer::new("primary", &["dbutils-list-tables"]));
    let secondary = Arc::new(FakeDbServer::new(
        "secondary",
        &["dbutils-list-tables", "dbutils-describe-table"],
    ));
    let model = StubModel::new(vec![
        tool_call_response("call_1", "dbutils-list-tables", json!({})),
        text_response("ok"),
    ]);
    let requests = model.requests();
    let servers: Vec<Arc<dyn McpServer>> = vec![primary.clone(), secondary.clone()];
    let agent = agent_with(model, servers);

    Runner.run(&agent, "tables", 10, &RunConfig::default()).await?;

    assert_eq!(primary.calls()?.len(), 1);
    assert!(secondary.calls()?.is_empty());

    let requests = lock_or_err(&requests, "stub model requests")?;
    let names: Vec<String> = requests[0]
        .tools
        .iter()
        .flatten()
        .map(|tool| tool.name.clone())
        .collect();
    assert_eq!(names, ["dbutils-list-tables", "dbutils-describe-table"]);
    Ok(())
}

#[tokio::test]
async fn runner_omits_blank_instructions_and_tool_choice_without_tools() -> Result<()> {
    let model = StubModel::new(vec![text_response("hello")]);
    let requests = model.requests();
    let agent = AgentDefinition::new("bare", Arc::new(model)).with_model_settings(ModelSettings {
        tool_choice: Some(ToolChoice::Auto),
        ..ModelSettings::default()
    });

    let result = Runner.run(&agent, "hi", 10, &RunConfig::default()).await?;
    assert_eq!(result.final_output, "hello");

    let requests = lock_or_err(&requests, "stub model requests")?;
    assert_eq!(requests[0].messages, [Message::user("hi")]);
    assert!(requests[0].tools.is_none());
    assert!(requests[0].tool_choice.is_none());
    Ok(())
}
