use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::model::{LanguageModel, ModelProvider};
use crate::types::{
    ContentPart, FinishReason, GenerateRequest, GenerateResponse, Message, Role, Tool, ToolChoice,
    Usage, Warning, parse_tool_call_arguments_json_or_string,
};
use crate::{Error, Result};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Clone)]
pub struct OpenAICompatible {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    default_model: String,
}

impl std::fmt::Debug for OpenAICompatible {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAICompatible")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("default_model", &self.default_model)
            .finish()
    }
}

impl OpenAICompatible {
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            default_model: String::new(),
        })
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        if !base_url.trim().is_empty() {
            self.base_url = base_url.trim().to_string();
        }
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn chat_completions_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        if base.ends_with("/chat/completions") {
            base.to_string()
        } else {
            format!("{base}/chat/completions")
        }
    }

    fn resolve_model<'a>(&'a self, request: &'a GenerateRequest) -> Result<&'a str> {
        if let Some(model) = request.model.as_deref().filter(|m| !m.trim().is_empty()) {
            return Ok(model);
        }
        if !self.default_model.trim().is_empty() {
            return Ok(self.default_model.as_str());
        }
        Err(Error::Config(
            "model is not set (pass --model, set DBSMART_MODEL, or set provider.model in the profile)"
                .to_string(),
        ))
    }

    fn tool_to_openai(tool: &Tool) -> Value {
        let mut function = Map::<String, Value>::new();
        function.insert("name".to_string(), Value::String(tool.name.clone()));
        if let Some(description) = &tool.description {
            function.insert(
                "description".to_string(),
                Value::String(description.clone()),
            );
        }
        let parameters = if tool.parameters.is_null() {
            serde_json::json!({ "type": "object", "properties": {} })
        } else {
            tool.parameters.clone()
        };
        function.insert("parameters".to_string(), parameters);

        serde_json::json!({ "type": "function", "function": Value::Object(function) })
    }

    fn tool_choice_to_openai(choice: &ToolChoice, warnings: &mut Vec<Warning>) -> Value {
        match choice {
            ToolChoice::Auto => Value::String("auto".to_string()),
            ToolChoice::None => Value::String("none".to_string()),
            ToolChoice::Required => {
                warnings.push(Warning::Compatibility {
                    feature: "tool_choice.required".to_string(),
                    details: "chat/completions does not support `required`; using `auto`"
                        .to_string(),
                });
                Value::String("auto".to_string())
            }
            ToolChoice::Tool { name } => serde_json::json!({
                "type": "function",
                "function": { "name": name }
            }),
        }
    }

    fn messages_to_chat_messages(messages: &[Message]) -> (Vec<Value>, Vec<Warning>) {
        let mut out = Vec::<Value>::new();
        let mut warnings = Vec::<Warning>::new();

        for message in messages {
            match message.role {
                Role::System | Role::User => {
                    let role = if message.role == Role::System {
                        "system"
                    } else {
                        "user"
                    };
                    let mut text = String::new();
                    for part in &message.content {
                        match part {
                            ContentPart::Text { text: chunk } => text.push_str(chunk),
                            other => warnings.push(Warning::Unsupported {
                                feature: format!("{role}_content_part"),
                                details: Some(format!("unsupported {role} content part: {other:?}")),
                            }),
                        }
                    }
                    if text.trim().is_empty() {
                        continue;
                    }
                    out.push(serde_json::json!({ "role": role, "content": text }));
                }
                Role::Assistant => {
                    let mut text = String::new();
                    let mut tool_calls = Vec::<Value>::new();
                    for part in &message.content {
                        match part {
                            ContentPart::Text { text: chunk } => text.push_str(chunk),
                            ContentPart::ToolCall {
                                id,
                                name,
                                arguments,
                            } => {
                                let arguments = match arguments {
                                    Value::String(raw) => raw.clone(),
                                    other => other.to_string(),
                                };
                                tool_calls.push(serde_json::json!({
                                    "id": id,
                                    "type": "function",
                                    "function": {
                                        "name": name,
                                        "arguments": arguments,
                                    }
                                }));
                            }
                            other => warnings.push(Warning::Unsupported {
                                feature: "assistant_content_part".to_string(),
                                details: Some(format!(
                                    "unsupported assistant content part: {other:?}"
                                )),
                            }),
                        }
                    }

                    if text.trim().is_empty() && tool_calls.is_empty() {
                        continue;
                    }

                    let mut msg = Map::<String, Value>::new();
                    msg.insert("role".to_string(), Value::String("assistant".to_string()));
                    if text.trim().is_empty() {
                        msg.insert("content".to_string(), Value::Null);
                    } else {
                        msg.insert("content".to_string(), Value::String(text));
                    }
                    if !tool_calls.is_empty() {
                        msg.insert("tool_calls".to_string(), Value::Array(tool_calls));
                    }
                    out.push(Value::Object(msg));
                }
                Role::Tool => {
                    for part in &message.content {
                        match part {
                            ContentPart::ToolResult {
                                tool_call_id,
                                content,
                                ..
                            } => {
                                // every tool_call_id must be answered, even with an empty body
                                out.push(serde_json::json!({
                                    "role": "tool",
                                    "tool_call_id": tool_call_id,
                                    "content": content,
                                }));
                            }
                            other => warnings.push(Warning::Unsupported {
                                feature: "tool_content_part".to_string(),
                                details: Some(format!("unsupported tool content part: {other:?}")),
                            }),
                        }
                    }
                }
            }
        }

        (out, warnings)
    }

    fn parse_finish_reason(reason: Option<&str>) -> FinishReason {
        match reason {
            Some("stop") => FinishReason::Stop,
            Some("length") => FinishReason::Length,
            Some("tool_calls") | Some("function_call") => FinishReason::ToolCalls,
            Some("content_filter") => FinishReason::ContentFilter,
            Some("error") => FinishReason::Error,
            _ => FinishReason::Unknown,
        }
    }

    fn parse_usage(value: &Value) -> Usage {
        let mut usage = Usage::default();
        if let Some(obj) = value.as_object() {
            usage.input_tokens = obj.get("prompt_tokens").and_then(Value::as_u64);
            usage.output_tokens = obj.get("completion_tokens").and_then(Value::as_u64);
            usage.total_tokens = obj.get("total_tokens").and_then(Value::as_u64);
        }
        usage.merge_total();
        usage
    }

    fn build_body(&self, request: &GenerateRequest) -> Result<(Map<String, Value>, Vec<Warning>)> {
        let model = self.resolve_model(request)?;
        let (messages, mut warnings) = Self::messages_to_chat_messages(&request.messages);

        let mut body = Map::<String, Value>::new();
        body.insert("model".to_string(), Value::String(model.to_string()));
        body.insert("messages".to_string(), Value::Array(messages));

        if let Some(temperature) = request.temperature {
            body.insert("temperature".to_string(), f32_to_json_number(temperature));
        }
        if let Some(max_tokens) = request.max_tokens {
            body.insert("max_tokens".to_string(), Value::Number(max_tokens.into()));
        }
        if let Some(top_p) = request.top_p {
            body.insert("top_p".to_string(), f32_to_json_number(top_p));
        }
        if let Some(stops) = request.stop_sequences.as_ref() {
            let stops = stops
                .iter()
                .filter(|s| !s.trim().is_empty())
                .map(|s| Value::String(s.clone()))
                .collect::<Vec<_>>();
            if !stops.is_empty() {
                body.insert("stop".to_string(), Value::Array(stops));
            }
        }

        let has_tools = request.tools.as_ref().is_some_and(|tools| !tools.is_empty());
        if let Some(tools) = request.tools.as_ref().filter(|tools| !tools.is_empty()) {
            let mapped = tools.iter().map(Self::tool_to_openai).collect();
            body.insert("tools".to_string(), Value::Array(mapped));
        }
        if let Some(tool_choice) = request.tool_choice.as_ref() {
            if has_tools {
                body.insert(
                    "tool_choice".to_string(),
                    Self::tool_choice_to_openai(tool_choice, &mut warnings),
                );
            } else {
                warnings.push(Warning::Unsupported {
                    feature: "tool_choice".to_string(),
                    details: Some("tool_choice dropped because no tools were sent".to_string()),
                });
            }
        }

        Ok((body, warnings))
    }
}

fn f32_to_json_number(value: f32) -> Value {
    // f32 -> f64 widening leaks binary noise (0.2 -> 0.20000000298...)
    let widened = (f64::from(value) * 1_000_000.0).round() / 1_000_000.0;
    serde_json::Number::from_f64(widened)
        .map(Value::Number)
        .unwrap_or_else(|| Value::Number(0.into()))
}

#[derive(Debug, Deserialize)]
struct ChatCompletionsResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<Value>,
}

#[derive(Debug, Deserialize, Default)]
struct ChatChoice {
    #[serde(default)]
    message: ChatMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ChatToolCall>>,
}

#[derive(Debug, Deserialize, Default)]
struct ChatToolCall {
    #[serde(default)]
    id: String,
    #[serde(default)]
    function: ChatToolFunction,
}

#[derive(Debug, Deserialize, Default)]
struct ChatToolFunction {
    #[serde(default)]
    name: String,
    #[serde(default)]
    arguments: String,
}

#[async_trait]
impl LanguageModel for OpenAICompatible {
    fn provider(&self) -> &str {
        "openai-compatible"
    }

    fn model_id(&self) -> &str {
        self.default_model.as_str()
    }

    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse> {
        let (body, mut warnings) = self.build_body(&request)?;

        let url = self.chat_completions_url();
        tracing::debug!(url = %url, messages = request.messages.len(), "sending chat completion");
        let mut req = self.http.post(url);
        if !self.api_key.trim().is_empty() {
            req = req.bearer_auth(&self.api_key);
        }
        let response = req.json(&body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Api { status, body: text });
        }

        let parsed = response.json::<ChatCompletionsResponse>().await?;
        let choice = parsed.choices.first().ok_or_else(|| {
            Error::InvalidResponse("chat/completions response has no choices".to_string())
        })?;

        let mut content = Vec::<ContentPart>::new();
        if let Some(text) = choice.message.content.as_deref().filter(|t| !t.is_empty()) {
            content.push(ContentPart::Text {
                text: text.to_string(),
            });
        }
        if let Some(tool_calls) = choice.message.tool_calls.as_ref() {
            for tool_call in tool_calls {
                let arguments = parse_tool_call_arguments_json_or_string(
                    &tool_call.function.arguments,
                    &tool_call.function.name,
                    &mut warnings,
                );
                content.push(ContentPart::ToolCall {
                    id: tool_call.id.clone(),
                    name: tool_call.function.name.clone(),
                    arguments,
                });
            }
        }

        let usage = parsed
            .usage
            .as_ref()
            .map(Self::parse_usage)
            .unwrap_or_default();

        let finish_reason = Self::parse_finish_reason(choice.finish_reason.as_deref());

        for warning in &warnings {
            tracing::warn!(?warning, "chat completion warning");
        }

        Ok(GenerateResponse {
            content,
            finish_reason,
            usage,
            warnings,
            provider_metadata: Some(serde_json::json!({ "id": parsed.id, "model": parsed.model })),
        })
    }
}

/// Hands out [`OpenAICompatible`] models that share one HTTP client and endpoint.
#[derive(Debug, Clone)]
pub struct OpenAICompatibleProvider {
    client: OpenAICompatible,
}

impl OpenAICompatibleProvider {
    pub fn new(client: OpenAICompatible) -> Self {
        Self { client }
    }
}

impl ModelProvider for OpenAICompatibleProvider {
    fn resolve(&self, model_name: &str) -> Result<Arc<dyn LanguageModel>> {
        let model = model_name.trim();
        let model = if model.is_empty() {
            self.client.default_model.trim()
        } else {
            model
        };
        if model.is_empty() {
            return Err(Error::Config(
                "cannot resolve a model: no model name and no default model".to_string(),
            ));
        }
        Ok(Arc::new(self.client.clone().with_model(model)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> Result<OpenAICompatible> {
        Ok(OpenAICompatible::new("sk-test")?
            .with_base_url("http://localhost:1234/v1/")
            .with_model("test-model"))
    }

    #[test]
    fn appends_chat_completions_suffix_once() -> Result<()> {
        let client = client()?;
        assert_eq!(
            client.chat_completions_url(),
            "http://localhost:1234/v1/chat/completions"
        );
        let client = client.with_base_url("http://localhost:1234/v1/chat/completions");
        assert_eq!(
            client.chat_completions_url(),
            "http://localhost:1234/v1/chat/completions"
        );
        Ok(())
    }

    #[test]
    fn tool_choice_required_maps_to_auto() {
        let mut warnings = Vec::<Warning>::new();
        let mapped = OpenAICompatible::tool_choice_to_openai(&ToolChoice::Required, &mut warnings);
        assert_eq!(mapped, Value::String("auto".to_string()));
        assert!(
            warnings
                .iter()
                .any(|w| matches!(w, Warning::Compatibility { .. }))
        );
    }

    #[test]
    fn converts_tool_result_to_tool_message() {
        let messages = vec![Message::tool_result("call_1", "{\"ok\":true}")];

        let (mapped, warnings) = OpenAICompatible::messages_to_chat_messages(&messages);
        assert!(warnings.is_empty());
        assert_eq!(
            mapped,
            vec![serde_json::json!({
                "role": "tool",
                "tool_call_id": "call_1",
                "content": "{\"ok\":true}",
            })]
        );
    }

    #[test]
    fn assistant_tool_calls_serialize_arguments_as_string() {
        let messages = vec![Message {
            role: Role::Assistant,
            content: vec![ContentPart::ToolCall {
                id: "call_1".to_string(),
                name: "dbutils-list-tables".to_string(),
                arguments: serde_json::json!({ "connection": "localhost_3306" }),
            }],
        }];

        let (mapped, _) = OpenAICompatible::messages_to_chat_messages(&messages);
        assert_eq!(mapped[0]["content"], Value::Null);
        assert_eq!(
            mapped[0]["tool_calls"][0]["function"]["arguments"],
            Value::String("{\"connection\":\"localhost_3306\"}".to_string())
        );
    }

    #[test]
    fn sampling_settings_are_not_widened_with_noise() -> Result<()> {
        let mut request = GenerateRequest::from(vec![Message::user("hi")]);
        request.temperature = Some(0.2);
        request.top_p = Some(0.9);
        let (body, _) = client()?.build_body(&request)?;
        assert_eq!(body["temperature"], serde_json::json!(0.2));
        assert_eq!(body["top_p"], serde_json::json!(0.9));
        Ok(())
    }

    #[test]
    fn tool_choice_without_tools_is_dropped() -> Result<()> {
        let mut request = GenerateRequest::from(vec![Message::user("hi")]);
        request.tool_choice = Some(ToolChoice::Auto);
        let (body, warnings) = client()?.build_body(&request)?;
        assert!(!body.contains_key("tool_choice"));
        assert_eq!(warnings.len(), 1);
        Ok(())
    }

    #[test]
    fn missing_model_is_a_config_error() -> Result<()> {
        let client = OpenAICompatible::new("")?;
        let request = GenerateRequest::from(vec![Message::user("hi")]);
        assert!(matches!(client.build_body(&request), Err(Error::Config(_))));
        Ok(())
    }

    #[test]
    fn provider_resolves_empty_name_to_default_model() -> Result<()> {
        let provider = OpenAICompatibleProvider::new(client()?);
        assert_eq!(provider.resolve("")?.model_id(), "test-model");
        assert_eq!(provider.resolve("other")?.model_id(), "other");

        let provider = OpenAICompatibleProvider::new(OpenAICompatible::new("")?);
        assert!(provider.resolve("  ").is_err());
        Ok(())
    }
}
