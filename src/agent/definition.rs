use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::mcp::McpServer;
use crate::model::LanguageModel;
use crate::types::ToolChoice;

/// Sampling settings forwarded with every model call of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ModelSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
}

/// An agent: instructions, tool sessions and the model that drives them.
#[derive(Clone)]
pub struct AgentDefinition {
    name: String,
    instructions: String,
    mcp_servers: Vec<Arc<dyn McpServer>>,
    model: Arc<dyn LanguageModel>,
    model_settings: ModelSettings,
}

impl std::fmt::Debug for AgentDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let servers: Vec<&str> = self.mcp_servers.iter().map(|s| s.name()).collect();
        f.debug_struct("AgentDefinition")
            .field("name", &self.name)
            .field("mcp_servers", &servers)
            .field("model", &self.model.model_id())
            .field("model_settings", &self.model_settings)
            .finish()
    }
}

impl AgentDefinition {
    pub fn new(name: impl Into<String>, model: Arc<dyn LanguageModel>) -> Self {
        Self {
            name: name.into(),
            instructions: String::new(),
            mcp_servers: Vec::new(),
            model,
            model_settings: ModelSettings::default(),
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn with_mcp_servers(mut self, servers: Vec<Arc<dyn McpServer>>) -> Self {
        self.mcp_servers = servers;
        self
    }

    pub fn with_model_settings(mut self, settings: ModelSettings) -> Self {
        self.model_settings = settings;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instructions(&self) -> &str {
        &self.instructions
    }

    pub fn mcp_servers(&self) -> &[Arc<dyn McpServer>] {
        &self.mcp_servers
    }

    pub fn model(&self) -> &Arc<dyn LanguageModel> {
        &self.model
    }

    pub fn model_settings(&self) -> &ModelSettings {
        &self.model_settings
    }
}
