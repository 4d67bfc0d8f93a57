//! Runtime settings.
//!
//! Resolved once at startup from, in order of precedence: command-line
//! overrides, an optional TOML profile, the environment (dotenv file first,
//! then the process), and built-in defaults.

mod env;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agent::ModelSettings;
use crate::mcp::{DEFAULT_REQUEST_TIMEOUT, McpStdioParams};
use crate::types::ToolChoice;
use crate::{Error, Result};

pub use env::{Env, parse_dotenv};

pub const DEFAULT_DB_CONFIG: &str = "examples/config.yaml";
pub const DEFAULT_MCP_COMMAND: &str = "python";
pub const DEFAULT_MCP_SERVER_NAME: &str = "dbutils";
pub const DEFAULT_MAX_TURNS: usize = 10;

const BASE_URL_KEYS: [&str; 2] = ["DBSMART_BASE_URL", "OPENAI_BASE_URL"];
const API_KEY_KEYS: [&str; 2] = ["DBSMART_API_KEY", "OPENAI_API_KEY"];
const MODEL_KEYS: [&str; 2] = ["DBSMART_MODEL", "OPENAI_MODEL"];

pub fn default_mcp_args(db_config: &Path) -> Vec<String> {
    vec![
        "-m".to_string(),
        "src.mcp_dbutils".to_string(),
        "--config".to_string(),
        db_config.display().to_string(),
    ]
}

pub fn default_model_settings() -> ModelSettings {
    ModelSettings {
        temperature: Some(0.2),
        top_p: Some(0.9),
        tool_choice: Some(ToolChoice::Auto),
    }
}

/// Values given explicitly on the command line.
#[derive(Clone, Default)]
pub struct SettingsOverrides {
    pub db_config: Option<PathBuf>,
    pub mcp_command: Option<String>,
    pub mcp_args: Vec<String>,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub max_turns: Option<usize>,
    pub json_logs: bool,
}

impl std::fmt::Debug for SettingsOverrides {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettingsOverrides")
            .field("db_config", &self.db_config)
            .field("mcp_command", &self.mcp_command)
            .field("mcp_args", &self.mcp_args)
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .field("max_turns", &self.max_turns)
            .field("json_logs", &self.json_logs)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProviderProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Environment variables consulted for the API key before the built-in ones.
    #[serde(default, alias = "api_key_envs", skip_serializing_if = "Vec::is_empty")]
    pub api_key_env: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct McpProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_tools_list: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout_secs: Option<u64>,
}

/// Optional TOML settings file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Profile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_config: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<usize>,
    #[serde(default)]
    pub provider: ProviderProfile,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_settings: Option<ModelSettings>,
    #[serde(default)]
    pub mcp: McpProfile,
}

impl Profile {
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|err| {
            Error::Config(format!("failed to read profile {}: {err}", path.display()))
        })?;
        Self::from_toml_str(&contents)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McpSettings {
    pub server_name: String,
    pub params: McpStdioParams,
    pub cache_tools_list: bool,
    pub request_timeout: Duration,
}

#[derive(Clone)]
pub struct Settings {
    pub base_url: Option<String>,
    pub api_key: String,
    pub model: String,
    pub db_config: PathBuf,
    pub mcp: McpSettings,
    pub model_settings: ModelSettings,
    pub max_turns: usize,
    pub json_logs: bool,
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let api_key = if self.api_key.is_empty() {
            "<empty>"
        } else {
            "<redacted>"
        };
        f.debug_struct("Settings")
            .field("base_url", &self.base_url)
            .field("api_key", &api_key)
            .field("model", &self.model)
            .field("db_config", &self.db_config)
            .field("mcp", &self.mcp)
            .field("model_settings", &self.model_settings)
            .field("max_turns", &self.max_turns)
            .field("json_logs", &self.json_logs)
            .finish()
    }
}

impl Settings {
    /// Reads the optional profile and dotenv files, then resolves.
    pub fn load(
        overrides: SettingsOverrides,
        profile_path: Option<&Path>,
        dotenv_path: &Path,
    ) -> Result<Self> {
        let profile = profile_path.map(Profile::load).transpose()?.unwrap_or_default();
        let env = Env::from_dotenv_file(dotenv_path)?;
        Self::resolve(overrides, profile, &env)
    }

    pub fn resolve(overrides: SettingsOverrides, profile: Profile, env: &Env) -> Result<Self> {
        let Profile {
            db_config,
            max_turns,
            provider,
            model_settings,
            mcp,
        } = profile;

        let base_url = non_blank(overrides.base_url)
            .or_else(|| non_blank(provider.base_url))
            .or_else(|| env.first_of(BASE_URL_KEYS));

        let api_key = non_blank(overrides.api_key)
            .or_else(|| env.first_of(provider.api_key_env.iter().map(String::as_str)))
            .or_else(|| env.first_of(API_KEY_KEYS))
            .unwrap_or_default();

        let model = non_blank(overrides.model)
            .or_else(|| non_blank(provider.model))
            .or_else(|| env.first_of(MODEL_KEYS))
            .ok_or_else(|| {
                Error::Config(
                    "no model configured: pass --model or set DBSMART_MODEL / OPENAI_MODEL"
                        .to_string(),
                )
            })?;

        let db_config = overrides
            .db_config
            .or(db_config)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_CONFIG));

        let command = non_blank(overrides.mcp_command)
            .or_else(|| non_blank(mcp.command))
            .unwrap_or_else(|| DEFAULT_MCP_COMMAND.to_string());
        let args = if !overrides.mcp_args.is_empty() {
            overrides.mcp_args
        } else {
            mcp.args.unwrap_or_else(|| default_mcp_args(&db_config))
        };

        let max_turns = overrides
            .max_turns
            .or(max_turns)
            .unwrap_or(DEFAULT_MAX_TURNS);
        if max_turns == 0 {
            return Err(Error::Config("max_turns must be greater than 0".to_string()));
        }

        let request_timeout = mcp
            .request_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT);

        Ok(Self {
            base_url,
            api_key,
            model,
            db_config,
            mcp: McpSettings {
                server_name: non_blank(mcp.name)
                    .unwrap_or_else(|| DEFAULT_MCP_SERVER_NAME.to_string()),
                params: McpStdioParams {
                    command,
                    args,
                    env: mcp.env,
                },
                cache_tools_list: mcp.cache_tools_list.unwrap_or(true),
                request_timeout,
            },
            model_settings: model_settings.unwrap_or_else(default_model_settings),
            max_turns,
            json_logs: overrides.json_logs,
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
