//! Natural-language database analysis over an MCP tool server.
//!
//! The binary wires an OpenAI-compatible chat model to a database tool
//! server launched over stdio and runs an interactive question loop.

pub mod agent;
mod db_config;
mod error;
pub mod mcp;
pub mod model;
pub mod providers;
pub mod session;
pub mod settings;
pub mod telemetry;
pub mod types;
pub mod utils;

pub use db_config::DatabaseConfig;
pub use error::{Error, Result};
pub use model::{LanguageModel, ModelProvider};
pub use providers::{OpenAICompatible, OpenAICompatibleProvider};
pub use types::{
    ContentPart, FinishReason, GenerateRequest, GenerateResponse, Message, Role, Tool, ToolChoice,
    Usage, Warning,
};
