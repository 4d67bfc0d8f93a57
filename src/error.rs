use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("api error ({status}): {body}")]
    Api {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("failed to parse json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to parse yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("failed to parse toml: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("mcp connection error: {0}")]
    Mcp(String),
    #[error("mcp server returned error {code}: {message}")]
    McpRpc { code: i64, message: String },
    #[error("agent exceeded max turns ({max_turns}) without a final answer")]
    MaxTurnsExceeded { max_turns: usize },
}

pub type Result<T> = std::result::Result<T, Error>;
