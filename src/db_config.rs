use std::path::{Path, PathBuf};

use serde_yaml::Value;

use crate::Result;

/// Database connection configuration handed to the tool server.
///
/// The document is kept opaque: the tool server owns its schema. Only the
/// keys of a top-level `connections` mapping are surfaced, since tool calls
/// must name one of them.
#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseConfig {
    path: PathBuf,
    value: Value,
}

impl DatabaseConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::from_yaml_str(&contents)?;
        config.path = path.to_path_buf();
        tracing::debug!(
            path = %path.display(),
            connections = config.connection_names().len(),
            "loaded database config"
        );
        Ok(config)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        Ok(Self {
            path: PathBuf::new(),
            value: serde_yaml::from_str(contents)?,
        })
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Empty when parsed from a string.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn connection_names(&self) -> Vec<String> {
        let Some(connections) = self.value.get("connections").and_then(Value::as_mapping) else {
            return Vec::new();
        };
        connections
            .keys()
            .filter_map(|key| match key {
                Value::String(name) => Some(name.clone()),
                Value::Number(number) => Some(number.to_string()),
                _ => None,
            })
            .collect()
    }
}

impl std::fmt::Display for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rendered = serde_yaml::to_string(&self.value).map_err(|_| std::fmt::Error)?;
        f.write_str(rendered.trim_end())
    }
}
