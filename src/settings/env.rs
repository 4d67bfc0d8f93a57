use std::collections::BTreeMap;
use std::path::Path;

use crate::Result;

/// Variable lookup over a parsed dotenv file with the process environment as fallback.
#[derive(Clone, Default)]
pub struct Env {
    pub dotenv: BTreeMap<String, String>,
}

impl std::fmt::Debug for Env {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys: Vec<&str> = self.dotenv.keys().map(|key| key.as_str()).collect();
        f.debug_struct("Env").field("dotenv_keys", &keys).finish()
    }
}

impl Env {
    pub fn parse_dotenv(contents: &str) -> Self {
        Self {
            dotenv: parse_dotenv(contents),
        }
    }

    /// Reads a dotenv file. A missing file yields an empty overlay.
    pub fn from_dotenv_file(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Ok(Self::parse_dotenv(&contents)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "dotenv file not found");
                Ok(Self::default())
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        if let Some(value) = self.dotenv.get(key) {
            return Some(value.clone());
        }
        std::env::var(key)
            .ok()
            .filter(|value| !value.trim().is_empty())
    }

    /// First non-empty value among `keys`, in order.
    pub fn first_of<'a>(&self, keys: impl IntoIterator<Item = &'a str>) -> Option<String> {
        keys.into_iter().find_map(|key| self.get(key))
    }
}

pub fn parse_dotenv(contents: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::<String, String>::new();

    for raw_line in contents.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let line = line.strip_prefix("export ").unwrap_or(line).trim();
        let Some((raw_key, raw_value)) = line.split_once('=') else {
            continue;
        };
        let key = raw_key.trim();
        if key.is_empty() {
            continue;
        }

        let value = unquote(raw_value.trim());
        if value.trim().is_empty() {
            continue;
        }
        out.insert(key.to_string(), value.to_string());
    }

    out
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
        .unwrap_or(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_exports_quotes_and_comments() {
        let env = Env::parse_dotenv(
            "# provider\nexport DBSMART_BASE_URL=\"http://localhost:8000/v1\"\nDBSMART_MODEL='qwen-plus'\nEMPTY=\n=orphan\nnot a pair\n",
        );
        assert_eq!(
            env.dotenv.get("DBSMART_BASE_URL").map(String::as_str),
            Some("http://localhost:8000/v1")
        );
        assert_eq!(
            env.dotenv.get("DBSMART_MODEL").map(String::as_str),
            Some("qwen-plus")
        );
        assert_eq!(env.dotenv.len(), 2);
    }

    #[test]
    fn first_of_prefers_earlier_keys() {
        let env = Env::parse_dotenv("DBSMART_TEST_B=second\nDBSMART_TEST_A=first\n");
        assert_eq!(
            env.first_of(["DBSMART_TEST_A", "DBSMART_TEST_B"]).as_deref(),
            Some("first")
        );
        assert_eq!(
            env.first_of(["DBSMART_TEST_MISSING", "DBSMART_TEST_B"]).as_deref(),
            Some("second")
        );
    }

    #[test]
    fn debug_lists_keys_only() {
        let env = Env::parse_dotenv("DBSMART_API_KEY=sk-secret\n");
        let rendered = format!("{env:?}");
        assert!(rendered.contains("DBSMART_API_KEY"));
        assert!(!rendered.contains("sk-secret"));
    }

    #[test]
    fn missing_dotenv_file_is_empty() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let env = Env::from_dotenv_file(&dir.path().join(".env"))?;
        assert!(env.dotenv.is_empty());
        Ok(())
    }
}
