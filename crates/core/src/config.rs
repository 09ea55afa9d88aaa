//! Configuration loaded from `$HOME/.codebased/config.toml` with environment
//! fallbacks.
//!
//! The config is an immutable value passed explicitly to the engine; nothing
//! here is global state.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub const DEFAULT_MODEL: &str = "text-embedding-3-small";
pub const DEFAULT_DIMENSION: usize = 1536;
pub const DEFAULT_INDEX_ROOT: &str = ".codebased";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  /// API key for the embedding endpoint. Falls back to `EMBEDDING_API_KEY`.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub embedding_api_key: Option<String>,

  /// Embedding model id sent to the endpoint.
  pub embedding_model: String,

  /// Dimension of the vectors the model produces.
  pub embedding_dimension: usize,

  /// OpenAI-compatible embeddings endpoint.
  pub embedding_endpoint: String,

  /// Editor invocation. Falls back to `$EDITOR`.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub editor_command: Option<String>,

  /// Name of the index directory under the repo root.
  pub index_root: String,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      embedding_api_key: None,
      embedding_model: DEFAULT_MODEL.to_string(),
      embedding_dimension: DEFAULT_DIMENSION,
      embedding_endpoint: "https://api.openai.com/v1/embeddings".to_string(),
      editor_command: None,
      index_root: DEFAULT_INDEX_ROOT.to_string(),
    }
  }
}

impl Config {
  /// Load from the user config file (if any) and apply environment
  /// fallbacks. A missing file yields the defaults; a malformed file is a
  /// fatal config error.
  pub fn load() -> Result<Self> {
    let mut config = match Self::config_path() {
      Some(path) if path.exists() => Self::load_file(&path)?,
      _ => Self::default(),
    };
    config.apply_env();
    Ok(config)
  }

  pub fn load_file(path: &Path) -> Result<Self> {
    let content = std::fs::read_to_string(path)?;
    toml::from_str(&content).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
  }

  pub fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".codebased").join("config.toml"))
  }

  fn apply_env(&mut self) {
    if self.embedding_api_key.is_none()
      && let Ok(key) = std::env::var("EMBEDDING_API_KEY")
      && !key.is_empty()
    {
      self.embedding_api_key = Some(key);
    }
    if self.editor_command.is_none()
      && let Ok(editor) = std::env::var("EDITOR")
      && !editor.is_empty()
    {
      self.editor_command = Some(editor);
    }
  }

  /// The index directory for a given repository root.
  pub fn index_dir(&self, repo_root: &Path) -> PathBuf {
    repo_root.join(&self.index_root)
  }

  /// Startup validation: an embedding key must be present before the engine
  /// can talk to the remote endpoint.
  pub fn require_api_key(&self) -> Result<&str> {
    self
      .embedding_api_key
      .as_deref()
      .ok_or_else(|| Error::Config("embedding_api_key is not set (config or EMBEDDING_API_KEY)".to_string()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults() {
    let config = Config::default();
    assert_eq!(config.embedding_model, DEFAULT_MODEL);
    assert_eq!(config.embedding_dimension, 1536);
    assert_eq!(config.index_root, ".codebased");
    assert!(config.embedding_api_key.is_none());
  }

  #[test]
  fn test_load_file() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(
      &path,
      r#"
embedding_api_key = "sk-test"
embedding_model = "text-embedding-3-large"
embedding_dimension = 3072
"#,
    )
    .unwrap();

    let config = Config::load_file(&path).unwrap();
    assert_eq!(config.embedding_api_key.as_deref(), Some("sk-test"));
    assert_eq!(config.embedding_model, "text-embedding-3-large");
    assert_eq!(config.embedding_dimension, 3072);
    // Unspecified keys keep their defaults.
    assert_eq!(config.index_root, ".codebased");
  }

  #[test]
  fn test_malformed_file_is_config_error() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "embedding_dimension = \"not a number\"").unwrap();

    let err = Config::load_file(&path).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
  }

  #[test]
  fn test_index_dir() {
    let config = Config::default();
    assert_eq!(
      config.index_dir(Path::new("/repo")),
      PathBuf::from("/repo/.codebased")
    );
  }

  #[test]
  fn test_require_api_key() {
    let mut config = Config::default();
    assert!(config.require_api_key().is_err());
    config.embedding_api_key = Some("sk-x".into());
    assert_eq!(config.require_api_key().unwrap(), "sk-x");
  }
}
