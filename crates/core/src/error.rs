use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
  #[error("Config: {0}")]
  Config(String),

  #[error("IO: {0}")]
  Io(#[from] std::io::Error),

  #[error("Parse failed for {path}")]
  Parse { path: String },

  #[error("Store: {0}")]
  Store(String),

  #[error("Watch: {0}")]
  Watch(String),

  #[error("Embedding (transient): {0}")]
  EmbeddingTransient(String),

  #[error("Embedding (permanent): {0}")]
  EmbeddingPermanent(String),

  #[error("Consistency: {0}")]
  Consistency(String),

  #[error("Cancelled")]
  Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;
