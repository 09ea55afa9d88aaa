use async_trait::async_trait;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
  fn name(&self) -> &str;
  fn model_id(&self) -> &str;
  fn dimensions(&self) -> usize;

  /// Embed a batch of texts, one vector per input in order.
  async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
  #[error("Request failed: {0}")]
  Request(#[from] reqwest::Error),
  #[error("Provider returned {status}: {message}")]
  Status { status: u16, message: String },
  #[error("Provider error: {0}")]
  Provider(String),
  #[error("Request timed out")]
  Timeout,
}
