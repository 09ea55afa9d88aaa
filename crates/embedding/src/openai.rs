use crate::{EmbeddingError, EmbeddingProvider};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct OpenAiProvider {
  client: reqwest::Client,
  endpoint: String,
  api_key: String,
  model: String,
  dimensions: usize,
}

impl OpenAiProvider {
  pub fn new(
    endpoint: impl Into<String>,
    api_key: impl Into<String>,
    model: impl Into<String>,
    dimensions: usize,
  ) -> Self {
    Self {
      client: reqwest::Client::new(),
      endpoint: endpoint.into(),
      api_key: api_key.into(),
      model: model.into(),
      dimensions,
    }
  }

  /// Only the `text-embedding-3-*` family accepts an explicit `dimensions`
  /// parameter; other models reject it.
  fn request_dimensions(&self) -> Option<usize> {
    self.model.starts_with("text-embedding-3").then_some(self.dimensions)
  }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
  model: &'a str,
  input: &'a [String],
  #[serde(skip_serializing_if = "Option::is_none")]
  dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
  data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
  embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingProvider for OpenAiProvider {
  fn name(&self) -> &str {
    "openai"
  }

  fn model_id(&self) -> &str {
    &self.model
  }

  fn dimensions(&self) -> usize {
    self.dimensions
  }

  async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    if texts.is_empty() {
      return Ok(Vec::new());
    }

    let request = EmbeddingRequest {
      model: &self.model,
      input: texts,
      dimensions: self.request_dimensions(),
    };

    debug!("Embedding batch of {} texts with {}", texts.len(), self.model);

    let response = self
      .client
      .post(&self.endpoint)
      .header("Authorization", format!("Bearer {}", self.api_key))
      .header("Content-Type", "application/json")
      .json(&request)
      .send()
      .await?;

    if !response.status().is_success() {
      let status = response.status().as_u16();
      let message = response.text().await.unwrap_or_default();
      warn!("Embedding request failed: {status} - {message}");
      return Err(EmbeddingError::Status { status, message });
    }

    let result: EmbeddingResponse = response.json().await?;

    if result.data.len() != texts.len() {
      return Err(EmbeddingError::Provider(format!(
        "expected {} embeddings, got {}",
        texts.len(),
        result.data.len()
      )));
    }

    Ok(result.data.into_iter().map(|d| d.embedding).collect())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_provider_basics() {
    let provider = OpenAiProvider::new("https://api.openai.com/v1/embeddings", "sk-test", "text-embedding-3-small", 1536);
    assert_eq!(provider.name(), "openai");
    assert_eq!(provider.model_id(), "text-embedding-3-small");
    assert_eq!(provider.dimensions(), 1536);
    assert_eq!(provider.request_dimensions(), Some(1536));
  }

  #[test]
  fn test_dimensions_omitted_for_legacy_models() {
    let provider = OpenAiProvider::new("http://localhost/v1/embeddings", "k", "text-embedding-ada-002", 1536);
    assert_eq!(provider.request_dimensions(), None);
  }

  #[test]
  fn test_request_serialization() {
    let input = vec!["hello".to_string()];
    let request = EmbeddingRequest {
      model: "text-embedding-3-small",
      input: &input,
      dimensions: Some(1536),
    };
    let json = serde_json::to_value(&request).unwrap();
    assert_eq!(json["model"], "text-embedding-3-small");
    assert_eq!(json["dimensions"], 1536);

    let request = EmbeddingRequest {
      model: "other",
      input: &input,
      dimensions: None,
    };
    let json = serde_json::to_value(&request).unwrap();
    assert!(json.get("dimensions").is_none());
  }
}
