//! Shared test harness: a deterministic stub embedding provider and an
//! engine setup over a temp repository.

use async_trait::async_trait;
use codebased_embedding::{BatchLimits, EmbeddingError, EmbeddingProvider, EmbeddingService, ServiceConfig};
use codebased_store::IndexStore;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::time::Duration;

pub const STUB_DIM: usize = 8;

/// Fixed, content-derived vector: a byte histogram folded into 8 buckets.
/// Similar texts get similar vectors, identical texts identical ones.
pub fn stub_vector(text: &str) -> Vec<f32> {
  let mut vector = vec![0.0f32; STUB_DIM];
  for byte in text.bytes() {
    vector[(byte as usize) % STUB_DIM] += 1.0;
  }
  vector
}

/// Deterministic embedding provider for end-to-end tests. Counts calls and
/// embedded texts; can be primed with failure statuses consumed per call.
pub struct StubProvider {
  pub calls: AtomicUsize,
  pub embedded_texts: AtomicUsize,
  pub fail_statuses: Mutex<VecDeque<u16>>,
}

impl StubProvider {
  pub fn new() -> Arc<Self> {
    Arc::new(Self {
      calls: AtomicUsize::new(0),
      embedded_texts: AtomicUsize::new(0),
      fail_statuses: Mutex::new(VecDeque::new()),
    })
  }

  pub fn fail_next_with(&self, statuses: &[u16]) {
    self.fail_statuses.lock().unwrap().extend(statuses.iter().copied());
  }
}

#[async_trait]
impl EmbeddingProvider for StubProvider {
  fn name(&self) -> &str {
    "stub"
  }

  fn model_id(&self) -> &str {
    "stub-model"
  }

  fn dimensions(&self) -> usize {
    STUB_DIM
  }

  async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    if let Some(status) = self.fail_statuses.lock().unwrap().pop_front() {
      return Err(EmbeddingError::Status {
        status,
        message: "primed failure".to_string(),
      });
    }
    self
      .embedded_texts
      .fetch_add(texts.len(), std::sync::atomic::Ordering::SeqCst);
    Ok(texts.iter().map(|t| stub_vector(t)).collect())
  }
}

/// Shares a stub across the resilient wrapper and test assertions.
pub struct ArcProvider(pub Arc<StubProvider>);

#[async_trait]
impl EmbeddingProvider for ArcProvider {
  fn name(&self) -> &str {
    self.0.name()
  }

  fn model_id(&self) -> &str {
    self.0.model_id()
  }

  fn dimensions(&self) -> usize {
    self.0.dimensions()
  }

  async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    self.0.embed_batch(texts).await
  }
}

pub fn open_store(root: &Path) -> Arc<IndexStore> {
  Arc::new(IndexStore::open(&root.join(".codebased"), "stub-model", STUB_DIM).unwrap())
}

pub fn service_over(provider: Arc<StubProvider>) -> Arc<EmbeddingService> {
  Arc::new(EmbeddingService::new(
    provider,
    ServiceConfig {
      limits: BatchLimits {
        linger: Duration::from_millis(10),
        ..Default::default()
      },
      ..Default::default()
    },
  ))
}
