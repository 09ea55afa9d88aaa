// Retry wrapper around an embedding provider
//
// Per-batch retry with exponential backoff and jitter. Retryable: network
// errors, timeouts, 408/429/5xx. Everything else surfaces unchanged so the
// caller can split the batch and quarantine the offending item.

use crate::{EmbeddingError, EmbeddingProvider};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryConfig {
  /// Total attempts, including the first.
  pub max_attempts: u32,
  pub initial_backoff: Duration,
  pub backoff_multiplier: f64,
  pub max_backoff: Duration,
  /// Apply ±25% jitter to each backoff.
  pub add_jitter: bool,
  /// Hard per-batch timeout.
  pub request_timeout: Duration,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      max_attempts: 6,
      initial_backoff: Duration::from_millis(500),
      backoff_multiplier: 2.0,
      max_backoff: Duration::from_secs(30),
      add_jitter: true,
      request_timeout: Duration::from_secs(60),
    }
  }
}

impl RetryConfig {
  /// Backoff before retry number `attempt` (0-based).
  pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
    let base = self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
    let capped = base.min(self.max_backoff.as_secs_f64());
    if !self.add_jitter {
      return Duration::from_secs_f64(capped);
    }
    let jitter_factor = 1.0 + (rand_f64() * 0.5 - 0.25);
    Duration::from_secs_f64((capped * jitter_factor).min(self.max_backoff.as_secs_f64()))
  }
}

/// A dependency-free pseudo-random value in [0, 1) for jitter.
fn rand_f64() -> f64 {
  use std::time::{SystemTime, UNIX_EPOCH};

  let nanos = SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .subsec_nanos();

  (nanos as f64 / u32::MAX as f64).fract()
}

pub fn is_retryable_error(error: &EmbeddingError) -> bool {
  match error {
    EmbeddingError::Request(_) => true,
    EmbeddingError::Status { status, .. } => matches!(status, 408 | 429) || (500..=599).contains(status),
    EmbeddingError::Timeout => true,
    EmbeddingError::Provider(_) => false,
  }
}

/// Wraps a provider with per-batch retries and a hard timeout.
pub struct ResilientProvider<P: EmbeddingProvider> {
  inner: P,
  config: RetryConfig,
}

impl<P: EmbeddingProvider> ResilientProvider<P> {
  pub fn new(provider: P) -> Self {
    Self {
      inner: provider,
      config: RetryConfig::default(),
    }
  }

  pub fn with_config(provider: P, config: RetryConfig) -> Self {
    Self {
      inner: provider,
      config,
    }
  }

  async fn embed_with_retry(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let mut last_error = None;

    for attempt in 0..self.config.max_attempts {
      if attempt > 0 {
        let backoff = self.config.backoff_for_attempt(attempt - 1);
        debug!("Retry attempt {} after {:?}", attempt + 1, backoff);
        sleep(backoff).await;
      }

      match tokio::time::timeout(self.config.request_timeout, self.inner.embed_batch(texts)).await {
        Ok(Ok(result)) => return Ok(result),
        Ok(Err(e)) => {
          if is_retryable_error(&e) && attempt + 1 < self.config.max_attempts {
            warn!("Retryable embedding error on attempt {}: {}", attempt + 1, e);
            last_error = Some(e);
            continue;
          }
          return Err(e);
        }
        Err(_) => {
          warn!("Embedding batch timed out on attempt {}", attempt + 1);
          last_error = Some(EmbeddingError::Timeout);
        }
      }
    }

    Err(last_error.unwrap_or_else(|| EmbeddingError::Provider("Max retries exceeded".to_string())))
  }
}

#[async_trait]
impl<P: EmbeddingProvider> EmbeddingProvider for ResilientProvider<P> {
  fn name(&self) -> &str {
    self.inner.name()
  }

  fn model_id(&self) -> &str {
    self.inner.model_id()
  }

  fn dimensions(&self) -> usize {
    self.inner.dimensions()
  }

  async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    self.embed_with_retry(texts).await
  }
}

pub fn wrap_resilient<P: EmbeddingProvider>(provider: P) -> ResilientProvider<P> {
  ResilientProvider::new(provider)
}
