//! The embedding service: a batching front over a provider.
//!
//! Callers hand over `(content_fingerprint, text)` pairs that missed the
//! store cache; an internal batcher groups them under item/token budgets
//! with a short linger window, runs at most a bounded number of in-flight
//! requests, isolates permanently-failing items by splitting their batch,
//! and remembers those fingerprints so they are not re-attempted within the
//! run. Query embeddings go through a small LRU.

use crate::batcher::{BatchLimits, estimate_tokens, truncate_to_tokens};
use crate::provider::{EmbeddingError, EmbeddingProvider};
use crate::resilient::is_retryable_error;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio::time::{Instant, timeout_at};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
  pub limits: BatchLimits,
  /// Maximum in-flight batches.
  pub max_in_flight: usize,
  /// Entries kept in the query-side LRU.
  pub query_cache_size: usize,
}

impl Default for ServiceConfig {
  fn default() -> Self {
    Self {
      limits: BatchLimits::default(),
      max_in_flight: 4,
      query_cache_size: 128,
    }
  }
}

enum JobOutcome {
  Vector(Vec<f32>),
  PermanentFailure,
  TransientFailure(String),
}

struct Job {
  key: String,
  text: String,
  reply: oneshot::Sender<JobOutcome>,
}

pub struct EmbeddingService {
  provider: Arc<dyn EmbeddingProvider>,
  limits: BatchLimits,
  tx: mpsc::UnboundedSender<Job>,
  failed: Arc<Mutex<HashSet<String>>>,
  query_cache: Mutex<QueryCache>,
}

impl EmbeddingService {
  /// Spawns the internal batcher task; must be called inside a runtime.
  pub fn new(provider: Arc<dyn EmbeddingProvider>, config: ServiceConfig) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    let failed = Arc::new(Mutex::new(HashSet::new()));
    tokio::spawn(run_batcher(
      provider.clone(),
      rx,
      config.limits.clone(),
      Arc::new(Semaphore::new(config.max_in_flight)),
      failed.clone(),
    ));
    Self {
      provider,
      limits: config.limits,
      tx,
      failed,
      query_cache: Mutex::new(QueryCache::new(config.query_cache_size)),
    }
  }

  pub fn dimensions(&self) -> usize {
    self.provider.dimensions()
  }

  pub fn model_id(&self) -> &str {
    self.provider.model_id()
  }

  /// Embed the miss set for a revision: `(content_fingerprint, text)` pairs
  /// the store had no vector for. Fingerprints quarantined by an earlier
  /// permanent failure are silently absent from the result.
  pub async fn embed_new(&self, items: Vec<(String, String)>) -> Result<HashMap<String, Vec<f32>>, EmbeddingError> {
    let mut pending = Vec::new();
    let mut seen = HashSet::new();
    {
      let failed = self.failed.lock().expect("failed set poisoned");
      for (key, text) in items {
        if failed.contains(&key) || !seen.insert(key.clone()) {
          continue;
        }
        let text = truncate_to_tokens(&text, self.limits.max_item_tokens).to_string();
        let (reply, rx) = oneshot::channel();
        self
          .tx
          .send(Job {
            key: key.clone(),
            text,
            reply,
          })
          .map_err(|_| EmbeddingError::Provider("embedding batcher stopped".to_string()))?;
        pending.push((key, rx));
      }
    }

    let mut out = HashMap::new();
    for (key, rx) in pending {
      match rx.await {
        Ok(JobOutcome::Vector(vector)) => {
          out.insert(key, vector);
        }
        Ok(JobOutcome::PermanentFailure) => {}
        Ok(JobOutcome::TransientFailure(message)) => return Err(EmbeddingError::Provider(message)),
        Err(_) => return Err(EmbeddingError::Provider("embedding batcher dropped request".to_string())),
      }
    }
    Ok(out)
  }

  /// Embed a search query through the short-lived LRU.
  pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
    if let Some(vector) = self.query_cache.lock().expect("query cache poisoned").get(text) {
      return Ok(vector);
    }

    let truncated = truncate_to_tokens(text, self.limits.max_item_tokens).to_string();
    let (reply, rx) = oneshot::channel();
    self
      .tx
      .send(Job {
        key: format!("query\u{0}{text}"),
        text: truncated,
        reply,
      })
      .map_err(|_| EmbeddingError::Provider("embedding batcher stopped".to_string()))?;

    match rx.await {
      Ok(JobOutcome::Vector(vector)) => {
        self
          .query_cache
          .lock()
          .expect("query cache poisoned")
          .insert(text.to_string(), vector.clone());
        Ok(vector)
      }
      Ok(JobOutcome::PermanentFailure) => Err(EmbeddingError::Provider("query embedding rejected".to_string())),
      Ok(JobOutcome::TransientFailure(message)) => Err(EmbeddingError::Provider(message)),
      Err(_) => Err(EmbeddingError::Provider("embedding batcher dropped request".to_string())),
    }
  }

  /// Content fingerprints quarantined by permanent failures this run.
  pub fn permanent_failure_count(&self) -> usize {
    self.failed.lock().expect("failed set poisoned").len()
  }
}

async fn run_batcher(
  provider: Arc<dyn EmbeddingProvider>,
  mut rx: mpsc::UnboundedReceiver<Job>,
  limits: BatchLimits,
  semaphore: Arc<Semaphore>,
  failed: Arc<Mutex<HashSet<String>>>,
) {
  let mut carry: Option<Job> = None;
  loop {
    let first = match carry.take() {
      Some(job) => job,
      None => match rx.recv().await {
        Some(job) => job,
        None => break,
      },
    };

    let mut tokens = estimate_tokens(&first.text);
    let mut batch = vec![first];
    let deadline = Instant::now() + limits.linger;

    while batch.len() < limits.max_items && tokens < limits.max_tokens {
      match timeout_at(deadline, rx.recv()).await {
        Ok(Some(job)) => {
          let job_tokens = estimate_tokens(&job.text);
          if tokens + job_tokens > limits.max_tokens {
            carry = Some(job);
            break;
          }
          tokens += job_tokens;
          batch.push(job);
        }
        // Channel closed or linger elapsed; dispatch what we have.
        Ok(None) | Err(_) => break,
      }
    }

    let permit = semaphore
      .clone()
      .acquire_owned()
      .await
      .expect("semaphore never closed");
    let provider = provider.clone();
    let failed = failed.clone();
    tokio::spawn(async move {
      let _permit = permit;
      execute_batch(provider, batch, failed).await;
    });
  }
}

/// Run one batch, splitting on non-retryable errors until the offending
/// item is isolated and quarantined.
async fn execute_batch(provider: Arc<dyn EmbeddingProvider>, jobs: Vec<Job>, failed: Arc<Mutex<HashSet<String>>>) {
  let mut stack = vec![jobs];
  while let Some(jobs) = stack.pop() {
    let texts: Vec<String> = jobs.iter().map(|j| j.text.clone()).collect();
    match provider.embed_batch(&texts).await {
      Ok(vectors) => {
        for (job, vector) in jobs.into_iter().zip(vectors) {
          let _ = job.reply.send(JobOutcome::Vector(vector));
        }
      }
      Err(e) if !is_retryable_error(&e) && jobs.len() > 1 => {
        warn!("Splitting batch of {} after non-retryable error: {e}", jobs.len());
        let mut head = jobs;
        let tail = head.split_off(head.len() / 2);
        stack.push(tail);
        stack.push(head);
      }
      Err(e) if !is_retryable_error(&e) => {
        let job = jobs.into_iter().next().expect("non-empty batch");
        warn!("Quarantining content fingerprint after permanent error: {e}");
        failed.lock().expect("failed set poisoned").insert(job.key.clone());
        let _ = job.reply.send(JobOutcome::PermanentFailure);
      }
      Err(e) => {
        let message = e.to_string();
        for job in jobs {
          let _ = job.reply.send(JobOutcome::TransientFailure(message.clone()));
        }
      }
    }
  }
}

struct QueryCache {
  capacity: usize,
  map: HashMap<String, Vec<f32>>,
  order: VecDeque<String>,
}

impl QueryCache {
  fn new(capacity: usize) -> Self {
    Self {
      capacity,
      map: HashMap::new(),
      order: VecDeque::new(),
    }
  }

  fn get(&mut self, key: &str) -> Option<Vec<f32>> {
    let vector = self.map.get(key)?.clone();
    if let Some(pos) = self.order.iter().position(|k| k == key) {
      self.order.remove(pos);
      self.order.push_back(key.to_string());
    }
    Some(vector)
  }

  fn insert(&mut self, key: String, vector: Vec<f32>) {
    if self.map.insert(key.clone(), vector).is_none() {
      self.order.push_back(key);
      if self.map.len() > self.capacity
        && let Some(evicted) = self.order.pop_front()
      {
        self.map.remove(&evicted);
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use async_trait::async_trait;
  use std::sync::atomic::{AtomicUsize, Ordering};

  /// Test provider: records batch sizes, rejects any batch containing the
  /// marker text with a 400.
  struct RecordingProvider {
    calls: Mutex<Vec<usize>>,
    embedded: AtomicUsize,
  }

  impl RecordingProvider {
    fn new() -> Arc<Self> {
      Arc::new(Self {
        calls: Mutex::new(Vec::new()),
        embedded: AtomicUsize::new(0),
      })
    }
  }

  #[async_trait]
  impl EmbeddingProvider for RecordingProvider {
    fn name(&self) -> &str {
      "recording"
    }
    fn model_id(&self) -> &str {
      "recording-model"
    }
    fn dimensions(&self) -> usize {
      3
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
      self.calls.lock().unwrap().push(texts.len());
      if texts.iter().any(|t| t.contains("POISON")) {
        return Err(EmbeddingError::Status {
          status: 400,
          message: "invalid input".to_string(),
        });
      }
      self.embedded.fetch_add(texts.len(), Ordering::SeqCst);
      Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0, 0.0]).collect())
    }
  }

  fn service(provider: Arc<RecordingProvider>) -> EmbeddingService {
    EmbeddingService::new(
      provider,
      ServiceConfig {
        limits: BatchLimits {
          linger: std::time::Duration::from_millis(20),
          ..Default::default()
        },
        ..Default::default()
      },
    )
  }

  fn items(texts: &[&str]) -> Vec<(String, String)> {
    texts
      .iter()
      .map(|t| (format!("hash-{t}"), t.to_string()))
      .collect()
  }

  #[tokio::test]
  async fn test_embed_new_batches_together() {
    let provider = RecordingProvider::new();
    let service = service(provider.clone());

    let result = service.embed_new(items(&["a", "b", "c"])).await.unwrap();
    assert_eq!(result.len(), 3);
    assert_eq!(result["hash-a"], vec![1.0, 1.0, 0.0]);

    // All three arrived before the linger elapsed: one request.
    assert_eq!(*provider.calls.lock().unwrap(), vec![3]);
  }

  #[tokio::test]
  async fn test_duplicate_fingerprints_deduplicated() {
    let provider = RecordingProvider::new();
    let service = service(provider.clone());

    let pairs = vec![
      ("same".to_string(), "text".to_string()),
      ("same".to_string(), "text".to_string()),
    ];
    let result = service.embed_new(pairs).await.unwrap();
    assert_eq!(result.len(), 1);
    assert_eq!(provider.embedded.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_poison_item_isolated_and_quarantined() {
    let provider = RecordingProvider::new();
    let service = service(provider.clone());

    let result = service.embed_new(items(&["good1", "POISON", "good2"])).await.unwrap();

    // The healthy items still get vectors; the poison item is absent.
    assert_eq!(result.len(), 2);
    assert!(result.contains_key("hash-good1"));
    assert!(result.contains_key("hash-good2"));
    assert_eq!(service.permanent_failure_count(), 1);

    // A second round does not re-attempt the quarantined fingerprint.
    let calls_before = provider.calls.lock().unwrap().len();
    let result = service.embed_new(items(&["POISON"])).await.unwrap();
    assert!(result.is_empty());
    assert_eq!(provider.calls.lock().unwrap().len(), calls_before);
  }

  #[tokio::test]
  async fn test_query_lru() {
    let provider = RecordingProvider::new();
    let service = service(provider.clone());

    let first = service.embed_query("find the parser").await.unwrap();
    let second = service.embed_query("find the parser").await.unwrap();
    assert_eq!(first, second);
    // Only one provider call; the second came from the LRU.
    assert_eq!(provider.calls.lock().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_query_lru_eviction() {
    let provider = RecordingProvider::new();
    let service = EmbeddingService::new(
      provider.clone(),
      ServiceConfig {
        limits: BatchLimits {
          linger: std::time::Duration::from_millis(5),
          ..Default::default()
        },
        query_cache_size: 2,
        ..Default::default()
      },
    );

    service.embed_query("one").await.unwrap();
    service.embed_query("two").await.unwrap();
    service.embed_query("three").await.unwrap(); // evicts "one"
    let calls = provider.calls.lock().unwrap().len();
    service.embed_query("one").await.unwrap(); // miss again
    assert_eq!(provider.calls.lock().unwrap().len(), calls + 1);
  }

  #[test]
  fn test_query_cache_refresh_on_get() {
    let mut cache = QueryCache::new(2);
    cache.insert("a".into(), vec![1.0]);
    cache.insert("b".into(), vec![2.0]);
    // Touch "a" so "b" is the eviction candidate.
    assert!(cache.get("a").is_some());
    cache.insert("c".into(), vec![3.0]);
    assert!(cache.get("a").is_some());
    assert!(cache.get("b").is_none());
  }
}
