//! Hybrid query execution: lexical and semantic subqueries run
//! concurrently, candidates fuse under reciprocal rank fusion, and result
//! bodies are read from disk on demand with stale candidates dropped.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use codebased_core::{Error, Object, Result, hash_bytes};
use codebased_embedding::EmbeddingService;
use codebased_index::decode_text;
use codebased_store::{IndexStore, SearchFilters, normalize};
use tracing::{debug, warn};

/// RRF constant: score(i) = sum over lists of 1 / (k + rank_i).
const RRF_K: f64 = 60.0;
/// Each subquery contributes a candidate pool of `3 * K`.
const CANDIDATE_MULTIPLIER: usize = 3;

#[derive(Debug, Clone)]
pub struct SearchRequest {
  pub query: String,
  pub limit: usize,
  pub filters: SearchFilters,
}

impl SearchRequest {
  pub fn new(query: impl Into<String>) -> Self {
    Self {
      query: query.into(),
      limit: 10,
      filters: SearchFilters::default(),
    }
  }

  pub fn with_limit(mut self, limit: usize) -> Self {
    self.limit = limit;
    self
  }

  pub fn with_filters(mut self, filters: SearchFilters) -> Self {
    self.filters = filters;
    self
  }
}

#[derive(Debug, Clone)]
pub struct SearchResult {
  pub object: Object,
  /// The object's body text, read from disk at result time.
  pub body: String,
  /// Fused RRF score.
  pub score: f64,
  /// BM25 rank from the lexical list, when present (lower is better).
  pub bm25: Option<f64>,
  /// Cosine similarity from the semantic list, when present.
  pub similarity: Option<f32>,
}

#[derive(Default)]
struct Candidate {
  lexical_rank: Option<usize>,
  semantic_rank: Option<usize>,
  bm25: Option<f64>,
  similarity: Option<f32>,
}

impl Candidate {
  fn rrf_score(&self) -> f64 {
    let mut score = 0.0;
    if let Some(rank) = self.lexical_rank {
      score += 1.0 / (RRF_K + rank as f64);
    }
    if let Some(rank) = self.semantic_rank {
      score += 1.0 / (RRF_K + rank as f64);
    }
    score
  }
}

pub struct Searcher {
  root: PathBuf,
  store: Arc<IndexStore>,
  service: Arc<EmbeddingService>,
}

impl Searcher {
  pub fn new(root: &std::path::Path, store: Arc<IndexStore>, service: Arc<EmbeddingService>) -> Self {
    Self {
      root: root.to_path_buf(),
      store,
      service,
    }
  }

  /// Execute a hybrid query. Degrades to single-list results when one
  /// subquery fails; errors surface only when nothing can be returned.
  pub async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchResult>> {
    let pool = request.limit.max(1) * CANDIDATE_MULTIPLIER;
    let mut degraded: Option<Error> = None;

    let lexical_task = {
      let store = self.store.clone();
      let query = request.query.clone();
      let filters = request.filters.clone();
      tokio::task::spawn_blocking(move || store.fts_search(&query, pool, &filters))
    };

    let semantic = match self.semantic_candidates(request, pool).await {
      Ok(hits) => hits,
      Err(e) => {
        warn!("Semantic subquery failed: {e}");
        degraded = Some(e);
        Vec::new()
      }
    };

    let lexical = match lexical_task.await {
      Ok(Ok(hits)) => hits,
      Ok(Err(e)) => {
        warn!("Lexical subquery failed: {e}");
        degraded = Some(Error::Store(e.to_string()));
        Vec::new()
      }
      Err(e) => {
        degraded = Some(Error::Store(e.to_string()));
        Vec::new()
      }
    };

    // Fuse: reciprocal rank fusion over both lists, 1-based ranks.
    let mut candidates: HashMap<i64, Candidate> = HashMap::new();
    for (rank, hit) in lexical.iter().enumerate() {
      let entry = candidates.entry(hit.object_id).or_default();
      entry.lexical_rank = Some(rank + 1);
      entry.bm25 = Some(hit.bm25);
    }
    for (rank, (id, similarity)) in semantic.iter().enumerate() {
      let entry = candidates.entry(*id).or_default();
      entry.semantic_rank = Some(rank + 1);
      entry.similarity = Some(*similarity);
    }

    let ids: Vec<i64> = candidates.keys().copied().collect();
    let objects = {
      let store = self.store.clone();
      let ids = ids.clone();
      tokio::task::spawn_blocking(move || store.fetch_objects(&ids))
        .await
        .map_err(|e| Error::Store(e.to_string()))?
        .map_err(|e| Error::Store(e.to_string()))?
    };

    let mut ranked: Vec<(Object, f64, Option<f64>, Option<f32>)> = objects
      .into_iter()
      .filter_map(|object| {
        let candidate = candidates.get(&object.id)?;
        Some((object, candidate.rrf_score(), candidate.bm25, candidate.similarity))
      })
      .collect();

    // Ties: higher similarity, then shorter byte range, then path order.
    ranked.sort_by(|a, b| {
      b.1
        .partial_cmp(&a.1)
        .unwrap_or(std::cmp::Ordering::Equal)
        .then_with(|| {
          let sim_a = a.3.unwrap_or(f32::NEG_INFINITY);
          let sim_b = b.3.unwrap_or(f32::NEG_INFINITY);
          sim_b.partial_cmp(&sim_a).unwrap_or(std::cmp::Ordering::Equal)
        })
        .then_with(|| a.0.byte_range.len().cmp(&b.0.byte_range.len()))
        .then_with(|| a.0.path.cmp(&b.0.path))
    });

    // Read bodies on demand; drop candidates whose file vanished or whose
    // fingerprint no longer matches, promoting the next in line.
    let mut results = Vec::with_capacity(request.limit);
    let mut file_cache: HashMap<String, Option<String>> = HashMap::new();
    for (object, score, bm25, similarity) in ranked {
      if results.len() >= request.limit {
        break;
      }
      let Some(body) = self.read_body(&object, &mut file_cache) else {
        debug!("Dropping stale result {}:{}", object.path, object.name);
        continue;
      };
      results.push(SearchResult {
        object,
        body,
        score,
        bm25,
        similarity,
      });
    }

    if results.is_empty()
      && let Some(error) = degraded
    {
      return Err(error);
    }
    Ok(results)
  }

  async fn semantic_candidates(&self, request: &SearchRequest, pool: usize) -> Result<Vec<(i64, f32)>> {
    let mut query_vector = self
      .service
      .embed_query(&request.query)
      .await
      .map_err(|e| Error::EmbeddingTransient(e.to_string()))?;
    normalize(&mut query_vector);

    let filtered = !matches!(
      request.filters,
      SearchFilters {
        language: None,
        kind: None,
        path_prefix: None
      }
    );

    // Overfetch when filters will thin the list afterwards.
    let fetch = if filtered { pool * 4 } else { pool };
    let hits = self.store.ann_search(&query_vector, fetch);
    if !filtered {
      return Ok(hits);
    }

    let ids: Vec<i64> = hits.iter().map(|(id, _)| *id).collect();
    let store = self.store.clone();
    let objects = tokio::task::spawn_blocking(move || store.fetch_objects(&ids))
      .await
      .map_err(|e| Error::Store(e.to_string()))?
      .map_err(|e| Error::Store(e.to_string()))?;
    let by_id: HashMap<i64, &Object> = objects.iter().map(|o| (o.id, o)).collect();

    let filters = &request.filters;
    let kept: Vec<(i64, f32)> = hits
      .into_iter()
      .filter(|(id, _)| {
        let Some(object) = by_id.get(id) else {
          return false;
        };
        if let Some(language) = filters.language
          && object.language != language
        {
          return false;
        }
        if let Some(kind) = filters.kind
          && object.kind != kind
        {
          return false;
        }
        if let Some(prefix) = &filters.path_prefix
          && !object.path.starts_with(prefix.as_str())
        {
          return false;
        }
        true
      })
      .take(pool)
      .collect();
    Ok(kept)
  }

  /// Read an object's body by byte range, verifying the file still matches
  /// its catalogued fingerprint.
  fn read_body(&self, object: &Object, cache: &mut HashMap<String, Option<String>>) -> Option<String> {
    let text = cache
      .entry(object.path.clone())
      .or_insert_with(|| {
        let stored = self.store.fingerprint(&object.path).ok()??;
        let bytes = std::fs::read(self.root.join(&object.path)).ok()?;
        if hash_bytes(&bytes) != stored.hash {
          return None;
        }
        decode_text(&bytes)
      })
      .as_ref()?;

    if object.byte_range.end > text.len() {
      return None;
    }
    Some(text[object.byte_range.start..object.byte_range.end].to_string())
  }
}
