//! Read-side store primitives: lexical FTS lookups and ANN queries against
//! the current snapshot. Fusion lives in the engine.

use codebased_core::{Language, ObjectKind};
use rusqlite::types::Value;
use tracing::trace;

use crate::connection::{IndexStore, StoreError};

#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
  pub language: Option<Language>,
  pub kind: Option<ObjectKind>,
  pub path_prefix: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FtsHit {
  pub object_id: i64,
  /// BM25 rank from FTS5; lower is better.
  pub bm25: f64,
}

/// Quote a free-text query for FTS5: balance stray double quotes, keep
/// quoted phrases, and phrase-quote each bare token so query syntax
/// characters cannot break the parse.
pub fn quote_fts_query(query: &str) -> String {
  let mut balanced = query.to_string();
  if balanced.matches('"').count() % 2 == 1 {
    balanced.push('"');
  }

  let mut bits: Vec<String> = Vec::new();
  let mut current = String::new();
  let mut in_quote = false;
  for c in balanced.chars() {
    match c {
      '"' => {
        current.push('"');
        if in_quote {
          bits.push(std::mem::take(&mut current));
        }
        in_quote = !in_quote;
      }
      c if c.is_whitespace() && !in_quote => {
        if !current.is_empty() {
          bits.push(std::mem::take(&mut current));
        }
      }
      c => current.push(c),
    }
  }
  if !current.is_empty() {
    bits.push(current);
  }

  bits.retain(|bit| !bit.is_empty() && bit != "\"\"");
  bits
    .iter()
    .map(|bit| {
      if bit.starts_with('"') {
        bit.clone()
      } else {
        format!("\"{bit}\"")
      }
    })
    .collect::<Vec<_>>()
    .join(" ")
}

impl IndexStore {
  /// Lexical subquery: BM25-ranked FTS hits over name, path, and body,
  /// with optional attribute filters applied via the catalog.
  pub fn fts_search(&self, query: &str, limit: usize, filters: &SearchFilters) -> Result<Vec<FtsHit>, StoreError> {
    let quoted = quote_fts_query(query);
    if quoted.is_empty() {
      return Ok(Vec::new());
    }
    trace!("FTS query: {quoted}");

    // Name matches outrank body matches (a nested declaration's text is
    // also part of its container's body).
    let mut sql = String::from(
      "SELECT fts.rowid, bm25(fts, 1.0, 4.0, 1.0) AS rank
       FROM fts
       JOIN object o ON o.id = fts.rowid
       WHERE fts MATCH ?",
    );
    let mut params: Vec<Value> = vec![Value::from(quoted)];

    if let Some(language) = filters.language {
      sql.push_str(" AND o.language = ?");
      params.push(Value::from(language.as_str().to_string()));
    }
    if let Some(kind) = filters.kind {
      sql.push_str(" AND o.kind = ?");
      params.push(Value::from(kind.as_str().to_string()));
    }
    if let Some(prefix) = &filters.path_prefix {
      sql.push_str(" AND o.path LIKE ? || '%'");
      params.push(Value::from(prefix.clone()));
    }
    sql.push_str(" ORDER BY rank LIMIT ?");
    params.push(Value::from(limit as i64));

    let conn = self.reader.lock().expect("reader lock poisoned");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(params), |row| {
      Ok(FtsHit {
        object_id: row.get(0)?,
        bm25: row.get(1)?,
      })
    })?;
    rows.collect::<rusqlite::Result<_>>().map_err(StoreError::from)
  }

  /// Semantic subquery: top-k cosine hits from the current ANN snapshot.
  pub fn ann_search(&self, query_vector: &[f32], k: usize) -> Vec<(i64, f32)> {
    self.ann_snapshot().search(query_vector, k)
  }
}
