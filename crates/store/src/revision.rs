//! The revision write protocol: all objects and embeddings for one path,
//! committed together.
//!
//! Readers see either the old revision entirely or the new one entirely:
//! the SQL side is a single transaction, and the ANN snapshot swap happens
//! only after that transaction commits. A rollback discards the pending ANN
//! mutations because they are never computed from an uncommitted state.

use codebased_core::{ByteRange, Coordinates, FileFingerprint, Language, ObjectKind};
use rusqlite::params;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::ann::normalize;
use crate::connection::{IndexStore, StoreError};

/// One object of a new revision, ready for insertion. `body` is indexed
/// into FTS but not stored in the catalog; `vector` is `None` when the
/// embedding permanently failed (the object then has no ANN slot).
#[derive(Debug, Clone)]
pub struct ObjectRecord {
  pub name: String,
  pub language: Language,
  pub kind: ObjectKind,
  pub byte_range: ByteRange,
  pub coordinates: Coordinates,
  pub context_before: String,
  pub context_after: String,
  pub content_hash: String,
  pub body: String,
  pub vector: Option<Vec<f32>>,
}

pub(crate) fn serialize_vector(vector: &[f32]) -> Vec<u8> {
  let mut blob = Vec::with_capacity(vector.len() * 4);
  for value in vector {
    blob.extend_from_slice(&value.to_le_bytes());
  }
  blob
}

pub(crate) fn deserialize_vector(blob: &[u8]) -> Vec<f32> {
  blob
    .chunks_exact(4)
    .map(|chunk| f32::from_le_bytes(chunk.try_into().expect("sized chunk")))
    .collect()
}

impl IndexStore {
  /// Commit one revision: replace all objects for `fingerprint.path`,
  /// update FTS rows, write embedding rows, update the fingerprint, then
  /// publish the ANN mutations. Returns the new object ids.
  pub fn commit_revision(
    &self,
    fingerprint: &FileFingerprint,
    records: Vec<ObjectRecord>,
  ) -> Result<Vec<i64>, StoreError> {
    for record in &records {
      if record.byte_range.is_empty() {
        return Err(StoreError::Consistency(format!(
          "empty byte range for object {} in {}",
          record.name, fingerprint.path
        )));
      }
      if let Some(vector) = &record.vector
        && vector.len() != self.dimension
      {
        return Err(StoreError::Consistency(format!(
          "vector dimension {} != {} for object {}",
          vector.len(),
          self.dimension,
          record.name
        )));
      }
    }

    let mut conn = self.writer.lock().expect("writer lock poisoned");
    let tx = conn.transaction()?;

    let old_ids: Vec<i64> = {
      let mut stmt = tx.prepare("SELECT id FROM object WHERE path = ?1")?;
      let rows = stmt.query_map([&fingerprint.path], |row| row.get(0))?;
      rows.collect::<rusqlite::Result<_>>()?
    };

    for id in &old_ids {
      tx.execute("DELETE FROM fts WHERE rowid = ?1", [id])?;
    }
    tx.execute("DELETE FROM object WHERE path = ?1", [&fingerprint.path])?;

    let mut new_ids = Vec::with_capacity(records.len());
    let mut ann_additions: Vec<(i64, Vec<f32>)> = Vec::new();

    for record in records {
      let id: i64 = tx.query_row(
        "INSERT INTO object
           (path, name, language, kind, byte_start, byte_end,
            start_line, start_col, end_line, end_col,
            context_before, context_after, content_hash)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
         RETURNING id",
        params![
          fingerprint.path,
          record.name,
          record.language.as_str(),
          record.kind.as_str(),
          record.byte_range.start as i64,
          record.byte_range.end as i64,
          record.coordinates.start_line,
          record.coordinates.start_col,
          record.coordinates.end_line,
          record.coordinates.end_col,
          record.context_before,
          record.context_after,
          record.content_hash,
        ],
        |row| row.get(0),
      )?;

      tx.execute(
        "INSERT INTO fts (rowid, path, name, body) VALUES (?1, ?2, ?3, ?4)",
        params![id, fingerprint.path, record.name, record.body],
      )?;

      if let Some(vector) = record.vector {
        let mut vector = vector;
        normalize(&mut vector);
        tx.execute(
          "INSERT OR REPLACE INTO embedding (object_id, vector, content_hash) VALUES (?1, ?2, ?3)",
          params![id, serialize_vector(&vector), record.content_hash],
        )?;
        ann_additions.push((id, vector));
      }

      new_ids.push(id);
    }

    tx.execute(
      "INSERT INTO file (path, size, mtime_ns, hash) VALUES (?1, ?2, ?3, ?4)
       ON CONFLICT(path) DO UPDATE SET
         size = excluded.size, mtime_ns = excluded.mtime_ns, hash = excluded.hash",
      params![fingerprint.path, fingerprint.size, fingerprint.mtime_ns, fingerprint.hash],
    )?;

    let gc_ids = gc_embeddings(&tx)?;

    tx.commit()?;

    let mut ann_removals = old_ids;
    ann_removals.extend(gc_ids);
    self.publish_ann(&ann_removals, &ann_additions);

    debug!(
      "Committed revision for {} ({} objects)",
      fingerprint.path,
      new_ids.len()
    );
    Ok(new_ids)
  }

  /// Remove a path and everything derived from it. Returns the removed
  /// object ids.
  pub fn remove_path(&self, rel: &str) -> Result<Vec<i64>, StoreError> {
    let mut conn = self.writer.lock().expect("writer lock poisoned");
    let tx = conn.transaction()?;

    let old_ids: Vec<i64> = {
      let mut stmt = tx.prepare("SELECT id FROM object WHERE path = ?1")?;
      let rows = stmt.query_map([rel], |row| row.get(0))?;
      rows.collect::<rusqlite::Result<_>>()?
    };

    for id in &old_ids {
      tx.execute("DELETE FROM fts WHERE rowid = ?1", [id])?;
    }
    tx.execute("DELETE FROM object WHERE path = ?1", [rel])?;
    tx.execute("DELETE FROM file WHERE path = ?1", [rel])?;

    let gc_ids = gc_embeddings(&tx)?;

    tx.commit()?;

    let mut ann_removals = old_ids.clone();
    ann_removals.extend(gc_ids);
    self.publish_ann(&ann_removals, &[]);

    debug!("Removed {} ({} objects)", rel, old_ids.len());
    Ok(old_ids)
  }

  /// Swap in the successor ANN snapshot and persist it. Called with the
  /// writer lock held so publishes are serialized in commit order.
  fn publish_ann(&self, removed: &[i64], added: &[(i64, Vec<f32>)]) {
    if removed.is_empty() && added.is_empty() {
      return;
    }
    let next = {
      let current = self.ann.read().expect("ann lock poisoned");
      Arc::new(current.apply(removed, added))
    };
    *self.ann.write().expect("ann lock poisoned") = next.clone();

    if let Err(e) = next.write_to(&self.ann_path) {
      warn!("Failed to persist ANN index: {e}");
    }
  }
}

/// Delete embedding rows whose object no longer exists. Runs inside the
/// revision transaction; reuse-by-content-hash has already happened by the
/// time this fires.
fn gc_embeddings(tx: &rusqlite::Transaction<'_>) -> Result<Vec<i64>, StoreError> {
  let mut stmt =
    tx.prepare("DELETE FROM embedding WHERE object_id NOT IN (SELECT id FROM object) RETURNING object_id")?;
  let rows = stmt.query_map([], |row| row.get(0))?;
  rows.collect::<rusqlite::Result<_>>().map_err(StoreError::from)
}

#[cfg(test)]
mod tests {
  use super::*;
  use codebased_core::content_fingerprint;
  use tempfile::TempDir;

  fn open(dir: &TempDir) -> IndexStore {
    IndexStore::open(&dir.path().join(".codebased"), "m", 3).unwrap()
  }

  fn fingerprint(path: &str) -> FileFingerprint {
    FileFingerprint {
      path: path.to_string(),
      size: 100,
      mtime_ns: 1,
      hash: "abc".to_string(),
    }
  }

  fn record(name: &str, body: &str, vector: Option<Vec<f32>>) -> ObjectRecord {
    ObjectRecord {
      name: name.to_string(),
      language: Language::Python,
      kind: ObjectKind::Function,
      byte_range: ByteRange::new(0, body.len().max(1)),
      coordinates: Coordinates {
        start_line: 0,
        start_col: 0,
        end_line: 0,
        end_col: body.len() as u32,
      },
      context_before: String::new(),
      context_after: String::new(),
      content_hash: content_fingerprint(Language::Python, ObjectKind::Function, "", body, ""),
      body: body.to_string(),
      vector,
    }
  }

  #[test]
  fn test_commit_populates_all_three_stores() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);

    let ids = store
      .commit_revision(
        &fingerprint("a.py"),
        vec![
          record("foo", "def foo(): pass", Some(vec![1.0, 0.0, 0.0])),
          record("bar", "def bar(): pass", Some(vec![0.0, 1.0, 0.0])),
        ],
      )
      .unwrap();

    assert_eq!(ids.len(), 2);
    assert_eq!(store.file_count().unwrap(), 1);
    assert_eq!(store.object_count().unwrap(), 2);
    assert_eq!(store.embedding_count().unwrap(), 2);
    assert_eq!(store.ann_snapshot().live_len(), 2);

    // FTS rows share the object rowids.
    let hits = store
      .fts_search("foo", 10, &crate::search::SearchFilters::default())
      .unwrap();
    assert_eq!(hits.len(), 1);
    assert!(ids.contains(&hits[0].object_id));
  }

  #[test]
  fn test_recommit_replaces_objects() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);

    let first = store
      .commit_revision(
        &fingerprint("a.py"),
        vec![record("foo", "def foo(): pass", Some(vec![1.0, 0.0, 0.0]))],
      )
      .unwrap();

    let second = store
      .commit_revision(
        &fingerprint("a.py"),
        vec![record("foo2", "def foo2(): pass", Some(vec![0.0, 1.0, 0.0]))],
      )
      .unwrap();

    assert_ne!(first, second);
    assert_eq!(store.object_count().unwrap(), 1);
    // The old embedding had no surviving referent and was GC'd.
    assert_eq!(store.embedding_count().unwrap(), 1);
    assert_eq!(store.ann_snapshot().live_len(), 1);

    // The old name is no longer findable.
    assert!(
      store
        .fts_search("\"foo(\"", 10, &crate::search::SearchFilters::default())
        .unwrap()
        .is_empty()
    );
  }

  #[test]
  fn test_embedding_reuse_by_content_hash() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);

    let body = "def foo(): pass";
    store
      .commit_revision(&fingerprint("a.py"), vec![record("foo", body, Some(vec![1.0, 0.0, 0.0]))])
      .unwrap();

    // The cache-first lookup finds the vector under its content hash.
    let hash = content_fingerprint(Language::Python, ObjectKind::Function, "", body, "");
    let cached = store.lookup_embedding_by_hash(&hash).unwrap();
    assert!(cached.is_some());

    // A rename-style recommit for a new path reuses it; vectors unchanged.
    let vector = cached.unwrap();
    store
      .commit_revision(&fingerprint("b.py"), vec![record("foo", body, Some(vector.clone()))])
      .unwrap();
    store.remove_path("a.py").unwrap();

    assert_eq!(store.embedding_count().unwrap(), 1);
    let again = store.lookup_embedding_by_hash(&hash).unwrap().unwrap();
    assert_eq!(again, vector);
  }

  #[test]
  fn test_remove_path_clears_everything() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);

    store
      .commit_revision(
        &fingerprint("a.py"),
        vec![
          record("one", "def one(): pass", Some(vec![1.0, 0.0, 0.0])),
          record("two", "def two(): pass", Some(vec![0.0, 1.0, 0.0])),
          record("three", "def three(): pass", Some(vec![0.0, 0.0, 1.0])),
        ],
      )
      .unwrap();
    assert_eq!(store.ann_snapshot().live_len(), 3);

    let removed = store.remove_path("a.py").unwrap();
    assert_eq!(removed.len(), 3);
    assert_eq!(store.file_count().unwrap(), 0);
    assert_eq!(store.object_count().unwrap(), 0);
    assert_eq!(store.embedding_count().unwrap(), 0);
    assert_eq!(store.ann_snapshot().live_len(), 0);
  }

  #[test]
  fn test_object_without_vector_has_no_ann_slot() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);

    store
      .commit_revision(&fingerprint("a.py"), vec![record("foo", "def foo(): pass", None)])
      .unwrap();

    assert_eq!(store.object_count().unwrap(), 1);
    assert_eq!(store.embedding_count().unwrap(), 0);
    assert_eq!(store.ann_snapshot().live_len(), 0);
  }

  #[test]
  fn test_dimension_mismatch_aborts() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);

    let err = store
      .commit_revision(&fingerprint("a.py"), vec![record("foo", "x", Some(vec![1.0, 0.0]))])
      .unwrap_err();
    assert!(matches!(err, StoreError::Consistency(_)));

    // Nothing landed; the fingerprint was not updated.
    assert_eq!(store.file_count().unwrap(), 0);
    assert_eq!(store.object_count().unwrap(), 0);
  }

  #[test]
  fn test_vector_roundtrip() {
    let vector = vec![0.25f32, -1.5, 3.25];
    assert_eq!(deserialize_vector(&serialize_vector(&vector)), vector);
  }

  #[test]
  fn test_ann_persisted_after_commit() {
    let dir = TempDir::new().unwrap();
    let index_dir = dir.path().join(".codebased");
    {
      let store = IndexStore::open(&index_dir, "m", 3).unwrap();
      store
        .commit_revision(&fingerprint("a.py"), vec![record("foo", "body", Some(vec![1.0, 0.0, 0.0]))])
        .unwrap();
    }
    // A fresh open loads the persisted ANN without a rebuild.
    let store = IndexStore::open(&index_dir, "m", 3).unwrap();
    assert_eq!(store.ann_snapshot().live_len(), 1);
  }
}
