//! The fingerprint catalog: durable `path -> (size, mtime_ns, hash)` with
//! the cheap-prefilter diff that drives incremental indexing.

use codebased_core::{ByteRange, Coordinates, FileFingerprint, Language, Object, ObjectKind, hash_bytes};
use rusqlite::{Row, params};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::debug;

use crate::connection::{IndexStore, StoreError};
use crate::revision::deserialize_vector;

/// Partition of the current tree against the stored catalog.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ScanDiff {
  pub added: Vec<String>,
  pub modified: Vec<String>,
  pub removed: Vec<String>,
  pub unchanged: usize,
}

impl ScanDiff {
  pub fn is_clean(&self) -> bool {
    self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
  }

  pub fn dirty_count(&self) -> usize {
    self.added.len() + self.modified.len()
  }
}

/// Repo-relative path with `/` separators, or `None` if outside the root.
pub fn relative_path(root: &Path, path: &Path) -> Option<String> {
  let rel = path.strip_prefix(root).ok()?;
  let s = rel.to_string_lossy();
  if std::path::MAIN_SEPARATOR == '/' {
    Some(s.into_owned())
  } else {
    Some(s.replace(std::path::MAIN_SEPARATOR, "/"))
  }
}

pub fn mtime_ns(metadata: &std::fs::Metadata) -> i64 {
  metadata
    .modified()
    .ok()
    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
    .map(|d| d.as_nanos() as i64)
    .unwrap_or(0)
}

/// Fingerprint a file on disk (stat + SHA-256).
pub fn fingerprint_file(root: &Path, path: &Path) -> std::io::Result<(FileFingerprint, Vec<u8>)> {
  let rel = relative_path(root, path)
    .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "path outside root"))?;
  let metadata = std::fs::metadata(path)?;
  let bytes = std::fs::read(path)?;
  Ok((
    FileFingerprint {
      path: rel,
      size: metadata.len(),
      mtime_ns: mtime_ns(&metadata),
      hash: hash_bytes(&bytes),
    },
    bytes,
  ))
}

impl IndexStore {
  /// Partition `paths` against the stored catalog. The (size, mtime_ns)
  /// prefilter decides cheaply; content hashes are computed only when it
  /// disagrees. Paths in the store but absent from `paths` are `removed`.
  pub fn scan_paths(&self, root: &Path, paths: &[PathBuf]) -> Result<ScanDiff, StoreError> {
    let stored: HashMap<String, (u64, i64, String)> = {
      let conn = self.reader.lock().expect("reader lock poisoned");
      let mut stmt = conn.prepare("SELECT path, size, mtime_ns, hash FROM file")?;
      let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, (row.get(1)?, row.get(2)?, row.get(3)?)))
      })?;
      rows.collect::<rusqlite::Result<_>>()?
    };

    let mut diff = ScanDiff::default();
    let mut seen: HashSet<&str> = HashSet::new();
    let mut touched: Vec<FileFingerprint> = Vec::new();

    for path in paths {
      let Some(rel) = relative_path(root, path) else {
        continue;
      };
      let Ok(metadata) = std::fs::metadata(path) else {
        // Vanished between walk and stat; the next scan will remove it.
        continue;
      };
      let size = metadata.len();
      let mtime = mtime_ns(&metadata);

      match stored.get_key_value(rel.as_str()) {
        None => diff.added.push(rel),
        Some((key, (stored_size, stored_mtime, stored_hash))) => {
          seen.insert(key.as_str());
          if *stored_size == size && *stored_mtime == mtime {
            diff.unchanged += 1;
            continue;
          }
          // Prefilter disagrees; resolve with the content hash.
          let Ok(bytes) = std::fs::read(path) else {
            continue;
          };
          let hash = hash_bytes(&bytes);
          if hash == *stored_hash {
            // Touched but unchanged: refresh the cheap half only.
            touched.push(FileFingerprint {
              path: rel,
              size,
              mtime_ns: mtime,
              hash,
            });
            diff.unchanged += 1;
          } else {
            diff.modified.push(rel);
          }
        }
      }
    }

    diff.removed = stored
      .keys()
      .filter(|path| !seen.contains(path.as_str()))
      .cloned()
      .collect();

    diff.added.sort();
    diff.modified.sort();
    diff.removed.sort();

    if !touched.is_empty() {
      debug!("Refreshing {} touched-but-unchanged fingerprints", touched.len());
      let conn = self.writer.lock().expect("writer lock poisoned");
      for fp in &touched {
        conn.execute(
          "UPDATE file SET size = ?2, mtime_ns = ?3 WHERE path = ?1",
          params![fp.path, fp.size, fp.mtime_ns],
        )?;
      }
    }

    Ok(diff)
  }

  pub fn fingerprint(&self, rel: &str) -> Result<Option<FileFingerprint>, StoreError> {
    let conn = self.reader.lock().expect("reader lock poisoned");
    let mut stmt = conn.prepare("SELECT path, size, mtime_ns, hash FROM file WHERE path = ?1")?;
    let mut rows = stmt.query_map([rel], |row| {
      Ok(FileFingerprint {
        path: row.get(0)?,
        size: row.get(1)?,
        mtime_ns: row.get(2)?,
        hash: row.get(3)?,
      })
    })?;
    rows.next().transpose().map_err(StoreError::from)
  }

  /// Stored repo-relative paths with a given prefix (directory removal).
  pub fn paths_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
    let conn = self.reader.lock().expect("reader lock poisoned");
    let pattern = format!("{}%", prefix.trim_end_matches('/').to_string() + "/");
    let mut stmt = conn.prepare("SELECT path FROM file WHERE path LIKE ?1 ORDER BY path")?;
    let rows = stmt.query_map([pattern], |row| row.get(0))?;
    rows.collect::<rusqlite::Result<_>>().map_err(StoreError::from)
  }

  /// Cache-first lookup: an existing vector for a content fingerprint.
  pub fn lookup_embedding_by_hash(&self, content_hash: &str) -> Result<Option<Vec<f32>>, StoreError> {
    let conn = self.reader.lock().expect("reader lock poisoned");
    let mut stmt = conn.prepare("SELECT vector FROM embedding WHERE content_hash = ?1 LIMIT 1")?;
    let mut rows = stmt.query_map([content_hash], |row| {
      let blob: Vec<u8> = row.get(0)?;
      Ok(deserialize_vector(&blob))
    })?;
    rows.next().transpose().map_err(StoreError::from)
  }

  pub fn objects_for_path(&self, rel: &str) -> Result<Vec<Object>, StoreError> {
    let conn = self.reader.lock().expect("reader lock poisoned");
    let mut stmt = conn.prepare(&format!("{OBJECT_COLUMNS} WHERE path = ?1 ORDER BY byte_start, byte_end DESC"))?;
    let rows = stmt.query_map([rel], row_to_object)?;
    rows.collect::<rusqlite::Result<_>>().map_err(StoreError::from)
  }

  /// Fetch objects by id, preserving the input order; unknown ids are
  /// silently absent.
  pub fn fetch_objects(&self, ids: &[i64]) -> Result<Vec<Object>, StoreError> {
    if ids.is_empty() {
      return Ok(Vec::new());
    }
    let placeholders = vec!["?"; ids.len()].join(", ");
    let conn = self.reader.lock().expect("reader lock poisoned");
    let mut stmt = conn.prepare(&format!("{OBJECT_COLUMNS} WHERE id IN ({placeholders})"))?;
    let rows = stmt.query_map(rusqlite::params_from_iter(ids.iter()), row_to_object)?;
    let mut by_id: HashMap<i64, Object> = rows
      .collect::<rusqlite::Result<Vec<_>>>()?
      .into_iter()
      .map(|o| (o.id, o))
      .collect();
    Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
  }
}

const OBJECT_COLUMNS: &str = "SELECT id, path, name, language, kind, byte_start, byte_end, \
   start_line, start_col, end_line, end_col, context_before, context_after, content_hash FROM object";

fn row_to_object(row: &Row<'_>) -> rusqlite::Result<Object> {
  let language: String = row.get(3)?;
  let kind: String = row.get(4)?;
  Ok(Object {
    id: row.get(0)?,
    path: row.get(1)?,
    name: row.get(2)?,
    language: Language::parse(&language).unwrap_or(Language::Rust),
    kind: ObjectKind::parse(&kind).unwrap_or(ObjectKind::Function),
    byte_range: ByteRange::new(row.get::<_, i64>(5)? as usize, row.get::<_, i64>(6)? as usize),
    coordinates: Coordinates {
      start_line: row.get(7)?,
      start_col: row.get(8)?,
      end_line: row.get(9)?,
      end_col: row.get(10)?,
    },
    context_before: row.get(11)?,
    context_after: row.get(12)?,
    content_hash: row.get(13)?,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::connection::IndexStore;
  use tempfile::TempDir;

  fn store(dir: &TempDir) -> IndexStore {
    IndexStore::open(&dir.path().join(".codebased"), "m", 3).unwrap()
  }

  #[test]
  fn test_scan_partitions() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir);

    let a = dir.path().join("a.py");
    let b = dir.path().join("b.py");
    std::fs::write(&a, "def a(): pass\n").unwrap();
    std::fs::write(&b, "def b(): pass\n").unwrap();

    let diff = store
      .scan_paths(dir.path(), &[a.clone(), b.clone()])
      .unwrap();
    assert_eq!(diff.added, vec!["a.py".to_string(), "b.py".to_string()]);
    assert!(diff.modified.is_empty());
    assert!(diff.removed.is_empty());
  }

  #[test]
  fn test_scan_detects_removed_and_modified() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir);

    // Seed the catalog directly.
    {
      let conn = store.writer.lock().unwrap();
      conn
        .execute(
          "INSERT INTO file (path, size, mtime_ns, hash) VALUES ('gone.py', 1, 1, 'x'), ('kept.py', 999, 1, 'y')",
          [],
        )
        .unwrap();
    }

    let kept = dir.path().join("kept.py");
    std::fs::write(&kept, "changed").unwrap();

    let diff = store.scan_paths(dir.path(), &[kept]).unwrap();
    assert_eq!(diff.removed, vec!["gone.py".to_string()]);
    assert_eq!(diff.modified, vec!["kept.py".to_string()]);
  }

  #[test]
  fn test_touched_but_unchanged_refreshes_prefilter() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir);

    let path = dir.path().join("same.py");
    std::fs::write(&path, "content").unwrap();
    let (fp, _) = fingerprint_file(dir.path(), &path).unwrap();

    // Store a fingerprint whose mtime disagrees but whose hash matches.
    {
      let conn = store.writer.lock().unwrap();
      conn
        .execute(
          "INSERT INTO file (path, size, mtime_ns, hash) VALUES (?1, ?2, 0, ?3)",
          params![fp.path, fp.size, fp.hash],
        )
        .unwrap();
    }

    let diff = store.scan_paths(dir.path(), std::slice::from_ref(&path)).unwrap();
    assert_eq!(diff.unchanged, 1);
    assert!(diff.modified.is_empty());

    // The cheap half was refreshed so the next scan skips hashing.
    let stored = store.fingerprint("same.py").unwrap().unwrap();
    assert_eq!(stored.mtime_ns, fp.mtime_ns);
  }

  #[test]
  fn test_relative_path() {
    assert_eq!(
      relative_path(Path::new("/repo"), Path::new("/repo/src/main.rs")),
      Some("src/main.rs".to_string())
    );
    assert_eq!(relative_path(Path::new("/repo"), Path::new("/elsewhere/x")), None);
  }

  #[test]
  fn test_paths_with_prefix() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir);
    {
      let conn = store.writer.lock().unwrap();
      conn
        .execute(
          "INSERT INTO file (path, size, mtime_ns, hash) VALUES
             ('vendor/x.go', 1, 1, 'a'), ('vendor/y/z.go', 1, 1, 'b'), ('main.go', 1, 1, 'c')",
          [],
        )
        .unwrap();
    }

    let under = store.paths_with_prefix("vendor").unwrap();
    assert_eq!(under, vec!["vendor/x.go".to_string(), "vendor/y/z.go".to_string()]);
  }
}
