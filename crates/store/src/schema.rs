//! Schema migrations, applied in order and recorded in a `migrations` table.

use rusqlite::Connection;
use tracing::debug;

use crate::Result;

/// Bump when a migration is added; persisted in `meta.toml` so incompatible
/// layouts trigger a full rebuild.
pub const SCHEMA_VERSION: i64 = 1;

const MIGRATIONS: &[(i64, &str)] = &[(
  1,
  r#"
  CREATE TABLE file (
    path TEXT PRIMARY KEY,
    size INTEGER NOT NULL,
    mtime_ns INTEGER NOT NULL,
    hash TEXT NOT NULL
  );

  CREATE TABLE object (
    id INTEGER PRIMARY KEY,
    path TEXT NOT NULL REFERENCES file(path),
    name TEXT NOT NULL,
    language TEXT NOT NULL,
    kind TEXT NOT NULL,
    byte_start INTEGER NOT NULL,
    byte_end INTEGER NOT NULL,
    start_line INTEGER NOT NULL,
    start_col INTEGER NOT NULL,
    end_line INTEGER NOT NULL,
    end_col INTEGER NOT NULL,
    context_before TEXT NOT NULL,
    context_after TEXT NOT NULL,
    content_hash TEXT NOT NULL
  );

  CREATE INDEX object_path_idx ON object(path);
  CREATE INDEX object_content_hash_idx ON object(content_hash);

  -- Embedding rows outlive the objects that created them until GC; the
  -- object_id column intentionally carries no FK so reuse-by-content-hash
  -- can read rows whose object was just deleted in the same revision.
  CREATE TABLE embedding (
    object_id INTEGER PRIMARY KEY,
    vector BLOB NOT NULL,
    content_hash TEXT NOT NULL
  );

  CREATE INDEX embedding_content_hash_idx ON embedding(content_hash);

  CREATE VIRTUAL TABLE fts USING fts5(
    path, name, body,
    content='',
    contentless_delete=1,
    tokenize='trigram'
  );
  "#,
)];

pub fn migrate(conn: &Connection) -> Result<()> {
  conn.execute(
    "CREATE TABLE IF NOT EXISTS migrations (version INTEGER PRIMARY KEY)",
    [],
  )?;

  let current: Option<i64> = conn
    .query_row("SELECT MAX(version) FROM migrations", [], |row| row.get(0))
    .unwrap_or(None);

  for (version, sql) in MIGRATIONS {
    if current.is_some_and(|v| v >= *version) {
      continue;
    }
    debug!("Applying schema migration {version}");
    conn.execute_batch(sql)?;
    conn.execute("INSERT INTO migrations (version) VALUES (?1)", [version])?;
  }

  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_migrate_fresh() {
    let conn = Connection::open_in_memory().unwrap();
    migrate(&conn).unwrap();

    let tables: Vec<String> = conn
      .prepare("SELECT name FROM sqlite_master WHERE type IN ('table', 'view') ORDER BY name")
      .unwrap()
      .query_map([], |row| row.get(0))
      .unwrap()
      .collect::<rusqlite::Result<_>>()
      .unwrap();

    for expected in ["file", "object", "embedding", "fts", "migrations"] {
      assert!(tables.iter().any(|t| t == expected), "missing {expected}: {tables:?}");
    }
  }

  #[test]
  fn test_migrate_is_idempotent() {
    let conn = Connection::open_in_memory().unwrap();
    migrate(&conn).unwrap();
    migrate(&conn).unwrap();

    let version: i64 = conn
      .query_row("SELECT MAX(version) FROM migrations", [], |row| row.get(0))
      .unwrap();
    assert_eq!(version, SCHEMA_VERSION);
  }

  #[test]
  fn test_fts_trigram_match() {
    let conn = Connection::open_in_memory().unwrap();
    migrate(&conn).unwrap();

    conn
      .execute(
        "INSERT INTO fts (rowid, path, name, body) VALUES (1, 'a.py', 'baz', 'def baz(self): ...')",
        [],
      )
      .unwrap();

    let hits: i64 = conn
      .query_row("SELECT COUNT(*) FROM fts WHERE fts MATCH '\"baz\"'", [], |row| {
        row.get(0)
      })
      .unwrap();
    assert_eq!(hits, 1);

    // Trigram tokenization matches substrings of identifiers too.
    let hits: i64 = conn
      .query_row("SELECT COUNT(*) FROM fts WHERE fts MATCH '\"def baz\"'", [], |row| {
        row.get(0)
      })
      .unwrap();
    assert_eq!(hits, 1);
  }

  #[test]
  fn test_fts_contentless_delete() {
    let conn = Connection::open_in_memory().unwrap();
    migrate(&conn).unwrap();

    conn
      .execute(
        "INSERT INTO fts (rowid, path, name, body) VALUES (7, 'x.rs', 'widget', 'fn widget() {}')",
        [],
      )
      .unwrap();
    conn.execute("DELETE FROM fts WHERE rowid = 7", []).unwrap();

    let hits: i64 = conn
      .query_row("SELECT COUNT(*) FROM fts WHERE fts MATCH '\"widget\"'", [], |row| {
        row.get(0)
      })
      .unwrap();
    assert_eq!(hits, 0);
  }
}
