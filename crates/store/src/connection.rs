use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tracing::{info, warn};

use crate::ann::{AnnError, AnnIndex};
use crate::schema::{self, SCHEMA_VERSION};

#[derive(Error, Debug)]
pub enum StoreError {
  #[error("SQLite error: {0}")]
  Sqlite(#[from] rusqlite::Error),
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
  #[error("ANN error: {0}")]
  Ann(#[from] AnnError),
  #[error("Meta error: {0}")]
  Meta(String),
  #[error("Consistency violation: {0}")]
  Consistency(String),
}

/// `meta.toml`: compatibility gate for the persisted layout. Any mismatch
/// against the running configuration triggers a full rebuild.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meta {
  pub schema_version: i64,
  pub embedding_model: String,
  pub embedding_dimension: usize,
}

impl Meta {
  pub fn current(model: &str, dimension: usize) -> Self {
    Self {
      schema_version: SCHEMA_VERSION,
      embedding_model: model.to_string(),
      embedding_dimension: dimension,
    }
  }

  fn load(path: &Path) -> Result<Self, StoreError> {
    let content = std::fs::read_to_string(path)?;
    toml::from_str(&content).map_err(|e| StoreError::Meta(e.to_string()))
  }

  fn save(&self, path: &Path) -> Result<(), StoreError> {
    let content = toml::to_string_pretty(self).map_err(|e| StoreError::Meta(e.to_string()))?;
    std::fs::write(path, content)?;
    Ok(())
  }
}

/// Handle over the three physical indices.
///
/// Single-writer / multi-reader: all mutations go through the writer
/// connection (serialized by its mutex, driven by the indexer); readers use
/// a separate WAL-mode connection and hold the current ANN snapshot by
/// reference for the duration of a query.
pub struct IndexStore {
  pub(crate) writer: Mutex<Connection>,
  pub(crate) reader: Mutex<Connection>,
  pub(crate) ann: RwLock<Arc<AnnIndex>>,
  pub(crate) ann_path: PathBuf,
  pub(crate) dimension: usize,
}

impl IndexStore {
  /// Open (or create) the store under `index_dir`, verifying `meta.toml`
  /// and reconciling the ANN file against the embedding table.
  pub fn open(index_dir: &Path, model: &str, dimension: usize) -> Result<Self, StoreError> {
    std::fs::create_dir_all(index_dir)?;

    let meta_path = index_dir.join("meta.toml");
    let db_path = index_dir.join("index.db");
    let ann_path = index_dir.join("ann.bin");
    let expected = Meta::current(model, dimension);

    if meta_path.exists() {
      let stale = match Meta::load(&meta_path) {
        Ok(meta) => meta != expected,
        Err(e) => {
          warn!("Unreadable meta.toml, rebuilding: {e}");
          true
        }
      };
      if stale {
        info!("Index layout mismatch; rebuilding {}", index_dir.display());
        remove_if_exists(&db_path)?;
        remove_if_exists(&ann_path)?;
      }
    }
    expected.save(&meta_path)?;

    let writer = open_connection(&db_path)?;
    schema::migrate(&writer)?;
    let reader = open_connection(&db_path)?;

    let ann = load_or_rebuild_ann(&writer, &ann_path, dimension)?;

    Ok(Self {
      writer: Mutex::new(writer),
      reader: Mutex::new(reader),
      ann: RwLock::new(Arc::new(ann)),
      ann_path,
      dimension,
    })
  }

  pub fn dimension(&self) -> usize {
    self.dimension
  }

  /// The current ANN snapshot; queries keep the `Arc` for their duration.
  pub fn ann_snapshot(&self) -> Arc<AnnIndex> {
    self.ann.read().expect("ann lock poisoned").clone()
  }

  pub fn file_count(&self) -> Result<usize, StoreError> {
    self.count("SELECT COUNT(*) FROM file")
  }

  pub fn object_count(&self) -> Result<usize, StoreError> {
    self.count("SELECT COUNT(*) FROM object")
  }

  pub fn embedding_count(&self) -> Result<usize, StoreError> {
    self.count("SELECT COUNT(*) FROM embedding")
  }

  fn count(&self, sql: &str) -> Result<usize, StoreError> {
    let conn = self.reader.lock().expect("reader lock poisoned");
    let count: i64 = conn.query_row(sql, [], |row| row.get(0))?;
    Ok(count as usize)
  }
}

fn remove_if_exists(path: &Path) -> std::io::Result<()> {
  match std::fs::remove_file(path) {
    Ok(()) => Ok(()),
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
    Err(e) => Err(e),
  }
}

fn open_connection(path: &Path) -> Result<Connection, StoreError> {
  let conn = Connection::open(path)?;
  conn.pragma_update(None, "journal_mode", "WAL")?;
  conn.pragma_update(None, "synchronous", "NORMAL")?;
  Ok(conn)
}

/// The catalog is the authority: a missing, corrupt, or miscounted ANN file
/// is rebuilt from the embedding table in one pass before queries are served.
fn load_or_rebuild_ann(conn: &Connection, ann_path: &Path, dimension: usize) -> Result<AnnIndex, StoreError> {
  let row_count: i64 = conn.query_row("SELECT COUNT(*) FROM embedding", [], |row| row.get(0))?;

  if ann_path.exists() {
    match AnnIndex::read_from(ann_path, dimension) {
      Ok(index) if index.live_len() == row_count as usize => return Ok(index),
      Ok(index) => {
        warn!(
          "ANN count {} does not match embedding rows {row_count}; rebuilding",
          index.live_len()
        );
      }
      Err(e) => {
        warn!("ANN file unreadable ({e}); rebuilding");
      }
    }
  }

  let mut stmt = conn.prepare("SELECT object_id, vector FROM embedding")?;
  let rows: Vec<(i64, Vec<f32>)> = stmt
    .query_map([], |row| {
      let id: i64 = row.get(0)?;
      let blob: Vec<u8> = row.get(1)?;
      Ok((id, crate::revision::deserialize_vector(&blob)))
    })?
    .collect::<rusqlite::Result<_>>()?;

  let index = AnnIndex::from_rows(dimension, rows);
  if let Err(e) = index.write_to(ann_path) {
    warn!("Failed to persist rebuilt ANN: {e}");
  }
  info!("Rebuilt ANN index with {} entries", index.live_len());
  Ok(index)
}
