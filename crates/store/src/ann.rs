//! Flat inner-product ANN index over L2-normalized vectors.
//!
//! Snapshots are immutable; the store publishes a new snapshot after each
//! catalog commit by swapping an `Arc`. Removals tombstone in place and the
//! index compacts once tombstones exceed 20% of live entries. Serialization
//! (`ann.bin`): magic `CBAN`, u32 version, u32 dim, u64 count, id list,
//! raw vectors.

use std::collections::HashSet;
use std::io::Write;
use std::path::Path;
use thiserror::Error;

pub const ANN_MAGIC: [u8; 4] = *b"CBAN";
pub const ANN_VERSION: u32 = 1;

const HEADER_LEN: usize = 4 + 4 + 4 + 8;

#[derive(Error, Debug)]
pub enum AnnError {
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
  #[error("Corrupt index: {0}")]
  Corrupt(String),
}

#[derive(Debug, Clone)]
pub struct AnnIndex {
  dim: usize,
  ids: Vec<i64>,
  vectors: Vec<f32>,
  tombstones: HashSet<i64>,
}

impl AnnIndex {
  pub fn new(dim: usize) -> Self {
    Self {
      dim,
      ids: Vec::new(),
      vectors: Vec::new(),
      tombstones: HashSet::new(),
    }
  }

  pub fn dim(&self) -> usize {
    self.dim
  }

  /// Entries visible to queries.
  pub fn live_len(&self) -> usize {
    self.ids.len() - self.tombstones.len()
  }

  pub fn tombstone_len(&self) -> usize {
    self.tombstones.len()
  }

  pub fn contains(&self, id: i64) -> bool {
    !self.tombstones.contains(&id) && self.ids.contains(&id)
  }

  /// Produce the successor snapshot with `removed` tombstoned and `added`
  /// appended. Ids in `removed` without an entry are ignored. Compacts when
  /// the tombstone share crosses the rebuild threshold.
  pub fn apply(&self, removed: &[i64], added: &[(i64, Vec<f32>)]) -> AnnIndex {
    let mut next = self.clone();

    let present: HashSet<i64> = next.ids.iter().copied().collect();
    for id in removed {
      if present.contains(id) {
        next.tombstones.insert(*id);
      }
    }

    for (id, vector) in added {
      debug_assert_eq!(vector.len(), next.dim);
      // Re-adding a tombstoned id revives it with the new vector.
      if let Some(pos) = next.ids.iter().position(|existing| existing == id) {
        next.tombstones.remove(id);
        next.vectors[pos * next.dim..(pos + 1) * next.dim].copy_from_slice(vector);
      } else {
        next.ids.push(*id);
        next.vectors.extend_from_slice(vector);
      }
    }

    if next.tombstones.len() * 5 > next.live_len() {
      next.compact();
    }

    next
  }

  /// Top-k by inner product (cosine similarity on normalized input).
  /// Ties break toward the smaller id for determinism.
  pub fn search(&self, query: &[f32], k: usize) -> Vec<(i64, f32)> {
    debug_assert_eq!(query.len(), self.dim);

    let mut scored: Vec<(i64, f32)> = self
      .ids
      .iter()
      .enumerate()
      .filter(|(_, id)| !self.tombstones.contains(id))
      .map(|(row, &id)| {
        let offset = row * self.dim;
        let score = dot(&self.vectors[offset..offset + self.dim], query);
        (id, score)
      })
      .collect();

    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then(a.0.cmp(&b.0)));
    scored.truncate(k);
    scored
  }

  /// Build from `(id, vector)` rows, e.g. the embedding table.
  pub fn from_rows(dim: usize, rows: Vec<(i64, Vec<f32>)>) -> Self {
    let mut index = Self::new(dim);
    index.ids.reserve(rows.len());
    index.vectors.reserve(rows.len() * dim);
    for (id, vector) in rows {
      index.ids.push(id);
      index.vectors.extend_from_slice(&vector);
    }
    index
  }

  fn compact(&mut self) {
    if self.tombstones.is_empty() {
      return;
    }
    let mut ids = Vec::with_capacity(self.live_len());
    let mut vectors = Vec::with_capacity(self.live_len() * self.dim);
    for (row, &id) in self.ids.iter().enumerate() {
      if self.tombstones.contains(&id) {
        continue;
      }
      ids.push(id);
      vectors.extend_from_slice(&self.vectors[row * self.dim..(row + 1) * self.dim]);
    }
    self.ids = ids;
    self.vectors = vectors;
    self.tombstones.clear();
  }

  /// Serialize (compacted) to `path`, atomically via a temp file rename.
  pub fn write_to(&self, path: &Path) -> Result<(), AnnError> {
    let mut compacted = self.clone();
    compacted.compact();

    let mut buffer = Vec::with_capacity(HEADER_LEN + compacted.ids.len() * (8 + compacted.dim * 4));
    buffer.extend_from_slice(&ANN_MAGIC);
    buffer.extend_from_slice(&ANN_VERSION.to_le_bytes());
    buffer.extend_from_slice(&(compacted.dim as u32).to_le_bytes());
    buffer.extend_from_slice(&(compacted.ids.len() as u64).to_le_bytes());
    for id in &compacted.ids {
      buffer.extend_from_slice(&id.to_le_bytes());
    }
    for value in &compacted.vectors {
      buffer.extend_from_slice(&value.to_le_bytes());
    }

    let tmp = path.with_extension("bin.tmp");
    {
      let mut file = std::fs::File::create(&tmp)?;
      file.write_all(&buffer)?;
      file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
  }

  pub fn read_from(path: &Path, expected_dim: usize) -> Result<Self, AnnError> {
    let bytes = std::fs::read(path)?;
    if bytes.len() < HEADER_LEN {
      return Err(AnnError::Corrupt("truncated header".to_string()));
    }
    if bytes[..4] != ANN_MAGIC {
      return Err(AnnError::Corrupt("bad magic".to_string()));
    }
    let version = u32::from_le_bytes(bytes[4..8].try_into().expect("sized slice"));
    if version != ANN_VERSION {
      return Err(AnnError::Corrupt(format!("unsupported version {version}")));
    }
    let dim = u32::from_le_bytes(bytes[8..12].try_into().expect("sized slice")) as usize;
    if dim != expected_dim {
      return Err(AnnError::Corrupt(format!("dimension {dim}, expected {expected_dim}")));
    }
    let count = u64::from_le_bytes(bytes[12..HEADER_LEN].try_into().expect("sized slice")) as usize;

    let expected_len = HEADER_LEN + count * 8 + count * dim * 4;
    if bytes.len() != expected_len {
      return Err(AnnError::Corrupt(format!(
        "expected {expected_len} bytes for {count} entries, found {}",
        bytes.len()
      )));
    }

    let mut ids = Vec::with_capacity(count);
    let mut offset = HEADER_LEN;
    for _ in 0..count {
      ids.push(i64::from_le_bytes(bytes[offset..offset + 8].try_into().expect("sized slice")));
      offset += 8;
    }

    let mut vectors = Vec::with_capacity(count * dim);
    for _ in 0..count * dim {
      vectors.push(f32::from_le_bytes(bytes[offset..offset + 4].try_into().expect("sized slice")));
      offset += 4;
    }

    Ok(Self {
      dim,
      ids,
      vectors,
      tombstones: HashSet::new(),
    })
  }
}

/// L2-normalize in place; the zero vector is left unchanged.
pub fn normalize(vector: &mut [f32]) {
  let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
  if norm > 0.0 {
    for value in vector.iter_mut() {
      *value /= norm;
    }
  }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
  a.iter().zip(b).map(|(x, y)| x * y).sum()
}
