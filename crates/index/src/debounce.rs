// Coalescing layer over the raw watcher - batches rapid event storms
// per path before they reach the indexer.

use crate::watcher::{ChangeKind, FileChange, WatchError, WatchEvent, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct DebounceConfig {
  /// Quiet period before a path's coalesced change is released.
  pub coalesce_ms: u64,
  /// Pending-map size that forces an immediate flush.
  pub max_pending: usize,
}

impl Default for DebounceConfig {
  fn default() -> Self {
    Self {
      coalesce_ms: 100,
      max_pending: 1024,
    }
  }
}

/// Accumulated change state for a single path.
#[derive(Debug, Clone)]
struct PendingChange {
  kind: ChangeKind,
  last_seen: Instant,
}

impl PendingChange {
  fn new(kind: ChangeKind) -> Self {
    Self {
      kind,
      last_seen: Instant::now(),
    }
  }

  fn update(&mut self, kind: ChangeKind) {
    self.last_seen = Instant::now();
    match (self.kind, kind) {
      // Create followed by modify is still a create
      (ChangeKind::Created, ChangeKind::Modified) => {}
      // Delete followed by create is a modify
      (ChangeKind::Deleted, ChangeKind::Created) => self.kind = ChangeKind::Modified,
      // Otherwise take the latest
      _ => self.kind = kind,
    }
  }
}

/// A watcher that deduplicates rapid event storms per path.
///
/// `Moved` events are decomposed into a delete of the source and a create of
/// the destination so downstream handling is uniform; a directory create is
/// expanded by the indexer, not here.
pub struct DebouncedWatcher {
  watcher: Watcher,
  config: DebounceConfig,
  pending: HashMap<PathBuf, PendingChange>,
  resync_requested: bool,
}

impl DebouncedWatcher {
  pub fn new(root: &Path, config: DebounceConfig) -> Result<Self, WatchError> {
    Ok(Self {
      watcher: Watcher::new(root)?,
      config,
      pending: HashMap::new(),
      resync_requested: false,
    })
  }

  pub fn with_defaults(root: &Path) -> Result<Self, WatchError> {
    Self::new(root, DebounceConfig::default())
  }

  pub fn root(&self) -> &Path {
    self.watcher.root()
  }

  /// Drain raw events into the pending map.
  pub fn poll_raw(&mut self) {
    while let Some(event) = self.watcher.poll() {
      self.handle_event(event);
    }
  }

  /// Collect changes whose quiet period has elapsed.
  pub fn collect_ready(&mut self) -> Vec<FileChange> {
    self.poll_raw();

    let force = self.pending.len() >= self.config.max_pending;
    let now = Instant::now();
    let window = Duration::from_millis(self.config.coalesce_ms);

    let ready_paths: Vec<PathBuf> = self
      .pending
      .iter()
      .filter(|(_, pending)| force || now.duration_since(pending.last_seen) >= window)
      .map(|(path, _)| path.clone())
      .collect();

    let mut ready = Vec::with_capacity(ready_paths.len());
    for path in ready_paths {
      if let Some(pending) = self.pending.remove(&path) {
        ready.push(FileChange {
          path,
          kind: pending.kind,
        });
      }
    }
    ready.sort_by(|a, b| a.path.cmp(&b.path));
    ready
  }

  /// Whether a resync was requested since the last call; clears the flag.
  pub fn take_resync(&mut self) -> bool {
    self.poll_raw();
    std::mem::take(&mut self.resync_requested)
  }

  pub fn pending_count(&self) -> usize {
    self.pending.len()
  }

  fn handle_event(&mut self, event: WatchEvent) {
    match event {
      WatchEvent::Created(path) => self.accumulate(path, ChangeKind::Created),
      WatchEvent::Modified(path) => self.accumulate(path, ChangeKind::Modified),
      WatchEvent::Deleted(path) => self.accumulate(path, ChangeKind::Deleted),
      WatchEvent::Moved { from, to } => {
        self.accumulate(from, ChangeKind::Deleted);
        self.accumulate(to, ChangeKind::Created);
      }
      WatchEvent::Resync => self.resync_requested = true,
    }
  }

  fn accumulate(&mut self, path: PathBuf, kind: ChangeKind) {
    if let Some(pending) = self.pending.get_mut(&path) {
      pending.update(kind);
    } else {
      self.pending.insert(path, PendingChange::new(kind));
    }
  }
}
