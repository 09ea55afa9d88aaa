//! The indexer: one-shot and live re-indexing over the triple store.
//!
//! Per-path failures are isolated and bounded; commits are serialized by
//! the store's single writer in worker completion order; an index-changed
//! notification is broadcast only after its commit is visible.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use codebased_core::{Error, FileFingerprint, Language, Result};
use codebased_embedding::EmbeddingService;
use codebased_index::scanner::IGNORE_FILENAME;
use codebased_index::{ChangeKind, DebounceConfig, DebouncedWatcher, EventFilter, FileChange, Scanner, decode_text};
use codebased_parser::{ExtractedObject, Extractor};
use codebased_store::catalog::{fingerprint_file, relative_path};
use codebased_store::{IndexStore, ObjectRecord, ScanDiff};
use tokio::sync::{Semaphore, broadcast, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

thread_local! {
  static EXTRACTOR: RefCell<Extractor> = RefCell::new(Extractor::new());
}

#[derive(Debug, Clone)]
pub struct IndexerConfig {
  /// Parse/extract worker pool size.
  pub workers: usize,
  /// Coalescing window for watcher events.
  pub coalesce_ms: u64,
  /// Failures per path before it is quarantined for the session.
  pub max_path_failures: u32,
  /// How long shutdown waits for in-flight commits.
  pub shutdown_drain: Duration,
}

impl Default for IndexerConfig {
  fn default() -> Self {
    let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
    Self {
      workers: cores.min(8),
      coalesce_ms: 100,
      max_path_failures: 3,
      shutdown_drain: Duration::from_secs(5),
    }
  }
}

/// Broadcast after each visible commit.
#[derive(Debug, Clone)]
pub struct IndexChanged {
  pub path: String,
  pub object_ids: Vec<i64>,
}

/// Counters exposed to the status line.
#[derive(Debug, Default)]
pub struct IndexStats {
  pub files_indexed: AtomicU64,
  pub files_removed: AtomicU64,
  pub objects_written: AtomicU64,
  pub errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
  pub indexed: usize,
  pub removed: usize,
  pub unchanged: usize,
  pub errors: usize,
}

pub struct Indexer {
  root: PathBuf,
  store: Arc<IndexStore>,
  service: Arc<EmbeddingService>,
  config: IndexerConfig,
  changed_tx: broadcast::Sender<IndexChanged>,
  shutdown_tx: watch::Sender<bool>,
  shutdown_rx: watch::Receiver<bool>,
  stats: IndexStats,
  failures: Mutex<HashMap<String, u32>>,
  /// Quarantined paths with the (size, mtime_ns) they failed at; a path
  /// leaves quarantine when its fingerprint changes.
  quarantine: Mutex<HashMap<String, (u64, i64)>>,
}

impl Indexer {
  pub fn new(
    root: &Path,
    store: Arc<IndexStore>,
    service: Arc<EmbeddingService>,
    config: IndexerConfig,
  ) -> Arc<Self> {
    let (changed_tx, _) = broadcast::channel(1024);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    Arc::new(Self {
      root: root.to_path_buf(),
      store,
      service,
      config,
      changed_tx,
      shutdown_tx,
      shutdown_rx,
      stats: IndexStats::default(),
      failures: Mutex::new(HashMap::new()),
      quarantine: Mutex::new(HashMap::new()),
    })
  }

  /// Subscribe to index-changed notifications.
  pub fn subscribe(&self) -> broadcast::Receiver<IndexChanged> {
    self.changed_tx.subscribe()
  }

  pub fn stats(&self) -> &IndexStats {
    &self.stats
  }

  /// Signal shutdown; live loops exit and pending work is drained up to
  /// the configured deadline.
  pub fn shutdown(&self) {
    let _ = self.shutdown_tx.send(true);
  }

  fn shutting_down(&self) -> bool {
    *self.shutdown_rx.borrow()
  }

  /// One-shot mode: scan, diff, and process the dirty set. Returns when
  /// the last path has committed.
  pub async fn run_once(self: &Arc<Self>) -> Result<RunSummary> {
    let scanner = Scanner::new(&self.root);
    let paths = tokio::task::spawn_blocking(move || scanner.scan())
      .await
      .map_err(|e| Error::Store(e.to_string()))?;

    let diff = self.diff_paths(paths).await?;
    info!(
      "Scan: {} added, {} modified, {} removed, {} unchanged",
      diff.added.len(),
      diff.modified.len(),
      diff.removed.len(),
      diff.unchanged
    );

    let errors_before = self.stats.errors.load(Ordering::Relaxed);

    for rel in &diff.removed {
      self.remove_rel(rel).await;
    }

    let mut dirty = diff.added.clone();
    dirty.extend(diff.modified.iter().cloned());
    let indexed = dirty.len();
    self.process_many(dirty).await;

    Ok(RunSummary {
      indexed,
      removed: diff.removed.len(),
      unchanged: diff.unchanged,
      errors: (self.stats.errors.load(Ordering::Relaxed) - errors_before) as usize,
    })
  }

  /// Live mode: one-shot, then watcher-driven incremental updates until
  /// shutdown.
  pub async fn run_live(self: Arc<Self>) -> Result<()> {
    self.run_once().await?;

    let mut watcher = DebouncedWatcher::new(
      &self.root,
      DebounceConfig {
        coalesce_ms: self.config.coalesce_ms,
        ..Default::default()
      },
    )
    .map_err(|e| Error::Watch(e.to_string()))?;
    let mut filter = EventFilter::new(&self.root);
    let mut shutdown = self.shutdown_rx.clone();

    info!("Watching {} for changes", self.root.display());

    loop {
      tokio::select! {
        changed = shutdown.changed() => {
          if changed.is_err() || *shutdown.borrow() {
            break;
          }
        }
        _ = tokio::time::sleep(Duration::from_millis(50)) => {
          if watcher.take_resync() {
            debug!("Resync requested");
            if let Err(e) = self.run_once().await {
              warn!("Resync failed: {e}");
            }
            continue;
          }
          let changes = watcher.collect_ready();
          if !changes.is_empty() {
            self.handle_changes(changes, &mut filter).await;
          }
        }
      }
    }

    debug!("Indexer shutting down");
    Ok(())
  }

  async fn handle_changes(self: &Arc<Self>, changes: Vec<FileChange>, filter: &mut EventFilter) {
    let mut to_process: Vec<String> = Vec::new();

    for change in changes {
      let name = change.path.file_name().and_then(|n| n.to_str()).unwrap_or("");
      if name == ".gitignore" || name == IGNORE_FILENAME {
        // Ignore rules changed: rebuild the matchers and reconverge via a
        // full scan, which also evicts newly-ignored paths.
        filter.reload();
        if let Err(e) = self.run_once().await {
          warn!("Rescan after ignore change failed: {e}");
        }
        continue;
      }

      // Ignore rules are re-applied at event time; filtered events drop.
      if !filter.should_index(&change.path) {
        continue;
      }

      match change.kind {
        ChangeKind::Deleted => {
          let Some(rel) = relative_path(&self.root, &change.path) else {
            continue;
          };
          // A deleted directory takes all its descendants with it.
          match self.store.paths_with_prefix(&rel) {
            Ok(descendants) => {
              for sub in descendants {
                self.remove_rel(&sub).await;
              }
            }
            Err(e) => warn!("Prefix lookup failed for {rel}: {e}"),
          }
          if matches!(self.store.fingerprint(&rel), Ok(Some(_))) {
            self.remove_rel(&rel).await;
          }
        }
        ChangeKind::Created | ChangeKind::Modified => {
          if change.path.is_dir() {
            // A moved-in directory: enumerate its descendants.
            let scanner = Scanner::new(&self.root);
            let dir = change.path.clone();
            let files = tokio::task::spawn_blocking(move || scanner.scan_dir(&dir))
              .await
              .unwrap_or_default();
            for file in files {
              if filter.should_index(&file)
                && let Some(rel) = relative_path(&self.root, &file)
              {
                to_process.push(rel);
              }
            }
          } else if let Some(rel) = relative_path(&self.root, &change.path) {
            to_process.push(rel);
          }
        }
      }
    }

    to_process.sort();
    to_process.dedup();
    self.process_many(to_process).await;
  }

  async fn diff_paths(&self, paths: Vec<PathBuf>) -> Result<ScanDiff> {
    let store = self.store.clone();
    let root = self.root.clone();
    tokio::task::spawn_blocking(move || store.scan_paths(&root, &paths))
      .await
      .map_err(|e| Error::Store(e.to_string()))?
      .map_err(|e| Error::Store(e.to_string()))
  }

  /// Process dirty paths on the worker pool. One bad file never stalls the
  /// others; failures are counted per path and quarantined after the limit.
  async fn process_many(self: &Arc<Self>, paths: Vec<String>) {
    if paths.is_empty() {
      return;
    }

    let semaphore = Arc::new(Semaphore::new(self.config.workers));
    let mut tasks = JoinSet::new();

    for rel in paths {
      if self.shutting_down() {
        debug!("Shutdown requested; abandoning remaining paths");
        break;
      }
      let Ok(permit) = semaphore.clone().acquire_owned().await else {
        break;
      };
      let indexer = self.clone();
      tasks.spawn(async move {
        let _permit = permit;
        indexer.process_with_accounting(rel).await;
      });
    }

    if self.shutting_down() {
      // Drain in-flight commits up to the deadline, then abandon; the
      // abandoned paths keep their old fingerprints and retry next run.
      let drain = async {
        while tasks.join_next().await.is_some() {}
      };
      if tokio::time::timeout(self.config.shutdown_drain, drain).await.is_err() {
        warn!("Shutdown drain deadline hit; abandoning in-flight work");
        tasks.abort_all();
      }
    } else {
      while tasks.join_next().await.is_some() {}
    }
  }

  async fn process_with_accounting(self: &Arc<Self>, rel: String) {
    match self.process_rel(&rel).await {
      Ok(Some(object_ids)) => {
        self.failures.lock().expect("failures lock poisoned").remove(&rel);
        self.stats.files_indexed.fetch_add(1, Ordering::Relaxed);
        self
          .stats
          .objects_written
          .fetch_add(object_ids.len() as u64, Ordering::Relaxed);
        let _ = self.changed_tx.send(IndexChanged { path: rel, object_ids });
      }
      Ok(None) => {}
      Err(e) => {
        self.stats.errors.fetch_add(1, Ordering::Relaxed);
        warn!("Indexing {rel} failed: {e}");

        let mut failures = self.failures.lock().expect("failures lock poisoned");
        let count = failures.entry(rel.clone()).or_insert(0);
        *count += 1;
        if *count >= self.config.max_path_failures {
          failures.remove(&rel);
          drop(failures);
          if let Ok(metadata) = std::fs::metadata(self.root.join(&rel)) {
            let key = (metadata.len(), codebased_store::catalog::mtime_ns(&metadata));
            warn!("Quarantining {rel} until it changes");
            self.quarantine.lock().expect("quarantine lock poisoned").insert(rel, key);
          }
        }
      }
    }
  }

  /// One revision: read, extract, resolve embeddings, commit.
  /// `Ok(None)` means the path was skipped (binary, vanished, quarantined).
  async fn process_rel(self: &Arc<Self>, rel: &str) -> Result<Option<Vec<i64>>> {
    let abs = self.root.join(rel);

    if self.is_quarantined(rel, &abs) {
      debug!("Skipping quarantined path {rel}");
      return Ok(None);
    }

    let root = self.root.clone();
    let parsed = tokio::task::spawn_blocking(move || read_and_extract(&root, &abs))
      .await
      .map_err(|e| Error::Store(e.to_string()))??;

    let Some((fingerprint, text, extracted)) = parsed else {
      return Ok(None);
    };

    // Cache-first: reuse stored vectors by content fingerprint, then ask
    // the service for the miss set only.
    let mut vectors: HashMap<String, Vec<f32>> = HashMap::new();
    let mut misses: Vec<(String, String)> = Vec::new();
    {
      let store = self.store.clone();
      let hashes: Vec<String> = extracted.iter().map(|o| o.content_hash.clone()).collect();
      let known = tokio::task::spawn_blocking(move || -> std::result::Result<_, codebased_store::StoreError> {
        let mut known = HashMap::new();
        for hash in hashes {
          if let Some(vector) = store.lookup_embedding_by_hash(&hash)? {
            known.insert(hash, vector);
          }
        }
        Ok(known)
      })
      .await
      .map_err(|e| Error::Store(e.to_string()))?
      .map_err(|e| Error::Store(e.to_string()))?;
      vectors.extend(known);
    }

    for object in &extracted {
      if !vectors.contains_key(&object.content_hash) {
        let body = text[object.byte_range.start..object.byte_range.end].to_string();
        let rendered = format!("{}\n\n{}{}{}", rel, object.context_before, body, object.context_after);
        misses.push((object.content_hash.clone(), rendered));
      }
    }

    if !misses.is_empty() {
      let fresh = self
        .service
        .embed_new(misses)
        .await
        .map_err(|e| Error::EmbeddingTransient(e.to_string()))?;
      vectors.extend(fresh);
    }

    let records: Vec<ObjectRecord> = extracted
      .into_iter()
      .map(|object| {
        let body = text[object.byte_range.start..object.byte_range.end].to_string();
        let vector = vectors.get(&object.content_hash).cloned();
        ObjectRecord {
          name: object.name,
          language: object.language,
          kind: object.kind,
          byte_range: object.byte_range,
          coordinates: object.coordinates,
          context_before: object.context_before,
          context_after: object.context_after,
          content_hash: object.content_hash,
          body,
          vector,
        }
      })
      .collect();

    let store = self.store.clone();
    let ids = tokio::task::spawn_blocking(move || store.commit_revision(&fingerprint, records))
      .await
      .map_err(|e| Error::Store(e.to_string()))?
      .map_err(|e| match e {
        codebased_store::StoreError::Consistency(msg) => Error::Consistency(msg),
        other => Error::Store(other.to_string()),
      })?;

    Ok(Some(ids))
  }

  async fn remove_rel(self: &Arc<Self>, rel: &str) {
    let store = self.store.clone();
    let owned = rel.to_string();
    match tokio::task::spawn_blocking(move || store.remove_path(&owned)).await {
      Ok(Ok(object_ids)) => {
        self.stats.files_removed.fetch_add(1, Ordering::Relaxed);
        let _ = self.changed_tx.send(IndexChanged {
          path: rel.to_string(),
          object_ids,
        });
      }
      Ok(Err(e)) => {
        self.stats.errors.fetch_add(1, Ordering::Relaxed);
        warn!("Removing {rel} failed: {e}");
      }
      Err(e) => {
        self.stats.errors.fetch_add(1, Ordering::Relaxed);
        warn!("Removal task for {rel} panicked: {e}");
      }
    }
  }

  fn is_quarantined(&self, rel: &str, abs: &Path) -> bool {
    let quarantine = self.quarantine.lock().expect("quarantine lock poisoned");
    let Some((size, mtime)) = quarantine.get(rel) else {
      return false;
    };
    match std::fs::metadata(abs) {
      Ok(metadata) => {
        metadata.len() == *size && codebased_store::catalog::mtime_ns(&metadata) == *mtime
      }
      // Vanished; removal will be handled by the scan.
      Err(_) => false,
    }
  }
}

type Parsed = Option<(FileFingerprint, String, Vec<ExtractedObject>)>;

/// Blocking half of a revision: fingerprint, decode, extract, validate.
fn read_and_extract(root: &Path, abs: &Path) -> Result<Parsed> {
  let (fingerprint, bytes) = match fingerprint_file(root, abs) {
    Ok(pair) => pair,
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
    Err(e) => return Err(Error::Io(e)),
  };

  let Some(text) = decode_text(&bytes) else {
    // Turned binary since the scan; leave the catalog alone.
    return Ok(None);
  };

  let extracted = match Language::from_path(abs) {
    None => Vec::new(),
    Some(language) => EXTRACTOR.with(|extractor| {
      match extractor.borrow_mut().extract(&text, language) {
        Ok(objects) => objects,
        Err(e) => {
          // Parse failures are non-fatal: zero objects, fingerprint still
          // updated so the file is not retried every cycle.
          warn!("Parse failed for {}: {e}", fingerprint.path);
          Vec::new()
        }
      }
    }),
  };

  for object in &extracted {
    if object.byte_range.end > text.len() || object.byte_range.start >= object.byte_range.end {
      return Err(Error::Consistency(format!(
        "object {} has byte range {}..{} outside {} ({} bytes)",
        object.name,
        object.byte_range.start,
        object.byte_range.end,
        fingerprint.path,
        text.len()
      )));
    }
  }

  Ok(Some((fingerprint, text, extracted)))
}
