use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcher};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, channel};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum WatchError {
  #[error("Notify error: {0}")]
  Notify(#[from] notify::Error),
  #[error("Channel receive error")]
  ChannelRecv,
}

/// Type of file change after coalescing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
  Created,
  Modified,
  Deleted,
}

/// A coalesced per-path change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
  pub path: PathBuf,
  pub kind: ChangeKind,
}

/// A raw filesystem event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
  Created(PathBuf),
  Modified(PathBuf),
  Deleted(PathBuf),
  Moved { from: PathBuf, to: PathBuf },
  /// Event delivery is best-effort; this asks for a full rescan.
  Resync,
}

/// Recursive filesystem watcher over the repository root.
pub struct Watcher {
  _watcher: RecommendedWatcher,
  receiver: Receiver<Result<Event, notify::Error>>,
  root: PathBuf,
}

impl Watcher {
  pub fn new(root: &Path) -> Result<Self, WatchError> {
    let (tx, rx) = channel();

    let mut watcher = RecommendedWatcher::new(
      move |res| {
        let _ = tx.send(res);
      },
      Config::default().with_poll_interval(Duration::from_secs(2)),
    )?;

    watcher.watch(root, RecursiveMode::Recursive)?;

    Ok(Self {
      _watcher: watcher,
      receiver: rx,
      root: root.to_path_buf(),
    })
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  /// Poll for the next event (non-blocking).
  pub fn poll(&self) -> Option<WatchEvent> {
    loop {
      match self.receiver.try_recv() {
        Ok(Ok(event)) => match translate(event) {
          Some(translated) => return Some(translated),
          None => continue,
        },
        Ok(Err(e)) => {
          warn!("Watch error, requesting resync: {e}");
          return Some(WatchEvent::Resync);
        }
        Err(_) => return None,
      }
    }
  }

  /// Wait for the next event with a timeout.
  pub fn wait_timeout(&self, timeout: Duration) -> Result<Option<WatchEvent>, WatchError> {
    match self.receiver.recv_timeout(timeout) {
      Ok(Ok(event)) => Ok(translate(event)),
      Ok(Err(e)) => {
        warn!("Watch error, requesting resync: {e}");
        Ok(Some(WatchEvent::Resync))
      }
      Err(std::sync::mpsc::RecvTimeoutError::Timeout) => Ok(None),
      Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => Err(WatchError::ChannelRecv),
    }
  }

  /// Drain everything currently pending.
  pub fn collect_pending(&self) -> Vec<WatchEvent> {
    let mut events = Vec::new();
    while let Some(event) = self.poll() {
      events.push(event);
    }
    events
  }
}

fn translate(event: Event) -> Option<WatchEvent> {
  // Unclassifiable events (including queue overflow on some platforms)
  // fall back to a rescan; they may carry no path at all.
  if matches!(event.kind, EventKind::Other) {
    return Some(WatchEvent::Resync);
  }

  let path = event.paths.first()?.clone();

  match event.kind {
    EventKind::Create(_) => Some(WatchEvent::Created(path)),
    EventKind::Remove(_) => Some(WatchEvent::Deleted(path)),
    EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
      let to = event.paths.get(1)?.clone();
      Some(WatchEvent::Moved { from: path, to })
    }
    EventKind::Modify(ModifyKind::Name(RenameMode::From)) => Some(WatchEvent::Deleted(path)),
    EventKind::Modify(ModifyKind::Name(RenameMode::To)) => Some(WatchEvent::Created(path)),
    EventKind::Modify(_) => Some(WatchEvent::Modified(path)),
    EventKind::Access(_) | EventKind::Any | EventKind::Other => {
      debug!("Ignoring event for {:?}", path);
      None
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::fs;
  use tempfile::TempDir;

  #[test]
  fn test_watcher_creation() {
    let dir = TempDir::new().unwrap();
    assert!(Watcher::new(dir.path()).is_ok());
  }

  #[test]
  fn test_watcher_detects_create() {
    let dir = TempDir::new().unwrap();
    let watcher = Watcher::new(dir.path()).unwrap();

    let file_path = dir.path().join("test.rs");
    fs::write(&file_path, "fn main() {}").unwrap();

    std::thread::sleep(Duration::from_millis(200));
    let events = watcher.collect_pending();

    // OS-level batching can merge create+modify; accept either, or an
    // empty set on platforms that delay delivery past the sleep.
    let saw_file = events.iter().any(|e| {
      matches!(e, WatchEvent::Created(p) | WatchEvent::Modified(p) if *p == file_path)
    });
    assert!(saw_file || events.is_empty());
  }

  #[test]
  fn test_translate_move() {
    let event = Event {
      kind: EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
      paths: vec![PathBuf::from("/a"), PathBuf::from("/b")],
      attrs: Default::default(),
    };
    assert_eq!(
      translate(event),
      Some(WatchEvent::Moved {
        from: PathBuf::from("/a"),
        to: PathBuf::from("/b"),
      })
    );
  }

  #[test]
  fn test_translate_other_is_resync() {
    let event = Event {
      kind: EventKind::Other,
      paths: vec![PathBuf::from("/x")],
      attrs: Default::default(),
    };
    assert_eq!(translate(event), Some(WatchEvent::Resync));
  }
}
