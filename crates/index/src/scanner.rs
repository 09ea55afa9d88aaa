use ignore::WalkBuilder;
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use rayon::prelude::*;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Bytes sniffed from the head of each candidate file.
const SNIFF_BYTES: usize = 8 * 1024;

/// Custom ignore file with `.gitignore` syntax, honored at any depth.
pub const IGNORE_FILENAME: &str = ".cbignore";

/// Directory names never descended into.
const SKIP_DIRS: [&str; 2] = [".git", ".codebased"];

/// Repository file enumerator.
///
/// Yields the ordered set of indexable files under a root: gitignore chains
/// and `.cbignore` respected, hidden entries skipped (except the root
/// itself), symlinks not followed, binary files sniffed out. The result is
/// sorted, so repeated scans of an unchanged tree are identical.
pub struct Scanner {
  root: PathBuf,
  max_file_size: u64,
}

impl Scanner {
  pub fn new(root: &Path) -> Self {
    Self {
      root: root.to_path_buf(),
      max_file_size: 8 * 1024 * 1024,
    }
  }

  pub fn with_max_file_size(mut self, size: u64) -> Self {
    self.max_file_size = size;
    self
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  /// Walk the tree and return absolute paths of indexable files.
  pub fn scan(&self) -> Vec<PathBuf> {
    self.scan_dir(&self.root)
  }

  /// Walk a subtree (used when a directory appears or moves in).
  pub fn scan_dir(&self, dir: &Path) -> Vec<PathBuf> {
    let walker = WalkBuilder::new(dir)
      .follow_links(false)
      .hidden(true)
      .git_ignore(true)
      .git_global(true)
      .git_exclude(true)
      .require_git(false)
      .add_custom_ignore_filename(IGNORE_FILENAME)
      .filter_entry(|entry| {
        entry
          .file_name()
          .to_str()
          .is_none_or(|name| !SKIP_DIRS.contains(&name))
      })
      .build();

    let mut files: Vec<PathBuf> = walker
      .filter_map(|e| e.ok())
      .par_bridge()
      .filter_map(|entry| {
        let file_type = entry.file_type()?;
        if !file_type.is_file() {
          return None;
        }
        let metadata = entry.metadata().ok()?;
        if metadata.len() > self.max_file_size {
          return None;
        }
        if !sniff_is_text(entry.path()).unwrap_or(false) {
          return None;
        }
        Some(entry.into_path())
      })
      .collect();

    files.sort();
    files
  }
}

/// Read the head of a file and decide whether it is indexable text.
///
/// A UTF-16 byte-order mark marks the file as text (it will be transcoded);
/// otherwise a NUL byte in the first 8 KiB, or bytes that are not UTF-8,
/// mark it as binary.
fn sniff_is_text(path: &Path) -> std::io::Result<bool> {
  let mut file = File::open(path)?;
  let mut buffer = [0u8; SNIFF_BYTES];
  let mut filled = 0;
  loop {
    let n = file.read(&mut buffer[filled..])?;
    if n == 0 {
      break;
    }
    filled += n;
    if filled == buffer.len() {
      break;
    }
  }
  let head = &buffer[..filled];
  let len = file.metadata()?.len();
  Ok(head_is_text(head, filled as u64 == len))
}

fn head_is_text(head: &[u8], complete: bool) -> bool {
  if has_utf16_bom(head) {
    return true;
  }
  if head.contains(&0) {
    return false;
  }
  match std::str::from_utf8(head) {
    Ok(_) => true,
    // A multi-byte character split at the sniff boundary is fine; an
    // invalid sequence inside the window is not.
    Err(e) => !complete && e.valid_up_to() + 4 > head.len() && e.error_len().is_none(),
  }
}

fn has_utf16_bom(bytes: &[u8]) -> bool {
  bytes.starts_with(&[0xFF, 0xFE]) || bytes.starts_with(&[0xFE, 0xFF])
}

/// Decode file bytes to the text that extraction and byte ranges refer to:
/// UTF-8 as-is, UTF-16 with a BOM transcoded. `None` means binary.
pub fn decode_text(bytes: &[u8]) -> Option<String> {
  if has_utf16_bom(bytes) {
    let le = bytes[0] == 0xFF;
    let units: Vec<u16> = bytes[2..]
      .chunks_exact(2)
      .map(|pair| {
        if le {
          u16::from_le_bytes([pair[0], pair[1]])
        } else {
          u16::from_be_bytes([pair[0], pair[1]])
        }
      })
      .collect();
    return char::decode_utf16(units).collect::<Result<String, _>>().ok();
  }
  String::from_utf8(bytes.to_vec()).ok()
}

/// Event-time ignore re-check for watcher events.
///
/// Uses the root-level `.gitignore` and `.cbignore` plus the hidden-entry
/// rule; drift from nested ignore files is corrected by the next full scan.
pub struct EventFilter {
  root: PathBuf,
  gitignore: Gitignore,
  cbignore: Gitignore,
}

impl EventFilter {
  pub fn new(root: &Path) -> Self {
    Self {
      root: root.to_path_buf(),
      gitignore: build_matcher(root, ".gitignore"),
      cbignore: build_matcher(root, IGNORE_FILENAME),
    }
  }

  /// Rebuild matchers after an ignore file changed.
  pub fn reload(&mut self) {
    self.gitignore = build_matcher(&self.root, ".gitignore");
    self.cbignore = build_matcher(&self.root, IGNORE_FILENAME);
  }

  pub fn should_index(&self, path: &Path) -> bool {
    let Ok(relative) = path.strip_prefix(&self.root) else {
      return false;
    };
    for component in relative.components() {
      if let Some(name) = component.as_os_str().to_str() {
        if SKIP_DIRS.contains(&name) || name.starts_with('.') {
          return false;
        }
      }
    }
    let is_dir = path.is_dir();
    if self.cbignore.matched_path_or_any_parents(path, is_dir).is_ignore() {
      return false;
    }
    if self.gitignore.matched_path_or_any_parents(path, is_dir).is_ignore() {
      return false;
    }
    true
  }
}

fn build_matcher(root: &Path, filename: &str) -> Gitignore {
  let mut builder = GitignoreBuilder::new(root);
  builder.add(root.join(filename));
  builder.build().unwrap_or_else(|_| Gitignore::empty())
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  fn relative(root: &Path, paths: &[PathBuf]) -> Vec<String> {
    paths
      .iter()
      .map(|p| p.strip_prefix(root).unwrap().to_string_lossy().into_owned())
      .collect()
  }

  #[test]
  fn test_scan_basic() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("main.rs"), "fn main() {}").unwrap();
    std::fs::write(dir.path().join("notes.txt"), "plain text").unwrap();

    let files = Scanner::new(dir.path()).scan();
    // Unknown extensions are still candidates; they are catalogued with
    // zero objects downstream.
    assert_eq!(relative(dir.path(), &files), vec!["main.rs", "notes.txt"]);
  }

  #[test]
  fn test_scan_is_ordered_and_restartable() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("b.rs"), "fn b() {}").unwrap();
    std::fs::write(dir.path().join("a.rs"), "fn a() {}").unwrap();
    std::fs::create_dir(dir.path().join("sub")).unwrap();
    std::fs::write(dir.path().join("sub/c.rs"), "fn c() {}").unwrap();

    let scanner = Scanner::new(dir.path());
    let first = scanner.scan();
    let second = scanner.scan();
    assert_eq!(first, second);
  }

  #[test]
  fn test_scan_respects_gitignore() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join(".gitignore"), "ignored/\n*.log").unwrap();
    std::fs::write(dir.path().join("main.rs"), "fn main() {}").unwrap();
    std::fs::create_dir(dir.path().join("ignored")).unwrap();
    std::fs::write(dir.path().join("ignored/hidden.rs"), "fn hidden() {}").unwrap();
    std::fs::write(dir.path().join("debug.log"), "log").unwrap();

    let files = Scanner::new(dir.path()).scan();
    assert_eq!(relative(dir.path(), &files), vec!["main.rs"]);
  }

  #[test]
  fn test_cbignore_overrides_gitignore_negation() {
    let dir = TempDir::new().unwrap();
    // .gitignore un-ignores vendor, .cbignore re-ignores it; the custom
    // ignore file is consulted after gitignore and wins.
    std::fs::write(dir.path().join(".gitignore"), "!vendor/").unwrap();
    std::fs::write(dir.path().join(".cbignore"), "vendor/").unwrap();
    std::fs::create_dir(dir.path().join("vendor")).unwrap();
    std::fs::write(dir.path().join("vendor/x.go"), "package x").unwrap();
    std::fs::write(dir.path().join("main.go"), "package main").unwrap();

    let files = Scanner::new(dir.path()).scan();
    assert_eq!(relative(dir.path(), &files), vec!["main.go"]);
  }

  #[test]
  fn test_hidden_entries_skipped() {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir(dir.path().join(".secret")).unwrap();
    std::fs::write(dir.path().join(".secret/inner.rs"), "fn x() {}").unwrap();
    std::fs::write(dir.path().join(".dotfile.rs"), "fn y() {}").unwrap();
    std::fs::write(dir.path().join("visible.rs"), "fn z() {}").unwrap();

    let files = Scanner::new(dir.path()).scan();
    assert_eq!(relative(dir.path(), &files), vec!["visible.rs"]);
  }

  #[cfg(unix)]
  #[test]
  fn test_symlinks_not_followed() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("real.rs"), "fn real() {}").unwrap();
    std::os::unix::fs::symlink(dir.path().join("real.rs"), dir.path().join("link.rs")).unwrap();

    let files = Scanner::new(dir.path()).scan();
    assert_eq!(relative(dir.path(), &files), vec!["real.rs"]);
  }

  #[test]
  fn test_binary_file_skipped() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("blob.bin"), b"\x00\x01\x02binary").unwrap();
    std::fs::write(dir.path().join("data.rs"), "fn ok() {}").unwrap();

    let files = Scanner::new(dir.path()).scan();
    assert_eq!(relative(dir.path(), &files), vec!["data.rs"]);
  }

  #[test]
  fn test_empty_file_is_a_candidate() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("empty.py"), "").unwrap();

    let files = Scanner::new(dir.path()).scan();
    assert_eq!(relative(dir.path(), &files), vec!["empty.py"]);
  }

  #[test]
  fn test_utf16_bom_is_text() {
    let mut bytes = vec![0xFF, 0xFE];
    for unit in "def foo(): pass\n".encode_utf16() {
      bytes.extend_from_slice(&unit.to_le_bytes());
    }
    assert!(head_is_text(&bytes, true));
    assert_eq!(decode_text(&bytes).unwrap(), "def foo(): pass\n");
  }

  #[test]
  fn test_decode_text_utf8() {
    assert_eq!(decode_text(b"hello").unwrap(), "hello");
    assert!(decode_text(b"\xFF\xFF\xFF").is_none());
  }

  #[test]
  fn test_head_is_text_boundary_split() {
    // A multi-byte character cut at the window edge is not binary.
    let mut head = vec![b'a'; 10];
    head.push(0xC3); // first byte of a 2-byte sequence
    assert!(head_is_text(&head, false));
    // But the same truncation at EOF is invalid UTF-8.
    assert!(!head_is_text(&head, true));
  }

  #[test]
  fn test_event_filter() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join(".gitignore"), "target/").unwrap();
    std::fs::write(dir.path().join(".cbignore"), "vendor/").unwrap();

    let filter = EventFilter::new(dir.path());
    assert!(filter.should_index(&dir.path().join("src.rs")));
    assert!(!filter.should_index(&dir.path().join("target/out.rs")));
    assert!(!filter.should_index(&dir.path().join("vendor/x.go")));
    assert!(!filter.should_index(&dir.path().join(".git/config")));
    assert!(!filter.should_index(&dir.path().join(".codebased/index.db")));
    assert!(!filter.should_index(&dir.path().join(".hidden/file.rs")));
    assert!(!filter.should_index(Path::new("/outside/of/root.rs")));
  }
}
