//! The extracted-object data model shared by the extractor, the store, and
//! the searcher.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Languages with a registered grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
  Rust,
  Python,
  JavaScript,
  Jsx,
  TypeScript,
  Tsx,
  Go,
  Java,
  C,
  Cpp,
}

impl Language {
  /// Map a file extension onto a language. Unknown extensions yield `None`;
  /// such files are catalogued but contribute zero objects.
  pub fn from_extension(ext: &str) -> Option<Self> {
    match ext.to_lowercase().as_str() {
      "rs" => Some(Language::Rust),
      "py" | "pyi" | "pyw" => Some(Language::Python),
      "js" | "mjs" | "cjs" => Some(Language::JavaScript),
      "jsx" => Some(Language::Jsx),
      "ts" | "mts" => Some(Language::TypeScript),
      "tsx" => Some(Language::Tsx),
      "go" => Some(Language::Go),
      "java" => Some(Language::Java),
      "c" | "h" => Some(Language::C),
      "cpp" | "cc" | "cxx" | "hpp" | "hxx" => Some(Language::Cpp),
      _ => None,
    }
  }

  pub fn from_path(path: &std::path::Path) -> Option<Self> {
    let ext = path.extension()?.to_str()?;
    Self::from_extension(ext)
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Language::Rust => "rust",
      Language::Python => "python",
      Language::JavaScript => "javascript",
      Language::Jsx => "jsx",
      Language::TypeScript => "typescript",
      Language::Tsx => "tsx",
      Language::Go => "go",
      Language::Java => "java",
      Language::C => "c",
      Language::Cpp => "cpp",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "rust" => Some(Language::Rust),
      "python" => Some(Language::Python),
      "javascript" => Some(Language::JavaScript),
      "jsx" => Some(Language::Jsx),
      "typescript" => Some(Language::TypeScript),
      "tsx" => Some(Language::Tsx),
      "go" => Some(Language::Go),
      "java" => Some(Language::Java),
      "c" => Some(Language::C),
      "cpp" => Some(Language::Cpp),
      _ => None,
    }
  }
}

/// The kind taxonomy every grammar maps onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
  Function,
  Method,
  Class,
  Struct,
  Enum,
  Interface,
  Trait,
  TypeAlias,
  Constant,
  Variable,
  Module,
  Macro,
}

impl ObjectKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      ObjectKind::Function => "function",
      ObjectKind::Method => "method",
      ObjectKind::Class => "class",
      ObjectKind::Struct => "struct",
      ObjectKind::Enum => "enum",
      ObjectKind::Interface => "interface",
      ObjectKind::Trait => "trait",
      ObjectKind::TypeAlias => "type_alias",
      ObjectKind::Constant => "constant",
      ObjectKind::Variable => "variable",
      ObjectKind::Module => "module",
      ObjectKind::Macro => "macro",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "function" => Some(ObjectKind::Function),
      "method" => Some(ObjectKind::Method),
      "class" => Some(ObjectKind::Class),
      "struct" => Some(ObjectKind::Struct),
      "enum" => Some(ObjectKind::Enum),
      "interface" => Some(ObjectKind::Interface),
      "trait" => Some(ObjectKind::Trait),
      "type_alias" => Some(ObjectKind::TypeAlias),
      "constant" => Some(ObjectKind::Constant),
      "variable" => Some(ObjectKind::Variable),
      "module" => Some(ObjectKind::Module),
      "macro" => Some(ObjectKind::Macro),
      _ => None,
    }
  }
}

/// Half-open `[start, end)` byte range within a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
  pub start: usize,
  pub end: usize,
}

impl ByteRange {
  pub fn new(start: usize, end: usize) -> Self {
    Self { start, end }
  }

  pub fn len(&self) -> usize {
    self.end - self.start
  }

  pub fn is_empty(&self) -> bool {
    self.start >= self.end
  }
}

/// 0-based line/column coordinates for a byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coordinates {
  pub start_line: u32,
  pub start_col: u32,
  pub end_line: u32,
  pub end_col: u32,
}

/// A named code structure extracted from a parse tree.
///
/// `id` is the catalog rowid, stable within a run; it is reassigned whenever
/// the owning path is re-indexed. `content_hash` is the content fingerprint
/// used as the embedding cache key.
#[derive(Debug, Clone, PartialEq)]
pub struct Object {
  pub id: i64,
  pub path: String,
  pub name: String,
  pub language: Language,
  pub kind: ObjectKind,
  pub byte_range: ByteRange,
  pub coordinates: Coordinates,
  pub context_before: String,
  pub context_after: String,
  pub content_hash: String,
}

/// Cheap (size + mtime) plus strong (SHA-256) change detector for a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFingerprint {
  /// Repo-relative path with `/` separators.
  pub path: String,
  pub size: u64,
  pub mtime_ns: i64,
  /// Hex-encoded SHA-256 over the file bytes.
  pub hash: String,
}

/// Content fingerprint of an object: SHA-256 over
/// `language || 0x00 || kind || 0x00 || context_before || body || context_after`.
///
/// Two objects with an identical fingerprint share one embedding, which is
/// what makes renames and moves free.
pub fn content_fingerprint(
  language: Language,
  kind: ObjectKind,
  context_before: &str,
  body: &str,
  context_after: &str,
) -> String {
  let mut hasher = Sha256::new();
  hasher.update(language.as_str().as_bytes());
  hasher.update([0u8]);
  hasher.update(kind.as_str().as_bytes());
  hasher.update([0u8]);
  hasher.update(context_before.as_bytes());
  hasher.update(body.as_bytes());
  hasher.update(context_after.as_bytes());
  format!("{:x}", hasher.finalize())
}

/// Hex-encoded SHA-256 over raw bytes; the strong half of a fingerprint.
pub fn hash_bytes(bytes: &[u8]) -> String {
  let mut hasher = Sha256::new();
  hasher.update(bytes);
  format!("{:x}", hasher.finalize())
}

/// Convert a byte offset into 0-based (line, column). Columns count bytes
/// since the last newline, matching tree-sitter points for ASCII and keeping
/// multi-byte identifiers consistent with byte ranges.
pub fn offset_to_coordinates(text: &str, offset: usize) -> (u32, u32) {
  let clamped = offset.min(text.len());
  let prefix = &text.as_bytes()[..clamped];
  let line = prefix.iter().filter(|&&b| b == b'\n').count() as u32;
  let col = match prefix.iter().rposition(|&b| b == b'\n') {
    Some(pos) => (clamped - pos - 1) as u32,
    None => clamped as u32,
  };
  (line, col)
}
