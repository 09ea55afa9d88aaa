//! Extractor implementation

use std::collections::HashMap;

use codebased_core::{ByteRange, Coordinates, Language, ObjectKind, content_fingerprint, offset_to_coordinates};
use thiserror::Error;
use tree_sitter::{Language as TsLanguage, Node, Parser, Query, QueryCursor, StreamingIterator};

use crate::queries;

/// Context window captured around each object, truncated to a line boundary.
const CONTEXT_BYTES: usize = 512;

#[derive(Error, Debug)]
pub enum ExtractError {
  #[error("grammar rejected by parser: {0}")]
  Grammar(#[from] tree_sitter::LanguageError),
  #[error("parse failed")]
  Parse,
}

/// An object as it comes out of the parse tree, before the catalog assigns
/// it an id.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedObject {
  pub name: String,
  pub language: Language,
  pub kind: ObjectKind,
  pub byte_range: ByteRange,
  pub coordinates: Coordinates,
  pub context_before: String,
  pub context_after: String,
  pub content_hash: String,
}

/// Tree-sitter based object extractor.
///
/// Parsers and queries load lazily per language and are reused across files;
/// a single `QueryCursor` is kept to avoid per-file allocation.
pub struct Extractor {
  parsers: HashMap<Language, Parser>,
  queries: HashMap<Language, Option<Query>>,
  cursor: QueryCursor,
}

impl Extractor {
  pub fn new() -> Self {
    Self {
      parsers: HashMap::new(),
      queries: HashMap::new(),
      cursor: QueryCursor::new(),
    }
  }

  /// Extract the ordered list of named declarations from one file.
  ///
  /// Outer declarations sort before the declarations they contain. Captures
  /// without an identifier (anonymous functions and the like) are skipped.
  pub fn extract(&mut self, text: &str, language: Language) -> Result<Vec<ExtractedObject>, ExtractError> {
    self.ensure_loaded(language)?;

    let tree = {
      let parser = self.parsers.get_mut(&language).expect("parser loaded above");
      parser.parse(text, None).ok_or(ExtractError::Parse)?
    };

    let Some(query) = self.queries.get(&language).and_then(|q| q.as_ref()) else {
      return Ok(Vec::new());
    };

    let mut found: Vec<ExtractedObject> = Vec::new();
    let mut by_span: HashMap<(usize, usize, String), usize> = HashMap::new();

    let mut matches = self.cursor.matches(query, tree.root_node(), text.as_bytes());
    while let Some(m) = matches.next() {
      let mut name: Option<&str> = None;
      let mut decl: Option<(Node, ObjectKind)> = None;

      for cap in m.captures {
        let cap_name = query.capture_names()[cap.index as usize];
        if cap_name == "name" {
          name = cap.node.utf8_text(text.as_bytes()).ok();
        } else if let Some(kind) = kind_for_capture(cap_name) {
          decl = Some((cap.node, kind));
        }
      }

      let (Some(name), Some((node, kind))) = (name, decl) else {
        continue;
      };
      if name.is_empty() {
        continue;
      }

      let start = extend_over_doc_comments(node, text);
      let end = node.end_byte();
      if start >= end || end > text.len() {
        continue;
      }

      let context_before = context_before(text, start);
      let context_after = context_after(text, end);
      let body = &text[start..end];
      let (start_line, start_col) = offset_to_coordinates(text, start);
      let (end_line, end_col) = offset_to_coordinates(text, end);

      let key = (start, end, name.to_string());
      if let Some(&existing) = by_span.get(&key) {
        // The same span can match a generic and a specific pattern
        // (function vs method, named type vs struct); keep the specific one.
        if specificity(kind) > specificity(found[existing].kind) {
          found[existing].kind = kind;
          found[existing].content_hash = content_fingerprint(language, kind, &context_before, body, &context_after);
        }
        continue;
      }

      let content_hash = content_fingerprint(language, kind, &context_before, body, &context_after);
      by_span.insert(key, found.len());
      found.push(ExtractedObject {
        name: name.to_string(),
        language,
        kind,
        byte_range: ByteRange::new(start, end),
        coordinates: Coordinates {
          start_line,
          start_col,
          end_line,
          end_col,
        },
        context_before,
        context_after,
        content_hash,
      });
    }

    // Containers before the declarations nested inside them.
    found.sort_by(|a, b| {
      a.byte_range
        .start
        .cmp(&b.byte_range.start)
        .then(b.byte_range.end.cmp(&a.byte_range.end))
    });

    Ok(found)
  }

  fn ensure_loaded(&mut self, language: Language) -> Result<(), ExtractError> {
    if self.parsers.contains_key(&language) {
      return Ok(());
    }
    let grammar = grammar(language);
    let mut parser = Parser::new();
    parser.set_language(&grammar)?;
    let query = queries::declarations(language, &grammar);
    self.parsers.insert(language, parser);
    self.queries.insert(language, query);
    Ok(())
  }
}

impl Default for Extractor {
  fn default() -> Self {
    Self::new()
  }
}

fn grammar(language: Language) -> TsLanguage {
  match language {
    Language::Rust => tree_sitter_rust::LANGUAGE.into(),
    Language::Python => tree_sitter_python::LANGUAGE.into(),
    Language::JavaScript | Language::Jsx => tree_sitter_javascript::LANGUAGE.into(),
    Language::TypeScript => tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(),
    Language::Tsx => tree_sitter_typescript::LANGUAGE_TSX.into(),
    Language::Go => tree_sitter_go::LANGUAGE.into(),
    Language::Java => tree_sitter_java::LANGUAGE.into(),
    Language::C => tree_sitter_c::LANGUAGE.into(),
    Language::Cpp => tree_sitter_cpp::LANGUAGE.into(),
  }
}

fn kind_for_capture(capture: &str) -> Option<ObjectKind> {
  ObjectKind::parse(capture.strip_prefix("definition.")?)
}

/// When one span matches both a generic and a specific pattern, the specific
/// kind wins (method over function, struct over type alias).
fn specificity(kind: ObjectKind) -> u8 {
  match kind {
    ObjectKind::Method
    | ObjectKind::Class
    | ObjectKind::Struct
    | ObjectKind::Enum
    | ObjectKind::Interface
    | ObjectKind::Trait
    | ObjectKind::Module
    | ObjectKind::Macro => 2,
    ObjectKind::Function | ObjectKind::TypeAlias | ObjectKind::Constant | ObjectKind::Variable => 1,
  }
}

/// Pull the start of a declaration back over immediately-adjacent preceding
/// comments. Adjacent means only whitespace with no blank line in between.
fn extend_over_doc_comments(node: Node, text: &str) -> usize {
  let mut start = node.start_byte();
  let mut current = node;
  while let Some(prev) = current.prev_sibling() {
    if !prev.kind().contains("comment") {
      break;
    }
    let gap = &text[prev.end_byte()..start];
    if !gap.chars().all(char::is_whitespace) || gap.matches('\n').count() > 1 {
      break;
    }
    start = prev.start_byte();
    current = prev;
  }
  start
}

/// Up to `CONTEXT_BYTES` preceding the object, truncated to a line boundary.
fn context_before(text: &str, start: usize) -> String {
  let window_start = start.saturating_sub(CONTEXT_BYTES);
  if window_start == 0 {
    return text[..start].to_string();
  }
  let window = &text.as_bytes()[window_start..start];
  match window.iter().position(|&b| b == b'\n') {
    Some(pos) => String::from_utf8_lossy(&window[pos + 1..]).into_owned(),
    None => String::new(),
  }
}

/// Up to `CONTEXT_BYTES` following the object, truncated to a line boundary.
fn context_after(text: &str, end: usize) -> String {
  let window_end = (end + CONTEXT_BYTES).min(text.len());
  if window_end == text.len() {
    return text[end..].to_string();
  }
  let window = &text.as_bytes()[end..window_end];
  match window.iter().rposition(|&b| b == b'\n') {
    Some(pos) => String::from_utf8_lossy(&window[..=pos]).into_owned(),
    None => String::new(),
  }
}
