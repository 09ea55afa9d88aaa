//! Per-language declaration queries.
//!
//! Capture convention: each pattern captures the identifier as `@name` and
//! the whole declaration node as `@definition.<kind>`, where `<kind>` is one
//! of the [`codebased_core::ObjectKind`] tags.

mod c;
mod cpp;
mod go;
mod java;
mod javascript;
mod python;
mod rust;
mod typescript;

use codebased_core::Language;
use tracing::warn;
use tree_sitter::{Language as TsLanguage, Query};

pub(crate) fn compile_query(grammar: &TsLanguage, source: &str) -> Option<Query> {
  match Query::new(grammar, source) {
    Ok(query) => Some(query),
    Err(e) => {
      warn!("Failed to compile declarations query: {e}");
      None
    }
  }
}

/// The declarations query for a language, compiled against its grammar.
pub fn declarations(language: Language, grammar: &TsLanguage) -> Option<Query> {
  let source = match language {
    Language::Rust => rust::DECLARATIONS,
    Language::Python => python::DECLARATIONS,
    Language::JavaScript | Language::Jsx => javascript::DECLARATIONS,
    Language::TypeScript | Language::Tsx => typescript::DECLARATIONS,
    Language::Go => go::DECLARATIONS,
    Language::Java => java::DECLARATIONS,
    Language::C => c::DECLARATIONS,
    Language::Cpp => cpp::DECLARATIONS,
  };
  compile_query(grammar, source)
}
