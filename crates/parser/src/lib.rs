//! Grammar-driven object extraction.
//!
//! One tree-sitter query per language enumerates named declarations; the
//! extractor turns matches into [`ExtractedObject`]s carrying byte ranges,
//! coordinates, surrounding context, and the content fingerprint used as the
//! embedding cache key.

mod extractor;
mod queries;

pub use extractor::{ExtractError, ExtractedObject, Extractor};

// Re-export for convenience
pub use codebased_core::Language;
