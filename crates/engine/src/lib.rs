//! The engine: a live indexer orchestrating scan, extraction, embedding,
//! and revision commits, plus the hybrid searcher that fuses lexical and
//! semantic candidates with reciprocal rank fusion.

pub mod indexer;
pub mod searcher;

pub use indexer::{IndexChanged, IndexStats, Indexer, IndexerConfig, RunSummary};
pub use searcher::{SearchRequest, SearchResult, Searcher};
