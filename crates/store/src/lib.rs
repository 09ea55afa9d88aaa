//! The triple store: SQLite catalog + contentless FTS5 trigram index + flat
//! ANN over L2-normalized vectors, kept in lockstep by the revision write
//! protocol. The catalog is the authority; the other two are derived from
//! it on any mismatch.

pub mod ann;
pub mod catalog;
pub mod connection;
pub mod revision;
pub mod schema;
pub mod search;

pub use ann::{AnnError, AnnIndex, normalize};
pub use catalog::ScanDiff;
pub use connection::{IndexStore, Meta, StoreError};
pub use revision::ObjectRecord;
pub use search::{FtsHit, SearchFilters, quote_fts_query};

pub type Result<T> = std::result::Result<T, StoreError>;
