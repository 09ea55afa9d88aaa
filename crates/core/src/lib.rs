pub mod config;
pub mod error;
pub mod object;

pub use config::Config;
pub use error::{Error, Result};
pub use object::{
  ByteRange, Coordinates, FileFingerprint, Language, Object, ObjectKind, content_fingerprint, hash_bytes,
  offset_to_coordinates,
};
