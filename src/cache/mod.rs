//! Two-tier ciphertext storage: a local disk cache in front of a blob store.
//!
//! Every ciphertext file in the cache is named `{connector}{suffix}` where the
//! suffix records its state (see [`state::CacheState`]). State changes are
//! atomic renames inside one directory, so a name is never in two states.

pub mod blobstore;
pub mod drain;
pub mod eviction;
pub mod fs;
pub mod state;

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache file `{0}` not found")]
    NotFound(String),
    #[error("cache file `{0}` already exists")]
    AlreadyExists(String),
    #[error("cache name `{0}` is not a plain file name")]
    InvalidName(String),
    #[error("cache i/o on `{name}`: {source}")]
    Io { name: String, source: io::Error },
}

impl CacheError {
    pub(crate) fn io(name: &str, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::NotFound => CacheError::NotFound(name.to_string()),
            io::ErrorKind::AlreadyExists => CacheError::AlreadyExists(name.to_string()),
            _ => CacheError::Io {
                name: name.to_string(),
                source,
            },
        }
    }
}

pub type CacheResult<T> = Result<T, CacheError>;
