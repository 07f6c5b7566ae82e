use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// The result type used throughout incmemo.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the memoization engine.
///
/// None of these are fatal to the host. The engine's call hooks absorb them
/// into "cache miss" or "do not memoize this call"; only the explicit APIs
/// (decoding, the store, flush reports) hand them out.
#[derive(Error, Debug)]
pub enum Error {
    /// A value holds state that cannot be encoded.
    #[error("value cannot be serialized: {0}")]
    Unserializable(String),

    /// Stored bytes do not decode into the requested type.
    #[error("stored value cannot be decoded: {0}")]
    Decode(String),

    /// An on-disk artifact could not be read back.
    #[error("corrupt cache data in {}: {reason}", path.display())]
    CacheCorrupt { path: PathBuf, reason: String },

    /// A code dependency's fingerprint no longer matches.
    #[error("code dependency `{dependency}` changed")]
    DependencyUnsatisfied { dependency: String },

    /// Reading or writing the cache directory failed.
    #[error("cache I/O failed for {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl Error {
    /// Wrap an I/O error with the path it happened at.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    /// Create a corruption error for a path.
    pub fn corrupt(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::CacheCorrupt { path: path.into(), reason: reason.to_string() }
    }
}
