//! Error types for readcache.

use std::io;
use thiserror::Error;

/// Result type alias for readcache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for cache operations.
///
/// Absence is never an error: missing keys and files are reported through
/// `Option` or outcome enums so callers can tell "not there" apart from
/// "cache is broken".
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// I/O error while opening or reading a table file, or while committing
    /// a store mutation.
    #[error("I/O error: {0}")]
    Io(String),

    /// The backing persistent store cannot be opened, created, or recovered.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// The store's arena or journal has no room for the requested mutation.
    /// No part of the mutation was applied.
    #[error("store full")]
    StoreFull,

    /// Key is too large for the location cache.
    #[error("key too large: {size} bytes (max: {max})")]
    KeyTooLarge { size: usize, max: usize },

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl Error {
    /// Create a store-unavailable error with the given message.
    pub fn store_unavailable<S: Into<String>>(msg: S) -> Self {
        Error::StoreUnavailable(msg.into())
    }

    /// Create an invalid configuration error.
    pub fn invalid_configuration<S: Into<String>>(msg: S) -> Self {
        Error::InvalidConfiguration(msg.into())
    }
}
