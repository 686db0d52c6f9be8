//! Error types surfaced across the public API.
//!
//! Configuration and I/O failures are returned as `Result`; invariant
//! violations (reentrant evaluation, corrupt memoization state, deserializer
//! type mismatches) are fatal and raised via `assert!`/`panic!` at their call
//! sites instead, matching the rest of this crate's style.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type for the evaluation engine.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error("i/o error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed persisted state: {message}")]
    Corrupt { message: String },
}

impl Error {
    pub fn configuration(message: impl Into<String>) -> Self {
        Error::Configuration {
            message: message.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub fn corrupt(message: impl Into<String>) -> Self {
        Error::Corrupt {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
