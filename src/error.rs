use std::{io, path::PathBuf};
use thiserror::Error;

/// Failures the store and engine can surface to callers. Everything carries
/// enough context to print a human-readable message plus the offending
/// path or name without further lookup.
#[derive(Debug, Error)]
pub enum ModloomError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("package name already registered: {0}")]
    DuplicateName(String),

    #[error("index {index} out of range (len {len})")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("malformed registry document {path:?}: {detail}")]
    Schema { path: PathBuf, detail: String },

    #[error("deploy failed at {path:?}: {source}")]
    Deploy {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ModloomError {
    pub fn not_found(what: impl Into<String>) -> Self {
        ModloomError::NotFound(what.into())
    }

    pub fn deploy(path: impl Into<PathBuf>, source: io::Error) -> Self {
        ModloomError::Deploy {
            path: path.into(),
            source,
        }
    }
}
