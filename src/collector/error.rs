use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Error taxonomy for the collection pipeline.
///
/// Everything except [`CollectError::Config`] is recovered locally: a failed
/// source is a zero-result fetch, a bad image is skipped, a bad oracle batch
/// is dropped whole, a failed persist leaves the count and hash store alone.
/// Configuration errors are precondition violations and halt the run.
#[derive(Error, Debug)]
pub(crate) enum CollectError {
    #[error("source error ({backend}, \"{keyword}\"): {message}")]
    Source {
        backend: &'static str,
        keyword: String,
        message: String,
    },

    #[error("decode error ({path}): {message}")]
    Decode { path: PathBuf, message: String },

    #[error("oracle batch error: {0}")]
    OracleBatch(String),

    #[error("persist error ({path}): {message}")]
    Persist { path: PathBuf, message: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for collection operations.
pub(crate) type CollectResult<T> = Result<T, CollectError>;

impl CollectError {
    /// Whether this error may stop the run. Only configuration-precondition
    /// violations halt execution; every other kind is handled at its catch
    /// site and the loop continues.
    pub(crate) fn is_fatal(&self) -> bool {
        matches!(self, CollectError::Config(_))
    }
}
