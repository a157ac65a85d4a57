//! Errors from loading an ISF file.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IsfError {
    #[error("ISF file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("Cannot read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The `.xz` stream is corrupt or truncated.
    #[error("Cannot decompress {}: {source}", .path.display())]
    Decompression {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Malformed ISF document: {0}")]
    JsonParse(#[from] serde_json::Error),
}

pub type IsfResult<T> = Result<T, IsfError>;
