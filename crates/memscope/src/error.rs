//! Crate-level error type.

use crate::memory::MemError;
use std::fmt;
use thiserror::Error;

/// Errors raised by the analyzers. None of them is fatal to a session; a
/// command that hits one stops and the next command starts clean.
#[derive(Error, Debug)]
pub enum Error {
    /// A read failed or came back short.
    #[error(transparent)]
    Memory(#[from] MemError),

    /// Bad magic, signature, machine type, or layout constant.
    #[error("{what}: unexpected value {found:#x}")]
    StructuralMismatch { what: &'static str, found: u64 },

    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// The symbol resolver has no offset for a field the walk needs.
    #[error("No offset for {type_name}.{field}")]
    MissingField { type_name: String, field: String },

    /// A page-table entry on the way to `address` could not be read.
    #[error("Translation of {address:#x} failed: {reason}")]
    Translation { address: u64, reason: String },

    #[error("Cannot evaluate '{0}'")]
    Evaluate(String),

    #[error("Output error: {0}")]
    Output(#[from] fmt::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn mismatch(what: &'static str, found: impl Into<u64>) -> Self {
        Error::StructuralMismatch {
            what,
            found: found.into(),
        }
    }

    pub fn unsupported(what: impl Into<String>) -> Self {
        Error::Unsupported(what.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
