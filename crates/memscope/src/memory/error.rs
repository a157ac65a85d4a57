//! Error types for memory operations.

use std::fmt;
use thiserror::Error;

/// Which address space a read targeted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressSpace {
    Virtual,
    Physical,
}

impl fmt::Display for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressSpace::Virtual => f.write_str("virtual"),
            AddressSpace::Physical => f.write_str("physical"),
        }
    }
}

/// Errors that can occur in memory operations.
#[derive(Error, Debug)]
pub enum MemError {
    /// Fewer bytes than requested came back. `actual == 0` is a plain failure.
    #[error("Short {space} read at {address:#x}: wanted {expected} bytes, got {actual}")]
    ShortRead {
        space: AddressSpace,
        address: u64,
        expected: usize,
        actual: usize,
    },

    /// Invalid parameter provided.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Memory mapping error.
    #[error("Memory mapping error: {0}")]
    Mmap(String),
}

impl MemError {
    /// Create a ShortRead error.
    pub fn short_read(space: AddressSpace, address: u64, expected: usize, actual: usize) -> Self {
        MemError::ShortRead {
            space,
            address,
            expected,
            actual,
        }
    }
}

/// Result type for memory operations.
pub type MemResult<T> = Result<T, MemError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_read_error() {
        let err = MemError::short_read(AddressSpace::Physical, 0x1000, 8, 3);
        let text = err.to_string();
        assert!(text.contains("physical"));
        assert!(text.contains("0x1000"));
        assert!(text.contains("got 3"));
    }
}
