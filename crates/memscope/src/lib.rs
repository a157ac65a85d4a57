//! memscope: read-only structure reconstruction from debuggee memory.
//!
//! Given a way to read virtual and physical memory, resolve symbols and look
//! up field offsets, the crate rebuilds PE images loaded in the target, walks
//! x86/x64 page tables, and enumerates pointer-linked kernel trees and lists.
//! All output is line-oriented text or JSON written to a caller-supplied sink.

pub mod address;
pub mod commands;
pub mod decode;
pub mod error;
pub mod memory;
pub mod nt;
pub mod paging;
pub mod pe;
pub mod session;
pub mod tree;

#[cfg(test)]
mod test_support;

pub use error::{Error, Result};
pub use session::Session;
