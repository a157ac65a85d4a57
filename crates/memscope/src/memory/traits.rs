//! Core traits for abstracting the debuggee.
//!
//! Everything the analyzers know about the target comes through these
//! traits: raw bytes ([`MemoryReader`], backed by a [`MemoryLayer`] in the
//! binary), names and layouts ([`SymbolResolver`]) and processor state
//! ([`Debuggee`]). Tests back them with an in-memory mock.

use crate::decode::Bitness;
use crate::memory::error::{AddressSpace, MemError, MemResult};

/// Trait for reading from a flat memory layer (a physical dump file).
pub trait MemoryLayer: Send + Sync {
    /// Read `length` bytes starting at `offset`.
    fn read(&self, offset: u64, length: usize) -> MemResult<Vec<u8>>;
}

/// Byte-level access to the target's virtual and physical address spaces.
///
/// Both primitives fill a prefix of `buf` and return how many bytes they
/// obtained. Callers go through the `*_exact` helpers, which turn any short
/// count into [`MemError::ShortRead`] so a partially filled buffer is never
/// consumed.
pub trait MemoryReader: Send + Sync {
    fn read_virtual(&self, address: u64, buf: &mut [u8]) -> usize;

    fn read_physical(&self, address: u64, buf: &mut [u8]) -> usize;

    fn read_virtual_exact(&self, address: u64, length: usize) -> MemResult<Vec<u8>> {
        let mut buf = vec![0u8; length];
        let got = self.read_virtual(address, &mut buf);
        if got < length {
            return Err(MemError::short_read(AddressSpace::Virtual, address, length, got));
        }
        Ok(buf)
    }

    fn read_physical_exact(&self, address: u64, length: usize) -> MemResult<Vec<u8>> {
        let mut buf = vec![0u8; length];
        let got = self.read_physical(address, &mut buf);
        if got < length {
            return Err(MemError::short_read(AddressSpace::Physical, address, length, got));
        }
        Ok(buf)
    }

    fn read_u8(&self, address: u64) -> MemResult<u8> {
        Ok(self.read_virtual_exact(address, 1)?[0])
    }

    fn read_u16(&self, address: u64) -> MemResult<u16> {
        let b = self.read_virtual_exact(address, 2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn read_u32(&self, address: u64) -> MemResult<u32> {
        let b = self.read_virtual_exact(address, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&self, address: u64) -> MemResult<u64> {
        let b = self.read_virtual_exact(address, 8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// Pointer-sized virtual read. 32-bit pointers are sign-extended, the way
    /// a debugger reports kernel addresses on x86.
    fn read_pointer(&self, address: u64, bitness: Bitness) -> MemResult<u64> {
        match bitness {
            Bitness::Bit32 => Ok(self.read_u32(address)? as i32 as i64 as u64),
            Bitness::Bit64 => self.read_u64(address),
        }
    }
}

/// Symbol lookups against the target's debug information.
pub trait SymbolResolver: Send + Sync {
    /// Closest symbol at or below `address` as `(name, displacement)`.
    fn resolve(&self, address: u64) -> Option<(String, u64)>;

    /// Byte offset of `field` inside `type_name` (`module!Type` accepted).
    fn field_offset(&self, type_name: &str, field: &str) -> Option<u32>;
}

/// Processor architecture as reported by the debugger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Machine {
    I386,
    Amd64,
    Other(u32),
}

/// Actual vs effective processor. They differ for a WOW64 process viewed
/// through its 32-bit personality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorTypes {
    pub actual: Machine,
    pub effective: Machine,
}

impl ProcessorTypes {
    pub fn is_wow64(&self) -> bool {
        self.actual == Machine::Amd64 && self.effective == Machine::I386
    }
}

/// One thread of the current process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadInfo {
    pub index: u32,
    pub tid: u32,
    pub teb: u64,
}

/// Target state outside of raw memory.
pub trait Debuggee: Send + Sync {
    /// `None` when the target cannot tell.
    fn is_pointer_64bit(&self) -> Option<bool>;

    /// Evaluate an expression such as `@cr3` or `nt!PsLoadedModuleList`.
    fn evaluate(&self, expression: &str) -> Option<u64>;

    fn read_msr(&self, msr: u32) -> Option<u64>;

    fn processor_types(&self) -> ProcessorTypes;

    /// PEB of the current process.
    fn current_peb(&self) -> Option<u64>;

    fn current_thread(&self) -> Option<ThreadInfo>;

    fn threads(&self) -> Vec<ThreadInfo>;
}
