//! Typed loads of fixed-size records from target memory.
//!
//! A [`Record`] knows its byte size and how to decode itself from a buffer
//! of exactly that size with a [`Fields`] cursor. [`load`] reads the bytes
//! with an exact read first, so a record is never decoded from a partially
//! filled buffer.

use crate::memory::{MemResult, MemoryReader};
use serde::Serialize;

/// Pointer width of a target or of one image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Bitness {
    Bit32,
    Bit64,
}

impl Bitness {
    pub fn from_pointer_64bit(is_64: bool) -> Self {
        if is_64 {
            Bitness::Bit64
        } else {
            Bitness::Bit32
        }
    }

    pub fn pointer_size(self) -> usize {
        match self {
            Bitness::Bit32 => 4,
            Bitness::Bit64 => 8,
        }
    }

    /// Top bit of an import thunk: set for ordinal imports.
    pub fn ordinal_flag(self) -> u64 {
        match self {
            Bitness::Bit32 => 0x8000_0000,
            Bitness::Bit64 => 1 << 63,
        }
    }
}

/// A fixed-size little-endian structure in target memory.
pub trait Record: Sized {
    const SIZE: usize;

    /// `data` is exactly `SIZE` bytes long.
    fn decode(data: &[u8]) -> Self;
}

macro_rules! scalar_record {
    ($($t:ty),*) => {$(
        impl Record for $t {
            const SIZE: usize = std::mem::size_of::<$t>();

            fn decode(data: &[u8]) -> Self {
                <$t>::from_le_bytes(Fields::new(data).bytes())
            }
        }
    )*};
}

scalar_record!(u16, u32, u64);

/// Little-endian cursor over a record buffer. Reads past the end yield zeros.
pub struct Fields<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Fields<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Fields { data, pos: 0 }
    }

    pub fn at(data: &'a [u8], pos: usize) -> Self {
        Fields { data, pos }
    }

    pub fn seek(&mut self, pos: usize) -> &mut Self {
        self.pos = pos;
        self
    }

    pub fn skip(&mut self, n: usize) -> &mut Self {
        self.pos += n;
        self
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn bytes<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        if self.pos < self.data.len() {
            let n = N.min(self.data.len() - self.pos);
            out[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        }
        self.pos += N;
        out
    }

    pub fn u8(&mut self) -> u8 {
        self.bytes::<1>()[0]
    }

    pub fn u16(&mut self) -> u16 {
        u16::from_le_bytes(self.bytes())
    }

    pub fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.bytes())
    }

    pub fn u64(&mut self) -> u64 {
        u64::from_le_bytes(self.bytes())
    }

    /// Pointer-sized field, zero-extended. Image fields (thunks, image
    /// base) are unsigned quantities, unlike pointers read off a stack.
    pub fn pointer(&mut self, bitness: Bitness) -> u64 {
        match bitness {
            Bitness::Bit32 => self.u32() as u64,
            Bitness::Bit64 => self.u64(),
        }
    }
}

/// Load one record from virtual memory.
pub fn load<T: Record>(mem: &dyn MemoryReader, address: u64) -> MemResult<T> {
    let data = mem.read_virtual_exact(address, T::SIZE)?;
    Ok(T::decode(&data))
}

/// Load one record from physical memory.
pub fn load_physical<T: Record>(mem: &dyn MemoryReader, address: u64) -> MemResult<T> {
    let data = mem.read_physical_exact(address, T::SIZE)?;
    Ok(T::decode(&data))
}

/// Load `count` consecutive records.
pub fn load_array<T: Record>(mem: &dyn MemoryReader, address: u64, count: usize) -> MemResult<Vec<T>> {
    let data = mem.read_virtual_exact(address, T::SIZE * count)?;
    Ok(data.chunks_exact(T::SIZE).map(T::decode).collect())
}

const PAGE_SIZE: u64 = 0x1000;

/// Read a NUL-terminated ASCII string of at most `max` bytes.
///
/// Reads stop at page boundaries so a short string at the end of a mapped
/// page does not fail because the next page is absent. A missing
/// terminator within `max` bytes returns the first `max` bytes.
pub fn read_cstring(mem: &dyn MemoryReader, address: u64, max: usize) -> MemResult<String> {
    let mut out = Vec::new();
    let mut cursor = address;
    while out.len() < max {
        let to_page_end = (PAGE_SIZE - (cursor & (PAGE_SIZE - 1))) as usize;
        let chunk_len = to_page_end.min(max - out.len());
        let chunk = mem.read_virtual_exact(cursor, chunk_len)?;
        if let Some(nul) = chunk.iter().position(|&b| b == 0) {
            out.extend_from_slice(&chunk[..nul]);
            return Ok(String::from_utf8_lossy(&out).into_owned());
        }
        out.extend_from_slice(&chunk);
        cursor = cursor.wrapping_add(chunk_len as u64);
    }
    Ok(String::from_utf8_lossy(&out).into_owned())
}

/// Read `byte_len` bytes of UTF-16LE text.
pub fn read_utf16(mem: &dyn MemoryReader, address: u64, byte_len: usize) -> MemResult<String> {
    let data = mem.read_virtual_exact(address, byte_len & !1)?;
    let units: Vec<u16> = data
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    Ok(String::from_utf16_lossy(&units))
}

/// `_UNICODE_STRING` header: byte length plus buffer pointer.
#[derive(Debug, Clone, Copy)]
pub struct UnicodeString {
    pub length: u16,
    pub maximum_length: u16,
    pub buffer: u64,
}

impl UnicodeString {
    pub fn size(bitness: Bitness) -> usize {
        match bitness {
            Bitness::Bit32 => 8,
            Bitness::Bit64 => 16,
        }
    }

    pub fn decode(data: &[u8], bitness: Bitness) -> Self {
        let mut f = Fields::new(data);
        let length = f.u16();
        let maximum_length = f.u16();
        if bitness == Bitness::Bit64 {
            f.skip(4);
        }
        UnicodeString {
            length,
            maximum_length,
            buffer: f.pointer(bitness),
        }
    }
}

/// Read a `_UNICODE_STRING` at `address` and the text it points to.
pub fn read_unicode_string(mem: &dyn MemoryReader, address: u64, bitness: Bitness) -> MemResult<String> {
    let header = mem.read_virtual_exact(address, UnicodeString::size(bitness))?;
    let us = UnicodeString::decode(&header, bitness);
    if us.length == 0 || us.buffer == 0 {
        return Ok(String::new());
    }
    read_utf16(mem, us.buffer, us.length as usize)
}
