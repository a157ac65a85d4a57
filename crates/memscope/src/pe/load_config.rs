//! Load-config directory and the Control Flow Guard function table.

use super::{DirectoryKind, PeImage};
use crate::address::Address;
use crate::decode::{Bitness, Fields};
use crate::error::Result;
use std::fmt::Write;
use tracing::debug;

/// IMAGE_GUARD_CF_FUNCTION_TABLE_SIZE_MASK: extra bytes per table entry.
const GUARD_CF_FUNCTION_TABLE_SIZE_MASK: u32 = 0xF000_0000;
const GUARD_CF_FUNCTION_TABLE_SIZE_SHIFT: u32 = 28;

/// The CFG fields of IMAGE_LOAD_CONFIG_DIRECTORY32/64.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GuardConfig {
    pub size: u32,
    pub check_function_pointer: u64,
    pub dispatch_function_pointer: u64,
    pub function_table: u64,
    pub function_count: u64,
    pub flags: u32,
}

impl GuardConfig {
    /// Bytes of the load-config record up to and including GuardFlags.
    pub fn record_size(bitness: Bitness) -> usize {
        match bitness {
            Bitness::Bit32 => 92,
            Bitness::Bit64 => 148,
        }
    }

    /// Fields past the record's declared size read as zero.
    pub fn decode(data: &[u8], bitness: Bitness) -> Self {
        let mut f = Fields::new(data);
        let size = f.u32();
        match bitness {
            Bitness::Bit32 => GuardConfig {
                size,
                check_function_pointer: f.seek(72).u32() as u64,
                dispatch_function_pointer: f.u32() as u64,
                function_table: f.u32() as u64,
                function_count: f.u32() as u64,
                flags: f.u32(),
            },
            Bitness::Bit64 => GuardConfig {
                size,
                check_function_pointer: f.seek(112).u64(),
                dispatch_function_pointer: f.u64(),
                function_table: f.u64(),
                function_count: f.u64(),
                flags: f.u32(),
            },
        }
    }

    /// Bytes per GuardCFFunctionTable entry: a 4-byte RVA plus metadata.
    pub fn table_stride(&self) -> u64 {
        (((self.flags & GUARD_CF_FUNCTION_TABLE_SIZE_MASK) >> GUARD_CF_FUNCTION_TABLE_SIZE_SHIFT) + 4)
            as u64
    }
}

pub fn read_guard_config(image: &PeImage<'_>) -> Result<Option<GuardConfig>> {
    let dir = image.directory(DirectoryKind::LoadConfig);
    if dir.is_empty() {
        return Ok(None);
    }
    let mem = image.memory();
    let at = image.rva(dir.virtual_address);
    let declared = mem.read_u32(at)? as usize;
    let len = declared.min(GuardConfig::record_size(image.bitness()));
    let data = mem.read_virtual_exact(at, len.max(4))?;
    Ok(Some(GuardConfig::decode(&data, image.bitness())))
}

pub fn dump_load_config(image: &PeImage<'_>, out: &mut dyn Write) -> Result<()> {
    let Some(config) = read_guard_config(image)? else {
        debug!("Image at {:#x} has no load-config directory", image.base());
        return Ok(());
    };
    let session = image.session();
    writeln!(out, "Size                           {:#x}", config.size)?;
    writeln!(
        out,
        "GuardCFCheckFunctionPointer    {}",
        session.annotate(config.check_function_pointer)
    )?;
    writeln!(
        out,
        "GuardCFDispatchFunctionPointer {}",
        session.annotate(config.dispatch_function_pointer)
    )?;
    writeln!(out, "GuardFlags                     {:08x}", config.flags)?;
    writeln!(
        out,
        "GuardCFFunctionTable           {} ({} entries)",
        Address(config.function_table),
        config.function_count
    )?;

    if config.function_table == 0 {
        return Ok(());
    }
    let mem = image.memory();
    let stride = config.table_stride();
    for i in 0..config.function_count {
        let entry = config.function_table.wrapping_add(i * stride);
        let rva = mem.read_u32(entry)?;
        let target = session.annotate(image.rva(rva));
        if stride > 4 {
            let metadata = mem.read_u8(entry.wrapping_add(4))?;
            writeln!(out, "{:5} {:02x} {}", i, metadata, target)?;
        } else {
            writeln!(out, "{:5} {}", i, target)?;
        }
    }
    Ok(())
}
