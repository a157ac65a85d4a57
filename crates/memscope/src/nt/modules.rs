//! Loader module list of the current process.

use crate::decode::{read_unicode_string, Bitness};
use crate::error::{Error, Result};
use crate::session::Session;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt::{self, Write};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleEntry {
    /// `_LDR_DATA_TABLE_ENTRY` address.
    pub entry: u64,
    pub dll_base: u64,
    pub reference_count: u32,
    pub load_count: i32,
    pub full_dll_name: String,
}

impl ModuleEntry {
    /// Pointers are zero-padded to the target's pointer width.
    pub fn render(&self, bitness: Bitness, out: &mut dyn Write) -> fmt::Result {
        let width = bitness.pointer_size() * 2;
        writeln!(
            out,
            "{:0w$x} {:0w$x}{:3}{:3} {}",
            self.entry,
            self.dll_base,
            self.reference_count,
            self.load_count,
            self.full_dll_name,
            w = width
        )
    }
}

struct LdrOffsets {
    in_memory_order_links: u64,
    dll_base: u64,
    full_dll_name: u64,
    reference_count: u64,
    ddag_node: Option<u64>,
    load_count: Option<u64>,
    flink: u64,
}

impl LdrOffsets {
    fn load(session: &Session) -> Result<Self> {
        const ENTRY: &str = "ntdll!_LDR_DATA_TABLE_ENTRY";
        Ok(LdrOffsets {
            in_memory_order_links: session.field_offset(ENTRY, "InMemoryOrderLinks")?,
            dll_base: session.field_offset(ENTRY, "DllBase")?,
            full_dll_name: session.field_offset(ENTRY, "FullDllName")?,
            reference_count: session.field_offset(ENTRY, "ReferenceCount")?,
            // The DDAG node appeared with Windows 8.
            ddag_node: session.field_offset(ENTRY, "DdagNode").ok(),
            load_count: session.field_offset("ntdll!_LDR_DDAG_NODE", "LoadCount").ok(),
            flink: session.field_offset("ntdll!_LIST_ENTRY", "Flink")?,
        })
    }
}

fn read_entry(session: &Session, offsets: &LdrOffsets, entry: u64) -> Result<ModuleEntry> {
    let mem = session.memory();
    let dll_base = session.read_pointer(entry + offsets.dll_base)?;
    let reference_count = mem.read_u32(entry + offsets.reference_count)?;
    let full_dll_name = read_unicode_string(mem, entry + offsets.full_dll_name, session.bitness()?)?;

    let load_count = match (offsets.ddag_node, offsets.load_count) {
        (Some(ddag_node), Some(load_count)) => {
            let ddag = session.read_pointer(entry + ddag_node)?;
            if ddag == 0 {
                0
            } else {
                mem.read_u32(ddag + load_count)? as i32
            }
        }
        _ => 0,
    };

    Ok(ModuleEntry {
        entry,
        dll_base,
        reference_count,
        load_count,
        full_dll_name,
    })
}

/// Walk `InMemoryOrderModuleList` from the current PEB. The walk ends back
/// at the list head, at a null link, or at a link already seen.
pub fn list_modules(session: &Session) -> Result<Vec<ModuleEntry>> {
    let peb = session
        .debuggee()
        .current_peb()
        .ok_or_else(|| Error::unsupported("no current process environment block"))?;
    let ldr = session.read_pointer(peb + session.field_offset("ntdll!_PEB", "Ldr")?)?;
    if ldr == 0 {
        debug!("PEB {:#x} has no loader data", peb);
        return Ok(Vec::new());
    }
    let head = ldr + session.field_offset("ntdll!_PEB_LDR_DATA", "InMemoryOrderModuleList")?;
    let offsets = LdrOffsets::load(session)?;

    let mut modules = Vec::new();
    let mut seen = HashSet::new();
    let mut link = session.read_pointer(head + offsets.flink)?;
    while link != 0 && link != head {
        if !seen.insert(link) {
            warn!("Module list loops at {:#x}", link);
            break;
        }
        let entry = link.wrapping_sub(offsets.in_memory_order_links);
        let module = read_entry(session, &offsets, entry)?;
        if module.dll_base != 0 {
            modules.push(module);
        }
        link = session.read_pointer(link + offsets.flink)?;
    }
    Ok(modules)
}
