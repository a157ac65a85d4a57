//! Export table.

use super::{DirectoryKind, PeImage};
use crate::decode::{self, read_cstring, Fields, Record};
use crate::error::Result;
use std::fmt::Write;
use tracing::debug;

/// Upper bound on function slots, the ordinal space of one image.
const MAX_SLOTS: u32 = 0x10000;
const MAX_NAME: usize = 256;

/// IMAGE_EXPORT_DIRECTORY.
#[derive(Debug, Clone, Copy)]
struct ExportDirectory {
    name: u32,
    base: u32,
    number_of_functions: u32,
    number_of_names: u32,
    address_of_functions: u32,
    address_of_names: u32,
    address_of_name_ordinals: u32,
}

impl Record for ExportDirectory {
    const SIZE: usize = 40;

    fn decode(data: &[u8]) -> Self {
        let mut f = Fields::at(data, 12);
        ExportDirectory {
            name: f.u32(),
            base: f.u32(),
            number_of_functions: f.u32(),
            number_of_names: f.u32(),
            address_of_functions: f.u32(),
            address_of_names: f.u32(),
            address_of_name_ordinals: f.u32(),
        }
    }
}

/// One ordinal slot of the function array.
struct ExportSlot {
    rva: u32,
    name: Option<String>,
}

pub fn dump_export_table(image: &PeImage<'_>, out: &mut dyn Write) -> Result<()> {
    let mem = image.memory();
    let dir = image.directory(DirectoryKind::Export);
    if dir.is_empty() {
        return Ok(());
    }
    let exports: ExportDirectory = decode::load(mem, image.rva(dir.virtual_address))?;

    let functions = exports.number_of_functions.min(MAX_SLOTS);
    let names = exports.number_of_names.min(MAX_SLOTS);
    if functions < exports.number_of_functions || names < exports.number_of_names {
        debug!(
            "Export counts {}/{} capped at {:#x}",
            exports.number_of_functions, exports.number_of_names, MAX_SLOTS
        );
    }

    let rvas: Vec<u32> =
        decode::load_array(mem, image.rva(exports.address_of_functions), functions as usize)?;
    let mut slots: Vec<ExportSlot> = rvas
        .into_iter()
        .map(|rva| ExportSlot { rva, name: None })
        .collect();

    if names > 0 {
        let name_rvas: Vec<u32> =
            decode::load_array(mem, image.rva(exports.address_of_names), names as usize)?;
        let ordinals: Vec<u16> =
            decode::load_array(mem, image.rva(exports.address_of_name_ordinals), names as usize)?;
        for (name_rva, ordinal) in name_rvas.into_iter().zip(ordinals) {
            match slots.get_mut(ordinal as usize) {
                Some(slot) => slot.name = Some(read_cstring(mem, image.rva(name_rva), MAX_NAME)?),
                None => debug!("Name ordinal {} outside {} slots", ordinal, functions),
            }
        }
    }

    let dll = read_cstring(mem, image.rva(exports.name), MAX_NAME)?;
    writeln!(
        out,
        "{} ({} functions, {} names, base {})",
        dll, exports.number_of_functions, exports.number_of_names, exports.base
    )?;

    let own_range = dir.range();
    for (index, slot) in slots.iter().enumerate() {
        if slot.rva == 0 {
            continue;
        }
        let ordinal = exports.base as u64 + index as u64;
        let name = slot.name.as_deref().unwrap_or("");
        if own_range.contains(&(slot.rva as u64)) {
            let forward = read_cstring(mem, image.rva(slot.rva), MAX_NAME)?;
            writeln!(out, "{:5} {:<32} -> {}", ordinal, name, forward)?;
        } else {
            let target = image.session().annotate(image.rva(slot.rva));
            writeln!(out, "{:5} {:<32} {}", ordinal, name, target)?;
        }
    }
    Ok(())
}
