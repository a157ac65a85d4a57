//! Import and delay-load import tables.

use super::{DirectoryKind, PeImage};
use crate::address::Address;
use crate::decode::{self, read_cstring, Bitness, Fields, Record};
use crate::error::Result;
use crate::memory::{MemResult, MemoryReader};
use std::collections::HashMap;
use std::fmt::Write;
use tracing::{debug, warn};

const MAX_DLL_NAME: usize = 256;
const MAX_FUNCTION_NAME: usize = 256;
const MAX_THUNKS: u64 = 0x10000;

/// Which descriptors to report and how much of each.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportFilter {
    /// One line per descriptor.
    Summary,
    /// Summary line plus every entry, for each descriptor.
    All,
    /// Entries of the first descriptor whose DLL name matches, ignoring case.
    Dll(String),
}

impl ImportFilter {
    pub fn parse(arg: Option<&str>) -> Self {
        match arg {
            None => ImportFilter::Summary,
            Some(a) if a == "*" || a.eq_ignore_ascii_case("-all") => ImportFilter::All,
            Some(a) => ImportFilter::Dll(a.to_string()),
        }
    }
}

/// IMAGE_IMPORT_DESCRIPTOR.
#[derive(Debug, Clone, Copy)]
struct ImportDescriptor {
    /// OriginalFirstThunk: the name table. Zero ends the table.
    characteristics: u32,
    name: u32,
    first_thunk: u32,
}

impl Record for ImportDescriptor {
    const SIZE: usize = 20;

    fn decode(data: &[u8]) -> Self {
        let mut f = Fields::new(data);
        ImportDescriptor {
            characteristics: f.u32(),
            name: f.seek(12).u32(),
            first_thunk: f.u32(),
        }
    }
}

/// IMAGE_DELAYLOAD_DESCRIPTOR.
#[derive(Debug, Clone, Copy)]
struct DelayDescriptor {
    attributes: u32,
    dll_name: u32,
    module_handle: u32,
    import_address_table: u32,
    import_name_table: u32,
}

impl DelayDescriptor {
    /// Bit 0: fields are RVAs. Without it they are VAs from old linkers.
    fn rva_based(&self) -> bool {
        self.attributes & 1 != 0
    }
}

impl Record for DelayDescriptor {
    const SIZE: usize = 32;

    fn decode(data: &[u8]) -> Self {
        let mut f = Fields::new(data);
        DelayDescriptor {
            attributes: f.u32(),
            dll_name: f.u32(),
            module_handle: f.u32(),
            import_address_table: f.u32(),
            import_name_table: f.u32(),
        }
    }
}

/// IMAGE_BOUND_IMPORT_DESCRIPTOR, and IMAGE_BOUND_FORWARDER_REF, which
/// shares its layout with the last field reserved.
#[derive(Debug, Clone, Copy)]
struct BoundDescriptor {
    time_date_stamp: u32,
    /// Offset of the DLL name from the start of the bound directory.
    module_name: u16,
    forwarder_refs: u16,
}

impl Record for BoundDescriptor {
    const SIZE: usize = 8;

    fn decode(data: &[u8]) -> Self {
        let mut f = Fields::new(data);
        BoundDescriptor {
            time_date_stamp: f.u32(),
            module_name: f.u16(),
            forwarder_refs: f.u16(),
        }
    }
}

fn load_bound(mem: &dyn MemoryReader, start: u64, slot: usize) -> MemResult<BoundDescriptor> {
    decode::load(mem, start.wrapping_add((slot * BoundDescriptor::SIZE) as u64))
}

/// DLL name (lowercased) to the timestamp it was bound against, from the
/// BoundImport directory. Forwarder references are included.
pub fn load_bound_imports(image: &PeImage<'_>) -> Result<HashMap<String, u32>> {
    let mem = image.memory();
    let dir = image.directory(DirectoryKind::BoundImport);
    let mut bound = HashMap::new();
    if dir.is_empty() {
        return Ok(bound);
    }
    let start = image.rva(dir.virtual_address);
    let slots = dir.size as usize / BoundDescriptor::SIZE;

    let mut slot = 0;
    while slot < slots {
        let desc: BoundDescriptor = load_bound(mem, start, slot)?;
        if desc.module_name == 0 {
            break;
        }
        let mut record = |e: BoundDescriptor| -> Result<()> {
            let name = read_cstring(mem, start.wrapping_add(e.module_name as u64), MAX_DLL_NAME)?;
            bound.entry(name.to_ascii_lowercase()).or_insert(e.time_date_stamp);
            Ok(())
        };
        record(desc)?;
        let refs = (desc.forwarder_refs as usize).min(slots - slot - 1);
        for i in 1..=refs {
            record(load_bound(mem, start, slot + i)?)?;
        }
        slot += refs + 1;
    }
    debug!("{} bound imports at {:#x}", bound.len(), start);
    Ok(bound)
}

/// What both descriptor kinds reduce to.
struct ImportedModule {
    descriptor: u64,
    dll: String,
    /// Timestamp from the BoundImport directory, for regular imports.
    bound: Option<u32>,
    name_table: u32,
    address_table: u32,
}

/// Pointer-sized image field, zero-extended.
fn read_thunk(mem: &dyn MemoryReader, address: u64, bitness: Bitness) -> MemResult<u64> {
    let data = mem.read_virtual_exact(address, bitness.pointer_size())?;
    Ok(Fields::new(&data).pointer(bitness))
}

fn dump_entries(image: &PeImage<'_>, module: &ImportedModule, out: &mut dyn Write) -> Result<()> {
    let mem = image.memory();
    let bitness = image.bitness();
    let step = bitness.pointer_size() as u64;
    let names = image.rva(module.name_table);
    let addresses = image.rva(module.address_table);

    for i in 0..MAX_THUNKS {
        let thunk = read_thunk(mem, names.wrapping_add(i * step), bitness)?;
        if thunk == 0 {
            break;
        }
        let function = read_thunk(mem, addresses.wrapping_add(i * step), bitness)?;

        let (hint, name) = if thunk & bitness.ordinal_flag() != 0 {
            let ordinal = thunk as u16;
            (ordinal, format!("Ordinal#{}", ordinal))
        } else {
            let hint_name = image.rva(thunk as u32);
            (
                mem.read_u16(hint_name)?,
                read_cstring(mem, hint_name.wrapping_add(2), MAX_FUNCTION_NAME)?,
            )
        };

        writeln!(
            out,
            "{:4} {:>10}@{:04x} {:<32} {}",
            i,
            module.dll,
            hint,
            name,
            image.session().annotate(function)
        )?;
    }
    Ok(())
}

fn summary_line(index: usize, module: &ImportedModule, out: &mut dyn Write) -> Result<()> {
    write!(out, "{:4} {} {}", index, Address(module.descriptor), module.dll)?;
    if let Some(stamp) = module.bound {
        write!(out, " bound {:08x}", stamp)?;
    }
    writeln!(out)?;
    Ok(())
}

/// Applies the filter to one module. Returns true when the walk should stop.
fn report(
    image: &PeImage<'_>,
    filter: &ImportFilter,
    index: usize,
    module: &ImportedModule,
    out: &mut dyn Write,
) -> Result<bool> {
    match filter {
        ImportFilter::Summary => {
            summary_line(index, module, out)?;
            Ok(false)
        }
        ImportFilter::All => {
            summary_line(index, module, out)?;
            dump_entries(image, module, out)?;
            Ok(false)
        }
        ImportFilter::Dll(target) if module.dll.eq_ignore_ascii_case(target) => {
            dump_entries(image, module, out)?;
            Ok(true)
        }
        ImportFilter::Dll(_) => Ok(false),
    }
}

pub fn dump_import_table(image: &PeImage<'_>, filter: &ImportFilter, out: &mut dyn Write) -> Result<()> {
    let mem = image.memory();
    let dir = image.directory(DirectoryKind::Import);
    let count = dir.size as usize / ImportDescriptor::SIZE;
    let bound = load_bound_imports(image)?;

    for index in 0..count {
        let at = image.rva(dir.virtual_address).wrapping_add((index * ImportDescriptor::SIZE) as u64);
        let desc: ImportDescriptor = decode::load(mem, at)?;
        if desc.characteristics == 0 {
            break;
        }
        let dll = read_cstring(mem, image.rva(desc.name), MAX_DLL_NAME)?;
        let module = ImportedModule {
            descriptor: at,
            bound: bound.get(&dll.to_ascii_lowercase()).copied(),
            dll,
            name_table: desc.characteristics,
            address_table: desc.first_thunk,
        };
        if report(image, filter, index, &module, out)? {
            break;
        }
    }
    Ok(())
}

pub fn dump_delay_import_table(
    image: &PeImage<'_>,
    filter: &ImportFilter,
    out: &mut dyn Write,
) -> Result<()> {
    let mem = image.memory();
    let dir = image.directory(DirectoryKind::DelayImport);
    let count = dir.size as usize / DelayDescriptor::SIZE;

    for index in 0..count {
        let at = image.rva(dir.virtual_address).wrapping_add((index * DelayDescriptor::SIZE) as u64);
        let desc: DelayDescriptor = decode::load(mem, at)?;
        if desc.dll_name == 0 {
            break;
        }
        if !desc.rva_based() {
            warn!("Delay descriptor at {:#x} is VA-based", at);
            writeln!(
                out,
                "{:4} {} unsupported descriptor attributes {:#x}",
                index,
                Address(at),
                desc.attributes
            )?;
            continue;
        }
        let module = ImportedModule {
            descriptor: at,
            dll: read_cstring(mem, image.rva(desc.dll_name), MAX_DLL_NAME)?,
            bound: None,
            name_table: desc.import_name_table,
            address_table: desc.import_address_table,
        };
        if desc.module_handle == 0 {
            warn!("Delay descriptor for {} has no module handle slot", module.dll);
        }
        if report(image, filter, index, &module, out)? {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockTarget, PeBuilder};

    const BASE: u64 = 0x7ff6_0000_0000;

    fn image_with_imports() -> MockTarget {
        let mut mock = MockTarget::new();
        PeBuilder::amd64()
            .section(".idata", 0x2000, 0x1000, 0x400, 0x1000)
            .directory(DirectoryKind::Import, 0x2000, 60)
            .directory(DirectoryKind::DelayImport, 0x2800, 64)
            .write(&mut mock, BASE);

        // KERNEL32.dll: one named and one ordinal import.
        mock.write_u32(BASE + 0x2000, 0x2100);
        mock.write_u32(BASE + 0x200c, 0x2200);
        mock.write_u32(BASE + 0x2010, 0x2300);
        mock.write_virtual(BASE + 0x2200, b"KERNEL32.dll\0");
        mock.write_u64(BASE + 0x2100, 0x2400);
        mock.write_u64(BASE + 0x2108, 0x8000_0000_0000_0010);
        mock.write_u16(BASE + 0x2400, 0x1f0);
        mock.write_virtual(BASE + 0x2402, b"GetProcAddress\0");
        mock.write_u64(BASE + 0x2300, 0x7ffb_0000_1000);
        mock.write_u64(BASE + 0x2308, 0x7ffb_0000_2040);
        mock.add_symbol(0x7ffb_0000_1000, "kernel32!GetProcAddress");
        mock.add_symbol(0x7ffb_0000_2000, "kernel32!Beep");

        // ntdll.dll: empty name table. Third descriptor is the zero sentinel.
        mock.write_u32(BASE + 0x2014, 0x2500);
        mock.write_u32(BASE + 0x2020, 0x2210);
        mock.write_u32(BASE + 0x2024, 0x2600);
        mock.write_virtual(BASE + 0x2210, b"ntdll.dll\0");

        // Delay descriptors: one RVA-based, one VA-based.
        mock.write_u32(BASE + 0x2800, 1);
        mock.write_u32(BASE + 0x2804, 0x2220);
        mock.write_u32(BASE + 0x2808, 0x2a00);
        mock.write_u32(BASE + 0x280c, 0x2b00);
        mock.write_u32(BASE + 0x2810, 0x2c00);
        mock.write_virtual(BASE + 0x2220, b"USER32.dll\0");
        mock.write_u64(BASE + 0x2c00, 0x2410);
        mock.write_u16(BASE + 0x2410, 0x2a);
        mock.write_virtual(BASE + 0x2412, b"MessageBoxW\0");
        mock.write_u64(BASE + 0x2b00, 0x7ff6_0000_1234);
        mock.write_u32(BASE + 0x2820, 0);
        mock.write_u32(BASE + 0x2824, 0x2230);
        mock
    }

    fn imports(filter: ImportFilter) -> String {
        let session = image_with_imports().into_session();
        let pe = PeImage::load(&session, BASE).unwrap();
        let mut out = String::new();
        dump_import_table(&pe, &filter, &mut out).unwrap();
        out
    }

    #[test]
    fn test_filter_parse() {
        assert_eq!(ImportFilter::parse(None), ImportFilter::Summary);
        assert_eq!(ImportFilter::parse(Some("*")), ImportFilter::All);
        assert_eq!(ImportFilter::parse(Some("-ALL")), ImportFilter::All);
        assert_eq!(
            ImportFilter::parse(Some("ntdll.dll")),
            ImportFilter::Dll("ntdll.dll".to_string())
        );
    }

    #[test]
    fn test_summary() {
        assert_eq!(
            imports(ImportFilter::Summary),
            "   0 00007ff6`00002000 KERNEL32.dll\n   1 00007ff6`00002014 ntdll.dll\n"
        );
    }

    #[test]
    fn test_entries_for_one_dll_ignore_case() {
        let out = imports(ImportFilter::Dll("kernel32.DLL".to_string()));
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines[0],
            "   0 KERNEL32.dll@01f0 GetProcAddress                   00007ffb`00001000 kernel32!GetProcAddress"
        );
        assert_eq!(
            lines[1],
            "   1 KERNEL32.dll@0010 Ordinal#16                       00007ffb`00002040 kernel32!Beep+0x40"
        );
    }

    #[test]
    fn test_all_prints_summary_and_entries() {
        let out = imports(ImportFilter::All);
        assert_eq!(out.lines().count(), 4);
        assert!(out.lines().nth(3).unwrap().contains("ntdll.dll"));
        assert_eq!(out, imports(ImportFilter::All));
    }

    #[test]
    fn test_no_match_prints_nothing() {
        assert_eq!(imports(ImportFilter::Dll("user32.dll".to_string())), "");
    }

    /// Bound directory at 0x2e00: KERNEL32.dll with one forwarder (NTDLL.DLL),
    /// then an entry for a DLL the image does not import.
    fn write_bound_directory(mock: &mut MockTarget) {
        let dir = BASE + 0x2e00;
        let entry = |mock: &mut MockTarget, at: u64, stamp: u32, name: u16, refs: u16| {
            mock.write_u32(at, stamp);
            mock.write_u16(at + 4, name);
            mock.write_u16(at + 6, refs);
        };
        entry(mock, dir, 0x5e1f_0a3c, 0x28, 1);
        entry(mock, dir + 8, 0x4a5b_c001, 0x38, 0);
        entry(mock, dir + 16, 0x1234_5678, 0x48, 0);
        mock.write_virtual(dir + 0x28, b"KERNEL32.dll\0");
        mock.write_virtual(dir + 0x38, b"NTDLL.DLL\0");
        mock.write_virtual(dir + 0x48, b"gdi32.dll\0");
    }

    fn image_with_bound_imports() -> MockTarget {
        let mut mock = image_with_imports();
        PeBuilder::amd64()
            .section(".idata", 0x2000, 0x1000, 0x400, 0x1000)
            .directory(DirectoryKind::Import, 0x2000, 60)
            .directory(DirectoryKind::DelayImport, 0x2800, 64)
            .directory(DirectoryKind::BoundImport, 0x2e00, 32)
            .write(&mut mock, BASE);
        write_bound_directory(&mut mock);
        mock
    }

    #[test]
    fn test_load_bound_imports_with_forwarders() {
        let session = image_with_bound_imports().into_session();
        let pe = PeImage::load(&session, BASE).unwrap();
        let bound = load_bound_imports(&pe).unwrap();
        assert_eq!(bound.len(), 3);
        assert_eq!(bound.get("kernel32.dll"), Some(&0x5e1f_0a3c));
        assert_eq!(bound.get("ntdll.dll"), Some(&0x4a5b_c001));
        assert_eq!(bound.get("gdi32.dll"), Some(&0x1234_5678));
    }

    #[test]
    fn test_summary_marks_bound_dlls() {
        let session = image_with_bound_imports().into_session();
        let pe = PeImage::load(&session, BASE).unwrap();
        let mut out = String::new();
        dump_import_table(&pe, &ImportFilter::Summary, &mut out).unwrap();
        assert_eq!(
            out,
            "   0 00007ff6`00002000 KERNEL32.dll bound 5e1f0a3c\n   1 00007ff6`00002014 ntdll.dll bound 4a5bc001\n"
        );
    }

    #[test]
    fn test_bound_directory_stops_at_zero_name() {
        let mut mock = image_with_bound_imports();
        mock.write_u16(BASE + 0x2e00 + 16 + 4, 0);
        let session = mock.into_session();
        let pe = PeImage::load(&session, BASE).unwrap();
        let bound = load_bound_imports(&pe).unwrap();
        assert_eq!(bound.len(), 2);
        assert!(!bound.contains_key("gdi32.dll"));
    }

    #[test]
    fn test_delay_imports() {
        let session = image_with_imports().into_session();
        let pe = PeImage::load(&session, BASE).unwrap();
        let mut out = String::new();
        dump_delay_import_table(&pe, &ImportFilter::All, &mut out).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "   0 00007ff6`00002800 USER32.dll");
        assert!(lines[1].starts_with("   0 USER32.dll@002a MessageBoxW "));
        assert!(lines[1].ends_with("00007ff6`00001234"));
        assert_eq!(
            lines[2],
            "   1 00007ff6`00002820 unsupported descriptor attributes 0x0"
        );
    }
}
