//! End-to-end reads through a physical dump file with real page tables.

use memscope::commands;
use memscope::memory::layers::MmapFileLayer;
use memscope::memory::virtual_memory::TranslatedMemory;
use memscope::memory::{
    Debuggee, Machine, MemoryLayer, MemoryReader, ProcessorTypes, SymbolResolver, ThreadInfo,
};
use memscope::paging::{PagingMode, PagingTranslator};
use memscope::Session;
use std::io::Write;
use std::sync::Arc;
use tempfile::NamedTempFile;

const PML4: u64 = 0x1000;
const PDPT: u64 = 0x2000;
const PD: u64 = 0x3000;
const PT: u64 = 0x4000;
const IMAGE_PAGE: u64 = 0x6000;
const IMAGE_BASE: u64 = 0x0000_7ff6_1234_5000;
const DUMP_SIZE: usize = 0x8000;

struct Host;

impl SymbolResolver for Host {
    fn resolve(&self, _address: u64) -> Option<(String, u64)> {
        None
    }

    fn field_offset(&self, _type_name: &str, _field: &str) -> Option<u32> {
        None
    }
}

impl Debuggee for Host {
    fn is_pointer_64bit(&self) -> Option<bool> {
        Some(true)
    }

    fn evaluate(&self, expression: &str) -> Option<u64> {
        memscope::address::parse_address(expression)
    }

    fn read_msr(&self, _msr: u32) -> Option<u64> {
        None
    }

    fn processor_types(&self) -> ProcessorTypes {
        ProcessorTypes {
            actual: Machine::Amd64,
            effective: Machine::Amd64,
        }
    }

    fn current_peb(&self) -> Option<u64> {
        None
    }

    fn current_thread(&self) -> Option<ThreadInfo> {
        None
    }

    fn threads(&self) -> Vec<ThreadInfo> {
        Vec::new()
    }
}

fn put(dump: &mut [u8], at: u64, bytes: &[u8]) {
    let at = at as usize;
    dump[at..at + bytes.len()].copy_from_slice(bytes);
}

/// One present 4 KiB mapping of IMAGE_BASE onto IMAGE_PAGE, holding a
/// PE32+ header with a single section.
fn build_dump() -> Vec<u8> {
    let mut dump = vec![0u8; DUMP_SIZE];
    let va = IMAGE_BASE;
    put(&mut dump, PML4 + ((va >> 39) & 0x1ff) * 8, &(PDPT | 0x63).to_le_bytes());
    put(&mut dump, PDPT + ((va >> 30) & 0x1ff) * 8, &(PD | 0x63).to_le_bytes());
    put(&mut dump, PD + ((va >> 21) & 0x1ff) * 8, &(PT | 0x63).to_le_bytes());
    put(&mut dump, PT + ((va >> 12) & 0x1ff) * 8, &(IMAGE_PAGE | 0x63).to_le_bytes());

    let pe = IMAGE_PAGE;
    put(&mut dump, pe, b"MZ");
    put(&mut dump, pe + 0x3c, &0x80u32.to_le_bytes());
    put(&mut dump, pe + 0x80, b"PE\0\0");
    put(&mut dump, pe + 0x84, &0x8664u16.to_le_bytes());
    put(&mut dump, pe + 0x86, &1u16.to_le_bytes());
    put(&mut dump, pe + 0x94, &240u16.to_le_bytes());
    put(&mut dump, pe + 0x98, &0x20bu16.to_le_bytes());
    put(&mut dump, pe + 0x98 + 24, &IMAGE_BASE.to_le_bytes());

    let section = pe + 0x98 + 240;
    put(&mut dump, section, b".text\0\0\0");
    put(&mut dump, section + 8, &0x100u32.to_le_bytes());
    put(&mut dump, section + 12, &0x1000u32.to_le_bytes());
    put(&mut dump, section + 16, &0x200u32.to_le_bytes());
    put(&mut dump, section + 20, &0x400u32.to_le_bytes());
    dump
}

fn open_dump() -> (NamedTempFile, Arc<dyn MemoryLayer>) {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(&build_dump()).unwrap();
    file.flush().unwrap();
    let layer = MmapFileLayer::open("physical", file.path()).unwrap();
    (file, Arc::new(layer))
}

fn session_over(physical: Arc<dyn MemoryLayer>) -> Session {
    let memory = TranslatedMemory::with_translator(
        physical,
        PagingTranslator::new(PagingMode::FourLevel, PML4),
    );
    let host = Arc::new(Host);
    Session::new(Arc::new(memory), host.clone(), host)
}

#[test]
fn test_virtual_read_through_page_tables() {
    let (_file, physical) = open_dump();
    let memory = TranslatedMemory::with_translator(
        physical,
        PagingTranslator::new(PagingMode::FourLevel, PML4),
    );

    let mut buf = [0u8; 4];
    assert_eq!(memory.read_virtual(IMAGE_BASE + 0x80, &mut buf), 4);
    assert_eq!(&buf, b"PE\0\0");

    // The next virtual page has no PTE: the read stops at the page end.
    let mut buf = [0u8; 0x20];
    assert_eq!(memory.read_virtual(IMAGE_BASE + 0xff0, &mut buf), 0x10);
    assert!(memory.read_virtual_exact(IMAGE_BASE + 0x1000, 1).is_err());

    // Physical reads past the end of the dump are short.
    let mut buf = [0u8; 0x10];
    assert_eq!(memory.read_physical(DUMP_SIZE as u64, &mut buf), 0);
}

#[test]
fn test_v2p_command_over_dump() {
    let (_file, physical) = open_dump();
    let session = session_over(physical);

    let mut out = String::new();
    assert!(commands::run(&session, "v2p 7ff6`12345010 1000", false, &mut out));
    let lines: Vec<&str> = out.lines().collect();
    assert_eq!(lines[1], "Assuming PagingMode is 4-level");
    assert_eq!(lines.last().copied(), Some("Physical Address = 00006010"));

    let mut out = String::new();
    assert!(commands::run(&session, "v2p 7ff6`12346000 1000", false, &mut out));
    assert!(!out.contains("Physical Address"));
    // A directory base past the end of the dump cannot be read.
    let mut out = String::new();
    assert!(!commands::run(&session, "v2p 7ff6`12345010 10000", false, &mut out));
    assert!(out.contains("\nFailed to read PML4E entry: "));
}

#[test]
fn test_section_table_from_dump() {
    let (_file, physical) = open_dump();
    let session = session_over(physical);

    let mut out = String::new();
    assert!(commands::run(&session, "sec 7ff6`12345000", false, &mut out));
    let lines: Vec<&str> = out.lines().collect();
    assert_eq!(lines.len(), 17);
    assert_eq!(
        lines[0],
        " 0 .text    00007ff6`12346000-00007ff6`12346100 00000400-00000600"
    );
    assert_eq!(lines[1], " 0 Export");
}
