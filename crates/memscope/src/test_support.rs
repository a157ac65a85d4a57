//! In-memory debuggee for unit tests.
//!
//! Virtual and physical memory are sparse maps of 4 KiB pages. Reads copy
//! page by page and stop at the first unmapped page, so tests get genuine
//! short reads.

use crate::memory::{Debuggee, Machine, MemoryReader, ProcessorTypes, SymbolResolver, ThreadInfo};
use crate::session::Session;
use std::collections::HashMap;
use std::sync::Arc;

const PAGE: u64 = 0x1000;

#[derive(Default)]
struct Pages(HashMap<u64, Box<[u8; PAGE as usize]>>);

impl Pages {
    fn write(&mut self, address: u64, bytes: &[u8]) {
        for (i, b) in bytes.iter().enumerate() {
            let a = address + i as u64;
            let page = self
                .0
                .entry(a & !(PAGE - 1))
                .or_insert_with(|| Box::new([0u8; PAGE as usize]));
            page[(a & (PAGE - 1)) as usize] = *b;
        }
    }

    fn read(&self, address: u64, buf: &mut [u8]) -> usize {
        let mut done = 0;
        while done < buf.len() {
            let a = address.wrapping_add(done as u64);
            let Some(page) = self.0.get(&(a & !(PAGE - 1))) else {
                break;
            };
            let off = (a & (PAGE - 1)) as usize;
            let n = (PAGE as usize - off).min(buf.len() - done);
            buf[done..done + n].copy_from_slice(&page[off..off + n]);
            done += n;
        }
        done
    }
}

pub struct MockTarget {
    virt: Pages,
    phys: Pages,
    pub pointer_64: Option<bool>,
    pub registers: HashMap<String, u64>,
    pub msrs: HashMap<u32, u64>,
    pub processor: ProcessorTypes,
    pub peb: Option<u64>,
    pub threads: Vec<ThreadInfo>,
    pub current_thread: Option<ThreadInfo>,
    symbols: Vec<(u64, String)>,
    fields: HashMap<(String, String), u32>,
}

impl MockTarget {
    pub fn new() -> Self {
        MockTarget {
            virt: Pages::default(),
            phys: Pages::default(),
            pointer_64: Some(true),
            registers: HashMap::new(),
            msrs: HashMap::new(),
            processor: ProcessorTypes {
                actual: Machine::Amd64,
                effective: Machine::Amd64,
            },
            peb: None,
            threads: Vec::new(),
            current_thread: None,
            symbols: Vec::new(),
            fields: HashMap::new(),
        }
    }

    pub fn write_virtual(&mut self, address: u64, bytes: &[u8]) {
        self.virt.write(address, bytes);
    }

    pub fn write_physical(&mut self, address: u64, bytes: &[u8]) {
        self.phys.write(address, bytes);
    }

    pub fn write_u16(&mut self, address: u64, value: u16) {
        self.write_virtual(address, &value.to_le_bytes());
    }

    pub fn write_u32(&mut self, address: u64, value: u32) {
        self.write_virtual(address, &value.to_le_bytes());
    }

    pub fn write_u64(&mut self, address: u64, value: u64) {
        self.write_virtual(address, &value.to_le_bytes());
    }

    pub fn write_phys_u32(&mut self, address: u64, value: u32) {
        self.write_physical(address, &value.to_le_bytes());
    }

    pub fn write_phys_u64(&mut self, address: u64, value: u64) {
        self.write_physical(address, &value.to_le_bytes());
    }

    pub fn add_symbol(&mut self, address: u64, name: &str) {
        self.symbols.push((address, name.to_string()));
        self.symbols.sort();
    }

    pub fn add_field(&mut self, type_name: &str, field: &str, offset: u32) {
        self.fields
            .insert((type_name.to_string(), field.to_string()), offset);
    }

    pub fn into_session(self) -> Session {
        let target = Arc::new(self);
        Session::new(target.clone(), target.clone(), target)
    }
}

impl MemoryReader for MockTarget {
    fn read_virtual(&self, address: u64, buf: &mut [u8]) -> usize {
        self.virt.read(address, buf)
    }

    fn read_physical(&self, address: u64, buf: &mut [u8]) -> usize {
        self.phys.read(address, buf)
    }
}

impl SymbolResolver for MockTarget {
    fn resolve(&self, address: u64) -> Option<(String, u64)> {
        self.symbols
            .iter()
            .rev()
            .find(|(a, _)| *a <= address)
            .map(|(a, name)| (name.clone(), address - a))
    }

    fn field_offset(&self, type_name: &str, field: &str) -> Option<u32> {
        let type_name = type_name.split_once('!').map_or(type_name, |(_, t)| t);
        self.fields
            .get(&(type_name.to_string(), field.to_string()))
            .copied()
    }
}

impl Debuggee for MockTarget {
    fn is_pointer_64bit(&self) -> Option<bool> {
        self.pointer_64
    }

    fn evaluate(&self, expression: &str) -> Option<u64> {
        self.registers
            .get(expression)
            .copied()
            .or_else(|| crate::address::parse_address(expression))
    }

    fn read_msr(&self, msr: u32) -> Option<u64> {
        self.msrs.get(&msr).copied()
    }

    fn processor_types(&self) -> ProcessorTypes {
        self.processor
    }

    fn current_peb(&self) -> Option<u64> {
        self.peb
    }

    fn current_thread(&self) -> Option<ThreadInfo> {
        self.current_thread
    }

    fn threads(&self) -> Vec<ThreadInfo> {
        self.threads.clone()
    }
}

/// Writes a minimal PE header set (DOS header, NT headers, section table)
/// into a [`MockTarget`]. Directory contents are left to the test.
pub struct PeBuilder {
    pub machine: u16,
    pub magic: Option<u16>,
    pub number_of_sections: Option<u16>,
    sections: Vec<(&'static str, u32, u32, u32, u32)>,
    directories: [(u32, u32); 16],
}

impl PeBuilder {
    fn with_machine(machine: u16) -> Self {
        PeBuilder {
            machine,
            magic: None,
            number_of_sections: None,
            sections: Vec::new(),
            directories: [(0, 0); 16],
        }
    }

    pub fn amd64() -> Self {
        Self::with_machine(0x8664)
    }

    pub fn i386() -> Self {
        Self::with_machine(0x014c)
    }

    pub fn section(mut self, name: &'static str, va: u32, vsize: u32, raw: u32, raw_size: u32) -> Self {
        self.sections.push((name, va, vsize, raw, raw_size));
        self
    }

    pub fn directory(mut self, kind: crate::pe::DirectoryKind, rva: u32, size: u32) -> Self {
        self.directories[kind as usize] = (rva, size);
        self
    }

    pub fn write(&self, mock: &mut MockTarget, base: u64) {
        let is64 = self.machine == 0x8664;
        mock.write_u16(base, 0x5a4d);
        mock.write_u32(base + 0x3c, 0x80);

        let nt = base + 0x80;
        mock.write_u32(nt, 0x4550);
        mock.write_u16(nt + 4, self.machine);
        mock.write_u16(
            nt + 6,
            self.number_of_sections.unwrap_or(self.sections.len() as u16),
        );
        let optional_size: u16 = if is64 { 240 } else { 224 };
        mock.write_u16(nt + 20, optional_size);

        let opt = nt + 24;
        mock.write_u16(opt, self.magic.unwrap_or(if is64 { 0x20b } else { 0x10b }));
        if is64 {
            mock.write_u64(opt + 24, base);
        } else {
            mock.write_u32(opt + 28, base as u32);
        }
        mock.write_u32(opt + 56, 0x10000);
        let dirs = opt + if is64 { 112 } else { 96 };
        for (i, (rva, size)) in self.directories.iter().enumerate() {
            mock.write_u32(dirs + i as u64 * 8, *rva);
            mock.write_u32(dirs + i as u64 * 8 + 4, *size);
        }

        let mut at = opt + optional_size as u64;
        for (name, va, vsize, raw, raw_size) in &self.sections {
            let mut padded = [0u8; 8];
            padded[..name.len()].copy_from_slice(name.as_bytes());
            mock.write_virtual(at, &padded);
            mock.write_u32(at + 8, *vsize);
            mock.write_u32(at + 12, *va);
            mock.write_u32(at + 16, *raw_size);
            mock.write_u32(at + 20, *raw);
            at = at.wrapping_add(40);
        }
    }
}
