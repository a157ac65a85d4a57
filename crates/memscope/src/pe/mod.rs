//! PE image parsing.
//!
//! [`PeImage::load`] validates the DOS header, the PE signature, the machine
//! type and the optional-header magic, in that order, then reads the section
//! table. Any failure returns an error and no image, so every dump operation
//! works on a fully validated header set. Once loaded the image is a
//! read-only view; dumps read the directories from target memory each time.

pub mod exception;
pub mod exports;
pub mod headers;
pub mod imports;
pub mod load_config;
pub mod resource;

use crate::address::Address;
use crate::decode::{self, Bitness, Record};
use crate::error::{Error, Result};
use crate::memory::MemoryReader;
use crate::session::Session;
use headers::{
    DataDirectory, DosHeader, FileHeader, OptionalHeader, OptionalHeader32, OptionalHeader64,
    SectionHeader, DOS_MAGIC, MACHINE_AMD64, MACHINE_I386, PE32_MAGIC, PE32_PLUS_MAGIC,
    PE_SIGNATURE,
};
use std::fmt::Write;
use tracing::debug;

pub use exports::dump_export_table;
pub use imports::{ImportFilter, dump_delay_import_table, dump_import_table};
pub use resource::{FixedFileInfo, ResourceMatch};

/// The sixteen data-directory slots, in header order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryKind {
    Export,
    Import,
    Resource,
    Exception,
    Certificate,
    BaseRelocation,
    Debug,
    ArchitectureSpecific,
    GlobalPointer,
    Tls,
    LoadConfig,
    BoundImport,
    Iat,
    DelayImport,
    ClrHeader,
    Reserved,
}

impl DirectoryKind {
    pub const ALL: [DirectoryKind; headers::NUMBER_OF_DIRECTORIES] = [
        DirectoryKind::Export,
        DirectoryKind::Import,
        DirectoryKind::Resource,
        DirectoryKind::Exception,
        DirectoryKind::Certificate,
        DirectoryKind::BaseRelocation,
        DirectoryKind::Debug,
        DirectoryKind::ArchitectureSpecific,
        DirectoryKind::GlobalPointer,
        DirectoryKind::Tls,
        DirectoryKind::LoadConfig,
        DirectoryKind::BoundImport,
        DirectoryKind::Iat,
        DirectoryKind::DelayImport,
        DirectoryKind::ClrHeader,
        DirectoryKind::Reserved,
    ];

    pub fn name(self) -> &'static str {
        match self {
            DirectoryKind::Export => "Export",
            DirectoryKind::Import => "Import",
            DirectoryKind::Resource => "Resource",
            DirectoryKind::Exception => "Exception",
            DirectoryKind::Certificate => "Certificate",
            DirectoryKind::BaseRelocation => "BaseRelocation",
            DirectoryKind::Debug => "Debug",
            DirectoryKind::ArchitectureSpecific => "ArchitectureSpecific",
            DirectoryKind::GlobalPointer => "GlobalPointer",
            DirectoryKind::Tls => "TLS",
            DirectoryKind::LoadConfig => "LoadConfig",
            DirectoryKind::BoundImport => "BoundImport",
            DirectoryKind::Iat => "IAT",
            DirectoryKind::DelayImport => "DelayImport",
            DirectoryKind::ClrHeader => "CLRHeader",
            DirectoryKind::Reserved => "Reserved",
        }
    }
}

/// A validated PE image in target memory.
pub struct PeImage<'s> {
    session: &'s Session,
    base: u64,
    file_header: FileHeader,
    optional: OptionalHeader,
    sections: Vec<SectionHeader>,
}

impl<'s> PeImage<'s> {
    pub fn load(session: &'s Session, base: u64) -> Result<Self> {
        let mem = session.memory();

        let dos: DosHeader = decode::load(mem, base)?;
        if dos.e_magic != DOS_MAGIC {
            return Err(Error::mismatch("DOS header magic", dos.e_magic));
        }

        let nt = base.wrapping_add(dos.e_lfanew as u64);
        let signature = mem.read_u32(nt)?;
        if signature != PE_SIGNATURE {
            return Err(Error::mismatch("PE signature", signature));
        }

        let file_header: FileHeader = decode::load(mem, nt.wrapping_add(4))?;
        let optional_at = nt.wrapping_add(4 + FileHeader::SIZE as u64);
        let optional = match file_header.machine {
            MACHINE_I386 => {
                let h: OptionalHeader32 = decode::load(mem, optional_at)?;
                if h.magic != PE32_MAGIC {
                    return Err(Error::mismatch("PE32 optional header magic", h.magic));
                }
                OptionalHeader::Pe32(h)
            }
            MACHINE_AMD64 => {
                let h: OptionalHeader64 = decode::load(mem, optional_at)?;
                if h.magic != PE32_PLUS_MAGIC {
                    return Err(Error::mismatch("PE32+ optional header magic", h.magic));
                }
                OptionalHeader::Pe64(h)
            }
            other => return Err(Error::mismatch("machine type", other)),
        };

        let mut sections = Vec::with_capacity(file_header.number_of_sections as usize);
        let mut at = optional_at.wrapping_add(file_header.size_of_optional_header as u64);
        for _ in 0..file_header.number_of_sections {
            let section: SectionHeader = decode::load(mem, at)?;
            if section.name == [0u8; 8] {
                debug!(
                    "Section table at {:#x} ends after {} of {} rows",
                    base,
                    sections.len(),
                    file_header.number_of_sections
                );
                break;
            }
            sections.push(section);
            at = at.wrapping_add(SectionHeader::SIZE as u64);
        }

        debug!(
            "PE image at {:#x}: machine {:#x}, {} sections",
            base,
            file_header.machine,
            sections.len()
        );
        Ok(PeImage {
            session,
            base,
            file_header,
            optional,
            sections,
        })
    }

    pub fn session(&self) -> &'s Session {
        self.session
    }

    pub fn memory(&self) -> &'s dyn MemoryReader {
        self.session.memory()
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn machine(&self) -> u16 {
        self.file_header.machine
    }

    pub fn bitness(&self) -> Bitness {
        self.optional.bitness()
    }

    pub fn optional_header(&self) -> &OptionalHeader {
        &self.optional
    }

    pub fn sections(&self) -> &[SectionHeader] {
        &self.sections
    }

    pub fn directory(&self, kind: DirectoryKind) -> DataDirectory {
        self.optional.directories()[kind as usize]
    }

    /// Virtual address of an RVA in this image.
    pub fn rva(&self, rva: u32) -> u64 {
        self.base.wrapping_add(rva as u64)
    }

    /// First section whose virtual range holds the whole directory.
    pub fn section_for(&self, dir: DataDirectory) -> Option<&SectionHeader> {
        self.sections
            .iter()
            .find(|s| s.contains(dir.virtual_address, dir.size))
    }

    pub fn dump_section_table(&self, out: &mut dyn Write) -> Result<()> {
        for (i, s) in self.sections.iter().enumerate() {
            let va = self.rva(s.virtual_address);
            let raw_end = s.pointer_to_raw_data as u64 + s.size_of_raw_data as u64;
            writeln!(
                out,
                "{:2} {:<8} {}-{} {:08x}-{:08x}",
                i,
                s.name(),
                Address(va),
                Address(va.wrapping_add(s.virtual_size as u64)),
                s.pointer_to_raw_data,
                raw_end
            )?;
        }

        for (i, kind) in DirectoryKind::ALL.iter().enumerate() {
            let dir = self.directory(*kind);
            if dir.is_empty() {
                writeln!(out, "{:2} {}", i, kind.name())?;
                continue;
            }
            let start = self.rva(dir.virtual_address);
            let mut line = format!(
                "{:2} {:<20} {}-{}",
                i,
                kind.name(),
                Address(start),
                Address(start.wrapping_add(dir.size as u64))
            );
            if let Some(section) = self.section_for(dir) {
                line.push(' ');
                line.push_str(&section.name());
            }
            writeln!(out, "{}", line)?;
        }
        Ok(())
    }
}
