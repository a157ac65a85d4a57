//! PE header records.

use crate::decode::{Bitness, Fields, Record};

pub const DOS_MAGIC: u16 = 0x5A4D; // "MZ"
pub const PE_SIGNATURE: u32 = 0x0000_4550; // "PE\0\0"
pub const MACHINE_I386: u16 = 0x014c;
pub const MACHINE_AMD64: u16 = 0x8664;
pub const PE32_MAGIC: u16 = 0x10b;
pub const PE32_PLUS_MAGIC: u16 = 0x20b;
pub const NUMBER_OF_DIRECTORIES: usize = 16;

/// The fields of IMAGE_DOS_HEADER this crate needs.
#[derive(Debug, Clone, Copy)]
pub struct DosHeader {
    pub e_magic: u16,
    pub e_lfanew: u32,
}

impl Record for DosHeader {
    const SIZE: usize = 64;

    fn decode(data: &[u8]) -> Self {
        DosHeader {
            e_magic: Fields::new(data).u16(),
            e_lfanew: Fields::at(data, 0x3c).u32(),
        }
    }
}

/// IMAGE_FILE_HEADER.
#[derive(Debug, Clone, Copy)]
pub struct FileHeader {
    pub machine: u16,
    pub number_of_sections: u16,
    pub time_date_stamp: u32,
    pub size_of_optional_header: u16,
    pub characteristics: u16,
}

impl Record for FileHeader {
    const SIZE: usize = 20;

    fn decode(data: &[u8]) -> Self {
        let mut f = Fields::new(data);
        let machine = f.u16();
        let number_of_sections = f.u16();
        let time_date_stamp = f.u32();
        f.skip(8); // PointerToSymbolTable, NumberOfSymbols
        FileHeader {
            machine,
            number_of_sections,
            time_date_stamp,
            size_of_optional_header: f.u16(),
            characteristics: f.u16(),
        }
    }
}

/// IMAGE_DATA_DIRECTORY.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataDirectory {
    pub virtual_address: u32,
    pub size: u32,
}

impl DataDirectory {
    pub fn is_empty(&self) -> bool {
        self.virtual_address == 0 || self.size == 0
    }

    /// `[va, va + size)` as RVAs, widened so the end cannot wrap.
    pub fn range(&self) -> std::ops::Range<u64> {
        let start = self.virtual_address as u64;
        start..start + self.size as u64
    }
}

fn read_directories(f: &mut Fields<'_>) -> [DataDirectory; NUMBER_OF_DIRECTORIES] {
    let mut dirs = [DataDirectory::default(); NUMBER_OF_DIRECTORIES];
    for dir in dirs.iter_mut() {
        dir.virtual_address = f.u32();
        dir.size = f.u32();
    }
    dirs
}

/// IMAGE_OPTIONAL_HEADER32, the fields kept.
#[derive(Debug, Clone, Copy)]
pub struct OptionalHeader32 {
    pub magic: u16,
    pub address_of_entry_point: u32,
    pub image_base: u32,
    pub size_of_image: u32,
    pub directories: [DataDirectory; NUMBER_OF_DIRECTORIES],
}

impl Record for OptionalHeader32 {
    const SIZE: usize = 96 + NUMBER_OF_DIRECTORIES * 8;

    fn decode(data: &[u8]) -> Self {
        let mut f = Fields::new(data);
        OptionalHeader32 {
            magic: f.u16(),
            address_of_entry_point: f.seek(16).u32(),
            image_base: f.seek(28).u32(),
            size_of_image: f.seek(56).u32(),
            directories: read_directories(f.seek(96)),
        }
    }
}

/// IMAGE_OPTIONAL_HEADER64, the fields kept.
#[derive(Debug, Clone, Copy)]
pub struct OptionalHeader64 {
    pub magic: u16,
    pub address_of_entry_point: u32,
    pub image_base: u64,
    pub size_of_image: u32,
    pub directories: [DataDirectory; NUMBER_OF_DIRECTORIES],
}

impl Record for OptionalHeader64 {
    const SIZE: usize = 112 + NUMBER_OF_DIRECTORIES * 8;

    fn decode(data: &[u8]) -> Self {
        let mut f = Fields::new(data);
        OptionalHeader64 {
            magic: f.u16(),
            address_of_entry_point: f.seek(16).u32(),
            image_base: f.seek(24).u64(),
            size_of_image: f.seek(56).u32(),
            directories: read_directories(f.seek(112)),
        }
    }
}

/// PE32 or PE32+ optional header, chosen by the machine type.
#[derive(Debug, Clone, Copy)]
pub enum OptionalHeader {
    Pe32(OptionalHeader32),
    Pe64(OptionalHeader64),
}

impl OptionalHeader {
    pub fn bitness(&self) -> Bitness {
        match self {
            OptionalHeader::Pe32(_) => Bitness::Bit32,
            OptionalHeader::Pe64(_) => Bitness::Bit64,
        }
    }

    pub fn magic(&self) -> u16 {
        match self {
            OptionalHeader::Pe32(h) => h.magic,
            OptionalHeader::Pe64(h) => h.magic,
        }
    }

    pub fn image_base(&self) -> u64 {
        match self {
            OptionalHeader::Pe32(h) => h.image_base as u64,
            OptionalHeader::Pe64(h) => h.image_base,
        }
    }

    pub fn size_of_image(&self) -> u32 {
        match self {
            OptionalHeader::Pe32(h) => h.size_of_image,
            OptionalHeader::Pe64(h) => h.size_of_image,
        }
    }

    pub fn address_of_entry_point(&self) -> u32 {
        match self {
            OptionalHeader::Pe32(h) => h.address_of_entry_point,
            OptionalHeader::Pe64(h) => h.address_of_entry_point,
        }
    }

    pub fn directories(&self) -> &[DataDirectory; NUMBER_OF_DIRECTORIES] {
        match self {
            OptionalHeader::Pe32(h) => &h.directories,
            OptionalHeader::Pe64(h) => &h.directories,
        }
    }
}

/// IMAGE_SECTION_HEADER.
#[derive(Debug, Clone, Copy)]
pub struct SectionHeader {
    pub name: [u8; 8],
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
    pub characteristics: u32,
}

impl SectionHeader {
    /// Section name without NUL padding, never longer than 8 characters.
    pub fn name(&self) -> String {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(8);
        String::from_utf8_lossy(&self.name[..len]).into_owned()
    }

    /// Whether `[rva, rva + size)` lies inside this section's virtual range.
    pub fn contains(&self, rva: u32, size: u32) -> bool {
        let start = self.virtual_address as u64;
        let end = start + self.virtual_size as u64;
        start <= rva as u64 && rva as u64 + size as u64 <= end
    }
}

impl Record for SectionHeader {
    const SIZE: usize = 40;

    fn decode(data: &[u8]) -> Self {
        let mut f = Fields::new(data);
        let name = f.bytes::<8>();
        let virtual_size = f.u32();
        let virtual_address = f.u32();
        let size_of_raw_data = f.u32();
        let pointer_to_raw_data = f.u32();
        SectionHeader {
            name,
            virtual_size,
            virtual_address,
            size_of_raw_data,
            pointer_to_raw_data,
            characteristics: f.seek(36).u32(),
        }
    }
}
