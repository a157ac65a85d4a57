//! Resource directory walk and the version resource.
//!
//! The resource tree is walked with an explicit stack so a corrupt tree
//! (cycles, absurd depth) costs at most one visit per directory.

use super::{DirectoryKind, PeImage};
use crate::decode::{self, read_utf16, Fields, Record};
use crate::error::{Error, Result};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt::Write;
use tracing::debug;

pub const RT_VERSION: u16 = 16;
const VS_FFI_SIGNATURE: u32 = 0xFEEF_04BD;
/// VS_VERSIONINFO header: wLength, wValueLength, wType, "VS_VERSION_INFO\0"
/// and padding to a 4-byte boundary.
const VERSION_INFO_VALUE_OFFSET: u64 = 40;
const HIGH_BIT: u32 = 0x8000_0000;

/// Match predicate for one level of the resource tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceMatch {
    Id(u16),
    /// Compared without regard to ASCII case.
    Name(String),
    Any,
}

/// IMAGE_RESOURCE_DIRECTORY, the entry counts.
#[derive(Debug, Clone, Copy)]
struct ResourceDirectory {
    named_entries: u16,
    id_entries: u16,
}

impl Record for ResourceDirectory {
    const SIZE: usize = 16;

    fn decode(data: &[u8]) -> Self {
        let mut f = Fields::at(data, 12);
        ResourceDirectory {
            named_entries: f.u16(),
            id_entries: f.u16(),
        }
    }
}

/// IMAGE_RESOURCE_DIRECTORY_ENTRY.
#[derive(Debug, Clone, Copy)]
struct DirectoryEntry {
    name: u32,
    offset: u32,
}

impl DirectoryEntry {
    fn is_directory(&self) -> bool {
        self.offset & HIGH_BIT != 0
    }

    fn target(&self) -> u32 {
        self.offset & !HIGH_BIT
    }
}

impl Record for DirectoryEntry {
    const SIZE: usize = 8;

    fn decode(data: &[u8]) -> Self {
        let mut f = Fields::new(data);
        DirectoryEntry {
            name: f.u32(),
            offset: f.u32(),
        }
    }
}

/// IMAGE_RESOURCE_DATA_ENTRY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceData {
    pub offset_to_data: u32,
    pub size: u32,
    pub code_page: u32,
}

impl Record for ResourceData {
    const SIZE: usize = 16;

    fn decode(data: &[u8]) -> Self {
        let mut f = Fields::new(data);
        ResourceData {
            offset_to_data: f.u32(),
            size: f.u32(),
            code_page: f.u32(),
        }
    }
}

impl ResourceMatch {
    fn matches(&self, image: &PeImage<'_>, root: u64, entry: &DirectoryEntry) -> Result<bool> {
        Ok(match self {
            ResourceMatch::Any => true,
            ResourceMatch::Id(id) => entry.name & HIGH_BIT == 0 && entry.name == *id as u32,
            ResourceMatch::Name(name) => {
                if entry.name & HIGH_BIT == 0 {
                    return Ok(false);
                }
                // IMAGE_RESOURCE_DIR_STRING_U: u16 length in characters, then UTF-16.
                let at = root.wrapping_add((entry.name & !HIGH_BIT) as u64);
                let len = image.memory().read_u16(at)? as usize;
                read_utf16(image.memory(), at.wrapping_add(2), len * 2)?.eq_ignore_ascii_case(name)
            }
        })
    }
}

/// Every data entry reached by following `path` from the resource root,
/// one predicate per level, in directory order.
pub fn find_resources(image: &PeImage<'_>, path: &[ResourceMatch]) -> Result<Vec<ResourceData>> {
    let dir = image.directory(DirectoryKind::Resource);
    if dir.is_empty() || path.is_empty() {
        return Ok(Vec::new());
    }
    let mem = image.memory();
    let root = image.rva(dir.virtual_address);

    let mut found = Vec::new();
    let mut visited = HashSet::new();
    let mut stack = vec![(0u32, 0usize)];
    while let Some((offset, depth)) = stack.pop() {
        if !visited.insert(offset) {
            debug!("Resource directory {:#x} reached twice", offset);
            continue;
        }
        let at = root.wrapping_add(offset as u64);
        let header: ResourceDirectory = decode::load(mem, at)?;
        let count = header.named_entries as usize + header.id_entries as usize;
        let entries: Vec<DirectoryEntry> =
            decode::load_array(mem, at.wrapping_add(ResourceDirectory::SIZE as u64), count)?;

        let mut subdirectories = Vec::new();
        for entry in &entries {
            if !path[depth].matches(image, root, entry)? {
                continue;
            }
            let last = depth + 1 == path.len();
            match (entry.is_directory(), last) {
                (true, false) => subdirectories.push((entry.target(), depth + 1)),
                (false, true) => found.push(decode::load(mem, root.wrapping_add(entry.target() as u64))?),
                _ => debug!(
                    "Resource entry {:#x} at depth {} has the wrong kind",
                    entry.name, depth
                ),
            }
        }
        // Reversed so the first subdirectory is popped first.
        stack.extend(subdirectories.into_iter().rev());
    }
    Ok(found)
}

/// VS_FIXEDFILEINFO.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FixedFileInfo {
    pub signature: u32,
    pub struc_version: u32,
    pub file_version_ms: u32,
    pub file_version_ls: u32,
    pub product_version_ms: u32,
    pub product_version_ls: u32,
    pub file_flags_mask: u32,
    pub file_flags: u32,
    pub file_os: u32,
    pub file_type: u32,
    pub file_subtype: u32,
    pub file_date_ms: u32,
    pub file_date_ls: u32,
}

impl Record for FixedFileInfo {
    const SIZE: usize = 52;

    fn decode(data: &[u8]) -> Self {
        let mut f = Fields::new(data);
        FixedFileInfo {
            signature: f.u32(),
            struc_version: f.u32(),
            file_version_ms: f.u32(),
            file_version_ls: f.u32(),
            product_version_ms: f.u32(),
            product_version_ls: f.u32(),
            file_flags_mask: f.u32(),
            file_flags: f.u32(),
            file_os: f.u32(),
            file_type: f.u32(),
            file_subtype: f.u32(),
            file_date_ms: f.u32(),
            file_date_ls: f.u32(),
        }
    }
}

fn dotted(ms: u32, ls: u32) -> String {
    format!("{}.{}.{}.{}", ms >> 16, ms & 0xffff, ls >> 16, ls & 0xffff)
}

impl FixedFileInfo {
    pub fn is_empty(&self) -> bool {
        *self == FixedFileInfo::default()
    }

    pub fn file_version(&self) -> String {
        dotted(self.file_version_ms, self.file_version_ls)
    }

    pub fn product_version(&self) -> String {
        dotted(self.product_version_ms, self.product_version_ls)
    }

    pub fn render(&self, out: &mut dyn Write) -> std::fmt::Result {
        if self.is_empty() {
            return Ok(());
        }
        writeln!(out, "FileVersion    {}", self.file_version())?;
        writeln!(out, "ProductVersion {}", self.product_version())?;
        writeln!(out, "FileFlags      {:08x}", self.file_flags & self.file_flags_mask)?;
        writeln!(out, "FileOS         {:08x}", self.file_os)?;
        writeln!(out, "FileType       {:08x}", self.file_type)
    }
}

fn read_version(image: &PeImage<'_>) -> Result<FixedFileInfo> {
    let path = [ResourceMatch::Id(RT_VERSION), ResourceMatch::Any, ResourceMatch::Any];
    let Some(data) = find_resources(image, &path)?.into_iter().next() else {
        return Err(Error::unsupported("no VS_VERSION_INFO resource"));
    };
    if (data.size as u64) < VERSION_INFO_VALUE_OFFSET + FixedFileInfo::SIZE as u64 {
        return Err(Error::mismatch("VS_VERSION_INFO size", data.size));
    }
    let mem = image.memory();
    let at = image.rva(data.offset_to_data);
    let value_length = mem.read_u16(at.wrapping_add(2))?;
    if value_length as usize != FixedFileInfo::SIZE {
        return Err(Error::mismatch("VS_VERSION_INFO value length", value_length));
    }
    let info: FixedFileInfo = decode::load(mem, at.wrapping_add(VERSION_INFO_VALUE_OFFSET))?;
    if info.signature != VS_FFI_SIGNATURE {
        return Err(Error::mismatch("VS_FIXEDFILEINFO signature", info.signature));
    }
    Ok(info)
}

/// The image's fixed file info, or the all-zero record when it has none or
/// it does not validate.
pub fn get_version(image: &PeImage<'_>) -> FixedFileInfo {
    read_version(image).unwrap_or_else(|e| {
        debug!("No version for image at {:#x}: {}", image.base(), e);
        FixedFileInfo::default()
    })
}
