//! Virtual Address Descriptor tree of one process.

use crate::address::Address;
use crate::decode::read_unicode_string;
use crate::error::Result;
use crate::session::Session;
use crate::tree::{self, NodeShape, TreeEvent};
use serde::Serialize;
use std::fmt::{self, Write};
use tracing::{debug, warn};

/// `_CONTROL_AREA.u.Flags.File`.
const CONTROL_AREA_FILE: u32 = 0x80;
/// `_EX_FAST_REF` reference-count bits of `FilePointer`.
const FAST_REF_MASK: u64 = 0xf;
const PAGE_SHIFT: u32 = 12;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VadEntry {
    pub node: u64,
    pub start: u64,
    /// Exclusive.
    pub end: u64,
    pub file_object: Option<u64>,
    pub file_name: Option<String>,
}

impl VadEntry {
    pub fn render(&self, index: usize, out: &mut dyn Write) -> fmt::Result {
        write!(
            out,
            "{:4} {} {} {}",
            index,
            Address(self.node),
            Address(self.start),
            Address(self.end)
        )?;
        if let Some(file_object) = self.file_object {
            write!(
                out,
                " {} {}",
                Address(file_object),
                self.file_name.as_deref().unwrap_or("")
            )?;
        }
        writeln!(out)
    }
}

struct VadOffsets {
    core: u64,
    starting_vpn: u64,
    starting_vpn_high: Option<u64>,
    ending_vpn: u64,
    ending_vpn_high: Option<u64>,
    subsection: u64,
    control_area: u64,
    control_area_flags: u64,
    file_pointer: u64,
    file_name: u64,
}

impl VadOffsets {
    fn load(session: &Session) -> Result<Self> {
        Ok(VadOffsets {
            core: session.field_offset("nt!_MMVAD", "Core")?,
            starting_vpn: session.field_offset("nt!_MMVAD_SHORT", "StartingVpn")?,
            // The high bytes only exist on 64-bit builds.
            starting_vpn_high: session.field_offset("nt!_MMVAD_SHORT", "StartingVpnHigh").ok(),
            ending_vpn: session.field_offset("nt!_MMVAD_SHORT", "EndingVpn")?,
            ending_vpn_high: session.field_offset("nt!_MMVAD_SHORT", "EndingVpnHigh").ok(),
            subsection: session.field_offset("nt!_MMVAD", "Subsection")?,
            control_area: session.field_offset("nt!_SUBSECTION", "ControlArea")?,
            control_area_flags: session.field_offset("nt!_CONTROL_AREA", "u")?,
            file_pointer: session.field_offset("nt!_CONTROL_AREA", "FilePointer")?,
            file_name: session.field_offset("nt!_FILE_OBJECT", "FileName")?,
        })
    }
}

fn read_vpn(session: &Session, core: u64, low: u64, high: Option<u64>) -> Result<u64> {
    let mem = session.memory();
    let low = mem.read_u32(core + low)? as u64;
    let high = match high {
        Some(offset) => mem.read_u8(core + offset)? as u64,
        None => 0,
    };
    Ok(high << 32 | low)
}

/// File object and name behind a mapped-file VAD.
fn mapped_file(session: &Session, offsets: &VadOffsets, node: u64) -> Result<Option<(u64, String)>> {
    let subsection = session.read_pointer(node + offsets.subsection)?;
    if subsection == 0 {
        return Ok(None);
    }
    let control_area = session.read_pointer(subsection + offsets.control_area)?;
    if control_area == 0 {
        return Ok(None);
    }
    let flags = session.memory().read_u32(control_area + offsets.control_area_flags)?;
    if flags & CONTROL_AREA_FILE == 0 {
        return Ok(None);
    }
    let file_object = session.read_pointer(control_area + offsets.file_pointer)? & !FAST_REF_MASK;
    if file_object == 0 {
        return Ok(None);
    }
    let name = read_unicode_string(session.memory(), file_object + offsets.file_name, session.bitness()?)?;
    Ok(Some((file_object, name)))
}

fn read_vad(session: &Session, offsets: &VadOffsets, node: u64) -> Result<VadEntry> {
    let core = node + offsets.core;
    let start_vpn = read_vpn(session, core, offsets.starting_vpn, offsets.starting_vpn_high)?;
    let end_vpn = read_vpn(session, core, offsets.ending_vpn, offsets.ending_vpn_high)?;

    let file = match mapped_file(session, offsets, node) {
        Ok(file) => file,
        Err(e) => {
            debug!("VAD {:#x}: no file information: {}", node, e);
            None
        }
    };
    Ok(VadEntry {
        node,
        start: start_vpn << PAGE_SHIFT,
        end: (end_vpn + 1) << PAGE_SHIFT,
        file_object: file.as_ref().map(|(object, _)| *object),
        file_name: file.map(|(_, name)| name),
    })
}

/// Every VAD of the process at `eprocess`, sorted by start address.
pub fn list_vads(session: &Session, eprocess: u64) -> Result<Vec<VadEntry>> {
    let bitness = session.bitness()?;
    let root_field = eprocess
        + session.field_offset("nt!_EPROCESS", "VadRoot")?
        + session.field_offset("nt!_RTL_AVL_TREE", "Root")?;
    let node = session.read_pointer(root_field)?;
    if node == 0 {
        return Ok(Vec::new());
    }

    let mem = session.memory();
    let shape = NodeShape::balanced_node(session)?;
    let root = tree::move_to_root(mem, node, &shape, bitness)?;
    let offsets = VadOffsets::load(session)?;

    let mut vads = Vec::new();
    for event in tree::walk(mem, root, &shape, bitness) {
        match event {
            TreeEvent::Visit(visit) => vads.push(read_vad(session, &offsets, visit.node)?),
            TreeEvent::Duplicate { address } => warn!("VAD node {:#x} linked twice", address),
            TreeEvent::Unreadable { address } => warn!("VAD node {:#x} unreadable", address),
        }
    }
    vads.sort_by_key(|v| v.start);
    Ok(vads)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockTarget;

    const EPROCESS: u64 = 0xffff_a000_0000_1000;

    fn target() -> MockTarget {
        let mut mock = MockTarget::new();
        for (t, f, o) in [
            ("_EPROCESS", "VadRoot", 0x7d8),
            ("_RTL_AVL_TREE", "Root", 0),
            ("_RTL_BALANCED_NODE", "Left", 0),
            ("_RTL_BALANCED_NODE", "Right", 8),
            ("_RTL_BALANCED_NODE", "ParentValue", 0x10),
            ("_MMVAD", "Core", 0),
            ("_MMVAD_SHORT", "StartingVpn", 0x18),
            ("_MMVAD_SHORT", "EndingVpn", 0x1c),
            ("_MMVAD_SHORT", "StartingVpnHigh", 0x20),
            ("_MMVAD_SHORT", "EndingVpnHigh", 0x21),
            ("_MMVAD", "Subsection", 0x48),
            ("_SUBSECTION", "ControlArea", 0),
            ("_CONTROL_AREA", "u", 0x38),
            ("_CONTROL_AREA", "FilePointer", 0x40),
            ("_FILE_OBJECT", "FileName", 0x58),
        ] {
            mock.add_field(t, f, o);
        }
        mock
    }

    fn vad(mock: &mut MockTarget, at: u64, parent: u64, left: u64, right: u64, start: u64, end: u64) {
        mock.write_u64(at, left);
        mock.write_u64(at + 8, right);
        mock.write_u64(at + 0x10, parent | 1);
        mock.write_u32(at + 0x18, start as u32);
        mock.write_u32(at + 0x1c, end as u32);
        mock.write_virtual(at + 0x20, &[(start >> 32) as u8, (end >> 32) as u8]);
    }

    #[test]
    fn test_vads_sorted_with_file() {
        let mut mock = target();
        let (a, b, c) = (0xffff_a000_0000_2000, 0xffff_a000_0000_2100, 0xffff_a000_0000_2200);
        vad(&mut mock, a, 0, b, c, 0x7ff6_0000, 0x7ff6_0010);
        vad(&mut mock, b, a, 0, 0, 0x10, 0x1f);
        vad(&mut mock, c, a, 0, 0, 0x7_ffe0, 0x7_ffe0);
        // The tree root field points at a leaf; the walk climbs to `a`.
        mock.write_u64(EPROCESS + 0x7d8, c);

        // `a` maps a file through subsection -> control area -> file object.
        let subsection = 0xffff_a000_0000_3000;
        let control_area = 0xffff_a000_0000_3100;
        let file_object = 0xffff_a000_0000_3200;
        mock.write_u64(a + 0x48, subsection);
        mock.write_u64(subsection, control_area);
        mock.write_u32(control_area + 0x38, 0x80);
        mock.write_u64(control_area + 0x40, file_object | 0x7);
        let name: Vec<u8> = r"\Windows\notepad.exe".encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
        mock.write_u16(file_object + 0x58, name.len() as u16);
        mock.write_u16(file_object + 0x5a, name.len() as u16);
        mock.write_u64(file_object + 0x60, 0xffff_a000_0000_4000);
        mock.write_virtual(0xffff_a000_0000_4000, &name);

        let session = mock.into_session();
        let vads = list_vads(&session, EPROCESS).unwrap();
        assert_eq!(vads.len(), 3);
        assert_eq!(vads[0].start, 0x10000);
        assert_eq!(vads[0].end, 0x20000);
        assert_eq!(vads[1].start, 0x7ffe0000);
        assert_eq!(vads[2].node, a);
        assert_eq!(vads[2].end, 0x7ff6_0011_000);
        assert_eq!(vads[2].file_name.as_deref(), Some(r"\Windows\notepad.exe"));

        let mut out = String::new();
        vads[2].render(2, &mut out).unwrap();
        assert_eq!(
            out,
            "   2 ffffa000`00002000 00000007`ff600000 00000007`ff611000 ffffa000`00003200 \\Windows\\notepad.exe\n"
        );
        out.clear();
        vads[0].render(0, &mut out).unwrap();
        assert_eq!(out, "   0 ffffa000`00002100 00010000 00020000\n");
    }

    #[test]
    fn test_empty_tree() {
        let session = {
            let mut mock = target();
            mock.write_u64(EPROCESS + 0x7d8, 0);
            mock.into_session()
        };
        assert!(list_vads(&session, EPROCESS).unwrap().is_empty());
    }

    #[test]
    fn test_missing_layout_is_an_error() {
        let mut mock = MockTarget::new();
        mock.write_u64(EPROCESS, 0x1000);
        let session = mock.into_session();
        assert!(list_vads(&session, EPROCESS).is_err());
    }
}
