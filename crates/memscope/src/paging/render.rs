//! Text report for a translation.

use super::{Mapping, PagingMode, Resolution, TraceStep, Translation};
use crate::address::Address;
use std::fmt::{self, Write};

pub fn render_step(step: &TraceStep, out: &mut dyn Write) -> fmt::Result {
    writeln!(
        out,
        "{} @{:<5}-> {}{}",
        Address(step.table),
        step.index,
        Address(step.entry.0),
        step.attributes
    )
}

/// Header, one line per table entry, then the outcome.
pub fn render_translation(t: &Translation, out: &mut dyn Write) -> fmt::Result {
    writeln!(out, "Virtual address = {}", Address(t.virtual_address))?;
    if t.assumed {
        writeln!(out, "Assuming PagingMode is {}", t.mode.label())?;
    } else {
        writeln!(out, "PagingMode: {}", t.mode.label())?;
    }
    if t.assumed || t.mode != PagingMode::Disabled {
        writeln!(out, "DirBase = {}", Address(t.dir_base))?;
    }

    for step in &t.trace {
        render_step(step, out)?;
    }

    match &t.resolution {
        Resolution::Mapped { physical, mapping } => {
            match mapping {
                Mapping::Legacy4M => writeln!(out, "4MB page is enabled.")?,
                Mapping::Pae2M | Mapping::Long2M => writeln!(out, "2MB page is enabled.")?,
                Mapping::Long1G => writeln!(out, "1GB page is enabled.")?,
                Mapping::Identity | Mapping::Legacy4K | Mapping::Pae4K | Mapping::Long4K => {}
            }
            writeln!(out, "Physical Address = {}", Address(*physical))
        }
        Resolution::NotPresent { .. } => Ok(()),
        Resolution::ReadFailed { level, reason } => {
            writeln!(out, "Failed to read {} entry: {}", level.name(), reason)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paging::entry::{EntryFormat, PageEntry};
    use crate::paging::Level;

    fn step(level: Level, table: u64, index: u32, raw: u64) -> TraceStep {
        let entry = PageEntry(raw);
        TraceStep {
            level,
            table,
            index,
            entry,
            present: entry.present(),
            attributes: entry.attributes(EntryFormat::Long),
        }
    }

    #[test]
    fn test_render_two_meg_page() {
        let t = Translation {
            virtual_address: 0xfffff800_00201000,
            mode: PagingMode::FourLevel,
            assumed: false,
            dir_base: 0x1ad000,
            trace: vec![
                step(Level::Pml4, 0x1ad000, 496, 0x4063),
                step(Level::Pdpt, 0x4000, 0, 0x5063),
                step(Level::Pd, 0x5000, 1, 0x2000e3),
            ],
            resolution: Resolution::Mapped {
                physical: 0x201000,
                mapping: Mapping::Long2M,
            },
        };
        let mut out = String::new();
        render_translation(&t, &mut out).unwrap();
        assert_eq!(
            out,
            "Virtual address = fffff800`00201000\n\
             PagingMode: 4-level\n\
             DirBase = 001ad000\n\
             001ad000 @496  -> 00004063 W S A\n\
             00004000 @0    -> 00005063 W S A\n\
             00005000 @1    -> 002000e3 W S A\n\
             2MB page is enabled.\n\
             Physical Address = 00201000\n"
        );
    }

    #[test]
    fn test_render_stops_after_inactive_entry() {
        let t = Translation {
            virtual_address: 0x1000,
            mode: PagingMode::Pae,
            assumed: true,
            dir_base: 0x3000,
            trace: vec![step(Level::Pdpt, 0x3000, 0, 0)],
            resolution: Resolution::NotPresent { level: Level::Pdpt },
        };
        let mut out = String::new();
        render_translation(&t, &mut out).unwrap();
        assert_eq!(
            out,
            "Virtual address = 00001000\n\
             Assuming PagingMode is PAE\n\
             DirBase = 00003000\n\
             00003000 @0    -> 00000000 (inactive)\n"
        );
    }

    #[test]
    fn test_render_read_failure() {
        let t = Translation {
            virtual_address: 0x7ff6_1234_5678,
            mode: PagingMode::FourLevel,
            assumed: true,
            dir_base: 0x1000,
            trace: vec![step(Level::Pml4, 0x1000, 255, 0x9063)],
            resolution: Resolution::ReadFailed {
                level: Level::Pdpt,
                reason: "unmapped".to_string(),
            },
        };
        let mut out = String::new();
        render_translation(&t, &mut out).unwrap();
        assert_eq!(
            out,
            "Virtual address = 00007ff6`12345678\n\
             Assuming PagingMode is 4-level\n\
             DirBase = 00001000\n\
             00001000 @255  -> 00009063 W S A\n\
             Failed to read PDPTE entry: unmapped\n"
        );
    }

    #[test]
    fn test_render_identity() {
        let t = Translation {
            virtual_address: 0x1234,
            mode: PagingMode::Disabled,
            assumed: false,
            dir_base: 0,
            trace: Vec::new(),
            resolution: Resolution::Mapped {
                physical: 0x1234,
                mapping: Mapping::Identity,
            },
        };
        let mut out = String::new();
        render_translation(&t, &mut out).unwrap();
        assert_eq!(
            out,
            "Virtual address = 00001234\nPagingMode: None\nPhysical Address = 00001234\n"
        );
    }
}
