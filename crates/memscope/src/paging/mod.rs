//! x86 / x86-64 virtual-to-physical translation.
//!
//! The translator walks the page tables in physical memory for one of the
//! four paging structures (32-bit, PAE, 4-level with or without PCID) and
//! records every entry it reads as a [`TraceStep`]. A not-present entry is a
//! normal end of the walk; a failed read of an entry is an error.

pub mod entry;
pub mod render;

use crate::decode::{load_physical, Bitness};
use crate::error::Result;
use crate::memory::{MemResult, MemoryReader};
use crate::session::Session;
use entry::{EntryFormat, PageEntry};
use serde::Serialize;
use tracing::{debug, warn};

pub use render::render_translation;

/// IA32_EFER model-specific register.
pub const MSR_EFER: u32 = 0xC000_0080;

const CR0_PG: u64 = 1 << 31;
const CR4_PAE: u64 = 1 << 5;
const CR4_PCIDE: u64 = 1 << 17;
const EFER_LME: u64 = 1 << 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PagingMode {
    /// Paging off: virtual equals physical.
    Disabled,
    Bit32,
    Pae,
    FourLevel,
    FourLevelPcid,
}

impl PagingMode {
    pub fn label(self) -> &'static str {
        match self {
            PagingMode::Disabled => "None",
            PagingMode::Bit32 => "32-bit",
            PagingMode::Pae => "PAE",
            PagingMode::FourLevel => "4-level",
            PagingMode::FourLevelPcid => "4-level (with PCID)",
        }
    }

    /// Combine the control-register bits in architectural priority order.
    pub fn from_control_bits(pg: bool, pae: bool, lme: bool, pcide: bool) -> Self {
        if !pg {
            PagingMode::Disabled
        } else if !pae {
            PagingMode::Bit32
        } else if !lme {
            PagingMode::Pae
        } else if pcide {
            PagingMode::FourLevelPcid
        } else {
            PagingMode::FourLevel
        }
    }

    /// Table levels a walk reads, top first.
    pub fn levels(self) -> &'static [Level] {
        match self {
            PagingMode::Disabled => &[],
            PagingMode::Bit32 => &[Level::Pd, Level::Pt],
            PagingMode::Pae => &[Level::Pdpt, Level::Pd, Level::Pt],
            PagingMode::FourLevel | PagingMode::FourLevelPcid => {
                &[Level::Pml4, Level::Pdpt, Level::Pd, Level::Pt]
            }
        }
    }

    /// Directory base bits of CR3 for this mode.
    pub fn dir_base_from_cr3(self, cr3: u64) -> u64 {
        match self {
            PagingMode::Disabled => 0,
            PagingMode::Bit32 => cr3 & 0xffff_f000,
            PagingMode::Pae => cr3 & 0xffff_ffe0,
            PagingMode::FourLevel | PagingMode::FourLevelPcid => cr3 & 0x000f_ffff_ffff_f000,
        }
    }
}

/// Raw register values for mode inference.
#[derive(Debug, Clone, Copy)]
pub struct ControlRegisters {
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    /// `None` when the MSR could not be read.
    pub efer: Option<u64>,
}

/// Table level an entry was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Level {
    Pml4,
    Pdpt,
    Pd,
    Pt,
}

impl Level {
    pub fn name(self) -> &'static str {
        match self {
            Level::Pml4 => "PML4E",
            Level::Pdpt => "PDPTE",
            Level::Pd => "PDE",
            Level::Pt => "PTE",
        }
    }
}

/// One entry read during a walk.
#[derive(Debug, Clone, Serialize)]
pub struct TraceStep {
    pub level: Level,
    pub table: u64,
    pub index: u32,
    pub entry: PageEntry,
    pub present: bool,
    pub attributes: String,
}

/// Page shape that produced a physical address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Mapping {
    Identity,
    Legacy4K,
    Legacy4M,
    Pae4K,
    Pae2M,
    Long4K,
    Long2M,
    Long1G,
}

impl Mapping {
    pub fn page_size(self) -> u64 {
        match self {
            Mapping::Identity | Mapping::Legacy4K | Mapping::Pae4K | Mapping::Long4K => 0x1000,
            Mapping::Legacy4M => 0x40_0000,
            Mapping::Pae2M | Mapping::Long2M => 0x20_0000,
            Mapping::Long1G => 0x4000_0000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Resolution {
    Mapped { physical: u64, mapping: Mapping },
    /// The walk stopped at a not-present entry of `level`.
    NotPresent { level: Level },
    /// The entry of `level` could not be read; the trace holds the steps
    /// before it.
    ReadFailed { level: Level, reason: String },
}

/// A full report for one address: setup, steps and outcome.
#[derive(Debug, Clone, Serialize)]
pub struct Translation {
    pub virtual_address: u64,
    pub mode: PagingMode,
    /// Mode came from the caller's hint rather than the registers.
    pub assumed: bool,
    pub dir_base: u64,
    pub trace: Vec<TraceStep>,
    pub resolution: Resolution,
}

#[derive(Debug, Clone, Copy)]
pub struct PagingTranslator {
    mode: PagingMode,
    dir_base: u64,
    assumed: bool,
}

impl PagingTranslator {
    pub fn new(mode: PagingMode, dir_base: u64) -> Self {
        PagingTranslator {
            mode,
            dir_base,
            assumed: false,
        }
    }

    /// Explicit directory base. The target's pointer width picks 4-level
    /// paging, otherwise `pae_hint` picks PAE over 32-bit.
    pub fn with_dir_base(session: &Session, dir_base: u64, pae_hint: bool) -> Result<Self> {
        let mode = match session.bitness()? {
            Bitness::Bit64 => PagingMode::FourLevel,
            Bitness::Bit32 if pae_hint => PagingMode::Pae,
            Bitness::Bit32 => PagingMode::Bit32,
        };
        debug!("Assuming paging mode {} with DirBase {:#x}", mode.label(), dir_base);
        Ok(PagingTranslator {
            mode,
            dir_base,
            assumed: true,
        })
    }

    /// Infer the mode from CR0, CR3, CR4 and IA32_EFER.
    pub fn from_registers(session: &Session) -> Result<Self> {
        let regs = ControlRegisters {
            cr0: session.evaluate("@cr0")?,
            cr3: session.evaluate("@cr3")?,
            cr4: session.evaluate("@cr4")?,
            efer: session.debuggee().read_msr(MSR_EFER),
        };
        let pointer_64 = session.target().bitness == Some(Bitness::Bit64);
        Ok(Self::from_control_registers(regs, pointer_64))
    }

    /// Mode inference from already-read register values. A missing EFER
    /// assumes long mode matches the target's pointer width.
    pub fn from_control_registers(regs: ControlRegisters, pointer_64: bool) -> Self {
        let lme = match regs.efer {
            Some(efer) => efer & EFER_LME != 0,
            None => {
                warn!(
                    "IA32_EFER unavailable, assuming LME={} from target pointer width",
                    pointer_64 as u8
                );
                pointer_64
            }
        };
        let mode = PagingMode::from_control_bits(
            regs.cr0 & CR0_PG != 0,
            regs.cr4 & CR4_PAE != 0,
            lme,
            regs.cr4 & CR4_PCIDE != 0,
        );
        Self::new(mode, mode.dir_base_from_cr3(regs.cr3))
    }

    pub fn mode(&self) -> PagingMode {
        self.mode
    }

    pub fn dir_base(&self) -> u64 {
        self.dir_base
    }

    pub fn is_assumed(&self) -> bool {
        self.assumed
    }

    fn lookup(
        &self,
        mem: &dyn MemoryReader,
        level: Level,
        table: u64,
        index: u64,
        format: EntryFormat,
        trace: &mut Vec<TraceStep>,
    ) -> MemResult<PageEntry> {
        let entry = match format {
            EntryFormat::Legacy => PageEntry(load_physical::<u32>(mem, table + index * 4)? as u64),
            EntryFormat::PaePdpt | EntryFormat::Long => {
                PageEntry(load_physical::<u64>(mem, table + index * 8)?)
            }
        };
        trace.push(TraceStep {
            level,
            table,
            index: index as u32,
            entry,
            present: entry.present(),
            attributes: entry.attributes(format),
        });
        Ok(entry)
    }

    /// Walk the tables for `va`, appending each entry read to `trace`.
    ///
    /// On a read failure the error is returned and `trace` keeps the steps
    /// that completed before it.
    pub fn walk(
        &self,
        mem: &dyn MemoryReader,
        va: u64,
        trace: &mut Vec<TraceStep>,
    ) -> MemResult<Resolution> {
        use EntryFormat::{Legacy, Long, PaePdpt};

        match self.mode {
            PagingMode::Disabled => Ok(Resolution::Mapped {
                physical: va,
                mapping: Mapping::Identity,
            }),

            PagingMode::Bit32 => {
                let pde = self.lookup(mem, Level::Pd, self.dir_base, (va >> 22) & 0x3ff, Legacy, trace)?;
                if !pde.present() {
                    return Ok(Resolution::NotPresent { level: Level::Pd });
                }
                if pde.large() {
                    return Ok(Resolution::Mapped {
                        physical: pde.legacy_frame_4m() | (va & 0x3f_ffff),
                        mapping: Mapping::Legacy4M,
                    });
                }
                let pte = self.lookup(mem, Level::Pt, pde.legacy_table_address(), (va >> 12) & 0x3ff, Legacy, trace)?;
                if !pte.present() {
                    return Ok(Resolution::NotPresent { level: Level::Pt });
                }
                Ok(Resolution::Mapped {
                    physical: pte.legacy_table_address() | (va & 0xfff),
                    mapping: Mapping::Legacy4K,
                })
            }

            PagingMode::Pae => {
                let pdpte = self.lookup(mem, Level::Pdpt, self.dir_base, (va >> 30) & 0x3, PaePdpt, trace)?;
                if !pdpte.present() {
                    return Ok(Resolution::NotPresent { level: Level::Pdpt });
                }
                let pde = self.lookup(mem, Level::Pd, pdpte.table_address(), (va >> 21) & 0x1ff, Long, trace)?;
                if !pde.present() {
                    return Ok(Resolution::NotPresent { level: Level::Pd });
                }
                if pde.large() {
                    return Ok(Resolution::Mapped {
                        physical: pde.frame_2m() | (va & 0x1f_ffff),
                        mapping: Mapping::Pae2M,
                    });
                }
                let pte = self.lookup(mem, Level::Pt, pde.table_address(), (va >> 12) & 0x1ff, Long, trace)?;
                if !pte.present() {
                    return Ok(Resolution::NotPresent { level: Level::Pt });
                }
                Ok(Resolution::Mapped {
                    physical: pte.table_address() | (va & 0xfff),
                    mapping: Mapping::Pae4K,
                })
            }

            PagingMode::FourLevel | PagingMode::FourLevelPcid => {
                let pml4e = self.lookup(mem, Level::Pml4, self.dir_base, (va >> 39) & 0x1ff, Long, trace)?;
                if !pml4e.present() {
                    return Ok(Resolution::NotPresent { level: Level::Pml4 });
                }
                let pdpte = self.lookup(mem, Level::Pdpt, pml4e.table_address(), (va >> 30) & 0x1ff, Long, trace)?;
                if !pdpte.present() {
                    return Ok(Resolution::NotPresent { level: Level::Pdpt });
                }
                if pdpte.large() {
                    return Ok(Resolution::Mapped {
                        physical: pdpte.frame_1g() | (va & 0x3fff_ffff),
                        mapping: Mapping::Long1G,
                    });
                }
                let pde = self.lookup(mem, Level::Pd, pdpte.table_address(), (va >> 21) & 0x1ff, Long, trace)?;
                if !pde.present() {
                    return Ok(Resolution::NotPresent { level: Level::Pd });
                }
                if pde.large() {
                    return Ok(Resolution::Mapped {
                        physical: pde.frame_2m() | (va & 0x1f_ffff),
                        mapping: Mapping::Long2M,
                    });
                }
                let pte = self.lookup(mem, Level::Pt, pde.table_address(), (va >> 12) & 0x1ff, Long, trace)?;
                if !pte.present() {
                    return Ok(Resolution::NotPresent { level: Level::Pt });
                }
                Ok(Resolution::Mapped {
                    physical: pte.table_address() | (va & 0xfff),
                    mapping: Mapping::Long4K,
                })
            }
        }
    }

    /// Walk `va` and package the result as a report. A read failure is
    /// kept in the report with the partial trace.
    pub fn translate(&self, mem: &dyn MemoryReader, va: u64) -> Translation {
        let mut trace = Vec::new();
        let resolution = match self.walk(mem, va, &mut trace) {
            Ok(resolution) => resolution,
            Err(e) => {
                warn!("Page walk for {:#x} aborted: {}", va, e);
                // Every completed lookup pushed one step, so the failed
                // level is the one after the last step.
                let level = self
                    .mode
                    .levels()
                    .get(trace.len())
                    .copied()
                    .unwrap_or(Level::Pt);
                Resolution::ReadFailed {
                    level,
                    reason: e.to_string(),
                }
            }
        };
        Translation {
            virtual_address: va,
            mode: self.mode,
            assumed: self.assumed,
            dir_base: self.dir_base,
            trace,
            resolution,
        }
    }

    /// Physical address of `va`, `None` when a level is not present.
    pub fn resolve(&self, mem: &dyn MemoryReader, va: u64) -> MemResult<Option<u64>> {
        let mut trace = Vec::with_capacity(4);
        match self.walk(mem, va, &mut trace)? {
            Resolution::Mapped { physical, .. } => Ok(Some(physical)),
            Resolution::NotPresent { .. } | Resolution::ReadFailed { .. } => Ok(None),
        }
    }
}
