//! Page-table entry bit layout.
//!
//! One raw 64-bit value covers every entry kind; 32-bit paging entries are
//! read as 4 bytes and zero-extended. The frame accessors differ per kind
//! and are only meaningful when [`PageEntry::present`] is set.

use serde::Serialize;

const PRESENT: u64 = 1 << 0;
const WRITABLE: u64 = 1 << 1;
const USER: u64 = 1 << 2;
const WRITE_THROUGH: u64 = 1 << 3;
const CACHE_DISABLE: u64 = 1 << 4;
const ACCESSED: u64 = 1 << 5;
const DIRTY: u64 = 1 << 6;
const PAGE_SIZE: u64 = 1 << 7;
const GLOBAL: u64 = 1 << 8;
const NO_EXECUTE: u64 = 1 << 63;

/// Bits 12..51: next table, or 4 KiB frame, in 8-byte entries.
const FRAME_4K: u64 = 0x000f_ffff_ffff_f000;
/// Bits 21..51: 2 MiB frame.
const FRAME_2M: u64 = 0x000f_ffff_ffe0_0000;
/// Bits 30..51: 1 GiB frame.
const FRAME_1G: u64 = 0x000f_ffff_c000_0000;
/// Bits 12..31: next table or 4 KiB frame in 32-bit paging.
const LEGACY_FRAME_4K: u64 = 0xffff_f000;
/// Bits 22..31: low part of a 4 MiB frame.
const LEGACY_FRAME_4M: u64 = 0xffc0_0000;

/// Which permission bits an entry kind carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryFormat {
    /// 4-byte entries of 32-bit paging: no execute-disable bit.
    Legacy,
    /// PAE page-directory-pointer entries: only the cache-control bits.
    PaePdpt,
    /// All other 8-byte entries.
    Long,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct PageEntry(pub u64);

impl PageEntry {
    pub fn present(self) -> bool {
        self.0 & PRESENT != 0
    }

    pub fn writable(self) -> bool {
        self.0 & WRITABLE != 0
    }

    pub fn user(self) -> bool {
        self.0 & USER != 0
    }

    pub fn write_through(self) -> bool {
        self.0 & WRITE_THROUGH != 0
    }

    pub fn cache_disable(self) -> bool {
        self.0 & CACHE_DISABLE != 0
    }

    pub fn accessed(self) -> bool {
        self.0 & ACCESSED != 0
    }

    pub fn dirty(self) -> bool {
        self.0 & DIRTY != 0
    }

    /// PS bit: the entry maps a large page instead of pointing at a table.
    pub fn large(self) -> bool {
        self.0 & PAGE_SIZE != 0
    }

    pub fn global(self) -> bool {
        self.0 & GLOBAL != 0
    }

    pub fn no_execute(self) -> bool {
        self.0 & NO_EXECUTE != 0
    }

    pub fn table_address(self) -> u64 {
        self.0 & FRAME_4K
    }

    pub fn frame_2m(self) -> u64 {
        self.0 & FRAME_2M
    }

    pub fn frame_1g(self) -> u64 {
        self.0 & FRAME_1G
    }

    pub fn legacy_table_address(self) -> u64 {
        self.0 & LEGACY_FRAME_4K
    }

    /// 4 MiB frame: bits 22..31 plus the PSE-36 high bits 13..20 as
    /// physical bits 32..39.
    pub fn legacy_frame_4m(self) -> u64 {
        (self.0 & LEGACY_FRAME_4M) | (((self.0 >> 13) & 0xff) << 32)
    }

    /// Short token list of the entry's permission bits, each token with a
    /// leading space, or ` (inactive)` for a not-present entry.
    pub fn attributes(self, format: EntryFormat) -> String {
        if !self.present() {
            return " (inactive)".to_string();
        }
        let rwusa = format != EntryFormat::PaePdpt;
        let mut attrs = String::new();
        if rwusa {
            attrs.push_str(if self.writable() { " W" } else { " R" });
            attrs.push_str(if self.user() { " U" } else { " S" });
        }
        if self.write_through() {
            attrs.push_str(" PWT");
        }
        if self.cache_disable() {
            attrs.push_str(" PCD");
        }
        if rwusa && self.accessed() {
            attrs.push_str(" A");
        }
        if format == EntryFormat::Long && self.no_execute() {
            attrs.push_str(" XD");
        }
        attrs
    }
}
