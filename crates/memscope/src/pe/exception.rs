//! x64 exception directory: RUNTIME_FUNCTION entries, UNWIND_INFO and
//! `__C_specific_handler` scope tables.

use super::{DirectoryKind, PeImage};
use crate::address::Address;
use crate::decode::{self, Bitness, Fields, Record};
use crate::error::Result;
use std::fmt::Write;
use tracing::debug;

pub const UNW_FLAG_EHANDLER: u8 = 0x01;
pub const UNW_FLAG_UHANDLER: u8 = 0x02;
pub const UNW_FLAG_CHAININFO: u8 = 0x04;

const C_SPECIFIC_HANDLER: &str = "__C_specific_handler";
const MAX_SCOPE_RECORDS: u32 = 100;

const REGISTERS: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12", "r13",
    "r14", "r15",
];

/// RUNTIME_FUNCTION.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeFunction {
    pub begin: u32,
    pub end: u32,
    pub unwind: u32,
}

impl Record for RuntimeFunction {
    const SIZE: usize = 12;

    fn decode(data: &[u8]) -> Self {
        let mut f = Fields::new(data);
        RuntimeFunction {
            begin: f.u32(),
            end: f.u32(),
            unwind: f.u32(),
        }
    }
}

/// Fixed UNWIND_INFO header.
#[derive(Debug, Clone, Copy)]
struct UnwindHeader {
    version: u8,
    flags: u8,
    prolog_size: u8,
    count_of_codes: u8,
    frame_register: u8,
    frame_offset: u8,
}

impl Record for UnwindHeader {
    const SIZE: usize = 4;

    fn decode(data: &[u8]) -> Self {
        let mut f = Fields::new(data);
        let version_flags = f.u8();
        let prolog_size = f.u8();
        let count_of_codes = f.u8();
        let frame = f.u8();
        UnwindHeader {
            version: version_flags & 0x7,
            flags: version_flags >> 3,
            prolog_size,
            count_of_codes,
            frame_register: frame & 0xf,
            frame_offset: frame >> 4,
        }
    }
}

/// C_SCOPE_TABLE entry.
#[derive(Debug, Clone, Copy)]
struct ScopeRecord {
    begin: u32,
    end: u32,
    handler: u32,
    jump_target: u32,
}

impl Record for ScopeRecord {
    const SIZE: usize = 16;

    fn decode(data: &[u8]) -> Self {
        let mut f = Fields::new(data);
        ScopeRecord {
            begin: f.u32(),
            end: f.u32(),
            handler: f.u32(),
            jump_target: f.u32(),
        }
    }
}

fn register(index: u16) -> &'static str {
    REGISTERS[(index & 0xf) as usize]
}

/// Render the unwind-code array, one string per operation. Operations that
/// claim more slots than the array holds end the list.
pub fn describe_unwind_codes(codes: &[u16], frame_register: u8, frame_offset: u8) -> Vec<String> {
    let mut ops = Vec::new();
    let mut i = 0;
    while i < codes.len() {
        let code = codes[i];
        let code_offset = code & 0xff;
        let op = (code >> 8) & 0xf;
        let info = code >> 12;
        let next = |n: usize| codes.get(i + n).copied();
        let far = |i: usize| -> Option<u32> {
            Some(codes.get(i + 1).copied()? as u32 | (codes.get(i + 2).copied()? as u32) << 16)
        };

        let (text, slots) = match op {
            0 => (format!("PUSH_NONVOL {}", register(info)), 1),
            1 if info == 0 => match next(1) {
                Some(size) => (format!("ALLOC_LARGE {:#x}", size as u32 * 8), 2),
                None => break,
            },
            1 => match far(i) {
                Some(size) => (format!("ALLOC_LARGE {:#x}", size), 3),
                None => break,
            },
            2 => (format!("ALLOC_SMALL {:#x}", info as u32 * 8 + 8), 1),
            3 => (
                format!(
                    "SET_FPREG {} = rsp+{:#x}",
                    register(frame_register as u16),
                    frame_offset as u32 * 16
                ),
                1,
            ),
            4 => match next(1) {
                Some(off) => (format!("SAVE_NONVOL {} [rsp+{:#x}]", register(info), off as u32 * 8), 2),
                None => break,
            },
            5 => match far(i) {
                Some(off) => (format!("SAVE_NONVOL_FAR {} [rsp+{:#x}]", register(info), off), 3),
                None => break,
            },
            6 => match next(1) {
                Some(off) => (format!("SAVE_XMM xmm{} [rsp+{:#x}]", info, off as u32 * 8), 2),
                None => break,
            },
            7 => match far(i) {
                Some(off) => (format!("SAVE_XMM_FAR xmm{} [rsp+{:#x}]", info, off), 3),
                None => break,
            },
            8 => match next(1) {
                Some(off) => (format!("SAVE_XMM128 xmm{} [rsp+{:#x}]", info, off as u32 * 16), 2),
                None => break,
            },
            9 => match far(i) {
                Some(off) => (format!("SAVE_XMM128_FAR xmm{} [rsp+{:#x}]", info, off), 3),
                None => break,
            },
            10 => (
                format!(
                    "PUSH_MACHFRAME{}",
                    if info == 1 { " (error code)" } else { "" }
                ),
                1,
            ),
            other => (format!("UNKNOWN op {}", other), 1),
        };
        ops.push(format!("[{:02x}] {}", code_offset, text));
        i += slots;
    }
    ops
}

fn dump_function(
    image: &PeImage<'_>,
    function: RuntimeFunction,
    filter_pc: u64,
    out: &mut dyn Write,
) -> Result<()> {
    let mem = image.memory();
    let session = image.session();
    let begin = image.rva(function.begin);
    writeln!(
        out,
        "{}-{} {} {}",
        Address(begin),
        Address(image.rva(function.end)),
        Address(image.rva(function.unwind)),
        session.symbolize(begin)
    )?;

    let unwind_at = image.rva(function.unwind);
    let header: UnwindHeader = decode::load(mem, unwind_at)?;
    if header.version >= 2 {
        writeln!(out, "  Unsupported unwind version {}", header.version)?;
        return Ok(());
    }
    let mut line = format!(
        "  Version {} Flags {:#x} Prolog {:#x} Codes {}",
        header.version, header.flags, header.prolog_size, header.count_of_codes
    );
    if header.frame_register != 0 {
        line.push_str(&format!(
            " Frame {}+{:#x}",
            register(header.frame_register as u16),
            header.frame_offset as u32 * 16
        ));
    }
    writeln!(out, "{}", line)?;

    let codes: Vec<u16> = decode::load_array(
        mem,
        unwind_at.wrapping_add(UnwindHeader::SIZE as u64),
        header.count_of_codes as usize,
    )?;
    for op in describe_unwind_codes(&codes, header.frame_register, header.frame_offset) {
        writeln!(out, "  {}", op)?;
    }

    // Handler RVA or chained entry follows the code array, padded to an even
    // slot count.
    let trailer = unwind_at
        .wrapping_add(UnwindHeader::SIZE as u64)
        .wrapping_add(((header.count_of_codes as u64 + 1) & !1) * 2);

    if header.flags & UNW_FLAG_CHAININFO != 0 {
        let chained: RuntimeFunction = decode::load(mem, trailer)?;
        writeln!(
            out,
            "  Chained {}-{} {}",
            Address(image.rva(chained.begin)),
            Address(image.rva(chained.end)),
            Address(image.rva(chained.unwind))
        )?;
    } else if header.flags & (UNW_FLAG_EHANDLER | UNW_FLAG_UHANDLER) != 0 {
        let handler = image.rva(mem.read_u32(trailer)?);
        writeln!(out, "  Handler {}", session.annotate(handler))?;
        let is_c_handler = matches!(
            session.symbols().resolve(handler),
            Some((name, 0)) if name.ends_with(C_SPECIFIC_HANDLER)
        );
        if is_c_handler {
            dump_scope_table(image, trailer.wrapping_add(4), filter_pc, out)?;
        }
    }
    Ok(())
}

fn dump_scope_table(image: &PeImage<'_>, at: u64, filter_pc: u64, out: &mut dyn Write) -> Result<()> {
    let mem = image.memory();
    let session = image.session();
    let count = mem.read_u32(at)?;
    if count > MAX_SCOPE_RECORDS {
        debug!("Scope table at {:#x} claims {} records", at, count);
    }
    let records: Vec<ScopeRecord> =
        decode::load_array(mem, at.wrapping_add(4), count.min(MAX_SCOPE_RECORDS) as usize)?;
    for (i, scope) in records.iter().enumerate() {
        let begin = image.rva(scope.begin);
        let end = image.rva(scope.end);
        // 1 is EXCEPTION_EXECUTE_HANDLER, not an RVA.
        let filter = if scope.handler <= 1 {
            scope.handler.to_string()
        } else {
            session.annotate(image.rva(scope.handler))
        };
        let target = if scope.jump_target == 0 {
            "-".to_string()
        } else {
            Address(image.rva(scope.jump_target)).to_string()
        };
        let hit = filter_pc != 0 && (begin..end).contains(&filter_pc);
        writeln!(
            out,
            "  Scope {} {}-{} {} {}{}",
            i,
            Address(begin),
            Address(end),
            filter,
            target,
            if hit { " *" } else { "" }
        )?;
    }
    Ok(())
}

/// Dump every function entry, or only those whose range holds `filter_pc`
/// when it is non-zero.
pub fn dump_exception_records(image: &PeImage<'_>, filter_pc: u64, out: &mut dyn Write) -> Result<()> {
    if image.bitness() != Bitness::Bit64 {
        writeln!(out, "Unsupported: x86 unwind information")?;
        return Ok(());
    }
    let dir = image.directory(DirectoryKind::Exception);
    let count = dir.size as usize / RuntimeFunction::SIZE;
    let start = image.rva(dir.virtual_address);
    let mem = image.memory();

    for i in 0..count {
        let function: RuntimeFunction = decode::load(mem, start.wrapping_add((i * RuntimeFunction::SIZE) as u64))?;
        if function.unwind == 0 {
            continue;
        }
        if filter_pc != 0 {
            let range = image.rva(function.begin)..image.rva(function.end);
            if !range.contains(&filter_pc) {
                continue;
            }
        }
        dump_function(image, function, filter_pc, out)?;
    }
    Ok(())
}
