//! Textual command surface.
//!
//! A command line is a name followed by whitespace-separated arguments. A
//! command with a missing required argument does nothing. Any other failure
//! is logged and ends that command; the session stays usable for the next.

use crate::decode::Bitness;
use crate::error::{Error, Result};
use crate::nt;
use crate::paging::{self, PagingTranslator, Resolution};
use crate::pe::{self, ImportFilter, PeImage};
use crate::session::Session;
use crate::tree::{self, NodeShape};
use serde::Serialize;
use std::fmt::Write;
use tracing::{debug, warn};

/// Available commands: (name, arguments, description).
pub const COMMANDS: &[(&str, &str, &str)] = &[
    ("cfg", "<ImageBase>", "dump GuardCFFunctionTable"),
    ("delay", "<ImageBase> [* | <Module>]", "display delay-load import table"),
    ("dt", "<RTL_SPLAY_LINKS*>", "dump splay tree"),
    ("ex", "<ImageBase> [<Code Address>]", "display SEH info"),
    ("ext", "<ImageBase>", "display export table"),
    ("help", "", "show this list"),
    ("imp", "<ImageBase> [* | <Module>]", "display import table"),
    ("ntvad", "<EPROCESS*>", "display VAD tree"),
    ("proc", "", "display loaded modules of the current process"),
    ("sec", "<ImageBase>", "display section table"),
    ("ts", "[-all]", "display TEB and TLS pointers"),
    ("v2p", "<VirtAddr> [<DirBase>] [32 | PAE]", "paging translation"),
    ("ver", "<ImageBase>", "display version info"),
];

pub fn help(out: &mut dyn Write) -> Result<()> {
    for (name, args, description) in COMMANDS {
        let synopsis = format!("{} {}", name, args);
        writeln!(out, "{:<40} - {}", synopsis.trim_end(), description)?;
    }
    Ok(())
}

/// Run one command line. Returns false when the command failed; the
/// failure has already been logged.
pub fn run(session: &Session, line: &str, json: bool, out: &mut dyn Write) -> bool {
    let mut words = line.split_whitespace();
    let Some(name) = words.next() else {
        return true;
    };
    let args: Vec<&str> = words.collect();
    match execute(session, name, &args, json, out) {
        Ok(()) => true,
        Err(e) => {
            warn!("{}: {}", name, e);
            false
        }
    }
}

pub fn execute(session: &Session, name: &str, args: &[&str], json: bool, out: &mut dyn Write) -> Result<()> {
    debug!("Command {} {:?}", name, args);
    match name {
        "help" => help(out),
        "ver" => with_image(session, args, |image| {
            let info = pe::resource::get_version(image);
            if json {
                emit_json(&info, out)
            } else {
                info.render(out)?;
                Ok(())
            }
        }),
        "imp" => with_image(session, args, |image| {
            pe::dump_import_table(image, &ImportFilter::parse(args.get(1).copied()), out)
        }),
        "delay" => with_image(session, args, |image| {
            pe::dump_delay_import_table(image, &ImportFilter::parse(args.get(1).copied()), out)
        }),
        "ext" => with_image(session, args, |image| pe::dump_export_table(image, out)),
        "sec" => with_image(session, args, |image| image.dump_section_table(out)),
        "cfg" => with_image(session, args, |image| pe::load_config::dump_load_config(image, out)),
        "ex" => {
            let filter_pc = match args.get(1) {
                Some(pc) => session.evaluate(pc)?,
                None => 0,
            };
            with_image(session, args, |image| {
                pe::exception::dump_exception_records(image, filter_pc, out)
            })
        }
        "v2p" => virtual_to_physical(session, args, json, out),
        "dt" => dump_tree(session, args, json, out),
        "ntvad" => {
            let Some(eprocess) = args.first() else {
                return Ok(());
            };
            let eprocess = session.evaluate(eprocess)?;
            if eprocess == 0 {
                return Ok(());
            }
            let vads = nt::list_vads(session, eprocess)?;
            if json {
                return emit_json(&vads, out);
            }
            for (index, vad) in vads.iter().enumerate() {
                vad.render(index, out)?;
            }
            Ok(())
        }
        "proc" => {
            let modules = nt::list_modules(session)?;
            if json {
                return emit_json(&modules, out);
            }
            let bitness = session.bitness()?;
            for module in &modules {
                module.render(bitness, out)?;
            }
            Ok(())
        }
        "ts" => {
            let all = args.first().is_some_and(|a| a.eq_ignore_ascii_case("-all"));
            let threads = if all {
                nt::all_threads_tls(session)
            } else {
                vec![nt::current_thread_tls(session)?]
            };
            if json {
                return emit_json(&threads, out);
            }
            for tls in &threads {
                tls.render(all, out)?;
            }
            Ok(())
        }
        _ => Err(Error::unsupported(format!("unknown command '{}'", name))),
    }
}

/// Load the image whose base is the first argument and hand it to `f`.
fn with_image<F>(session: &Session, args: &[&str], f: F) -> Result<()>
where
    F: FnOnce(&PeImage<'_>) -> Result<()>,
{
    let Some(base) = args.first() else {
        return Ok(());
    };
    let base = session.evaluate(base)?;
    let image = PeImage::load(session, base)?;
    f(&image)
}

/// Addresses typed for a 32-bit target must not pick up sign extension.
fn truncate_for_target(session: &Session, address: u64) -> u64 {
    if session.target().bitness == Some(Bitness::Bit64) {
        address
    } else {
        address & 0xffff_ffff
    }
}

fn virtual_to_physical(session: &Session, args: &[&str], json: bool, out: &mut dyn Write) -> Result<()> {
    let Some(va) = args.first() else {
        return Ok(());
    };
    let va = truncate_for_target(session, session.evaluate(va)?);
    let translator = match args.get(1) {
        Some(dir_base) => {
            let dir_base = session.evaluate(dir_base)?;
            let pae = args.get(2).is_some_and(|a| a.eq_ignore_ascii_case("PAE"));
            PagingTranslator::with_dir_base(session, dir_base, pae)?
        }
        None => PagingTranslator::from_registers(session)?,
    };
    let translation = translator.translate(session.memory(), va);
    if json {
        emit_json(&translation, out)?;
    } else {
        paging::render_translation(&translation, out)?;
    }
    match translation.resolution {
        Resolution::ReadFailed { reason, .. } => Err(Error::Translation { address: va, reason }),
        Resolution::Mapped { .. } | Resolution::NotPresent { .. } => Ok(()),
    }
}

fn dump_tree(session: &Session, args: &[&str], json: bool, out: &mut dyn Write) -> Result<()> {
    let Some(root) = args.first() else {
        return Ok(());
    };
    let root = truncate_for_target(session, session.evaluate(root)?);
    if root == 0 {
        return Ok(());
    }
    let events = tree::walk(session.memory(), root, &NodeShape::SplayLinks, session.bitness()?);
    if json {
        return emit_json(&events, out);
    }
    for event in &events {
        tree::render_event(event, out)?;
    }
    Ok(())
}

fn emit_json<T: Serialize + ?Sized>(value: &T, out: &mut dyn Write) -> Result<()> {
    writeln!(out, "{}", serde_json::to_string_pretty(value)?)?;
    Ok(())
}
