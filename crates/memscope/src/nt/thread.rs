//! Thread environment blocks and their TLS slot arrays.

use crate::address::Address;
use crate::error::{Error, Result};
use crate::memory::{Machine, ThreadInfo};
use crate::session::Session;
use serde::Serialize;
use std::fmt::{self, Write};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ThreadTls {
    pub index: u32,
    pub tid: u32,
    pub teb: u64,
    /// `ThreadLocalStoragePointer`.
    pub tls_head: u64,
}

impl ThreadTls {
    pub fn render(&self, with_thread: bool, out: &mut dyn Write) -> fmt::Result {
        if with_thread {
            write!(out, "{:2}:{:04x} ", self.index, self.tid)?;
        }
        writeln!(out, "TEB {} TLSHEAD {}", Address(self.teb), Address(self.tls_head))
    }
}

/// TEB of `thread` as the debuggee's effective processor sees it. Under
/// WOW64 the native TEB's first pointer leads to the 32-bit TEB.
fn effective_teb(session: &Session, thread: &ThreadInfo) -> Result<u64> {
    if session.processor_types().is_wow64() {
        session.read_pointer(thread.teb)
    } else {
        Ok(thread.teb)
    }
}

pub fn thread_tls(session: &Session, thread: &ThreadInfo) -> Result<ThreadTls> {
    let teb = effective_teb(session, thread)?;
    let tls_head = if session.processor_types().effective == Machine::Amd64 {
        session.read_pointer(teb + session.field_offset("ntdll!_TEB", "ThreadLocalStoragePointer")?)?
    } else {
        let offset = session.field_offset("ntdll!_TEB32", "ThreadLocalStoragePointer")?;
        session.memory().read_u32(teb + offset)? as u64
    };
    Ok(ThreadTls {
        index: thread.index,
        tid: thread.tid,
        teb,
        tls_head,
    })
}

pub fn current_thread_tls(session: &Session) -> Result<ThreadTls> {
    let thread = session
        .debuggee()
        .current_thread()
        .ok_or_else(|| Error::unsupported("no current thread"))?;
    thread_tls(session, &thread)
}

/// One record per thread. Threads whose TEB cannot be read are skipped.
pub fn all_threads_tls(session: &Session) -> Vec<ThreadTls> {
    session
        .debuggee()
        .threads()
        .iter()
        .filter_map(|thread| match thread_tls(session, thread) {
            Ok(tls) => Some(tls),
            Err(e) => {
                warn!("Thread {:#x}: {}", thread.tid, e);
                None
            }
        })
        .collect()
}
