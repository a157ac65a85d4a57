//! Per-target analysis context.
//!
//! A [`Session`] bundles the three collaborators with the state that is
//! stable for the lifetime of one debugging session: field offsets looked up
//! by name and the processor/pointer-width facts about the target. Both are
//! filled lazily on first use and never invalidated.

use crate::address::Address;
use crate::decode::Bitness;
use crate::error::{Error, Result};
use crate::memory::{Debuggee, MemoryReader, ProcessorTypes, SymbolResolver};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tracing::debug;

/// Target facts that are read once.
#[derive(Debug, Clone, Copy)]
pub struct TargetInfo {
    /// `None` when the target could not report its pointer width.
    pub bitness: Option<Bitness>,
    pub processor: ProcessorTypes,
}

pub struct Session {
    memory: Arc<dyn MemoryReader>,
    symbols: Arc<dyn SymbolResolver>,
    debuggee: Arc<dyn Debuggee>,
    field_offsets: Mutex<HashMap<(String, String), u32>>,
    target: OnceLock<TargetInfo>,
}

impl Session {
    pub fn new(
        memory: Arc<dyn MemoryReader>,
        symbols: Arc<dyn SymbolResolver>,
        debuggee: Arc<dyn Debuggee>,
    ) -> Self {
        Session {
            memory,
            symbols,
            debuggee,
            field_offsets: Mutex::new(HashMap::new()),
            target: OnceLock::new(),
        }
    }

    pub fn memory(&self) -> &dyn MemoryReader {
        self.memory.as_ref()
    }

    pub fn symbols(&self) -> &dyn SymbolResolver {
        self.symbols.as_ref()
    }

    pub fn debuggee(&self) -> &dyn Debuggee {
        self.debuggee.as_ref()
    }

    pub fn target(&self) -> TargetInfo {
        *self.target.get_or_init(|| {
            let info = TargetInfo {
                bitness: self.debuggee.is_pointer_64bit().map(Bitness::from_pointer_64bit),
                processor: self.debuggee.processor_types(),
            };
            debug!("Target: {:?}", info);
            info
        })
    }

    /// Pointer width of the target. Fails when the target cannot tell.
    pub fn bitness(&self) -> Result<Bitness> {
        self.target()
            .bitness
            .ok_or_else(|| Error::unsupported("target pointer width unknown"))
    }

    pub fn processor_types(&self) -> ProcessorTypes {
        self.target().processor
    }

    /// Offset of `type_name.field`, cached after the first successful lookup.
    pub fn field_offset(&self, type_name: &str, field: &str) -> Result<u64> {
        let key = (type_name.to_string(), field.to_string());
        if let Some(offset) = self.field_offsets.lock().get(&key) {
            return Ok(*offset as u64);
        }
        let offset = self
            .symbols
            .field_offset(type_name, field)
            .ok_or_else(|| Error::MissingField {
                type_name: type_name.to_string(),
                field: field.to_string(),
            })?;
        self.field_offsets.lock().insert(key, offset);
        Ok(offset as u64)
    }

    pub fn evaluate(&self, expression: &str) -> Result<u64> {
        self.debuggee
            .evaluate(expression)
            .ok_or_else(|| Error::Evaluate(expression.to_string()))
    }

    /// Target-width pointer read, sign-extended on 32-bit targets.
    pub fn read_pointer(&self, address: u64) -> Result<u64> {
        Ok(self.memory.read_pointer(address, self.bitness()?)?)
    }

    /// `name+0xdisp`, `name` for an exact hit, or empty when unknown.
    pub fn symbolize(&self, address: u64) -> String {
        match self.symbols.resolve(address) {
            Some((name, 0)) => name,
            Some((name, disp)) => format!("{}+0x{:x}", name, disp),
            None => String::new(),
        }
    }

    /// Address followed by its symbol, if any.
    pub fn annotate(&self, address: u64) -> String {
        let symbol = self.symbolize(address);
        if symbol.is_empty() {
            Address(address).to_string()
        } else {
            format!("{} {}", Address(address), symbol)
        }
    }
}
