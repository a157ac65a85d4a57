pub mod error;
pub mod layers;
pub mod traits;
pub mod virtual_memory;

pub use error::{AddressSpace, MemError, MemResult};
pub use traits::{
    Debuggee, Machine, MemoryLayer, MemoryReader, ProcessorTypes, SymbolResolver, ThreadInfo,
};
