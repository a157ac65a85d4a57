//! Windows NT structure walkers: process VADs, the loader module list and
//! per-thread TLS pointers. Every layout detail comes from the session's
//! field offsets, so the walkers follow whatever build the symbols describe.

pub mod modules;
pub mod thread;
pub mod vad;

pub use modules::{list_modules, ModuleEntry};
pub use thread::{all_threads_tls, current_thread_tls, ThreadTls};
pub use vad::{list_vads, VadEntry};
