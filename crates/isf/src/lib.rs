//! ISF (Intermediate Symbol Format) symbol tables.
//!
//! Parses the JSON-based ISF files produced for Windows kernel and user-mode
//! modules (plain `.json` or LZMA-compressed `.json.xz`) and answers the two
//! questions a memory walker needs from a symbol table:
//!
//! - where does `type.field` live inside its structure, and
//! - which symbol does an address belong to (name + displacement).
//!
//! # Example
//!
//! ```rust,ignore
//! use isf::parse_isf_file;
//!
//! let symbols = parse_isf_file("ntkrnlmp.pdb/GUID/ntkrnlmp.json.xz")?;
//! let vad_root = symbols.field_offset("_EPROCESS", "VadRoot");
//! let hit = symbols.resolve(0x1234);
//! ```

pub mod error;
pub mod parser;
pub mod types;

pub use error::{IsfError, IsfResult};
pub use parser::{parse_isf_bytes, parse_isf_file, parse_isf_str};
pub use types::{BaseType, FieldDef, IsfSymbols, Metadata, Symbol, SymbolHit, TypeInfo, UserType};
