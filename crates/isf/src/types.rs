//! Type definitions for parsed ISF data.

use serde::Deserialize;
use std::collections::HashMap;

/// Top-level ISF file structure.
#[derive(Debug, Deserialize)]
pub struct IsfFile {
    pub metadata: Metadata,
    #[serde(default)]
    pub base_types: HashMap<String, BaseType>,
    #[serde(default)]
    pub user_types: HashMap<String, UserType>,
    #[serde(default)]
    pub symbols: HashMap<String, Symbol>,
}

/// ISF metadata block.
#[derive(Debug, Deserialize)]
pub struct Metadata {
    pub format: String,
    #[serde(default)]
    pub windows: Option<WindowsMetadata>,
}

#[derive(Debug, Deserialize)]
pub struct WindowsMetadata {
    #[serde(default)]
    pub build: Option<u32>,
    #[serde(default)]
    pub pe_file: Option<String>,
    #[serde(default)]
    pub pdb_file: Option<String>,
}

/// A base (primitive) type definition.
#[derive(Debug, Clone, Deserialize)]
pub struct BaseType {
    pub size: usize,
    #[serde(default)]
    pub signed: bool,
    pub kind: String,
}

/// A user-defined (struct/union) type.
#[derive(Debug, Clone, Deserialize)]
pub struct UserType {
    pub size: usize,
    #[serde(default)]
    pub fields: HashMap<String, FieldDef>,
}

/// A field within a user type.
#[derive(Debug, Clone, Deserialize)]
pub struct FieldDef {
    pub offset: usize,
    #[serde(rename = "type")]
    pub type_info: TypeInfo,
}

/// Type information for a field.
#[derive(Debug, Clone, Deserialize)]
pub struct TypeInfo {
    pub kind: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub subtype: Option<Box<TypeInfo>>,
    #[serde(default)]
    pub count: Option<usize>,
}

/// A named address.
#[derive(Debug, Clone, Deserialize)]
pub struct Symbol {
    pub address: u64,
}

/// Result of an address lookup: the closest symbol at or below the address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolHit {
    pub name: String,
    pub displacement: u64,
}

/// Resolved symbol table ready for lookups.
///
/// Symbol addresses in ISF files are relative to the module base; `relocate`
/// rebases them so `resolve` can answer for absolute addresses.
#[derive(Debug)]
pub struct IsfSymbols {
    pub base_types: HashMap<String, BaseType>,
    pub user_types: HashMap<String, UserType>,
    pub symbols: HashMap<String, Symbol>,
    pub metadata: Metadata,
    /// Pointer size in bytes (4 or 8).
    pub pointer_size: usize,
    /// Module name used as the `module!` prefix of resolved names.
    pub module: String,
    /// Base added to every symbol address.
    pub base: u64,
    /// (address, name) sorted by address for nearest-symbol lookup.
    by_address: Vec<(u64, String)>,
}

impl IsfSymbols {
    pub(crate) fn from_file(file: IsfFile) -> Self {
        let pointer_size = file
            .base_types
            .get("pointer")
            .map(|bt| bt.size)
            .unwrap_or(8);

        let module = file
            .metadata
            .windows
            .as_ref()
            .and_then(|w| w.pdb_file.as_deref().or(w.pe_file.as_deref()))
            .map(module_stem)
            .unwrap_or_default();

        let mut by_address: Vec<(u64, String)> = file
            .symbols
            .iter()
            .map(|(name, sym)| (sym.address, name.clone()))
            .collect();
        by_address.sort();

        IsfSymbols {
            base_types: file.base_types,
            user_types: file.user_types,
            symbols: file.symbols,
            metadata: file.metadata,
            pointer_size,
            module,
            base: 0,
            by_address,
        }
    }

    /// Rebase all symbol addresses onto `base` (the module's load address).
    pub fn relocate(&mut self, base: u64) {
        self.base = base;
    }

    /// Look up a struct definition by name. A leading `module!` is ignored.
    pub fn get_type(&self, name: &str) -> Option<&UserType> {
        self.user_types.get(strip_module(name))
    }

    /// Absolute address of a symbol by name.
    pub fn get_symbol(&self, name: &str) -> Option<u64> {
        self.symbols
            .get(strip_module(name))
            .map(|s| self.base.wrapping_add(s.address))
    }

    /// Offset of `field_name` inside `type_name`.
    pub fn field_offset(&self, type_name: &str, field_name: &str) -> Option<usize> {
        self.get_type(type_name)
            .and_then(|t| t.fields.get(field_name))
            .map(|f| f.offset)
    }

    /// Nearest symbol at or below `address`.
    pub fn resolve(&self, address: u64) -> Option<SymbolHit> {
        let rva = address.checked_sub(self.base)?;
        let idx = self.by_address.partition_point(|(a, _)| *a <= rva);
        let (sym_rva, name) = self.by_address.get(idx.checked_sub(1)?)?;
        let name = if self.module.is_empty() {
            name.clone()
        } else {
            format!("{}!{}", self.module, name)
        };
        Some(SymbolHit {
            name,
            displacement: rva - sym_rva,
        })
    }
}

/// `nt!_EPROCESS` -> `_EPROCESS`.
fn strip_module(name: &str) -> &str {
    name.split_once('!').map_or(name, |(_, rest)| rest)
}

/// `ntkrnlmp.pdb` -> `ntkrnlmp`.
fn module_stem(file: &str) -> String {
    let file = file.rsplit(['/', '\\']).next().unwrap_or(file);
    file.split('.').next().unwrap_or(file).to_string()
}
