//! Loading ISF documents from disk or memory.
//!
//! A path ending in `.xz` (any case) is an LZMA stream around the JSON;
//! anything else is read as plain JSON.

use crate::error::{IsfError, IsfResult};
use crate::types::{IsfFile, IsfSymbols};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use xz2::read::XzDecoder;

fn is_xz(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("xz"))
}

pub fn parse_isf_file(path: impl AsRef<Path>) -> IsfResult<IsfSymbols> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| match source.kind() {
        std::io::ErrorKind::NotFound => IsfError::FileNotFound(path.to_path_buf()),
        _ => IsfError::Io {
            path: path.to_path_buf(),
            source,
        },
    })?;

    let mut json = Vec::new();
    let reader = BufReader::new(file);
    if is_xz(path) {
        XzDecoder::new(reader)
            .read_to_end(&mut json)
            .map_err(|source| IsfError::Decompression {
                path: path.to_path_buf(),
                source,
            })?;
    } else {
        let mut reader = reader;
        reader.read_to_end(&mut json).map_err(|source| IsfError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    }
    parse_isf_bytes(&json)
}

/// Already-decompressed JSON bytes.
pub fn parse_isf_bytes(json: &[u8]) -> IsfResult<IsfSymbols> {
    let file: IsfFile = serde_json::from_slice(json)?;
    Ok(IsfSymbols::from_file(file))
}

pub fn parse_isf_str(json: &str) -> IsfResult<IsfSymbols> {
    parse_isf_bytes(json.as_bytes())
}
