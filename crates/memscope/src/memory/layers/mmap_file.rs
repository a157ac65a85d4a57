//! Memory-mapped physical dump layer.
//!
//! A raw dump file is a flat image of physical memory: file offset N holds
//! physical address N. Reads past the end are short, never padded.

use crate::memory::error::{MemError, MemResult};
use crate::memory::traits::MemoryLayer;
use crate::memory::AddressSpace;
use memmap2::{Mmap, MmapOptions};
use std::fs::File;
use std::path::Path;
use tracing::debug;

/// Read-only memory-mapped dump file.
pub struct MmapFileLayer {
    /// An empty file cannot be mapped and holds `None`.
    mmap: Option<Mmap>,
    size: u64,
}

impl MmapFileLayer {
    /// Map `path` read-only. `name` only labels the log line.
    pub fn open(name: &str, path: impl AsRef<Path>) -> MemResult<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let size = file.metadata()?.len();

        let mmap = if size == 0 {
            None
        } else {
            // SAFETY: the file is opened read-only and the mapping lives as
            // long as the layer.
            let map = unsafe { MmapOptions::new().map(&file) }
                .map_err(|e| MemError::Mmap(format!("{}: {}", path.display(), e)))?;
            Some(map)
        };

        debug!("Mapped {} ({} bytes) as layer '{}'", path.display(), size, name);
        Ok(MmapFileLayer { mmap, size })
    }

    /// Copy as many bytes as are available at `offset` into `buf`.
    ///
    /// Returns the number of bytes copied; 0 when `offset` is past the end.
    pub fn read_into(&self, offset: u64, buf: &mut [u8]) -> usize {
        let Some(data) = self.mmap.as_deref() else {
            return 0;
        };
        if offset >= self.size {
            return 0;
        }
        let start = offset as usize;
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        n
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

impl MemoryLayer for MmapFileLayer {
    fn read(&self, offset: u64, length: usize) -> MemResult<Vec<u8>> {
        let mut buf = vec![0u8; length];
        let got = self.read_into(offset, &mut buf);
        if got < length {
            return Err(MemError::short_read(AddressSpace::Physical, offset, length, got));
        }
        Ok(buf)
    }
}
