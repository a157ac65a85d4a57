//! Virtual memory over a physical dump.
//!
//! Given a physical [`MemoryLayer`] and a [`PagingTranslator`], serves
//! virtual reads by translating each 4 KiB page through the page tables in
//! that same layer. Page translations are kept in an LRU cache.

use crate::memory::traits::{MemoryLayer, MemoryReader};
use crate::paging::PagingTranslator;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::debug;

const PAGE_SIZE: u64 = 0x1000;
const DEFAULT_CACHE_PAGES: usize = 4096;

/// Virtual and physical reads for a target backed by a raw dump.
pub struct TranslatedMemory {
    physical: Arc<dyn MemoryLayer>,
    translator: PagingTranslator,
    /// Virtual page -> physical page, `None` for a not-present page.
    pages: Mutex<LruCache<u64, Option<u64>>>,
}

impl TranslatedMemory {
    pub fn new(physical: Arc<dyn MemoryLayer>, translator: PagingTranslator, cache_pages: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_pages).unwrap_or(NonZeroUsize::MIN);
        TranslatedMemory {
            physical,
            translator,
            pages: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn with_translator(physical: Arc<dyn MemoryLayer>, translator: PagingTranslator) -> Self {
        Self::new(physical, translator, DEFAULT_CACHE_PAGES)
    }

    pub fn translator(&self) -> &PagingTranslator {
        &self.translator
    }

    /// Physical page backing the virtual page at `page`.
    fn physical_page(&self, page: u64) -> Option<u64> {
        if let Some(cached) = self.pages.lock().get(&page) {
            return *cached;
        }
        let resolved = match self.translator.resolve(self, page) {
            Ok(p) => p,
            Err(e) => {
                debug!("Translation of page {:#x} failed: {}", page, e);
                None
            }
        };
        self.pages.lock().put(page, resolved);
        resolved
    }
}

impl MemoryReader for TranslatedMemory {
    fn read_virtual(&self, address: u64, buf: &mut [u8]) -> usize {
        let mut done = 0;
        while done < buf.len() {
            let va = address.wrapping_add(done as u64);
            let page = va & !(PAGE_SIZE - 1);
            let offset = va - page;
            let n = ((PAGE_SIZE - offset) as usize).min(buf.len() - done);
            let Some(phys_page) = self.physical_page(page) else {
                break;
            };
            let got = self.read_physical(phys_page + offset, &mut buf[done..done + n]);
            done += got;
            if got < n {
                break;
            }
        }
        done
    }

    fn read_physical(&self, address: u64, buf: &mut [u8]) -> usize {
        let mut done = 0;
        while done < buf.len() {
            let pa = address.wrapping_add(done as u64);
            let n = ((PAGE_SIZE - (pa & (PAGE_SIZE - 1))) as usize).min(buf.len() - done);
            match self.physical.read(pa, n) {
                Ok(bytes) => buf[done..done + n].copy_from_slice(&bytes),
                Err(_) => break,
            }
            done += n;
        }
        done
    }
}
