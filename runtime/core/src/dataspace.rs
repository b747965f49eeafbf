//! Dataspaces: chunks of memory presented as capabilities
//!
//! A dataspace is a reference-counted region of physical memory that a
//! region map can attach. Three variants exist: RAM dataspaces allocated
//! from the physical pool, ROM dataspaces backed by boot modules or a
//! ROM server, and IO_MEM dataspaces backed by device memory. The hosted
//! backing store carries the content bytes so ROM and ELF handling is
//! observable in tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use lattice_base::{Capability, Selector};

use crate::iface;

/// Cacheability of a RAM dataspace
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheAttribute {
    #[default]
    Cached,
    WriteCombined,
    Uncached,
}

impl CacheAttribute {
    /// Physical alignment the allocator must honour for this attribute
    pub fn align_log2(&self) -> u8 {
        match self {
            CacheAttribute::Cached => 12,
            CacheAttribute::WriteCombined => 14,
            CacheAttribute::Uncached => 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataspaceKind {
    Ram,
    Rom,
    IoMem { write_combined: bool },
}

#[derive(Debug)]
pub struct Dataspace {
    kind: DataspaceKind,
    phys_base: Option<u64>,
    size: u64,
    writable: bool,
    cache: CacheAttribute,
    content: Mutex<Vec<u8>>,
}

impl Dataspace {
    /// Zero-filled RAM dataspace over freshly allocated pages
    pub fn ram(phys_base: u64, size: u64, cache: CacheAttribute) -> Self {
        Self {
            kind: DataspaceKind::Ram,
            phys_base: Some(phys_base),
            size,
            writable: true,
            cache,
            content: Mutex::new(vec![0; size as usize]),
        }
    }

    /// Read-only dataspace carrying the given content
    pub fn rom(content: Vec<u8>) -> Self {
        Self {
            kind: DataspaceKind::Rom,
            phys_base: None,
            size: content.len() as u64,
            writable: false,
            cache: CacheAttribute::Cached,
            content: Mutex::new(content),
        }
    }

    /// Device-memory dataspace; content is not represented
    pub fn io_mem(phys_base: u64, size: u64, write_combined: bool) -> Self {
        Self {
            kind: DataspaceKind::IoMem { write_combined },
            phys_base: Some(phys_base),
            size,
            writable: true,
            cache: if write_combined {
                CacheAttribute::WriteCombined
            } else {
                CacheAttribute::Uncached
            },
            content: Mutex::new(Vec::new()),
        }
    }

    pub fn kind(&self) -> DataspaceKind {
        self.kind
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn phys_base(&self) -> Option<u64> {
        self.phys_base
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn cache(&self) -> CacheAttribute {
        self.cache
    }

    /// Snapshot of the backing bytes
    pub fn read(&self) -> Vec<u8> {
        self.content.lock().unwrap().clone()
    }

    pub fn read_at(&self, offset: u64, out: &mut [u8]) -> usize {
        let content = self.content.lock().unwrap();
        let offset = offset as usize;
        if offset >= content.len() {
            return 0;
        }
        let n = out.len().min(content.len() - offset);
        out[..n].copy_from_slice(&content[offset..offset + n]);
        n
    }

    /// Overwrite backing bytes starting at `offset`; the write is clipped
    /// to the dataspace size
    pub fn write_at(&self, offset: u64, data: &[u8]) -> usize {
        let mut content = self.content.lock().unwrap();
        let offset = offset as usize;
        if offset >= content.len() {
            return 0;
        }
        let n = data.len().min(content.len() - offset);
        content[offset..offset + n].copy_from_slice(&data[..n]);
        n
    }

    /// Replace the whole content if it fits; used by ROM refreshes
    pub fn refresh(&self, data: &[u8]) -> bool {
        let mut content = self.content.lock().unwrap();
        if data.len() > content.len() {
            return false;
        }
        content[..data.len()].copy_from_slice(data);
        for byte in content[data.len()..].iter_mut() {
            *byte = 0;
        }
        true
    }
}

/// Core-wide table resolving dataspace capabilities to their objects
///
/// Every service that manufactures dataspaces (RAM, ROM, IO_MEM) mints
/// the capability here so region maps can resolve attachments uniformly.
pub struct DataspacePool {
    entries: Mutex<HashMap<Selector, Arc<Dataspace>>>,
    next: AtomicU64,
}

impl DataspacePool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            // selector region disjoint from entrypoint-minted ones
            next: AtomicU64::new(0x2_0000_0000),
        })
    }

    pub fn mint(&self, dataspace: Arc<Dataspace>) -> Capability {
        let selector = self.next.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().unwrap().insert(selector, dataspace);
        Capability::new(selector, iface::DATASPACE)
    }

    pub fn lookup(&self, selector: Selector) -> Option<Arc<Dataspace>> {
        self.entries.lock().unwrap().get(&selector).cloned()
    }

    /// Drop the capability binding; outstanding selectors become invalid
    pub fn revoke(&self, selector: Selector) -> Option<Arc<Dataspace>> {
        self.entries.lock().unwrap().remove(&selector)
    }

    pub fn live(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_mint_lookup_revoke() {
        let pool = DataspacePool::new();
        let ds = Arc::new(Dataspace::rom(b"x".to_vec()));
        let cap = pool.mint(ds.clone());
        assert_eq!(cap.iface(), iface::DATASPACE);
        assert!(Arc::ptr_eq(&pool.lookup(cap.selector()).unwrap(), &ds));

        pool.revoke(cap.selector()).unwrap();
        assert!(pool.lookup(cap.selector()).is_none());
        assert_eq!(pool.live(), 0);
    }

    #[test]
    fn test_ram_dataspace_is_zeroed() {
        let ds = Dataspace::ram(0x10_0000, 4096, CacheAttribute::Cached);
        assert_eq!(ds.size(), 4096);
        assert!(ds.writable());
        assert!(ds.read().iter().all(|b| *b == 0));
    }

    #[test]
    fn test_read_write_at() {
        let ds = Dataspace::ram(0, 16, CacheAttribute::Cached);
        assert_eq!(ds.write_at(12, b"abcdef"), 4);

        let mut out = [0u8; 8];
        assert_eq!(ds.read_at(12, &mut out), 4);
        assert_eq!(&out[..4], b"abcd");
        assert_eq!(ds.read_at(16, &mut out), 0);
    }

    #[test]
    fn test_rom_refresh_fits_or_fails() {
        let ds = Dataspace::rom(b"version 1".to_vec());
        assert!(!ds.writable());
        assert!(ds.refresh(b"ver 2"));
        assert_eq!(&ds.read()[..5], b"ver 2");
        // the remainder was cleared
        assert!(ds.read()[5..].iter().all(|b| *b == 0));
        assert!(!ds.refresh(b"far too long for this ds"));
    }

    #[test]
    fn test_cache_alignment() {
        assert_eq!(CacheAttribute::Cached.align_log2(), 12);
        assert!(CacheAttribute::Uncached.align_log2() > CacheAttribute::Cached.align_log2());
    }
}
