//! RAM dataspace factory: the allocation back end of every PD session
//!
//! Dataspaces are backed by physically allocated pages taken from the
//! platform's physical pool; freeing a dataspace returns the pages. The
//! factory keeps its own book of handed-out dataspaces so a PD session
//! can only free what it allocated.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;

use lattice_base::{Capability, Selector};

use crate::dataspace::{CacheAttribute, Dataspace, DataspacePool};
use crate::platform::{page_align_up, Platform};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RamError {
    #[error("physical memory exhausted")]
    OutOfRam,

    #[error("capability does not refer to a dataspace of this session")]
    InvalidHandle,
}

struct Allocation {
    phys: u64,
    size: u64,
}

pub struct RamDataspaceFactory {
    platform: Arc<Platform>,
    pool: Arc<DataspacePool>,
    allocations: Mutex<HashMap<Selector, Allocation>>,
}

impl RamDataspaceFactory {
    pub fn new(platform: Arc<Platform>, pool: Arc<DataspacePool>) -> Self {
        Self {
            platform,
            pool,
            allocations: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate a zeroed RAM dataspace of at least `size` bytes
    pub fn try_alloc(
        &self,
        size: u64,
        cache: CacheAttribute,
    ) -> Result<(Capability, Arc<Dataspace>), RamError> {
        if size == 0 {
            return Err(RamError::InvalidHandle);
        }
        let size = page_align_up(size);
        let phys = self
            .platform
            .alloc_ram(size, cache)
            .map_err(|_| RamError::OutOfRam)?;
        let dataspace = Arc::new(Dataspace::ram(phys, size, cache));
        let cap = self.pool.mint(dataspace.clone());
        self.allocations
            .lock()
            .unwrap()
            .insert(cap.selector(), Allocation { phys, size });
        Ok((cap, dataspace))
    }

    /// Free a dataspace; reports the byte size returned to the pool
    pub fn free(&self, selector: Selector) -> Result<u64, RamError> {
        let allocation = self
            .allocations
            .lock()
            .unwrap()
            .remove(&selector)
            .ok_or(RamError::InvalidHandle)?;
        self.pool.revoke(selector);
        if self.platform.free_ram(allocation.phys).is_err() {
            log::error!(
                "physical pages {:#x} of a RAM dataspace were lost",
                allocation.phys
            );
        }
        Ok(allocation.size)
    }

    pub fn dataspace_size(&self, selector: Selector) -> Result<u64, RamError> {
        self.allocations
            .lock()
            .unwrap()
            .get(&selector)
            .map(|a| a.size)
            .ok_or(RamError::InvalidHandle)
    }

    /// Free everything still allocated; reports the total returned
    pub fn release_all(&self) -> u64 {
        let selectors: Vec<Selector> = self.allocations.lock().unwrap().keys().copied().collect();
        let mut total = 0;
        for selector in selectors {
            if let Ok(size) = self.free(selector) {
                total += size;
            }
        }
        total
    }

    pub fn allocation_count(&self) -> usize {
        self.allocations.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootinfo::{BootInfo, PhysRegion};
    use lattice_base::AffinitySpace;

    fn factory() -> RamDataspaceFactory {
        let info = BootInfo {
            ram: vec![PhysRegion {
                base: 0x10_0000,
                size: 0x40_0000,
            }],
            affinity: AffinitySpace::default(),
            ..Default::default()
        };
        RamDataspaceFactory::new(Arc::new(Platform::new(&info)), DataspacePool::new())
    }

    #[test]
    fn test_alloc_rounds_to_pages() {
        let factory = factory();
        let (cap, ds) = factory.try_alloc(100, CacheAttribute::Cached).unwrap();
        assert_eq!(ds.size(), 4096);
        assert_eq!(factory.dataspace_size(cap.selector()).unwrap(), 4096);
        assert_eq!(factory.free(cap.selector()).unwrap(), 4096);
    }

    #[test]
    fn test_free_returns_pages_to_the_pool() {
        let factory = factory();
        let avail = factory.platform.ram_avail();

        let (cap, _ds) = factory.try_alloc(0x10_0000, CacheAttribute::Cached).unwrap();
        assert_eq!(factory.platform.ram_avail(), avail - 0x10_0000);

        factory.free(cap.selector()).unwrap();
        assert_eq!(factory.platform.ram_avail(), avail);
        assert_eq!(
            factory.free(cap.selector()).unwrap_err(),
            RamError::InvalidHandle
        );
    }

    #[test]
    fn test_exhaustion_reports_out_of_ram() {
        let factory = factory();
        assert_eq!(
            factory.try_alloc(1 << 30, CacheAttribute::Cached).unwrap_err(),
            RamError::OutOfRam
        );
    }

    #[test]
    fn test_release_all() {
        let factory = factory();
        factory.try_alloc(0x1000, CacheAttribute::Cached).unwrap();
        factory.try_alloc(0x2000, CacheAttribute::Cached).unwrap();
        assert_eq!(factory.allocation_count(), 2);
        assert_eq!(factory.release_all(), 0x3000);
        assert_eq!(factory.allocation_count(), 0);
    }
}
