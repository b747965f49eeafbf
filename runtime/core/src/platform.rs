//! Platform bring-up: boot resources become typed allocators
//!
//! Consumes the boot hand-over exactly once and partitions it: physical
//! RAM at page granularity, core's virtual window, MMIO ranges, I/O
//! ports, and interrupt lines. Boot-module frames are withdrawn from the
//! RAM pool before any allocation happens; they stay reachable through
//! the ROM service only. Ownership of device resources is recorded as
//! block metadata so a conflicting request can name the holder.

use std::sync::Mutex;

use lattice_alloc::{AllocError, RangeAllocator};
use lattice_base::AffinitySpace;

use crate::bootinfo::BootInfo;
use crate::dataspace::CacheAttribute;

pub const PAGE_SIZE: u64 = 4096;
const PAGE_LOG2: u8 = 12;

/// Core's own virtual window used for metadata and attachments
const CORE_VIRT_BASE: u64 = 0x10_0000;
const CORE_VIRT_SIZE: u64 = 1 << 40;

pub fn page_align_up(value: u64) -> u64 {
    (value + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

pub fn page_align_down(value: u64) -> u64 {
    value & !(PAGE_SIZE - 1)
}

pub struct Platform {
    phys: Mutex<RangeAllocator>,
    virt: Mutex<RangeAllocator>,
    io_mem: Mutex<RangeAllocator<String>>,
    io_ports: Mutex<RangeAllocator<String>>,
    irqs: Mutex<RangeAllocator<String>>,
    affinity: AffinitySpace,
    ram_total: u64,
}

impl Platform {
    pub fn new(info: &BootInfo) -> Self {
        let mut phys = RangeAllocator::new();
        let mut ram_total = 0;
        for region in &info.ram {
            let base = page_align_up(region.base);
            let end = page_align_down(region.end());
            if end > base {
                if phys.add_range(base, end - base).is_ok() {
                    ram_total += end - base;
                } else {
                    log::warn!(
                        "boot RAM region {:#x}+{:#x} overlaps an earlier one, skipped",
                        region.base,
                        region.size
                    );
                }
            }
        }

        // boot modules keep their frames until the ROM service goes away
        for module in &info.modules {
            let base = page_align_down(module.base);
            let end = page_align_up(module.base + module.size);
            if phys.remove_range(base, end - base).is_ok() {
                ram_total -= end - base;
            }
        }

        let mut virt = RangeAllocator::new();
        let _ = virt.add_range(CORE_VIRT_BASE, CORE_VIRT_SIZE);

        let mut io_mem = RangeAllocator::new();
        for region in &info.mmio {
            let _ = io_mem.add_range(region.base, region.size);
        }

        let mut io_ports = RangeAllocator::new();
        for region in &info.io_ports {
            let _ = io_ports.add_range(region.base as u64, region.count as u64);
        }

        let mut irqs = RangeAllocator::new();
        for range in &info.irqs {
            let _ = irqs.add_range(range.base as u64, range.count as u64);
        }

        Self {
            phys: Mutex::new(phys),
            virt: Mutex::new(virt),
            io_mem: Mutex::new(io_mem),
            io_ports: Mutex::new(io_ports),
            irqs: Mutex::new(irqs),
            affinity: info.affinity,
            ram_total,
        }
    }

    pub fn affinity_space(&self) -> AffinitySpace {
        self.affinity
    }

    /// Bytes of RAM handed to the allocator at boot
    pub fn ram_total(&self) -> u64 {
        self.ram_total
    }

    pub fn ram_avail(&self) -> u64 {
        self.phys.lock().unwrap().avail()
    }

    /// Allocate physical pages honouring the cache-derived alignment
    pub fn alloc_ram(&self, size: u64, cache: CacheAttribute) -> Result<u64, AllocError> {
        let size = page_align_up(size);
        self.phys
            .lock()
            .unwrap()
            .alloc_aligned(size, cache.align_log2().max(PAGE_LOG2))
    }

    /// Return pages to the pool; reports the freed size
    pub fn free_ram(&self, addr: u64) -> Result<u64, AllocError> {
        self.phys.lock().unwrap().free(addr)
    }

    /// Allocate a window of core-local virtual addresses
    pub fn alloc_virt(&self, size: u64) -> Result<u64, AllocError> {
        self.virt
            .lock()
            .unwrap()
            .alloc_aligned(page_align_up(size), PAGE_LOG2)
    }

    pub fn free_virt(&self, addr: u64) -> Result<u64, AllocError> {
        self.virt.lock().unwrap().free(addr)
    }

    /// Claim an MMIO window for the named client
    pub fn request_io_mem(&self, base: u64, size: u64, label: &str) -> Result<(), AllocError> {
        let mut io_mem = self.io_mem.lock().unwrap();
        io_mem.alloc_addr(size, base)?;
        let _ = io_mem.set_metadata(base, label.to_string());
        Ok(())
    }

    pub fn release_io_mem(&self, base: u64) -> Result<(), AllocError> {
        self.io_mem.lock().unwrap().free(base).map(|_| ())
    }

    /// The label of the client holding the MMIO window covering `addr`
    pub fn io_mem_holder(&self, addr: u64) -> Option<String> {
        self.io_mem.lock().unwrap().metadata(addr).cloned()
    }

    pub fn request_io_ports(&self, base: u16, count: u16, label: &str) -> Result<(), AllocError> {
        let mut ports = self.io_ports.lock().unwrap();
        ports.alloc_addr(count as u64, base as u64)?;
        let _ = ports.set_metadata(base as u64, label.to_string());
        Ok(())
    }

    pub fn release_io_ports(&self, base: u16) -> Result<(), AllocError> {
        self.io_ports.lock().unwrap().free(base as u64).map(|_| ())
    }

    pub fn request_irq(&self, number: u32, label: &str) -> Result<(), AllocError> {
        let mut irqs = self.irqs.lock().unwrap();
        irqs.alloc_addr(1, number as u64)?;
        let _ = irqs.set_metadata(number as u64, label.to_string());
        Ok(())
    }

    pub fn release_irq(&self, number: u32) -> Result<(), AllocError> {
        self.irqs.lock().unwrap().free(number as u64).map(|_| ())
    }
}
