//! Region maps: the virtual address space of a protection domain
//!
//! A region map is an ordered set of dataspace attachments over a
//! virtual range, with a fault-handler capability receiving a signal on
//! unresolvable faults. Each PD owns three pre-existing maps: the
//! address space proper, the stack area, and the linker area.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use lattice_alloc::{AllocError, RangeAllocator};
use lattice_base::rpc::{
    decode, ExceptionCode, Opcode, RpcClient, RpcError, RpcObject, RpcResult,
    EXCEPTION_IFACE_BASE, EXCEPTION_UNKNOWN_OPCODE,
};
use lattice_base::Capability;

use crate::dataspace::{Dataspace, DataspacePool};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RegionMapError {
    #[error("the requested virtual range is occupied")]
    RegionConflict,

    #[error("attachment does not fit the region map")]
    OutOfVirtualMemory,

    #[error("offset or size exceed the dataspace")]
    InvalidDataspace,

    #[error("no attachment at the given address")]
    InvalidAddress,
}

bitflags! {
    /// Access permissions of one attachment
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Perms: u8 {
        const READ  = 0x1;
        const WRITE = 0x2;
        const EXEC  = 0x4;
    }
}

/// One dataspace attachment
#[derive(Clone)]
pub struct Attachment {
    pub dataspace: Arc<Dataspace>,
    pub offset: u64,
    pub size: u64,
    pub perms: Perms,
}

pub struct RegionMap {
    size: u64,
    virt: Mutex<RangeAllocator>,
    attachments: Mutex<BTreeMap<u64, Attachment>>,
    fault_handler: Mutex<Option<Capability>>,
}

impl RegionMap {
    pub fn new(size: u64) -> Self {
        let mut virt = RangeAllocator::new();
        // base 0 stays unmapped so null dereferences fault
        let _ = virt.add_range(0x1000, size.saturating_sub(0x1000));
        Self {
            size,
            virt: Mutex::new(virt),
            attachments: Mutex::new(BTreeMap::new()),
            fault_handler: Mutex::new(None),
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Attach a dataspace window, either at a caller-chosen address or
    /// wherever it fits
    pub fn attach(
        &self,
        dataspace: &Arc<Dataspace>,
        offset: u64,
        size: u64,
        at: Option<u64>,
        perms: Perms,
    ) -> Result<u64, RegionMapError> {
        let size = if size == 0 {
            dataspace.size().saturating_sub(offset)
        } else {
            size
        };
        if size == 0 || offset + size > dataspace.size() {
            return Err(RegionMapError::InvalidDataspace);
        }
        let size = (size + 0xfff) & !0xfff;

        let mut virt = self.virt.lock().unwrap();
        let vaddr = match at {
            Some(at) => {
                virt.alloc_addr(size, at).map_err(|e| match e {
                    AllocError::RangeConflict => RegionMapError::RegionConflict,
                    _ => RegionMapError::OutOfVirtualMemory,
                })?;
                at
            }
            None => virt
                .alloc_aligned(size, 12)
                .map_err(|_| RegionMapError::OutOfVirtualMemory)?,
        };

        self.attachments.lock().unwrap().insert(
            vaddr,
            Attachment {
                dataspace: dataspace.clone(),
                offset,
                size,
                perms,
            },
        );
        Ok(vaddr)
    }

    /// Release the attachment starting at `vaddr`
    pub fn detach(&self, vaddr: u64) -> Result<(), RegionMapError> {
        let removed = self.attachments.lock().unwrap().remove(&vaddr);
        match removed {
            Some(_) => {
                let _ = self.virt.lock().unwrap().free(vaddr);
                Ok(())
            }
            None => Err(RegionMapError::InvalidAddress),
        }
    }

    /// The attachment covering `vaddr`, if any
    pub fn at(&self, vaddr: u64) -> Option<(u64, Attachment)> {
        let attachments = self.attachments.lock().unwrap();
        let (base, attachment) = attachments.range(..=vaddr).next_back()?;
        (vaddr < base + attachment.size).then(|| (*base, attachment.clone()))
    }

    pub fn attachment_count(&self) -> usize {
        self.attachments.lock().unwrap().len()
    }

    /// Install the handler receiving fault signals for this map
    pub fn fault_handler(&self, sigh: Capability) {
        *self.fault_handler.lock().unwrap() = Some(sigh);
    }

    pub fn fault_handler_cap(&self) -> Option<Capability> {
        *self.fault_handler.lock().unwrap()
    }
}

impl RegionMapError {
    pub fn exception(&self) -> ExceptionCode {
        EXCEPTION_IFACE_BASE
            + match self {
                RegionMapError::RegionConflict => 0,
                RegionMapError::OutOfVirtualMemory => 1,
                RegionMapError::InvalidDataspace => 2,
                RegionMapError::InvalidAddress => 3,
            }
    }

    fn from_exception(code: ExceptionCode) -> Option<RegionMapError> {
        match code.checked_sub(EXCEPTION_IFACE_BASE) {
            Some(0) => Some(RegionMapError::RegionConflict),
            Some(1) => Some(RegionMapError::OutOfVirtualMemory),
            Some(2) => Some(RegionMapError::InvalidDataspace),
            Some(3) => Some(RegionMapError::InvalidAddress),
            _ => None,
        }
    }
}

/* RPC interface */

pub const OP_ATTACH: Opcode = 0;
pub const OP_DETACH: Opcode = 1;
pub const OP_FAULT_HANDLER: Opcode = 2;
pub const OP_SIZE: Opcode = 3;

#[derive(Serialize, Deserialize)]
struct AttachArgs {
    dataspace: Capability,
    offset: u64,
    size: u64,
    at: Option<u64>,
    perms: u8,
}

pub struct RegionMapDispatch {
    region_map: Arc<RegionMap>,
    pool: Arc<DataspacePool>,
}

impl RegionMapDispatch {
    pub fn new(region_map: Arc<RegionMap>, pool: Arc<DataspacePool>) -> Self {
        Self { region_map, pool }
    }
}

impl RpcObject for RegionMapDispatch {
    fn dispatch(&mut self, opcode: Opcode, args: &[u8]) -> Result<RpcResult, ExceptionCode> {
        match opcode {
            OP_ATTACH => {
                let args: AttachArgs = decode(args)?;
                let dataspace = self
                    .pool
                    .lookup(args.dataspace.selector())
                    .ok_or_else(|| RegionMapError::InvalidDataspace.exception())?;
                let vaddr = self
                    .region_map
                    .attach(
                        &dataspace,
                        args.offset,
                        args.size,
                        args.at,
                        Perms::from_bits_truncate(args.perms),
                    )
                    .map_err(|e| e.exception())?;
                RpcResult::with_results(&vaddr)
            }
            OP_DETACH => {
                let vaddr: u64 = decode(args)?;
                self.region_map.detach(vaddr).map_err(|e| e.exception())?;
                RpcResult::with_results(&())
            }
            OP_FAULT_HANDLER => {
                let sigh: Capability = decode(args)?;
                self.region_map.fault_handler(sigh);
                RpcResult::with_results(&())
            }
            OP_SIZE => RpcResult::with_results(&self.region_map.size()),
            _ => Err(EXCEPTION_UNKNOWN_OPCODE),
        }
    }
}

/// Typed client stub of the region-map interface
#[derive(Clone)]
pub struct RegionMapClient {
    rpc: RpcClient,
}

impl RegionMapClient {
    pub fn new(rpc: RpcClient) -> Self {
        Self { rpc }
    }

    pub fn attach(
        &self,
        dataspace: Capability,
        offset: u64,
        size: u64,
        at: Option<u64>,
        perms: Perms,
    ) -> Result<u64, RegionMapError> {
        self.rpc
            .call::<_, u64>(
                OP_ATTACH,
                &AttachArgs {
                    dataspace,
                    offset,
                    size,
                    at,
                    perms: perms.bits(),
                },
            )
            .map(|r| r.value)
            .map_err(map_rpc)
    }

    pub fn detach(&self, vaddr: u64) -> Result<(), RegionMapError> {
        self.rpc
            .call::<_, ()>(OP_DETACH, &vaddr)
            .map(|_| ())
            .map_err(map_rpc)
    }

    pub fn fault_handler(&self, sigh: Capability) -> Result<(), RegionMapError> {
        self.rpc
            .call::<_, ()>(OP_FAULT_HANDLER, &sigh)
            .map(|_| ())
            .map_err(map_rpc)
    }

    pub fn size(&self) -> Result<u64, RegionMapError> {
        self.rpc
            .call::<_, u64>(OP_SIZE, &())
            .map(|r| r.value)
            .map_err(map_rpc)
    }
}

fn map_rpc(error: RpcError) -> RegionMapError {
    match error {
        RpcError::Exception(code) => {
            RegionMapError::from_exception(code).unwrap_or(RegionMapError::InvalidAddress)
        }
        _ => RegionMapError::InvalidAddress,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataspace::CacheAttribute;

    fn ds(size: u64) -> Arc<Dataspace> {
        Arc::new(Dataspace::ram(0x100_0000, size, CacheAttribute::Cached))
    }

    #[test]
    fn test_attach_anywhere_and_lookup() {
        let rm = RegionMap::new(1 << 30);
        let dataspace = ds(0x3000);

        let vaddr = rm
            .attach(&dataspace, 0, 0, None, Perms::READ | Perms::WRITE)
            .unwrap();
        assert_eq!(vaddr % 0x1000, 0);

        let (base, attachment) = rm.at(vaddr + 0x2fff).unwrap();
        assert_eq!(base, vaddr);
        assert_eq!(attachment.size, 0x3000);
        assert!(rm.at(vaddr + 0x3000).is_none());
    }

    #[test]
    fn test_attach_at_fixed_address_conflicts() {
        let rm = RegionMap::new(1 << 30);
        let dataspace = ds(0x2000);

        rm.attach(&dataspace, 0, 0, Some(0x10_0000), Perms::READ)
            .unwrap();
        assert_eq!(
            rm.attach(&dataspace, 0, 0, Some(0x10_1000), Perms::READ)
                .unwrap_err(),
            RegionMapError::RegionConflict
        );

        // adjacent is fine
        rm.attach(&dataspace, 0, 0, Some(0x10_2000), Perms::READ)
            .unwrap();
        assert_eq!(rm.attachment_count(), 2);
    }

    #[test]
    fn test_detach_releases_the_range() {
        let rm = RegionMap::new(1 << 30);
        let dataspace = ds(0x1000);

        rm.attach(&dataspace, 0, 0, Some(0x20_0000), Perms::READ)
            .unwrap();
        rm.detach(0x20_0000).unwrap();
        assert_eq!(rm.detach(0x20_0000).unwrap_err(), RegionMapError::InvalidAddress);

        rm.attach(&dataspace, 0, 0, Some(0x20_0000), Perms::READ)
            .unwrap();
    }

    #[test]
    fn test_window_attachment_validation() {
        let rm = RegionMap::new(1 << 30);
        let dataspace = ds(0x2000);

        assert_eq!(
            rm.attach(&dataspace, 0x1000, 0x1800, None, Perms::READ)
                .unwrap_err(),
            RegionMapError::InvalidDataspace
        );
        let vaddr = rm
            .attach(&dataspace, 0x1000, 0x1000, None, Perms::READ)
            .unwrap();
        let (_, attachment) = rm.at(vaddr).unwrap();
        assert_eq!(attachment.offset, 0x1000);
    }

    #[test]
    fn test_fault_handler_registration() {
        use lattice_base::IfaceId;

        let rm = RegionMap::new(1 << 20);
        assert!(rm.fault_handler_cap().is_none());
        rm.fault_handler(Capability::new(5, IfaceId(12)));
        assert_eq!(rm.fault_handler_cap().unwrap().selector(), 5);
    }
}
