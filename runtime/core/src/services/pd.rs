//! PD service: protection domains, their accounts, and their signals
//!
//! A PD session owns a kernel protection domain, the three region maps,
//! one RAM and one capability account, a signal broker endpoint, and an
//! RPC-capability factory. Every operation that creates a kernel object
//! charges the two accounts first and rolls the charge back when the
//! creation fails.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use lattice_base::rpc::{
    decode, Entrypoint, ExceptionCode, Opcode, RpcClient, RpcError, RpcObject, RpcResult,
    EXCEPTION_IFACE_BASE, EXCEPTION_UNKNOWN_OPCODE,
};
use lattice_base::{Account, CapQuota, Capability, Label, QuotaError, RamQuota, Selector};
use lattice_kernel::{KernelInterface, ObjectId, PdHandle};
use lattice_session::{LocalService, SessionError, SessionRef};

use crate::dataspace::{CacheAttribute, DataspacePool};
use crate::iface;
use crate::platform::{page_align_up, Platform};
use crate::region_map::{RegionMap, RegionMapDispatch};
use crate::services::ram::{RamDataspaceFactory, RamError};
use crate::services::signal::SignalBroker;

/// Virtual sizes of the three pre-existing region maps
const ADDRESS_SPACE_SIZE: u64 = 1 << 46;
const STACK_AREA_SIZE: u64 = 1 << 30;
const LINKER_AREA_SIZE: u64 = 1 << 28;

/// Quota a PD session must donate to cover core-side metadata
pub const PD_SESSION_RAM_COSTS: u64 = 0x4000;
pub const PD_SESSION_CAP_COSTS: u64 = 4;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PdError {
    #[error("out of RAM quota")]
    OutOfRam,

    #[error("out of capability quota")]
    OutOfCaps,

    #[error("capability does not refer to a live object of this session")]
    InvalidHandle,

    #[error("the parent endpoint is assigned exactly once")]
    ParentAlreadyAssigned,

    #[error("operation not supported on this platform")]
    Unsupported,

    #[error("transport failure")]
    Ipc,
}

impl From<QuotaError> for PdError {
    fn from(error: QuotaError) -> Self {
        match error {
            QuotaError::OutOfRam => PdError::OutOfRam,
            QuotaError::OutOfCaps => PdError::OutOfCaps,
        }
    }
}

impl From<RamError> for PdError {
    fn from(error: RamError) -> Self {
        match error {
            RamError::OutOfRam => PdError::OutOfRam,
            RamError::InvalidHandle => PdError::InvalidHandle,
        }
    }
}

impl PdError {
    pub fn exception(&self) -> ExceptionCode {
        EXCEPTION_IFACE_BASE
            + match self {
                PdError::OutOfRam => 0,
                PdError::OutOfCaps => 1,
                PdError::InvalidHandle => 2,
                PdError::ParentAlreadyAssigned => 3,
                PdError::Unsupported => 4,
                PdError::Ipc => 5,
            }
    }

    fn from_exception(code: ExceptionCode) -> PdError {
        match code.checked_sub(EXCEPTION_IFACE_BASE) {
            Some(0) => PdError::OutOfRam,
            Some(1) => PdError::OutOfCaps,
            Some(2) => PdError::InvalidHandle,
            Some(3) => PdError::ParentAlreadyAssigned,
            Some(4) => PdError::Unsupported,
            _ => PdError::Ipc,
        }
    }
}

fn map_rpc(error: RpcError) -> PdError {
    match error {
        RpcError::Exception(code) => PdError::from_exception(code),
        _ => PdError::Ipc,
    }
}

/// Kinds of capabilities a PD session pays for, named in diagnostics
#[derive(Debug, Clone, Copy)]
enum CapType {
    Rpc,
    Dataspace,
    SignalSource,
    SignalContext,
}

impl CapType {
    fn name(&self) -> &'static str {
        match self {
            CapType::Rpc => "RPC",
            CapType::Dataspace => "dataspace",
            CapType::SignalSource => "signal-source",
            CapType::SignalContext => "signal-context",
        }
    }
}

pub struct PdSessionComponent {
    label: Label,
    kernel: Arc<dyn KernelInterface>,
    pd: PdHandle,
    ram_account: Arc<Account<RamQuota>>,
    cap_account: Arc<Account<CapQuota>>,
    ram_ds: RamDataspaceFactory,
    hub: Arc<SignalBroker>,
    sources: Mutex<Vec<Capability>>,
    contexts: Mutex<Vec<Capability>>,
    rpc_caps: Mutex<Vec<(Capability, ObjectId)>>,
    address_space: Arc<RegionMap>,
    stack_area: Arc<RegionMap>,
    linker_area: Arc<RegionMap>,
    region_map_caps: Mutex<Option<[Capability; 3]>>,
    parent: Mutex<Option<Capability>>,
    pci_assignments: Mutex<Vec<(u64, u16)>>,
}

impl PdSessionComponent {
    pub fn new(
        label: Label,
        kernel: Arc<dyn KernelInterface>,
        platform: Arc<Platform>,
        pool: Arc<DataspacePool>,
        hub: Arc<SignalBroker>,
        ram_quota: RamQuota,
        cap_quota: CapQuota,
    ) -> Result<Self, PdError> {
        let pd = kernel
            .create_pd(label.as_str())
            .map_err(|_| PdError::Unsupported)?;
        Ok(Self {
            ram_account: Account::new(label.as_str(), ram_quota),
            cap_account: Account::new(label.as_str(), cap_quota),
            ram_ds: RamDataspaceFactory::new(platform, pool),
            hub,
            sources: Mutex::new(Vec::new()),
            contexts: Mutex::new(Vec::new()),
            rpc_caps: Mutex::new(Vec::new()),
            address_space: Arc::new(RegionMap::new(ADDRESS_SPACE_SIZE)),
            stack_area: Arc::new(RegionMap::new(STACK_AREA_SIZE)),
            linker_area: Arc::new(RegionMap::new(LINKER_AREA_SIZE)),
            region_map_caps: Mutex::new(None),
            parent: Mutex::new(None),
            pci_assignments: Mutex::new(Vec::new()),
            kernel,
            pd,
            label,
        })
    }

    pub fn label(&self) -> &Label {
        &self.label
    }

    pub fn pd_handle(&self) -> PdHandle {
        self.pd
    }

    pub fn ram_account(&self) -> &Arc<Account<RamQuota>> {
        &self.ram_account
    }

    pub fn cap_account(&self) -> &Arc<Account<CapQuota>> {
        &self.cap_account
    }

    fn consume_cap(&self, kind: CapType) -> Result<(), PdError> {
        self.cap_account.withdraw(CapQuota { value: 1 }).map_err(|_| {
            log::debug!(
                "{}: out of caps while consuming {} cap ({:?})",
                self.label,
                kind.name(),
                self.cap_account
            );
            PdError::OutOfCaps
        })
    }

    fn released_cap(&self, kind: CapType) {
        self.cap_account.replenish(CapQuota { value: 1 });
        log::debug!("{}: released {} cap", self.label, kind.name());
    }

    /// Set the parent RPC endpoint reported on the PD's first system call
    pub fn assign_parent(&self, parent: Capability) -> Result<(), PdError> {
        let mut slot = self.parent.lock().unwrap();
        if slot.is_some() {
            return Err(PdError::ParentAlreadyAssigned);
        }
        *slot = Some(parent);
        Ok(())
    }

    pub fn parent_cap(&self) -> Option<Capability> {
        *self.parent.lock().unwrap()
    }

    /// Diagnostic memory mapping; a no-op on platforms without eager maps
    pub fn map(&self, vaddr: u64, paddr: u64) -> Result<(), PdError> {
        log::debug!("{}: map {:#x} -> {:#x} ignored", self.label, vaddr, paddr);
        Ok(())
    }

    pub fn alloc_signal_source(&self) -> Result<Capability, PdError> {
        self.consume_cap(CapType::SignalSource)?;
        let (cap, _source) = self.hub.alloc_source();
        self.sources.lock().unwrap().push(cap);
        Ok(cap)
    }

    pub fn free_signal_source(&self, cap: Capability) -> Result<(), PdError> {
        let mut sources = self.sources.lock().unwrap();
        let index = sources
            .iter()
            .position(|c| c.selector() == cap.selector())
            .ok_or(PdError::InvalidHandle)?;
        sources.remove(index);
        drop(sources);
        self.hub
            .free_source(cap)
            .map_err(|_| PdError::InvalidHandle)?;
        self.released_cap(CapType::SignalSource);
        Ok(())
    }

    pub fn alloc_context(&self, source: Capability, imprint: u64) -> Result<Capability, PdError> {
        let reservation = self
            .cap_account
            .reserve(CapQuota { value: 1 })
            .map_err(PdError::from)?;
        let cap = self
            .hub
            .alloc_context(source, imprint)
            .map_err(|_| PdError::InvalidHandle)?;
        reservation.acknowledge();
        self.contexts.lock().unwrap().push(cap);
        Ok(cap)
    }

    pub fn free_context(&self, cap: Capability) -> Result<(), PdError> {
        let mut contexts = self.contexts.lock().unwrap();
        let index = contexts
            .iter()
            .position(|c| c.selector() == cap.selector())
            .ok_or(PdError::InvalidHandle)?;
        contexts.remove(index);
        drop(contexts);
        self.hub.free_context(cap).map_err(|_| PdError::InvalidHandle)?;
        self.released_cap(CapType::SignalContext);
        Ok(())
    }

    pub fn submit(&self, context: Capability, num: u64) -> Result<(), PdError> {
        self.hub
            .submit(context.selector(), num)
            .map_err(|_| PdError::InvalidHandle)
    }

    /// Manufacture an RPC capability bound to the given entrypoint
    pub fn alloc_rpc_cap(&self, ep: Capability) -> Result<Capability, PdError> {
        self.consume_cap(CapType::Rpc)?;
        let object = match self.kernel.create_endpoint(self.pd) {
            Ok(endpoint) => endpoint.0,
            Err(_) => {
                self.cap_account.replenish(CapQuota { value: 1 });
                return Err(PdError::InvalidHandle);
            }
        };
        let selector = match self.kernel.mint(self.pd, object) {
            Ok(selector) => selector,
            Err(_) => {
                self.cap_account.replenish(CapQuota { value: 1 });
                return Err(PdError::InvalidHandle);
            }
        };
        let cap = Capability::new(selector, ep.iface());
        self.rpc_caps.lock().unwrap().push((cap, object));
        Ok(cap)
    }

    pub fn free_rpc_cap(&self, cap: Capability) -> Result<(), PdError> {
        let mut rpc_caps = self.rpc_caps.lock().unwrap();
        let index = rpc_caps
            .iter()
            .position(|(c, _)| c.selector() == cap.selector())
            .ok_or(PdError::InvalidHandle)?;
        let (_, object) = rpc_caps.remove(index);
        drop(rpc_caps);
        let _ = self.kernel.revoke(object);
        self.released_cap(CapType::Rpc);
        Ok(())
    }

    pub fn address_space(&self) -> Arc<RegionMap> {
        self.address_space.clone()
    }

    pub fn stack_area(&self) -> Arc<RegionMap> {
        self.stack_area.clone()
    }

    pub fn linker_area(&self) -> Arc<RegionMap> {
        self.linker_area.clone()
    }

    pub fn set_region_map_caps(&self, caps: [Capability; 3]) {
        *self.region_map_caps.lock().unwrap() = Some(caps);
    }

    pub fn region_map_caps(&self) -> Option<[Capability; 3]> {
        *self.region_map_caps.lock().unwrap()
    }

    /// Designate another PD as the reference account for both resources
    pub fn ref_account(&self, reference: &PdSessionComponent) {
        self.ram_account.ref_account(reference.ram_account());
        self.cap_account.ref_account(reference.cap_account());
    }

    pub fn transfer_ram(&self, target: &PdSessionComponent, amount: RamQuota) -> Result<(), PdError> {
        self.ram_account
            .transfer_to(target.ram_account(), amount)
            .map_err(PdError::from)
    }

    pub fn transfer_caps(
        &self,
        target: &PdSessionComponent,
        amount: CapQuota,
    ) -> Result<(), PdError> {
        self.cap_account
            .transfer_to(target.cap_account(), amount)
            .map_err(PdError::from)
    }

    /// Allocate a RAM dataspace, charging RAM and capability quota
    pub fn alloc(&self, size: u64, cache: CacheAttribute) -> Result<Capability, PdError> {
        let charged = page_align_up(size);
        self.ram_account
            .withdraw(RamQuota { value: charged })
            .map_err(PdError::from)?;
        if let Err(refusal) = self.consume_cap(CapType::Dataspace) {
            self.ram_account.replenish(RamQuota { value: charged });
            return Err(refusal);
        }
        match self.ram_ds.try_alloc(size, cache) {
            Ok((cap, _ds)) => Ok(cap),
            Err(refusal) => {
                self.ram_account.replenish(RamQuota { value: charged });
                self.released_cap(CapType::Dataspace);
                Err(refusal.into())
            }
        }
    }

    pub fn free(&self, cap: Capability) -> Result<(), PdError> {
        let size = self.ram_ds.free(cap.selector())?;
        self.ram_account.replenish(RamQuota { value: size });
        self.released_cap(CapType::Dataspace);
        Ok(())
    }

    pub fn dataspace_size(&self, cap: Capability) -> Result<u64, PdError> {
        self.ram_ds.dataspace_size(cap.selector()).map_err(PdError::from)
    }

    pub fn cap_quota(&self) -> CapQuota {
        self.cap_account.limit()
    }

    pub fn used_caps(&self) -> CapQuota {
        self.cap_account.used()
    }

    pub fn ram_quota(&self) -> RamQuota {
        self.ram_account.limit()
    }

    pub fn used_ram(&self) -> RamQuota {
        self.ram_account.used()
    }

    /// IOMMU assignment; recorded and acknowledged on this platform
    pub fn assign_pci(&self, bdf: u64, rid: u16) -> Result<(), PdError> {
        self.pci_assignments.lock().unwrap().push((bdf, rid));
        Ok(())
    }

    pub fn pci_assignment_count(&self) -> usize {
        self.pci_assignments.lock().unwrap().len()
    }

    /// Tear down everything the session handed out
    ///
    /// Dataspaces return their pages, RPC capabilities are revoked, and
    /// the kernel PD is destroyed, which revokes everything minted from
    /// it.
    pub fn release(&self) {
        let mut released_caps = self.ram_ds.allocation_count() as u64;
        let freed = self.ram_ds.release_all();
        self.ram_account.replenish(RamQuota { value: freed });

        let rpc_caps: Vec<(Capability, ObjectId)> =
            std::mem::take(&mut *self.rpc_caps.lock().unwrap());
        for (_, object) in &rpc_caps {
            let _ = self.kernel.revoke(*object);
        }
        released_caps += rpc_caps.len() as u64;

        let contexts: Vec<Capability> = std::mem::take(&mut *self.contexts.lock().unwrap());
        for cap in &contexts {
            let _ = self.hub.free_context(*cap);
        }
        released_caps += contexts.len() as u64;

        let sources: Vec<Capability> = std::mem::take(&mut *self.sources.lock().unwrap());
        for cap in &sources {
            let _ = self.hub.free_source(*cap);
        }
        released_caps += sources.len() as u64;

        self.cap_account.replenish(CapQuota {
            value: released_caps,
        });
        let _ = self.kernel.destroy_pd(self.pd);
    }
}

/// Registry resolving PD session capabilities to their components
pub struct PdRegistry {
    entries: Mutex<HashMap<Selector, Arc<PdSessionComponent>>>,
}

impl PdRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
        })
    }

    pub fn insert(&self, selector: Selector, component: Arc<PdSessionComponent>) {
        self.entries.lock().unwrap().insert(selector, component);
    }

    pub fn get(&self, selector: Selector) -> Option<Arc<PdSessionComponent>> {
        self.entries.lock().unwrap().get(&selector).cloned()
    }

    pub fn remove(&self, selector: Selector) -> Option<Arc<PdSessionComponent>> {
        self.entries.lock().unwrap().remove(&selector)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The PD service as published through core's router
pub struct PdService {
    kernel: Arc<dyn KernelInterface>,
    platform: Arc<Platform>,
    pool: Arc<DataspacePool>,
    hub: Arc<SignalBroker>,
    ep: Arc<Entrypoint>,
    registry: Arc<PdRegistry>,
}

impl PdService {
    pub fn new(
        kernel: Arc<dyn KernelInterface>,
        platform: Arc<Platform>,
        pool: Arc<DataspacePool>,
        hub: Arc<SignalBroker>,
        ep: Arc<Entrypoint>,
        registry: Arc<PdRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            kernel,
            platform,
            pool,
            hub,
            ep,
            registry,
        })
    }

    pub fn registry(&self) -> &Arc<PdRegistry> {
        &self.registry
    }
}

impl LocalService for PdService {
    fn name(&self) -> &str {
        "PD"
    }

    fn initiate(&self, session: &SessionRef) -> Result<Capability, SessionError> {
        let (label, ram, caps) =
            session.with(|s| (s.label().clone(), s.donated_ram(), s.donated_caps()));
        if ram.value < PD_SESSION_RAM_COSTS {
            return Err(SessionError::InsufficientRamQuota);
        }
        if caps.value < PD_SESSION_CAP_COSTS {
            return Err(SessionError::InsufficientCapQuota);
        }

        let component = Arc::new(
            PdSessionComponent::new(
                label,
                self.kernel.clone(),
                self.platform.clone(),
                self.pool.clone(),
                self.hub.clone(),
                RamQuota {
                    value: ram.value - PD_SESSION_RAM_COSTS,
                },
                CapQuota {
                    value: caps.value - PD_SESSION_CAP_COSTS,
                },
            )
            .map_err(|_| SessionError::Unavailable)?,
        );

        let rm_caps = [
            self.ep.manage(
                iface::REGION_MAP,
                Box::new(RegionMapDispatch::new(
                    component.address_space(),
                    self.pool.clone(),
                )),
            ),
            self.ep.manage(
                iface::REGION_MAP,
                Box::new(RegionMapDispatch::new(
                    component.stack_area(),
                    self.pool.clone(),
                )),
            ),
            self.ep.manage(
                iface::REGION_MAP,
                Box::new(RegionMapDispatch::new(
                    component.linker_area(),
                    self.pool.clone(),
                )),
            ),
        ];
        component.set_region_map_caps(rm_caps);

        let cap = self.ep.manage(
            iface::PD,
            Box::new(PdDispatch {
                component: component.clone(),
                registry: self.registry.clone(),
            }),
        );
        self.registry.insert(cap.selector(), component);
        Ok(cap)
    }

    fn close(&self, session: &SessionRef) {
        let cap = session.with(|s| s.cap);
        if let Some(component) = self.registry.remove(cap.selector()) {
            component.release();
            if let Some(rm_caps) = component.region_map_caps() {
                for rm_cap in rm_caps {
                    self.ep.dissolve(&rm_cap);
                }
            }
        }
        self.ep.dissolve(&cap);
    }
}

/* RPC interface */

pub const OP_ASSIGN_PARENT: Opcode = 0;
pub const OP_MAP: Opcode = 1;
pub const OP_ALLOC_SIGNAL_SOURCE: Opcode = 2;
pub const OP_FREE_SIGNAL_SOURCE: Opcode = 3;
pub const OP_ALLOC_CONTEXT: Opcode = 4;
pub const OP_FREE_CONTEXT: Opcode = 5;
pub const OP_SUBMIT: Opcode = 6;
pub const OP_ALLOC_RPC_CAP: Opcode = 7;
pub const OP_FREE_RPC_CAP: Opcode = 8;
pub const OP_ADDRESS_SPACE: Opcode = 9;
pub const OP_STACK_AREA: Opcode = 10;
pub const OP_LINKER_AREA: Opcode = 11;
pub const OP_REF_ACCOUNT: Opcode = 12;
pub const OP_TRANSFER_RAM: Opcode = 13;
pub const OP_TRANSFER_CAPS: Opcode = 14;
pub const OP_ALLOC: Opcode = 15;
pub const OP_FREE: Opcode = 16;
pub const OP_DATASPACE_SIZE: Opcode = 17;
pub const OP_CAP_QUOTA: Opcode = 18;
pub const OP_USED_CAPS: Opcode = 19;
pub const OP_RAM_QUOTA: Opcode = 20;
pub const OP_USED_RAM: Opcode = 21;
pub const OP_ASSIGN_PCI: Opcode = 22;

#[derive(Serialize, Deserialize)]
struct MapArgs {
    vaddr: u64,
    paddr: u64,
}

#[derive(Serialize, Deserialize)]
struct AllocContextArgs {
    source: Capability,
    imprint: u64,
}

#[derive(Serialize, Deserialize)]
struct SubmitArgs {
    context: Capability,
    num: u64,
}

#[derive(Serialize, Deserialize)]
struct TransferArgs {
    target: Capability,
    amount: u64,
}

#[derive(Serialize, Deserialize)]
struct AllocArgs {
    size: u64,
    cache: CacheAttribute,
}

#[derive(Serialize, Deserialize)]
struct AssignPciArgs {
    bdf: u64,
    rid: u16,
}

struct PdDispatch {
    component: Arc<PdSessionComponent>,
    registry: Arc<PdRegistry>,
}

impl PdDispatch {
    fn resolve_peer(&self, cap: Capability) -> Result<Arc<PdSessionComponent>, ExceptionCode> {
        self.registry
            .get(cap.selector())
            .ok_or_else(|| PdError::InvalidHandle.exception())
    }
}

impl RpcObject for PdDispatch {
    fn dispatch(&mut self, opcode: Opcode, args: &[u8]) -> Result<RpcResult, ExceptionCode> {
        let component = &self.component;
        match opcode {
            OP_ASSIGN_PARENT => {
                let parent: Capability = decode(args)?;
                component
                    .assign_parent(parent)
                    .map_err(|e| e.exception())?;
                RpcResult::with_results(&())
            }
            OP_MAP => {
                let args: MapArgs = decode(args)?;
                component
                    .map(args.vaddr, args.paddr)
                    .map_err(|e| e.exception())?;
                RpcResult::with_results(&())
            }
            OP_ALLOC_SIGNAL_SOURCE => {
                let cap = component
                    .alloc_signal_source()
                    .map_err(|e| e.exception())?;
                RpcResult::with_cap(&(), cap)
            }
            OP_FREE_SIGNAL_SOURCE => {
                let cap: Capability = decode(args)?;
                component
                    .free_signal_source(cap)
                    .map_err(|e| e.exception())?;
                RpcResult::with_results(&())
            }
            OP_ALLOC_CONTEXT => {
                let args: AllocContextArgs = decode(args)?;
                let cap = component
                    .alloc_context(args.source, args.imprint)
                    .map_err(|e| e.exception())?;
                RpcResult::with_cap(&(), cap)
            }
            OP_FREE_CONTEXT => {
                let cap: Capability = decode(args)?;
                component.free_context(cap).map_err(|e| e.exception())?;
                RpcResult::with_results(&())
            }
            OP_SUBMIT => {
                let args: SubmitArgs = decode(args)?;
                component
                    .submit(args.context, args.num)
                    .map_err(|e| e.exception())?;
                RpcResult::with_results(&())
            }
            OP_ALLOC_RPC_CAP => {
                let ep: Capability = decode(args)?;
                let cap = component.alloc_rpc_cap(ep).map_err(|e| e.exception())?;
                RpcResult::with_cap(&(), cap)
            }
            OP_FREE_RPC_CAP => {
                let cap: Capability = decode(args)?;
                component.free_rpc_cap(cap).map_err(|e| e.exception())?;
                RpcResult::with_results(&())
            }
            OP_ADDRESS_SPACE | OP_STACK_AREA | OP_LINKER_AREA => {
                let caps = component
                    .region_map_caps()
                    .ok_or_else(|| PdError::InvalidHandle.exception())?;
                let cap = caps[(opcode - OP_ADDRESS_SPACE) as usize];
                RpcResult::with_cap(&(), cap)
            }
            OP_REF_ACCOUNT => {
                let peer: Capability = decode(args)?;
                let peer = self.resolve_peer(peer)?;
                component.ref_account(&peer);
                RpcResult::with_results(&())
            }
            OP_TRANSFER_RAM => {
                let args: TransferArgs = decode(args)?;
                let peer = self.resolve_peer(args.target)?;
                component
                    .transfer_ram(&peer, RamQuota { value: args.amount })
                    .map_err(|e| e.exception())?;
                RpcResult::with_results(&())
            }
            OP_TRANSFER_CAPS => {
                let args: TransferArgs = decode(args)?;
                let peer = self.resolve_peer(args.target)?;
                component
                    .transfer_caps(&peer, CapQuota { value: args.amount })
                    .map_err(|e| e.exception())?;
                RpcResult::with_results(&())
            }
            OP_ALLOC => {
                let args: AllocArgs = decode(args)?;
                let cap = component
                    .alloc(args.size, args.cache)
                    .map_err(|e| e.exception())?;
                RpcResult::with_cap(&(), cap)
            }
            OP_FREE => {
                let cap: Capability = decode(args)?;
                component.free(cap).map_err(|e| e.exception())?;
                RpcResult::with_results(&())
            }
            OP_DATASPACE_SIZE => {
                let cap: Capability = decode(args)?;
                let size = component.dataspace_size(cap).map_err(|e| e.exception())?;
                RpcResult::with_results(&size)
            }
            OP_CAP_QUOTA => RpcResult::with_results(&component.cap_quota().value),
            OP_USED_CAPS => RpcResult::with_results(&component.used_caps().value),
            OP_RAM_QUOTA => RpcResult::with_results(&component.ram_quota().value),
            OP_USED_RAM => RpcResult::with_results(&component.used_ram().value),
            OP_ASSIGN_PCI => {
                let args: AssignPciArgs = decode(args)?;
                component
                    .assign_pci(args.bdf, args.rid)
                    .map_err(|e| e.exception())?;
                RpcResult::with_results(&())
            }
            _ => Err(EXCEPTION_UNKNOWN_OPCODE),
        }
    }
}

/// Typed client stub of the PD interface
#[derive(Clone)]
pub struct PdSessionClient {
    rpc: RpcClient,
}

impl PdSessionClient {
    pub fn new(rpc: RpcClient) -> Self {
        Self { rpc }
    }

    pub fn cap(&self) -> Capability {
        self.rpc.cap()
    }

    pub fn assign_parent(&self, parent: Capability) -> Result<(), PdError> {
        self.rpc
            .call::<_, ()>(OP_ASSIGN_PARENT, &parent)
            .map(|_| ())
            .map_err(map_rpc)
    }

    pub fn map(&self, vaddr: u64, paddr: u64) -> Result<(), PdError> {
        self.rpc
            .call::<_, ()>(OP_MAP, &MapArgs { vaddr, paddr })
            .map(|_| ())
            .map_err(map_rpc)
    }

    pub fn alloc_signal_source(&self) -> Result<Capability, PdError> {
        let ret = self
            .rpc
            .call::<_, ()>(OP_ALLOC_SIGNAL_SOURCE, &())
            .map_err(map_rpc)?;
        ret.caps.first().copied().ok_or(PdError::Ipc)
    }

    pub fn free_signal_source(&self, cap: Capability) -> Result<(), PdError> {
        self.rpc
            .call::<_, ()>(OP_FREE_SIGNAL_SOURCE, &cap)
            .map(|_| ())
            .map_err(map_rpc)
    }

    pub fn alloc_context(&self, source: Capability, imprint: u64) -> Result<Capability, PdError> {
        let ret = self
            .rpc
            .call::<_, ()>(OP_ALLOC_CONTEXT, &AllocContextArgs { source, imprint })
            .map_err(map_rpc)?;
        ret.caps.first().copied().ok_or(PdError::Ipc)
    }

    pub fn free_context(&self, cap: Capability) -> Result<(), PdError> {
        self.rpc
            .call::<_, ()>(OP_FREE_CONTEXT, &cap)
            .map(|_| ())
            .map_err(map_rpc)
    }

    pub fn submit(&self, context: Capability, num: u64) -> Result<(), PdError> {
        self.rpc
            .call::<_, ()>(OP_SUBMIT, &SubmitArgs { context, num })
            .map(|_| ())
            .map_err(map_rpc)
    }

    pub fn alloc_rpc_cap(&self, ep: Capability) -> Result<Capability, PdError> {
        let ret = self
            .rpc
            .call::<_, ()>(OP_ALLOC_RPC_CAP, &ep)
            .map_err(map_rpc)?;
        ret.caps.first().copied().ok_or(PdError::Ipc)
    }

    pub fn free_rpc_cap(&self, cap: Capability) -> Result<(), PdError> {
        self.rpc
            .call::<_, ()>(OP_FREE_RPC_CAP, &cap)
            .map(|_| ())
            .map_err(map_rpc)
    }

    pub fn address_space(&self) -> Result<Capability, PdError> {
        let ret = self
            .rpc
            .call::<_, ()>(OP_ADDRESS_SPACE, &())
            .map_err(map_rpc)?;
        ret.caps.first().copied().ok_or(PdError::Ipc)
    }

    pub fn stack_area(&self) -> Result<Capability, PdError> {
        let ret = self.rpc.call::<_, ()>(OP_STACK_AREA, &()).map_err(map_rpc)?;
        ret.caps.first().copied().ok_or(PdError::Ipc)
    }

    pub fn linker_area(&self) -> Result<Capability, PdError> {
        let ret = self
            .rpc
            .call::<_, ()>(OP_LINKER_AREA, &())
            .map_err(map_rpc)?;
        ret.caps.first().copied().ok_or(PdError::Ipc)
    }

    pub fn ref_account(&self, reference: Capability) -> Result<(), PdError> {
        self.rpc
            .call::<_, ()>(OP_REF_ACCOUNT, &reference)
            .map(|_| ())
            .map_err(map_rpc)
    }

    pub fn transfer_ram(&self, target: Capability, amount: RamQuota) -> Result<(), PdError> {
        self.rpc
            .call::<_, ()>(
                OP_TRANSFER_RAM,
                &TransferArgs {
                    target,
                    amount: amount.value,
                },
            )
            .map(|_| ())
            .map_err(map_rpc)
    }

    pub fn transfer_caps(&self, target: Capability, amount: CapQuota) -> Result<(), PdError> {
        self.rpc
            .call::<_, ()>(
                OP_TRANSFER_CAPS,
                &TransferArgs {
                    target,
                    amount: amount.value,
                },
            )
            .map(|_| ())
            .map_err(map_rpc)
    }

    pub fn alloc(&self, size: u64, cache: CacheAttribute) -> Result<Capability, PdError> {
        let ret = self
            .rpc
            .call::<_, ()>(OP_ALLOC, &AllocArgs { size, cache })
            .map_err(map_rpc)?;
        ret.caps.first().copied().ok_or(PdError::Ipc)
    }

    pub fn free(&self, cap: Capability) -> Result<(), PdError> {
        self.rpc
            .call::<_, ()>(OP_FREE, &cap)
            .map(|_| ())
            .map_err(map_rpc)
    }

    pub fn dataspace_size(&self, cap: Capability) -> Result<u64, PdError> {
        self.rpc
            .call::<_, u64>(OP_DATASPACE_SIZE, &cap)
            .map(|r| r.value)
            .map_err(map_rpc)
    }

    pub fn cap_quota(&self) -> Result<CapQuota, PdError> {
        self.rpc
            .call::<_, u64>(OP_CAP_QUOTA, &())
            .map(|r| CapQuota { value: r.value })
            .map_err(map_rpc)
    }

    pub fn used_caps(&self) -> Result<CapQuota, PdError> {
        self.rpc
            .call::<_, u64>(OP_USED_CAPS, &())
            .map(|r| CapQuota { value: r.value })
            .map_err(map_rpc)
    }

    pub fn ram_quota(&self) -> Result<RamQuota, PdError> {
        self.rpc
            .call::<_, u64>(OP_RAM_QUOTA, &())
            .map(|r| RamQuota { value: r.value })
            .map_err(map_rpc)
    }

    pub fn used_ram(&self) -> Result<RamQuota, PdError> {
        self.rpc
            .call::<_, u64>(OP_USED_RAM, &())
            .map(|r| RamQuota { value: r.value })
            .map_err(map_rpc)
    }

    pub fn assign_pci(&self, bdf: u64, rid: u16) -> Result<(), PdError> {
        self.rpc
            .call::<_, ()>(OP_ASSIGN_PCI, &AssignPciArgs { bdf, rid })
            .map(|_| ())
            .map_err(map_rpc)
    }
}
