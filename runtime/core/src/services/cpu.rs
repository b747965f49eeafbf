//! CPU service: threads, scheduling weights, and affinities
//!
//! Threads are created on behalf of a PD and scheduled across the CPUs
//! of the session's affinity space. A weight is a scheduler share; the
//! session's quota is distributed across its threads proportionally to
//! their weights. Killing a thread closes its trace subject and buffer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use lattice_base::rpc::{
    decode, Entrypoint, ExceptionCode, Opcode, RpcClient, RpcError, RpcObject, RpcResult,
    EXCEPTION_IFACE_BASE, EXCEPTION_UNKNOWN_OPCODE,
};
use lattice_base::{AffinityLocation, AffinitySpace, CapQuota, Capability, Label, Selector};
use lattice_kernel::{KernelInterface, ThreadHandle, ThreadStatus};
use lattice_session::{LocalService, SessionError, SessionRef};

use crate::iface;
use crate::services::pd::{PdRegistry, PdSessionComponent};
use crate::services::trace::TraceRegistry;

pub const CPU_SESSION_RAM_COSTS: u64 = 8192;
pub const CPU_SESSION_CAP_COSTS: u64 = 2;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CpuError {
    #[error("capability does not refer to a live thread")]
    InvalidHandle,

    #[error("out of capability quota")]
    OutOfCaps,

    #[error("request refused")]
    Denied,

    #[error("transport failure")]
    Ipc,
}

impl CpuError {
    fn exception(&self) -> ExceptionCode {
        EXCEPTION_IFACE_BASE
            + match self {
                CpuError::InvalidHandle => 0,
                CpuError::OutOfCaps => 1,
                CpuError::Denied => 2,
                CpuError::Ipc => 3,
            }
    }

    fn from_exception(code: ExceptionCode) -> CpuError {
        match code.checked_sub(EXCEPTION_IFACE_BASE) {
            Some(0) => CpuError::InvalidHandle,
            Some(1) => CpuError::OutOfCaps,
            Some(2) => CpuError::Denied,
            _ => CpuError::Ipc,
        }
    }
}

/// Wire form of a thread-state readout
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadStateInfo {
    pub status: u8,
    pub ip: u64,
    pub sp: u64,
    pub cpu: usize,
    pub single_step: bool,
}

pub const THREAD_INACTIVE: u8 = 0;
pub const THREAD_RUNNING: u8 = 1;
pub const THREAD_PAUSED: u8 = 2;
pub const THREAD_DEAD: u8 = 3;

fn status_code(status: ThreadStatus) -> u8 {
    match status {
        ThreadStatus::Inactive => THREAD_INACTIVE,
        ThreadStatus::Running => THREAD_RUNNING,
        ThreadStatus::Paused => THREAD_PAUSED,
        ThreadStatus::Dead => THREAD_DEAD,
    }
}

struct CpuThread {
    handle: ThreadHandle,
    pd: Arc<PdSessionComponent>,
    name: String,
    weight: u64,
    affinity: AffinityLocation,
    exception_sigh: Option<Capability>,
    utcb: u64,
}

pub struct CpuSessionComponent {
    label: Label,
    kernel: Arc<dyn KernelInterface>,
    space: AffinitySpace,
    location: AffinityLocation,
    pd_registry: Arc<PdRegistry>,
    trace: Arc<TraceRegistry>,
    threads: Mutex<HashMap<Selector, CpuThread>>,
    next_selector: Arc<AtomicU64>,
    quota: Mutex<u64>,
    reference: Mutex<Option<Arc<CpuSessionComponent>>>,
}

impl CpuSessionComponent {
    fn new(
        label: Label,
        kernel: Arc<dyn KernelInterface>,
        space: AffinitySpace,
        location: AffinityLocation,
        pd_registry: Arc<PdRegistry>,
        trace: Arc<TraceRegistry>,
        next_selector: Arc<AtomicU64>,
    ) -> Self {
        Self {
            label,
            kernel,
            space,
            location,
            pd_registry,
            trace,
            threads: Mutex::new(HashMap::new()),
            next_selector,
            quota: Mutex::new(0),
            reference: Mutex::new(None),
        }
    }

    /// Create a thread in the PD behind `pd_cap`, charging that PD's
    /// capability account
    pub fn create_thread(
        &self,
        pd_cap: Capability,
        name: &str,
        affinity: AffinityLocation,
        weight: u64,
        utcb: u64,
    ) -> Result<Capability, CpuError> {
        let pd = self
            .pd_registry
            .get(pd_cap.selector())
            .ok_or(CpuError::InvalidHandle)?;
        pd.cap_account()
            .withdraw(CapQuota { value: 1 })
            .map_err(|_| CpuError::OutOfCaps)?;

        let handle = match self.kernel.create_thread(pd.pd_handle(), name) {
            Ok(handle) => handle,
            Err(_) => {
                pd.cap_account().replenish(CapQuota { value: 1 });
                return Err(CpuError::InvalidHandle);
            }
        };
        let affinity = if self.space.contains(&affinity) {
            affinity
        } else {
            // fall back to the session's own location
            AffinityLocation::single(self.location.xpos, self.location.ypos)
        };
        let _ = self
            .kernel
            .thread_affinity(handle, affinity.cpu_index(&self.space));

        let selector = self.next_selector.fetch_add(1, Ordering::Relaxed);
        self.trace.insert(selector, name);
        self.threads.lock().unwrap().insert(
            selector,
            CpuThread {
                handle,
                pd,
                name: name.into(),
                weight: weight.max(1),
                affinity,
                exception_sigh: None,
                utcb,
            },
        );
        Ok(Capability::new(selector, iface::THREAD))
    }

    /// Destroy a thread, its trace subject, and its buffer
    pub fn kill_thread(&self, cap: Capability) -> Result<(), CpuError> {
        let thread = self
            .threads
            .lock()
            .unwrap()
            .remove(&cap.selector())
            .ok_or(CpuError::InvalidHandle)?;
        let _ = self.kernel.destroy_thread(thread.handle);
        self.trace.remove_by_thread(cap.selector());
        thread.pd.cap_account().replenish(CapQuota { value: 1 });
        log::debug!("killed thread '{}' (utcb {:#x})", thread.name, thread.utcb);
        Ok(())
    }

    fn with_thread<R>(
        &self,
        cap: Capability,
        f: impl FnOnce(&mut CpuThread) -> R,
    ) -> Result<R, CpuError> {
        let mut threads = self.threads.lock().unwrap();
        threads
            .get_mut(&cap.selector())
            .map(f)
            .ok_or(CpuError::InvalidHandle)
    }

    pub fn start(&self, cap: Capability, ip: u64, sp: u64) -> Result<(), CpuError> {
        let handle = self.with_thread(cap, |t| t.handle)?;
        self.kernel
            .thread_start(handle, ip, sp)
            .map_err(|_| CpuError::InvalidHandle)
    }

    pub fn pause(&self, cap: Capability) -> Result<(), CpuError> {
        let handle = self.with_thread(cap, |t| t.handle)?;
        self.kernel
            .thread_pause(handle)
            .map_err(|_| CpuError::InvalidHandle)
    }

    pub fn resume(&self, cap: Capability) -> Result<(), CpuError> {
        let handle = self.with_thread(cap, |t| t.handle)?;
        self.kernel
            .thread_resume(handle)
            .map_err(|_| CpuError::InvalidHandle)
    }

    pub fn state(&self, cap: Capability) -> Result<ThreadStateInfo, CpuError> {
        let handle = self.with_thread(cap, |t| t.handle)?;
        let state = self
            .kernel
            .thread_state(handle)
            .map_err(|_| CpuError::InvalidHandle)?;
        Ok(ThreadStateInfo {
            status: status_code(state.status),
            ip: state.ip,
            sp: state.sp,
            cpu: state.cpu,
            single_step: state.single_step,
        })
    }

    pub fn affinity(&self, cap: Capability, location: AffinityLocation) -> Result<(), CpuError> {
        if !self.space.contains(&location) {
            return Err(CpuError::Denied);
        }
        let handle = self.with_thread(cap, |t| {
            t.affinity = location;
            t.handle
        })?;
        self.kernel
            .thread_affinity(handle, location.cpu_index(&self.space))
            .map_err(|_| CpuError::InvalidHandle)
    }

    pub fn single_step(&self, cap: Capability, enabled: bool) -> Result<(), CpuError> {
        let handle = self.with_thread(cap, |t| t.handle)?;
        self.kernel
            .thread_single_step(handle, enabled)
            .map_err(|_| CpuError::InvalidHandle)
    }

    /// Handler receiving a signal on thread exceptions
    pub fn exception_sigh(&self, cap: Capability, sigh: Capability) -> Result<(), CpuError> {
        self.with_thread(cap, |t| t.exception_sigh = Some(sigh))
    }

    pub fn quota(&self) -> u64 {
        *self.quota.lock().unwrap()
    }

    pub fn set_quota(&self, quota: u64) {
        *self.quota.lock().unwrap() = quota;
    }

    /// The share of the session quota a thread receives by its weight
    pub fn thread_quota(&self, cap: Capability) -> Result<u64, CpuError> {
        let threads = self.threads.lock().unwrap();
        let thread = threads
            .get(&cap.selector())
            .ok_or(CpuError::InvalidHandle)?;
        let total: u64 = threads.values().map(|t| t.weight).sum();
        if total == 0 {
            return Ok(0);
        }
        Ok(self.quota() * thread.weight / total)
    }

    pub fn ref_account(&self, reference: &Arc<CpuSessionComponent>) {
        *self.reference.lock().unwrap() = Some(reference.clone());
    }

    /// Move scheduler share to another CPU session
    pub fn transfer_quota(
        &self,
        target: &Arc<CpuSessionComponent>,
        amount: u64,
    ) -> Result<(), CpuError> {
        if let Some(reference) = self.reference.lock().unwrap().as_ref() {
            if !Arc::ptr_eq(reference, target) {
                log::debug!(
                    "'{}' trades CPU quota past its reference account",
                    self.label
                );
            }
        }
        {
            let mut own = self.quota.lock().unwrap();
            if *own < amount {
                return Err(CpuError::Denied);
            }
            *own -= amount;
        }
        *target.quota.lock().unwrap() += amount;
        Ok(())
    }

    /// Toggle tracing of one thread
    pub fn trace_control(&self, cap: Capability, enabled: bool) -> Result<(), CpuError> {
        if !self.threads.lock().unwrap().contains_key(&cap.selector()) {
            return Err(CpuError::InvalidHandle);
        }
        self.trace.set_enabled_by_thread(cap.selector(), enabled);
        Ok(())
    }

    pub fn thread_count(&self) -> usize {
        self.threads.lock().unwrap().len()
    }

    fn release(&self) {
        let threads: Vec<Selector> = self.threads.lock().unwrap().keys().copied().collect();
        for selector in threads {
            let _ = self.kill_thread(Capability::new(selector, iface::THREAD));
        }
    }
}

/// Registry resolving CPU session capabilities to their components
pub struct CpuRegistry {
    entries: Mutex<HashMap<Selector, Arc<CpuSessionComponent>>>,
}

impl CpuRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
        })
    }

    fn insert(&self, selector: Selector, component: Arc<CpuSessionComponent>) {
        self.entries.lock().unwrap().insert(selector, component);
    }

    fn get(&self, selector: Selector) -> Option<Arc<CpuSessionComponent>> {
        self.entries.lock().unwrap().get(&selector).cloned()
    }

    fn remove(&self, selector: Selector) -> Option<Arc<CpuSessionComponent>> {
        self.entries.lock().unwrap().remove(&selector)
    }
}

pub struct CpuService {
    kernel: Arc<dyn KernelInterface>,
    space: AffinitySpace,
    pd_registry: Arc<PdRegistry>,
    trace: Arc<TraceRegistry>,
    ep: Arc<Entrypoint>,
    registry: Arc<CpuRegistry>,
    next_thread_selector: Arc<AtomicU64>,
}

impl CpuService {
    pub fn new(
        kernel: Arc<dyn KernelInterface>,
        space: AffinitySpace,
        pd_registry: Arc<PdRegistry>,
        trace: Arc<TraceRegistry>,
        ep: Arc<Entrypoint>,
    ) -> Arc<Self> {
        Arc::new(Self {
            kernel,
            space,
            pd_registry,
            trace,
            ep,
            registry: CpuRegistry::new(),
            // selector region disjoint from entrypoint-minted ones
            next_thread_selector: Arc::new(AtomicU64::new(0x3_0000_0000)),
        })
    }
}

impl LocalService for CpuService {
    fn name(&self) -> &str {
        "CPU"
    }

    fn initiate(&self, session: &SessionRef) -> Result<Capability, SessionError> {
        let (label, ram, caps, affinity) = session.with(|s| {
            (
                s.label().clone(),
                s.donated_ram(),
                s.donated_caps(),
                *s.affinity(),
            )
        });
        if ram.value < CPU_SESSION_RAM_COSTS {
            return Err(SessionError::InsufficientRamQuota);
        }
        if caps.value < CPU_SESSION_CAP_COSTS {
            return Err(SessionError::InsufficientCapQuota);
        }

        let location = if self.space.contains(&affinity.location) {
            affinity.location
        } else {
            self.space.whole()
        };
        let component = Arc::new(CpuSessionComponent::new(
            label,
            self.kernel.clone(),
            self.space,
            location,
            self.pd_registry.clone(),
            self.trace.clone(),
            self.next_thread_selector.clone(),
        ));
        let cap = self.ep.manage(
            iface::CPU,
            Box::new(CpuDispatch {
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
        }
        self.ep.dissolve(&cap);
    }
}

/* RPC interface */

pub const OP_CREATE_THREAD: Opcode = 0;
pub const OP_KILL_THREAD: Opcode = 1;
pub const OP_START: Opcode = 2;
pub const OP_PAUSE: Opcode = 3;
pub const OP_RESUME: Opcode = 4;
pub const OP_STATE: Opcode = 5;
pub const OP_AFFINITY: Opcode = 6;
pub const OP_SINGLE_STEP: Opcode = 7;
pub const OP_EXCEPTION_SIGH: Opcode = 8;
pub const OP_QUOTA: Opcode = 9;
pub const OP_THREAD_QUOTA: Opcode = 10;
pub const OP_REF_ACCOUNT: Opcode = 11;
pub const OP_TRANSFER_QUOTA: Opcode = 12;
pub const OP_TRACE_CONTROL: Opcode = 13;

#[derive(Serialize, Deserialize)]
struct CreateThreadArgs {
    pd: Capability,
    name: String,
    affinity: AffinityLocation,
    weight: u64,
    utcb: u64,
}

#[derive(Serialize, Deserialize)]
struct StartArgs {
    thread: Capability,
    ip: u64,
    sp: u64,
}

#[derive(Serialize, Deserialize)]
struct AffinityArgs {
    thread: Capability,
    location: AffinityLocation,
}

#[derive(Serialize, Deserialize)]
struct SingleStepArgs {
    thread: Capability,
    enabled: bool,
}

#[derive(Serialize, Deserialize)]
struct ExceptionSighArgs {
    thread: Capability,
    sigh: Capability,
}

#[derive(Serialize, Deserialize)]
struct TransferQuotaArgs {
    target: Capability,
    amount: u64,
}

#[derive(Serialize, Deserialize)]
struct TraceControlArgs {
    thread: Capability,
    enabled: bool,
}

struct CpuDispatch {
    component: Arc<CpuSessionComponent>,
    registry: Arc<CpuRegistry>,
}

impl RpcObject for CpuDispatch {
    fn dispatch(&mut self, opcode: Opcode, args: &[u8]) -> Result<RpcResult, ExceptionCode> {
        let component = &self.component;
        match opcode {
            OP_CREATE_THREAD => {
                let args: CreateThreadArgs = decode(args)?;
                let cap = component
                    .create_thread(args.pd, &args.name, args.affinity, args.weight, args.utcb)
                    .map_err(|e| e.exception())?;
                RpcResult::with_cap(&(), cap)
            }
            OP_KILL_THREAD => {
                let thread: Capability = decode(args)?;
                component.kill_thread(thread).map_err(|e| e.exception())?;
                RpcResult::with_results(&())
            }
            OP_START => {
                let args: StartArgs = decode(args)?;
                component
                    .start(args.thread, args.ip, args.sp)
                    .map_err(|e| e.exception())?;
                RpcResult::with_results(&())
            }
            OP_PAUSE => {
                let thread: Capability = decode(args)?;
                component.pause(thread).map_err(|e| e.exception())?;
                RpcResult::with_results(&())
            }
            OP_RESUME => {
                let thread: Capability = decode(args)?;
                component.resume(thread).map_err(|e| e.exception())?;
                RpcResult::with_results(&())
            }
            OP_STATE => {
                let thread: Capability = decode(args)?;
                let state = component.state(thread).map_err(|e| e.exception())?;
                RpcResult::with_results(&state)
            }
            OP_AFFINITY => {
                let args: AffinityArgs = decode(args)?;
                component
                    .affinity(args.thread, args.location)
                    .map_err(|e| e.exception())?;
                RpcResult::with_results(&())
            }
            OP_SINGLE_STEP => {
                let args: SingleStepArgs = decode(args)?;
                component
                    .single_step(args.thread, args.enabled)
                    .map_err(|e| e.exception())?;
                RpcResult::with_results(&())
            }
            OP_EXCEPTION_SIGH => {
                let args: ExceptionSighArgs = decode(args)?;
                component
                    .exception_sigh(args.thread, args.sigh)
                    .map_err(|e| e.exception())?;
                RpcResult::with_results(&())
            }
            OP_QUOTA => RpcResult::with_results(&component.quota()),
            OP_THREAD_QUOTA => {
                let thread: Capability = decode(args)?;
                let quota = component.thread_quota(thread).map_err(|e| e.exception())?;
                RpcResult::with_results(&quota)
            }
            OP_REF_ACCOUNT => {
                let peer: Capability = decode(args)?;
                let peer = self
                    .registry
                    .get(peer.selector())
                    .ok_or_else(|| CpuError::InvalidHandle.exception())?;
                component.ref_account(&peer);
                RpcResult::with_results(&())
            }
            OP_TRANSFER_QUOTA => {
                let args: TransferQuotaArgs = decode(args)?;
                let peer = self
                    .registry
                    .get(args.target.selector())
                    .ok_or_else(|| CpuError::InvalidHandle.exception())?;
                component
                    .transfer_quota(&peer, args.amount)
                    .map_err(|e| e.exception())?;
                RpcResult::with_results(&())
            }
            OP_TRACE_CONTROL => {
                let args: TraceControlArgs = decode(args)?;
                component
                    .trace_control(args.thread, args.enabled)
                    .map_err(|e| e.exception())?;
                RpcResult::with_results(&())
            }
            _ => Err(EXCEPTION_UNKNOWN_OPCODE),
        }
    }
}

fn map_rpc(error: RpcError) -> CpuError {
    match error {
        RpcError::Exception(code) => CpuError::from_exception(code),
        _ => CpuError::Ipc,
    }
}

/// Typed client stub of the CPU interface
#[derive(Clone)]
pub struct CpuSessionClient {
    rpc: RpcClient,
}

impl CpuSessionClient {
    pub fn new(rpc: RpcClient) -> Self {
        Self { rpc }
    }

    pub fn cap(&self) -> Capability {
        self.rpc.cap()
    }

    pub fn create_thread(
        &self,
        pd: Capability,
        name: &str,
        affinity: AffinityLocation,
        weight: u64,
        utcb: u64,
    ) -> Result<Capability, CpuError> {
        let ret = self
            .rpc
            .call::<_, ()>(
                OP_CREATE_THREAD,
                &CreateThreadArgs {
                    pd,
                    name: name.into(),
                    affinity,
                    weight,
                    utcb,
                },
            )
            .map_err(map_rpc)?;
        ret.caps.first().copied().ok_or(CpuError::Ipc)
    }

    pub fn kill_thread(&self, thread: Capability) -> Result<(), CpuError> {
        self.rpc
            .call::<_, ()>(OP_KILL_THREAD, &thread)
            .map(|_| ())
            .map_err(map_rpc)
    }

    pub fn start(&self, thread: Capability, ip: u64, sp: u64) -> Result<(), CpuError> {
        self.rpc
            .call::<_, ()>(OP_START, &StartArgs { thread, ip, sp })
            .map(|_| ())
            .map_err(map_rpc)
    }

    pub fn pause(&self, thread: Capability) -> Result<(), CpuError> {
        self.rpc
            .call::<_, ()>(OP_PAUSE, &thread)
            .map(|_| ())
            .map_err(map_rpc)
    }

    pub fn resume(&self, thread: Capability) -> Result<(), CpuError> {
        self.rpc
            .call::<_, ()>(OP_RESUME, &thread)
            .map(|_| ())
            .map_err(map_rpc)
    }

    pub fn state(&self, thread: Capability) -> Result<ThreadStateInfo, CpuError> {
        self.rpc
            .call::<_, ThreadStateInfo>(OP_STATE, &thread)
            .map(|r| r.value)
            .map_err(map_rpc)
    }

    pub fn affinity(
        &self,
        thread: Capability,
        location: AffinityLocation,
    ) -> Result<(), CpuError> {
        self.rpc
            .call::<_, ()>(OP_AFFINITY, &AffinityArgs { thread, location })
            .map(|_| ())
            .map_err(map_rpc)
    }

    pub fn single_step(&self, thread: Capability, enabled: bool) -> Result<(), CpuError> {
        self.rpc
            .call::<_, ()>(OP_SINGLE_STEP, &SingleStepArgs { thread, enabled })
            .map(|_| ())
            .map_err(map_rpc)
    }

    pub fn exception_sigh(&self, thread: Capability, sigh: Capability) -> Result<(), CpuError> {
        self.rpc
            .call::<_, ()>(OP_EXCEPTION_SIGH, &ExceptionSighArgs { thread, sigh })
            .map(|_| ())
            .map_err(map_rpc)
    }

    pub fn quota(&self) -> Result<u64, CpuError> {
        self.rpc
            .call::<_, u64>(OP_QUOTA, &())
            .map(|r| r.value)
            .map_err(map_rpc)
    }

    pub fn thread_quota(&self, thread: Capability) -> Result<u64, CpuError> {
        self.rpc
            .call::<_, u64>(OP_THREAD_QUOTA, &thread)
            .map(|r| r.value)
            .map_err(map_rpc)
    }

    pub fn ref_account(&self, reference: Capability) -> Result<(), CpuError> {
        self.rpc
            .call::<_, ()>(OP_REF_ACCOUNT, &reference)
            .map(|_| ())
            .map_err(map_rpc)
    }

    pub fn transfer_quota(&self, target: Capability, amount: u64) -> Result<(), CpuError> {
        self.rpc
            .call::<_, ()>(OP_TRANSFER_QUOTA, &TransferQuotaArgs { target, amount })
            .map(|_| ())
            .map_err(map_rpc)
    }

    pub fn trace_control(&self, thread: Capability, enabled: bool) -> Result<(), CpuError> {
        self.rpc
            .call::<_, ()>(OP_TRACE_CONTROL, &TraceControlArgs { thread, enabled })
            .map(|_| ())
            .map_err(map_rpc)
    }
}
