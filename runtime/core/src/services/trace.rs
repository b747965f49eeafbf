//! TRACE service: tracing subjects and their buffers
//!
//! Threads register as trace subjects when they are created. A TRACE
//! session discovers subjects, allocates a trace buffer per subject, and
//! toggles tracing. Killing a thread closes its buffer by revoking the
//! buffer capability.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use lattice_base::rpc::{
    decode, Entrypoint, ExceptionCode, Opcode, RpcClient, RpcError, RpcObject, RpcResult,
    EXCEPTION_IFACE_BASE, EXCEPTION_UNKNOWN_OPCODE,
};
use lattice_base::{Capability, Selector};
use lattice_session::{LocalService, SessionError, SessionRef};

use crate::dataspace::{CacheAttribute, DataspacePool};
use crate::iface;
use crate::platform::Platform;
use crate::services::ram::RamDataspaceFactory;

pub const TRACE_SESSION_RAM_COSTS: u64 = 8192;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TraceError {
    #[error("no such trace subject")]
    UnknownSubject,

    #[error("out of RAM quota")]
    OutOfRam,

    #[error("transport failure")]
    Ipc,
}

impl TraceError {
    fn exception(&self) -> ExceptionCode {
        EXCEPTION_IFACE_BASE
            + match self {
                TraceError::UnknownSubject => 0,
                TraceError::OutOfRam => 1,
                TraceError::Ipc => 2,
            }
    }

    fn from_exception(code: ExceptionCode) -> TraceError {
        match code.checked_sub(EXCEPTION_IFACE_BASE) {
            Some(0) => TraceError::UnknownSubject,
            Some(1) => TraceError::OutOfRam,
            _ => TraceError::Ipc,
        }
    }
}

/// Client-visible description of one subject
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SubjectInfo {
    pub id: u64,
    pub name: String,
    pub enabled: bool,
    pub has_buffer: bool,
}

struct TraceSubject {
    thread: Selector,
    name: String,
    enabled: bool,
    buffer: Option<Capability>,
}

/// Registry of traceable threads, fed by the CPU service
pub struct TraceRegistry {
    subjects: Mutex<BTreeMap<u64, TraceSubject>>,
    pool: Arc<DataspacePool>,
    next: AtomicU64,
}

impl TraceRegistry {
    pub fn new(pool: Arc<DataspacePool>) -> Arc<Self> {
        Arc::new(Self {
            subjects: Mutex::new(BTreeMap::new()),
            pool,
            next: AtomicU64::new(1),
        })
    }

    pub fn insert(&self, thread: Selector, name: &str) -> u64 {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        self.subjects.lock().unwrap().insert(
            id,
            TraceSubject {
                thread,
                name: name.into(),
                enabled: false,
                buffer: None,
            },
        );
        id
    }

    /// Drop the subject of a dying thread, revoking its trace buffer
    pub fn remove_by_thread(&self, thread: Selector) {
        let mut subjects = self.subjects.lock().unwrap();
        let dead: Vec<u64> = subjects
            .iter()
            .filter(|(_, s)| s.thread == thread)
            .map(|(id, _)| *id)
            .collect();
        for id in dead {
            if let Some(subject) = subjects.remove(&id) {
                if let Some(buffer) = subject.buffer {
                    self.pool.revoke(buffer.selector());
                }
            }
        }
    }

    pub fn set_enabled_by_thread(&self, thread: Selector, enabled: bool) -> bool {
        let mut subjects = self.subjects.lock().unwrap();
        let mut hit = false;
        for subject in subjects.values_mut() {
            if subject.thread == thread {
                subject.enabled = enabled;
                hit = true;
            }
        }
        hit
    }

    pub fn set_enabled(&self, id: u64, enabled: bool) -> Result<(), TraceError> {
        let mut subjects = self.subjects.lock().unwrap();
        subjects
            .get_mut(&id)
            .map(|s| s.enabled = enabled)
            .ok_or(TraceError::UnknownSubject)
    }

    pub fn attach_buffer(&self, id: u64, buffer: Capability) -> Result<(), TraceError> {
        let mut subjects = self.subjects.lock().unwrap();
        subjects
            .get_mut(&id)
            .map(|s| s.buffer = Some(buffer))
            .ok_or(TraceError::UnknownSubject)
    }

    pub fn list(&self) -> Vec<SubjectInfo> {
        self.subjects
            .lock()
            .unwrap()
            .iter()
            .map(|(id, s)| SubjectInfo {
                id: *id,
                name: s.name.clone(),
                enabled: s.enabled,
                has_buffer: s.buffer.is_some(),
            })
            .collect()
    }
}

pub struct TraceSessionComponent {
    registry: Arc<TraceRegistry>,
    factory: RamDataspaceFactory,
    buffers: Mutex<HashMap<u64, Capability>>,
}

impl TraceSessionComponent {
    fn new(registry: Arc<TraceRegistry>, platform: Arc<Platform>, pool: Arc<DataspacePool>) -> Self {
        Self {
            registry,
            factory: RamDataspaceFactory::new(platform, pool),
            buffers: Mutex::new(HashMap::new()),
        }
    }

    pub fn subjects(&self) -> Vec<SubjectInfo> {
        self.registry.list()
    }

    pub fn alloc_buffer(&self, subject: u64, size: u64) -> Result<Capability, TraceError> {
        let (cap, _ds) = self
            .factory
            .try_alloc(size, CacheAttribute::Cached)
            .map_err(|_| TraceError::OutOfRam)?;
        if let Err(refusal) = self.registry.attach_buffer(subject, cap) {
            let _ = self.factory.free(cap.selector());
            return Err(refusal);
        }
        self.buffers.lock().unwrap().insert(subject, cap);
        Ok(cap)
    }

    pub fn enable(&self, subject: u64) -> Result<(), TraceError> {
        self.registry.set_enabled(subject, true)
    }

    pub fn disable(&self, subject: u64) -> Result<(), TraceError> {
        self.registry.set_enabled(subject, false)
    }

    fn release(&self) {
        self.factory.release_all();
        self.buffers.lock().unwrap().clear();
    }
}

pub struct TraceService {
    registry: Arc<TraceRegistry>,
    platform: Arc<Platform>,
    pool: Arc<DataspacePool>,
    ep: Arc<Entrypoint>,
    sessions: Mutex<HashMap<Selector, Arc<TraceSessionComponent>>>,
}

impl TraceService {
    pub fn new(
        registry: Arc<TraceRegistry>,
        platform: Arc<Platform>,
        pool: Arc<DataspacePool>,
        ep: Arc<Entrypoint>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            platform,
            pool,
            ep,
            sessions: Mutex::new(HashMap::new()),
        })
    }
}

impl LocalService for TraceService {
    fn name(&self) -> &str {
        "TRACE"
    }

    fn initiate(&self, session: &SessionRef) -> Result<Capability, SessionError> {
        let ram = session.with(|s| s.donated_ram());
        if ram.value < TRACE_SESSION_RAM_COSTS {
            return Err(SessionError::InsufficientRamQuota);
        }
        let component = Arc::new(TraceSessionComponent::new(
            self.registry.clone(),
            self.platform.clone(),
            self.pool.clone(),
        ));
        let cap = self.ep.manage(
            iface::TRACE,
            Box::new(TraceDispatch {
                component: component.clone(),
            }),
        );
        self.sessions.lock().unwrap().insert(cap.selector(), component);
        Ok(cap)
    }

    fn close(&self, session: &SessionRef) {
        let cap = session.with(|s| s.cap);
        if let Some(component) = self.sessions.lock().unwrap().remove(&cap.selector()) {
            component.release();
        }
        self.ep.dissolve(&cap);
    }
}

/* RPC interface */

pub const OP_SUBJECTS: Opcode = 0;
pub const OP_ALLOC_BUFFER: Opcode = 1;
pub const OP_ENABLE: Opcode = 2;
pub const OP_DISABLE: Opcode = 3;

#[derive(Serialize, Deserialize)]
struct AllocBufferArgs {
    subject: u64,
    size: u64,
}

struct TraceDispatch {
    component: Arc<TraceSessionComponent>,
}

impl RpcObject for TraceDispatch {
    fn dispatch(&mut self, opcode: Opcode, args: &[u8]) -> Result<RpcResult, ExceptionCode> {
        match opcode {
            OP_SUBJECTS => RpcResult::with_results(&self.component.subjects()),
            OP_ALLOC_BUFFER => {
                let args: AllocBufferArgs = decode(args)?;
                let cap = self
                    .component
                    .alloc_buffer(args.subject, args.size)
                    .map_err(|e| e.exception())?;
                RpcResult::with_cap(&(), cap)
            }
            OP_ENABLE => {
                let subject: u64 = decode(args)?;
                self.component.enable(subject).map_err(|e| e.exception())?;
                RpcResult::with_results(&())
            }
            OP_DISABLE => {
                let subject: u64 = decode(args)?;
                self.component.disable(subject).map_err(|e| e.exception())?;
                RpcResult::with_results(&())
            }
            _ => Err(EXCEPTION_UNKNOWN_OPCODE),
        }
    }
}

fn map_rpc(error: RpcError) -> TraceError {
    match error {
        RpcError::Exception(code) => TraceError::from_exception(code),
        _ => TraceError::Ipc,
    }
}

/// Typed client stub of the TRACE interface
#[derive(Clone)]
pub struct TraceSessionClient {
    rpc: RpcClient,
}

impl TraceSessionClient {
    pub fn new(rpc: RpcClient) -> Self {
        Self { rpc }
    }

    pub fn subjects(&self) -> Result<Vec<SubjectInfo>, TraceError> {
        self.rpc
            .call::<_, Vec<SubjectInfo>>(OP_SUBJECTS, &())
            .map(|r| r.value)
            .map_err(map_rpc)
    }

    pub fn alloc_buffer(&self, subject: u64, size: u64) -> Result<Capability, TraceError> {
        let ret = self
            .rpc
            .call::<_, ()>(OP_ALLOC_BUFFER, &AllocBufferArgs { subject, size })
            .map_err(map_rpc)?;
        ret.caps.first().copied().ok_or(TraceError::Ipc)
    }

    pub fn enable(&self, subject: u64) -> Result<(), TraceError> {
        self.rpc
            .call::<_, ()>(OP_ENABLE, &subject)
            .map(|_| ())
            .map_err(map_rpc)
    }

    pub fn disable(&self, subject: u64) -> Result<(), TraceError> {
        self.rpc
            .call::<_, ()>(OP_DISABLE, &subject)
            .map(|_| ())
            .map_err(map_rpc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootinfo::{BootInfo, PhysRegion};

    fn registry_and_component() -> (Arc<TraceRegistry>, TraceSessionComponent) {
        let info = BootInfo {
            ram: vec![PhysRegion {
                base: 0x10_0000,
                size: 0x100_0000,
            }],
            ..Default::default()
        };
        let pool = DataspacePool::new();
        let registry = TraceRegistry::new(pool.clone());
        let component = TraceSessionComponent::new(
            registry.clone(),
            Arc::new(Platform::new(&info)),
            pool,
        );
        (registry, component)
    }

    #[test]
    fn test_subject_lifecycle() {
        let (registry, component) = registry_and_component();
        let id = registry.insert(100, "init -> worker");

        let listed = component.subjects();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, id);
        assert!(!listed[0].enabled);

        component.enable(id).unwrap();
        assert!(component.subjects()[0].enabled);
        component.disable(id).unwrap();
        assert_eq!(
            component.enable(id + 1).unwrap_err(),
            TraceError::UnknownSubject
        );
    }

    #[test]
    fn test_buffer_follows_the_thread() {
        let (registry, component) = registry_and_component();
        let id = registry.insert(100, "worker");

        let buffer = component.alloc_buffer(id, 0x4000).unwrap();
        assert!(component.subjects()[0].has_buffer);
        assert!(registry.pool.lookup(buffer.selector()).is_some());

        // killing the thread revokes the buffer capability
        registry.remove_by_thread(100);
        assert!(registry.pool.lookup(buffer.selector()).is_none());
        assert!(component.subjects().is_empty());
    }

    #[test]
    fn test_buffer_for_unknown_subject() {
        let (_registry, component) = registry_and_component();
        assert_eq!(
            component.alloc_buffer(99, 0x1000).unwrap_err(),
            TraceError::UnknownSubject
        );
        // the dataspace was rolled back
        assert_eq!(component.factory.allocation_count(), 0);
    }
}
