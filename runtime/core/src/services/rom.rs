//! ROM service: read-only dataspaces keyed by module name
//!
//! Backed at boot by the modules the bootloader handed over, plus ROMs
//! generated at runtime by writing a buffer and publishing it. Clients
//! install a signal handler for change notifications and call `update`
//! to refresh; `update` reports whether the existing dataspace could be
//! reused, otherwise the client fetches a fresh one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use lattice_base::rpc::{
    decode, Entrypoint, ExceptionCode, Opcode, RpcClient, RpcObject, RpcResult,
    EXCEPTION_UNKNOWN_OPCODE,
};
use lattice_base::{Capability, Selector};
use lattice_session::{LocalService, SessionError, SessionRef};

use crate::bootinfo::BootModule;
use crate::dataspace::{Dataspace, DataspacePool};
use crate::iface;
use crate::services::signal::SignalBroker;

/// Metadata cost a ROM session must cover
pub const ROM_SESSION_RAM_COSTS: u64 = 4096;

/// One named read-only module
pub struct RomModule {
    name: String,
    content: Mutex<Vec<u8>>,
    version: AtomicU64,
    sighs: Mutex<Vec<Capability>>,
}

impl RomModule {
    fn new(name: &str, content: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            content: Mutex::new(content),
            version: AtomicU64::new(1),
            sighs: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn content(&self) -> Vec<u8> {
        self.content.lock().unwrap().clone()
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    fn add_sigh(&self, cap: Capability) {
        self.sighs.lock().unwrap().push(cap);
    }

    fn remove_sigh(&self, cap: Capability) {
        self.sighs
            .lock()
            .unwrap()
            .retain(|c| c.selector() != cap.selector());
    }
}

/// All modules known to core
pub struct RomRegistry {
    modules: Mutex<HashMap<String, Arc<RomModule>>>,
    hub: Arc<SignalBroker>,
}

impl RomRegistry {
    pub fn new(hub: Arc<SignalBroker>) -> Arc<Self> {
        Arc::new(Self {
            modules: Mutex::new(HashMap::new()),
            hub,
        })
    }

    pub fn register_boot_modules(&self, modules: &[BootModule]) {
        for module in modules {
            self.insert(&module.name, module.content.clone());
        }
    }

    pub fn insert(&self, name: &str, content: Vec<u8>) -> Arc<RomModule> {
        let module = RomModule::new(name, content);
        self.modules
            .lock()
            .unwrap()
            .insert(name.into(), module.clone());
        module
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<RomModule>> {
        self.modules.lock().unwrap().get(name).cloned()
    }

    /// Publish new content for a dynamically generated ROM and signal
    /// every session watching it
    pub fn publish(&self, name: &str, content: Vec<u8>) -> bool {
        let Some(module) = self.lookup(name) else {
            return false;
        };
        *module.content.lock().unwrap() = content;
        module.version.fetch_add(1, Ordering::SeqCst);
        let sighs = module.sighs.lock().unwrap().clone();
        for sigh in sighs {
            if self.hub.submit(sigh.selector(), 1).is_err() {
                log::warn!(
                    "ROM '{}': dropping change notification for a dead context",
                    name
                );
            }
        }
        true
    }
}

pub struct RomSessionComponent {
    module: Arc<RomModule>,
    pool: Arc<DataspacePool>,
    dataspace: Mutex<Option<(Capability, Arc<Dataspace>)>>,
    seen_version: AtomicU64,
    sigh: Mutex<Option<Capability>>,
}

impl RomSessionComponent {
    fn new(module: Arc<RomModule>, pool: Arc<DataspacePool>) -> Self {
        Self {
            module,
            pool,
            dataspace: Mutex::new(None),
            seen_version: AtomicU64::new(0),
            sigh: Mutex::new(None),
        }
    }

    /// Dataspace holding the module content as of the last refresh
    pub fn dataspace(&self) -> Capability {
        let mut slot = self.dataspace.lock().unwrap();
        if let Some((cap, _)) = slot.as_ref() {
            return *cap;
        }
        let content = self.module.content();
        let ds = Arc::new(Dataspace::rom(content));
        let cap = self.pool.mint(ds.clone());
        self.seen_version
            .store(self.module.version(), Ordering::SeqCst);
        *slot = Some((cap, ds));
        cap
    }

    /// Re-read the module; reports whether the dataspace stayed fit
    pub fn update(&self) -> bool {
        let mut slot = self.dataspace.lock().unwrap();
        let content = self.module.content();
        match slot.as_ref() {
            Some((_, ds)) if ds.refresh(&content) => {
                self.seen_version
                    .store(self.module.version(), Ordering::SeqCst);
                true
            }
            Some((cap, _)) => {
                // too large for the handed-out dataspace; the client
                // fetches a new one
                self.pool.revoke(cap.selector());
                *slot = None;
                false
            }
            None => false,
        }
    }

    pub fn sigh(&self, cap: Capability) {
        let mut slot = self.sigh.lock().unwrap();
        if let Some(old) = slot.take() {
            self.module.remove_sigh(old);
        }
        self.module.add_sigh(cap);
        *slot = Some(cap);
    }

    fn release(&self) {
        if let Some(cap) = self.sigh.lock().unwrap().take() {
            self.module.remove_sigh(cap);
        }
        if let Some((cap, _)) = self.dataspace.lock().unwrap().take() {
            self.pool.revoke(cap.selector());
        }
    }
}

/// The ROM service as published through core's router
pub struct RomService {
    registry: Arc<RomRegistry>,
    pool: Arc<DataspacePool>,
    ep: Arc<Entrypoint>,
    sessions: Mutex<HashMap<Selector, Arc<RomSessionComponent>>>,
}

impl RomService {
    pub fn new(
        registry: Arc<RomRegistry>,
        pool: Arc<DataspacePool>,
        ep: Arc<Entrypoint>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            pool,
            ep,
            sessions: Mutex::new(HashMap::new()),
        })
    }
}

impl LocalService for RomService {
    fn name(&self) -> &str {
        "ROM"
    }

    fn initiate(&self, session: &SessionRef) -> Result<Capability, SessionError> {
        let (label, ram) = session.with(|s| (s.label().clone(), s.donated_ram()));
        if ram.value < ROM_SESSION_RAM_COSTS {
            return Err(SessionError::InsufficientRamQuota);
        }
        // the module is named by the label's last element
        let module_name = label.last_element().to_string();
        let module = self.registry.lookup(&module_name).ok_or_else(|| {
            log::warn!("ROM module '{}' does not exist", module_name);
            SessionError::Denied
        })?;

        let component = Arc::new(RomSessionComponent::new(module, self.pool.clone()));
        let cap = self.ep.manage(
            iface::ROM,
            Box::new(RomDispatch {
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

pub const OP_DATASPACE: Opcode = 0;
pub const OP_SIGH: Opcode = 1;
pub const OP_UPDATE: Opcode = 2;

struct RomDispatch {
    component: Arc<RomSessionComponent>,
}

impl RpcObject for RomDispatch {
    fn dispatch(&mut self, opcode: Opcode, args: &[u8]) -> Result<RpcResult, ExceptionCode> {
        match opcode {
            OP_DATASPACE => {
                let cap = self.component.dataspace();
                RpcResult::with_cap(&(), cap)
            }
            OP_SIGH => {
                let sigh: Capability = decode(args)?;
                self.component.sigh(sigh);
                RpcResult::with_results(&())
            }
            OP_UPDATE => RpcResult::with_results(&self.component.update()),
            _ => Err(EXCEPTION_UNKNOWN_OPCODE),
        }
    }
}

/// Typed client stub of the ROM interface
#[derive(Clone)]
pub struct RomSessionClient {
    rpc: RpcClient,
}

impl RomSessionClient {
    pub fn new(rpc: RpcClient) -> Self {
        Self { rpc }
    }

    pub fn dataspace(&self) -> Option<Capability> {
        self.rpc
            .call::<_, ()>(OP_DATASPACE, &())
            .ok()
            .and_then(|r| r.caps.first().copied())
    }

    pub fn sigh(&self, cap: Capability) -> bool {
        self.rpc.call::<_, ()>(OP_SIGH, &cap).is_ok()
    }

    pub fn update(&self) -> bool {
        self.rpc
            .call::<_, bool>(OP_UPDATE, &())
            .map(|r| r.value)
            .unwrap_or(false)
    }
}
