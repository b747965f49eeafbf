//! IO_MEM service: device-memory windows as dataspaces
//!
//! A session claims one MMIO window. The window must lie inside the
//! ranges the platform reported and must not be held by another client;
//! a collision denies the session and the log names the holder.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use lattice_base::rpc::{
    Entrypoint, ExceptionCode, Opcode, RpcClient, RpcObject, RpcResult, EXCEPTION_UNKNOWN_OPCODE,
};
use lattice_base::{Capability, Selector};
use lattice_kernel::{KernelInterface, MmioHandle};
use lattice_session::{LocalService, SessionError, SessionRef};

use crate::dataspace::{Dataspace, DataspacePool};
use crate::iface;
use crate::platform::Platform;

pub struct IoMemSessionComponent {
    base: u64,
    dataspace_cap: Capability,
    mapping: MmioHandle,
}

pub struct IoMemService {
    kernel: Arc<dyn KernelInterface>,
    platform: Arc<Platform>,
    pool: Arc<DataspacePool>,
    ep: Arc<Entrypoint>,
    sessions: Mutex<HashMap<Selector, IoMemSessionComponent>>,
}

impl IoMemService {
    pub fn new(
        kernel: Arc<dyn KernelInterface>,
        platform: Arc<Platform>,
        pool: Arc<DataspacePool>,
        ep: Arc<Entrypoint>,
    ) -> Arc<Self> {
        Arc::new(Self {
            kernel,
            platform,
            pool,
            ep,
            sessions: Mutex::new(HashMap::new()),
        })
    }
}

impl LocalService for IoMemService {
    fn name(&self) -> &str {
        "IO_MEM"
    }

    fn initiate(&self, session: &SessionRef) -> Result<Capability, SessionError> {
        let (label, args) = session.with(|s| (s.label().clone(), s.args().clone()));
        let base = args.ulong("base", 0);
        let size = args.ulong("size", 0);
        let write_combined = args.string("wc").map(|v| v == "yes").unwrap_or(false);
        if size == 0 {
            return Err(SessionError::Denied);
        }

        if let Err(refusal) = self.platform.request_io_mem(base, size, label.as_str()) {
            match self.platform.io_mem_holder(base) {
                Some(holder) => log::warn!(
                    "IO_MEM {:#x}+{:#x} denied for '{}', held by '{}'",
                    base,
                    size,
                    label,
                    holder
                ),
                None => log::warn!(
                    "IO_MEM {:#x}+{:#x} denied for '{}': {}",
                    base,
                    size,
                    label,
                    refusal
                ),
            }
            return Err(SessionError::Denied);
        }

        let mapping = match self.kernel.map_mmio(base, size, write_combined) {
            Ok(mapping) => mapping,
            Err(_) => {
                let _ = self.platform.release_io_mem(base);
                return Err(SessionError::Unavailable);
            }
        };

        let dataspace = Arc::new(Dataspace::io_mem(base, size, write_combined));
        let dataspace_cap = self.pool.mint(dataspace);
        let cap = self.ep.manage(
            iface::IO_MEM,
            Box::new(IoMemDispatch { dataspace_cap }),
        );
        self.sessions.lock().unwrap().insert(
            cap.selector(),
            IoMemSessionComponent {
                base,
                dataspace_cap,
                mapping,
            },
        );
        Ok(cap)
    }

    fn close(&self, session: &SessionRef) {
        let cap = session.with(|s| s.cap);
        if let Some(component) = self.sessions.lock().unwrap().remove(&cap.selector()) {
            let _ = self.kernel.unmap_mmio(component.mapping);
            let _ = self.platform.release_io_mem(component.base);
            self.pool.revoke(component.dataspace_cap.selector());
        }
        self.ep.dissolve(&cap);
    }
}

/* RPC interface */

pub const OP_DATASPACE: Opcode = 0;

struct IoMemDispatch {
    dataspace_cap: Capability,
}

impl RpcObject for IoMemDispatch {
    fn dispatch(&mut self, opcode: Opcode, _args: &[u8]) -> Result<RpcResult, ExceptionCode> {
        match opcode {
            OP_DATASPACE => RpcResult::with_cap(&(), self.dataspace_cap),
            _ => Err(EXCEPTION_UNKNOWN_OPCODE),
        }
    }
}

/// Typed client stub of the IO_MEM interface
#[derive(Clone)]
pub struct IoMemSessionClient {
    rpc: RpcClient,
}

impl IoMemSessionClient {
    pub fn new(rpc: RpcClient) -> Self {
        Self { rpc }
    }

    pub fn dataspace(&self) -> Option<Capability> {
        self.rpc
            .call::<_, ()>(OP_DATASPACE, &())
            .ok()
            .and_then(|r| r.caps.first().copied())
    }
}
