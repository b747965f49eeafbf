//! IO_PORT service: port-I/O access over an allocated range
//!
//! A session claims one port range and gets byte/word/dword accessors
//! over it. Architectures without port I/O surface the kernel's
//! unsupported error; the service shape stays the same there.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use lattice_base::rpc::{
    decode, Entrypoint, ExceptionCode, Opcode, RpcClient, RpcError, RpcObject, RpcResult,
    EXCEPTION_IFACE_BASE, EXCEPTION_UNKNOWN_OPCODE,
};
use lattice_base::{Capability, Selector};
use lattice_kernel::{KernelError, KernelInterface};
use lattice_session::{LocalService, SessionError, SessionRef};

use crate::iface;
use crate::platform::Platform;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum IoPortError {
    #[error("port lies outside the session's range")]
    OutOfRange,

    #[error("port I/O is not supported on this platform")]
    Unsupported,

    #[error("transport failure")]
    Ipc,
}

impl IoPortError {
    fn exception(&self) -> ExceptionCode {
        EXCEPTION_IFACE_BASE
            + match self {
                IoPortError::OutOfRange => 0,
                IoPortError::Unsupported => 1,
                IoPortError::Ipc => 2,
            }
    }

    fn from_exception(code: ExceptionCode) -> IoPortError {
        match code.checked_sub(EXCEPTION_IFACE_BASE) {
            Some(0) => IoPortError::OutOfRange,
            Some(1) => IoPortError::Unsupported,
            _ => IoPortError::Ipc,
        }
    }
}

pub struct IoPortSessionComponent {
    kernel: Arc<dyn KernelInterface>,
    base: u16,
    count: u16,
}

impl IoPortSessionComponent {
    fn check(&self, port: u16, width: u8) -> Result<(), IoPortError> {
        let end = self.base as u32 + self.count as u32;
        if (port as u32) < self.base as u32 || port as u32 + width as u32 > end {
            return Err(IoPortError::OutOfRange);
        }
        Ok(())
    }

    pub fn read(&self, port: u16, width: u8) -> Result<u32, IoPortError> {
        self.check(port, width)?;
        self.kernel.port_read(port, width).map_err(|e| match e {
            KernelError::Unsupported => IoPortError::Unsupported,
            _ => IoPortError::OutOfRange,
        })
    }

    pub fn write(&self, port: u16, width: u8, value: u32) -> Result<(), IoPortError> {
        self.check(port, width)?;
        self.kernel
            .port_write(port, width, value)
            .map_err(|e| match e {
                KernelError::Unsupported => IoPortError::Unsupported,
                _ => IoPortError::OutOfRange,
            })
    }
}

pub struct IoPortService {
    kernel: Arc<dyn KernelInterface>,
    platform: Arc<Platform>,
    ep: Arc<Entrypoint>,
    sessions: Mutex<HashMap<Selector, u16>>,
}

impl IoPortService {
    pub fn new(
        kernel: Arc<dyn KernelInterface>,
        platform: Arc<Platform>,
        ep: Arc<Entrypoint>,
    ) -> Arc<Self> {
        Arc::new(Self {
            kernel,
            platform,
            ep,
            sessions: Mutex::new(HashMap::new()),
        })
    }
}

impl LocalService for IoPortService {
    fn name(&self) -> &str {
        "IO_PORT"
    }

    fn initiate(&self, session: &SessionRef) -> Result<Capability, SessionError> {
        let (label, args) = session.with(|s| (s.label().clone(), s.args().clone()));
        let base = args.ulong("io_port_base", 0);
        let count = args.ulong("io_port_size", 0);
        if count == 0 || base > u16::MAX as u64 || base + count > u16::MAX as u64 + 1 {
            return Err(SessionError::Denied);
        }

        if self
            .platform
            .request_io_ports(base as u16, count as u16, label.as_str())
            .is_err()
        {
            log::warn!(
                "IO_PORT {:#x}+{:#x} denied for '{}'",
                base,
                count,
                label
            );
            return Err(SessionError::Denied);
        }

        let cap = self.ep.manage(
            iface::IO_PORT,
            Box::new(IoPortDispatch {
                component: IoPortSessionComponent {
                    kernel: self.kernel.clone(),
                    base: base as u16,
                    count: count as u16,
                },
            }),
        );
        self.sessions.lock().unwrap().insert(cap.selector(), base as u16);
        Ok(cap)
    }

    fn close(&self, session: &SessionRef) {
        let cap = session.with(|s| s.cap);
        if let Some(base) = self.sessions.lock().unwrap().remove(&cap.selector()) {
            let _ = self.platform.release_io_ports(base);
        }
        self.ep.dissolve(&cap);
    }
}

/* RPC interface */

pub const OP_READ: Opcode = 0;
pub const OP_WRITE: Opcode = 1;

#[derive(Serialize, Deserialize)]
struct ReadArgs {
    port: u16,
    width: u8,
}

#[derive(Serialize, Deserialize)]
struct WriteArgs {
    port: u16,
    width: u8,
    value: u32,
}

struct IoPortDispatch {
    component: IoPortSessionComponent,
}

impl RpcObject for IoPortDispatch {
    fn dispatch(&mut self, opcode: Opcode, args: &[u8]) -> Result<RpcResult, ExceptionCode> {
        match opcode {
            OP_READ => {
                let args: ReadArgs = decode(args)?;
                let value = self
                    .component
                    .read(args.port, args.width)
                    .map_err(|e| e.exception())?;
                RpcResult::with_results(&value)
            }
            OP_WRITE => {
                let args: WriteArgs = decode(args)?;
                self.component
                    .write(args.port, args.width, args.value)
                    .map_err(|e| e.exception())?;
                RpcResult::with_results(&())
            }
            _ => Err(EXCEPTION_UNKNOWN_OPCODE),
        }
    }
}

fn map_rpc(error: RpcError) -> IoPortError {
    match error {
        RpcError::Exception(code) => IoPortError::from_exception(code),
        _ => IoPortError::Ipc,
    }
}

/// Typed client stub of the IO_PORT interface
#[derive(Clone)]
pub struct IoPortSessionClient {
    rpc: RpcClient,
}

impl IoPortSessionClient {
    pub fn new(rpc: RpcClient) -> Self {
        Self { rpc }
    }

    pub fn inb(&self, port: u16) -> Result<u8, IoPortError> {
        self.read(port, 1).map(|v| v as u8)
    }

    pub fn inw(&self, port: u16) -> Result<u16, IoPortError> {
        self.read(port, 2).map(|v| v as u16)
    }

    pub fn inl(&self, port: u16) -> Result<u32, IoPortError> {
        self.read(port, 4)
    }

    pub fn outb(&self, port: u16, value: u8) -> Result<(), IoPortError> {
        self.write(port, 1, value as u32)
    }

    pub fn outw(&self, port: u16, value: u16) -> Result<(), IoPortError> {
        self.write(port, 2, value as u32)
    }

    pub fn outl(&self, port: u16, value: u32) -> Result<(), IoPortError> {
        self.write(port, 4, value)
    }

    fn read(&self, port: u16, width: u8) -> Result<u32, IoPortError> {
        self.rpc
            .call::<_, u32>(OP_READ, &ReadArgs { port, width })
            .map(|r| r.value)
            .map_err(map_rpc)
    }

    fn write(&self, port: u16, width: u8, value: u32) -> Result<(), IoPortError> {
        self.rpc
            .call::<_, ()>(OP_WRITE, &WriteArgs { port, width, value })
            .map(|_| ())
            .map_err(map_rpc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_kernel::MockKernel;

    #[test]
    fn test_range_is_enforced() {
        let component = IoPortSessionComponent {
            kernel: Arc::new(MockKernel::new()),
            base: 0x3f8,
            count: 8,
        };

        component.write(0x3f8, 1, 0x55).unwrap();
        assert_eq!(component.read(0x3f8, 1).unwrap(), 0x55);
        assert_eq!(component.read(0x3ff, 1).unwrap(), 0);

        assert_eq!(
            component.read(0x3f7, 1).unwrap_err(),
            IoPortError::OutOfRange
        );
        assert_eq!(
            component.read(0x400, 1).unwrap_err(),
            IoPortError::OutOfRange
        );
        // a dword read crossing the range end is refused
        assert_eq!(
            component.read(0x3fe, 4).unwrap_err(),
            IoPortError::OutOfRange
        );
    }
}
