//! RPC framework: entrypoints, typed stubs, and the wire format
//!
//! An entrypoint is a dedicated thread owning a registry of RPC objects
//! and a request channel. A call names a capability selector, an opcode,
//! and a serialized argument blob; the reply carries a numeric exception
//! code, a result blob, and any capabilities handed out, delegated
//! atomically with the reply.
//!
//! Dispatch serializes all objects managed by one entrypoint: the registry
//! lock is held for the duration of a handler. Calls to objects on
//! different entrypoints proceed in parallel. Closing the request channel
//! cancels the dispatch loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam::channel::{unbounded, Receiver, Sender};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::cap::{Capability, IfaceId, Selector};

/// Operation selector within one RPC interface
pub type Opcode = u16;

/// Numeric exception code travelling in replies; `0` means success
pub type ExceptionCode = u32;

pub const EXCEPTION_OK: ExceptionCode = 0;
/// The capability does not name a live object on this entrypoint
pub const EXCEPTION_INVALID_OBJECT: ExceptionCode = 1;
/// The argument blob did not decode against the interface description
pub const EXCEPTION_BAD_MESSAGE: ExceptionCode = 2;
/// The opcode is not part of the interface
pub const EXCEPTION_UNKNOWN_OPCODE: ExceptionCode = 3;
/// First code available to interface-specific exception lists
pub const EXCEPTION_IFACE_BASE: ExceptionCode = 16;

/// Client-visible failure of an RPC call
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("entrypoint is gone")]
    Disconnected,

    #[error("server raised exception code {0}")]
    Exception(ExceptionCode),

    #[error("malformed message payload")]
    Payload,
}

/// Successful handler outcome: result blob plus handed-out capabilities
#[derive(Default)]
pub struct RpcResult {
    pub results: Vec<u8>,
    pub caps: Vec<Capability>,
}

impl RpcResult {
    pub fn with_results<T: Serialize>(value: &T) -> Result<Self, ExceptionCode> {
        Ok(Self {
            results: encode(value)?,
            caps: Vec::new(),
        })
    }

    pub fn with_cap<T: Serialize>(value: &T, cap: Capability) -> Result<Self, ExceptionCode> {
        Ok(Self {
            results: encode(value)?,
            caps: vec![cap],
        })
    }
}

/// Server-side object reachable through an entrypoint
pub trait RpcObject: Send {
    fn dispatch(&mut self, opcode: Opcode, args: &[u8]) -> Result<RpcResult, ExceptionCode>;
}

struct CallRequest {
    selector: Selector,
    opcode: Opcode,
    args: Vec<u8>,
    reply_tx: Sender<Reply>,
}

enum Request {
    Call(CallRequest),
    Shutdown,
}

struct Reply {
    exception: ExceptionCode,
    results: Vec<u8>,
    caps: Vec<Capability>,
}

type Registry = Arc<Mutex<HashMap<Selector, Box<dyn RpcObject>>>>;

/// A dispatch thread serving RPC objects on a kernel IPC endpoint
pub struct Entrypoint {
    name: String,
    tx: Sender<Request>,
    registry: Registry,
    next_selector: AtomicU64,
    thread: Option<JoinHandle<()>>,
}

impl Entrypoint {
    pub fn new(name: &str) -> Self {
        let (tx, rx) = unbounded();
        let registry: Registry = Arc::new(Mutex::new(HashMap::new()));
        let dispatch_registry = registry.clone();
        let thread = std::thread::Builder::new()
            .name(format!("ep-{name}"))
            .spawn(move || dispatch_loop(rx, dispatch_registry))
            .ok();
        if thread.is_none() {
            log::error!("failed to spawn entrypoint thread '{}'", name);
        }
        Self {
            name: name.into(),
            tx,
            registry,
            next_selector: AtomicU64::new(1),
            thread,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Associate an object with this entrypoint and return its capability
    pub fn manage(&self, iface: IfaceId, object: Box<dyn RpcObject>) -> Capability {
        let selector = self.next_selector.fetch_add(1, Ordering::Relaxed);
        self.registry.lock().unwrap().insert(selector, object);
        Capability::new(selector, iface)
    }

    /// Remove an object; pending calls to it fail with an invalid-object
    /// exception
    pub fn dissolve(&self, cap: &Capability) -> bool {
        self.registry.lock().unwrap().remove(&cap.selector()).is_some()
    }

    pub fn managed_count(&self) -> usize {
        self.registry.lock().unwrap().len()
    }

    /// A client stub speaking to `cap` through this entrypoint
    pub fn client(&self, cap: Capability) -> RpcClient {
        RpcClient {
            tx: self.tx.clone(),
            cap,
        }
    }
}

impl Drop for Entrypoint {
    fn drop(&mut self) {
        let _ = self.tx.send(Request::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn dispatch_loop(rx: Receiver<Request>, registry: Registry) {
    while let Ok(request) = rx.recv() {
        let call = match request {
            Request::Shutdown => break,
            Request::Call(call) => call,
        };
        let reply = {
            let mut registry = registry.lock().unwrap();
            match registry.get_mut(&call.selector) {
                None => Reply {
                    exception: EXCEPTION_INVALID_OBJECT,
                    results: Vec::new(),
                    caps: Vec::new(),
                },
                Some(object) => match object.dispatch(call.opcode, &call.args) {
                    Ok(result) => Reply {
                        exception: EXCEPTION_OK,
                        results: result.results,
                        caps: result.caps,
                    },
                    Err(exception) => Reply {
                        exception,
                        results: Vec::new(),
                        caps: Vec::new(),
                    },
                },
            }
        };
        let _ = call.reply_tx.send(reply);
    }
}

/// Typed call result: decoded value plus delegated capabilities
#[derive(Debug)]
pub struct CallReturn<R> {
    pub value: R,
    pub caps: Vec<Capability>,
}

/// Client stub bound to one capability on one entrypoint
#[derive(Clone)]
pub struct RpcClient {
    tx: Sender<Request>,
    cap: Capability,
}

impl RpcClient {
    pub fn cap(&self) -> Capability {
        self.cap
    }

    /// Perform a call, blocking until the server replies
    pub fn call<A: Serialize, R: DeserializeOwned>(
        &self,
        opcode: Opcode,
        args: &A,
    ) -> Result<CallReturn<R>, RpcError> {
        let args = bincode::serialize(args).map_err(|_| RpcError::Payload)?;
        let (reply_tx, reply_rx) = unbounded();
        self.tx
            .send(Request::Call(CallRequest {
                selector: self.cap.selector(),
                opcode,
                args,
                reply_tx,
            }))
            .map_err(|_| RpcError::Disconnected)?;
        let reply = reply_rx.recv().map_err(|_| RpcError::Disconnected)?;
        if reply.exception != EXCEPTION_OK {
            return Err(RpcError::Exception(reply.exception));
        }
        let value = bincode::deserialize(&reply.results).map_err(|_| RpcError::Payload)?;
        Ok(CallReturn {
            value,
            caps: reply.caps,
        })
    }
}

/// Decode an argument blob inside a dispatch handler
pub fn decode<T: DeserializeOwned>(args: &[u8]) -> Result<T, ExceptionCode> {
    bincode::deserialize(args).map_err(|_| EXCEPTION_BAD_MESSAGE)
}

/// Encode a handler result
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ExceptionCode> {
    bincode::serialize(value).map_err(|_| EXCEPTION_BAD_MESSAGE)
}
