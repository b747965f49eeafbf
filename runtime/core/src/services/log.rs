//! LOG service: label-tagged line output for client diagnostics
//!
//! Clients write byte strings; core flushes complete lines to its own
//! log, each prefixed with the session label. Partial writes accumulate
//! until a newline arrives.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use lattice_base::rpc::{
    decode, Entrypoint, ExceptionCode, Opcode, RpcClient, RpcObject, RpcResult,
    EXCEPTION_UNKNOWN_OPCODE,
};
use lattice_base::{Capability, Label, Selector};
use lattice_session::{LocalService, SessionError, SessionRef};

use crate::iface;

pub struct LogSessionComponent {
    label: Label,
    buffer: Mutex<String>,
    lines: Mutex<Vec<String>>,
}

impl LogSessionComponent {
    fn new(label: Label) -> Self {
        Self {
            label,
            buffer: Mutex::new(String::new()),
            lines: Mutex::new(Vec::new()),
        }
    }

    /// Append output; complete lines are flushed immediately
    pub fn write(&self, message: &str) -> usize {
        let mut buffer = self.buffer.lock().unwrap();
        buffer.push_str(message);
        while let Some(newline) = buffer.find('\n') {
            let line: String = buffer.drain(..=newline).collect();
            let line = line.trim_end_matches('\n');
            log::info!("[{}] {}", self.label, line);
            self.lines.lock().unwrap().push(line.to_string());
        }
        message.len()
    }

    /// Lines flushed so far
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }

    fn flush_remainder(&self) {
        let mut buffer = self.buffer.lock().unwrap();
        if !buffer.is_empty() {
            log::info!("[{}] {}", self.label, buffer);
            self.lines.lock().unwrap().push(std::mem::take(&mut *buffer));
        }
    }
}

pub struct LogService {
    ep: Arc<Entrypoint>,
    sessions: Mutex<HashMap<Selector, Arc<LogSessionComponent>>>,
}

impl LogService {
    pub fn new(ep: Arc<Entrypoint>) -> Arc<Self> {
        Arc::new(Self {
            ep,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    pub fn session_component(&self, cap: Capability) -> Option<Arc<LogSessionComponent>> {
        self.sessions.lock().unwrap().get(&cap.selector()).cloned()
    }
}

impl LocalService for LogService {
    fn name(&self) -> &str {
        "LOG"
    }

    fn initiate(&self, session: &SessionRef) -> Result<Capability, SessionError> {
        let label = session.with(|s| s.label().clone());
        let component = Arc::new(LogSessionComponent::new(label));
        let cap = self.ep.manage(
            iface::LOG,
            Box::new(LogDispatch {
                component: component.clone(),
            }),
        );
        self.sessions.lock().unwrap().insert(cap.selector(), component);
        Ok(cap)
    }

    fn close(&self, session: &SessionRef) {
        let cap = session.with(|s| s.cap);
        if let Some(component) = self.sessions.lock().unwrap().remove(&cap.selector()) {
            component.flush_remainder();
        }
        self.ep.dissolve(&cap);
    }
}

/* RPC interface */

pub const OP_WRITE: Opcode = 0;

struct LogDispatch {
    component: Arc<LogSessionComponent>,
}

impl RpcObject for LogDispatch {
    fn dispatch(&mut self, opcode: Opcode, args: &[u8]) -> Result<RpcResult, ExceptionCode> {
        match opcode {
            OP_WRITE => {
                let message: String = decode(args)?;
                let written = self.component.write(&message);
                RpcResult::with_results(&(written as u64))
            }
            _ => Err(EXCEPTION_UNKNOWN_OPCODE),
        }
    }
}

/// Typed client stub of the LOG interface
#[derive(Clone)]
pub struct LogSessionClient {
    rpc: RpcClient,
}

impl LogSessionClient {
    pub fn new(rpc: RpcClient) -> Self {
        Self { rpc }
    }

    pub fn write(&self, message: &str) -> usize {
        self.rpc
            .call::<_, u64>(OP_WRITE, &message.to_string())
            .map(|r| r.value as usize)
            .unwrap_or(0)
    }
}
