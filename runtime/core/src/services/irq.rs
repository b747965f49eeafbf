//! IRQ service: interrupt lines delivered as signals
//!
//! A session binds one interrupt line to a kernel IRQ object. Core
//! dispatches a signal to the client's handler context on every latched
//! interrupt; the client acknowledges before the next one can fire.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use lattice_base::rpc::{
    decode, Entrypoint, ExceptionCode, Opcode, RpcClient, RpcError, RpcObject, RpcResult,
    EXCEPTION_IFACE_BASE, EXCEPTION_UNKNOWN_OPCODE,
};
use lattice_base::{Capability, Selector};
use lattice_kernel::{IrqHandle, IrqPolarity, IrqTrigger, KernelInterface};
use lattice_session::{LocalService, SessionError, SessionRef};

use crate::iface;
use crate::platform::Platform;
use crate::services::signal::SignalBroker;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum IrqError {
    #[error("interrupt object is gone")]
    InvalidHandle,

    #[error("transport failure")]
    Ipc,
}

impl IrqError {
    fn exception(&self) -> ExceptionCode {
        EXCEPTION_IFACE_BASE
            + match self {
                IrqError::InvalidHandle => 0,
                IrqError::Ipc => 1,
            }
    }

    fn from_exception(code: ExceptionCode) -> IrqError {
        match code.checked_sub(EXCEPTION_IFACE_BASE) {
            Some(0) => IrqError::InvalidHandle,
            _ => IrqError::Ipc,
        }
    }
}

pub struct IrqSessionComponent {
    kernel: Arc<dyn KernelInterface>,
    number: u32,
    irq: IrqHandle,
    sigh: Arc<Mutex<Option<Capability>>>,
}

impl IrqSessionComponent {
    fn new(
        kernel: Arc<dyn KernelInterface>,
        hub: Arc<SignalBroker>,
        number: u32,
        trigger: IrqTrigger,
        polarity: IrqPolarity,
    ) -> Result<Self, SessionError> {
        let irq = kernel
            .create_irq(number, trigger, polarity)
            .map_err(|_| SessionError::Unavailable)?;

        let sigh: Arc<Mutex<Option<Capability>>> = Arc::new(Mutex::new(None));
        let handler_sigh = sigh.clone();
        let result = kernel.irq_register(
            irq,
            Box::new(move || {
                let slot = handler_sigh.lock().unwrap();
                match slot.as_ref() {
                    Some(cap) => {
                        if hub.submit(cap.selector(), 1).is_err() {
                            log::warn!("interrupt {} hit a dead signal context", number);
                        }
                    }
                    None => log::debug!("interrupt {} latched without a handler", number),
                }
            }),
        );
        if result.is_err() {
            let _ = kernel.destroy_irq(irq);
            return Err(SessionError::Unavailable);
        }

        Ok(Self {
            kernel,
            number,
            irq,
            sigh,
        })
    }

    /// Install the signal context receiving one signal per interrupt
    pub fn sigh(&self, cap: Capability) {
        *self.sigh.lock().unwrap() = Some(cap);
    }

    /// Re-arm the line; required before the next signal can fire
    pub fn ack_irq(&self) -> Result<(), IrqError> {
        self.kernel.irq_ack(self.irq).map_err(|_| IrqError::InvalidHandle)
    }

    fn release(&self) {
        let _ = self.kernel.destroy_irq(self.irq);
    }
}

pub struct IrqService {
    kernel: Arc<dyn KernelInterface>,
    platform: Arc<Platform>,
    hub: Arc<SignalBroker>,
    ep: Arc<Entrypoint>,
    sessions: Mutex<HashMap<Selector, Arc<IrqSessionComponent>>>,
}

impl IrqService {
    pub fn new(
        kernel: Arc<dyn KernelInterface>,
        platform: Arc<Platform>,
        hub: Arc<SignalBroker>,
        ep: Arc<Entrypoint>,
    ) -> Arc<Self> {
        Arc::new(Self {
            kernel,
            platform,
            hub,
            ep,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Kernel IRQ object serving a session, for test interrupt injection
    pub fn irq_handle(&self, cap: Capability) -> Option<IrqHandle> {
        self.sessions
            .lock()
            .unwrap()
            .get(&cap.selector())
            .map(|c| c.irq)
    }
}

fn parse_trigger(value: Option<String>) -> IrqTrigger {
    match value.as_deref() {
        Some("edge") => IrqTrigger::Edge,
        Some("level") => IrqTrigger::Level,
        _ => IrqTrigger::Unchanged,
    }
}

fn parse_polarity(value: Option<String>) -> IrqPolarity {
    match value.as_deref() {
        Some("high") => IrqPolarity::High,
        Some("low") => IrqPolarity::Low,
        _ => IrqPolarity::Unchanged,
    }
}

impl LocalService for IrqService {
    fn name(&self) -> &str {
        "IRQ"
    }

    fn initiate(&self, session: &SessionRef) -> Result<Capability, SessionError> {
        let (label, args) = session.with(|s| (s.label().clone(), s.args().clone()));
        let number = args.ulong("irq_number", u64::MAX);
        if number > u32::MAX as u64 {
            return Err(SessionError::Denied);
        }
        let number = number as u32;
        let trigger = parse_trigger(args.string("irq_trigger"));
        let polarity = parse_polarity(args.string("irq_polarity"));

        if self.platform.request_irq(number, label.as_str()).is_err() {
            log::warn!("IRQ {} denied for '{}'", number, label);
            return Err(SessionError::Denied);
        }

        let component = match IrqSessionComponent::new(
            self.kernel.clone(),
            self.hub.clone(),
            number,
            trigger,
            polarity,
        ) {
            Ok(component) => Arc::new(component),
            Err(refusal) => {
                let _ = self.platform.release_irq(number);
                return Err(refusal);
            }
        };

        let cap = self.ep.manage(
            iface::IRQ,
            Box::new(IrqDispatch {
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
            let _ = self.platform.release_irq(component.number);
        }
        self.ep.dissolve(&cap);
    }
}

/* RPC interface */

pub const OP_SIGH: Opcode = 0;
pub const OP_ACK_IRQ: Opcode = 1;

#[derive(Serialize, Deserialize)]
struct SighArgs {
    cap: Capability,
}

struct IrqDispatch {
    component: Arc<IrqSessionComponent>,
}

impl RpcObject for IrqDispatch {
    fn dispatch(&mut self, opcode: Opcode, args: &[u8]) -> Result<RpcResult, ExceptionCode> {
        match opcode {
            OP_SIGH => {
                let args: SighArgs = decode(args)?;
                self.component.sigh(args.cap);
                RpcResult::with_results(&())
            }
            OP_ACK_IRQ => {
                self.component.ack_irq().map_err(|e| e.exception())?;
                RpcResult::with_results(&())
            }
            _ => Err(EXCEPTION_UNKNOWN_OPCODE),
        }
    }
}

fn map_rpc(error: RpcError) -> IrqError {
    match error {
        RpcError::Exception(code) => IrqError::from_exception(code),
        _ => IrqError::Ipc,
    }
}

/// Typed client stub of the IRQ interface
#[derive(Clone)]
pub struct IrqSessionClient {
    rpc: RpcClient,
}

impl IrqSessionClient {
    pub fn new(rpc: RpcClient) -> Self {
        Self { rpc }
    }

    pub fn sigh(&self, cap: Capability) -> Result<(), IrqError> {
        self.rpc
            .call::<_, ()>(OP_SIGH, &SighArgs { cap })
            .map(|_| ())
            .map_err(map_rpc)
    }

    pub fn ack_irq(&self) -> Result<(), IrqError> {
        self.rpc
            .call::<_, ()>(OP_ACK_IRQ, &())
            .map(|_| ())
            .map_err(map_rpc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_kernel::MockKernel;

    #[test]
    fn test_interrupt_becomes_signal_with_ack_gating() {
        let kernel = Arc::new(MockKernel::new());
        let hub = SignalBroker::new();

        let component = IrqSessionComponent::new(
            kernel.clone(),
            hub.clone(),
            4,
            IrqTrigger::Edge,
            IrqPolarity::High,
        )
        .unwrap();

        let (source_cap, source) = hub.alloc_source();
        let context = hub.alloc_context(source_cap, 0x4).unwrap();
        component.sigh(context);

        kernel.raise_irq(component.irq).unwrap();
        assert_eq!(source.wait().unwrap().num, 1);

        // without an ack the next interrupt stays latched
        kernel.raise_irq(component.irq).unwrap();
        assert!(source.try_wait().is_none());

        component.ack_irq().unwrap();
        assert_eq!(source.wait().unwrap().num, 1);
    }

    #[test]
    fn test_interrupt_without_handler_is_kept_quiet() {
        let kernel = Arc::new(MockKernel::new());
        let hub = SignalBroker::new();
        let component =
            IrqSessionComponent::new(kernel.clone(), hub, 11, IrqTrigger::Level, IrqPolarity::Low)
                .unwrap();

        // no sigh installed; raising must not panic or signal
        kernel.raise_irq(component.irq).unwrap();
        component.ack_irq().unwrap();
    }
}
