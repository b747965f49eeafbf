//! Core-side signal broker
//!
//! Manufactures signal-source and signal-context capabilities on behalf
//! of PD sessions and routes submissions from any core service to the
//! right source. Contexts are keyed by their capability selector; the
//! imprint inside a delivery is the client-chosen value, never trusted
//! as a pointer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;

use lattice_base::signal::{SignalSource, SourceContext};
use lattice_base::{Capability, Selector};

use crate::iface;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SignalBrokerError {
    #[error("capability does not refer to a live signal object")]
    InvalidHandle,
}

pub struct SignalBroker {
    sources: Mutex<HashMap<Selector, Arc<SignalSource>>>,
    contexts: Mutex<HashMap<Selector, (Arc<SignalSource>, Arc<SourceContext>)>>,
    next: AtomicU64,
}

impl SignalBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sources: Mutex::new(HashMap::new()),
            contexts: Mutex::new(HashMap::new()),
            // selector region disjoint from entrypoint-minted ones
            next: AtomicU64::new(0x1_0000_0000),
        })
    }

    pub fn alloc_source(&self) -> (Capability, Arc<SignalSource>) {
        let source = SignalSource::new();
        let selector = self.next.fetch_add(1, Ordering::Relaxed);
        self.sources.lock().unwrap().insert(selector, source.clone());
        (Capability::new(selector, iface::SIGNAL_SOURCE), source)
    }

    /// Close a source and dissolve every context bound to it
    pub fn free_source(&self, cap: Capability) -> Result<(), SignalBrokerError> {
        let source = self
            .sources
            .lock()
            .unwrap()
            .remove(&cap.selector())
            .ok_or(SignalBrokerError::InvalidHandle)?;
        self.contexts
            .lock()
            .unwrap()
            .retain(|_, (owner, context)| {
                if Arc::ptr_eq(owner, &source) {
                    owner.free_context(context);
                    false
                } else {
                    true
                }
            });
        source.close();
        Ok(())
    }

    pub fn source(&self, cap: Capability) -> Result<Arc<SignalSource>, SignalBrokerError> {
        self.sources
            .lock()
            .unwrap()
            .get(&cap.selector())
            .cloned()
            .ok_or(SignalBrokerError::InvalidHandle)
    }

    pub fn alloc_context(
        &self,
        source_cap: Capability,
        imprint: u64,
    ) -> Result<Capability, SignalBrokerError> {
        let source = self.source(source_cap)?;
        let context = source.alloc_context(imprint);
        let selector = self.next.fetch_add(1, Ordering::Relaxed);
        self.contexts
            .lock()
            .unwrap()
            .insert(selector, (source, context));
        Ok(Capability::new(selector, iface::SIGNAL_CONTEXT))
    }

    pub fn free_context(&self, cap: Capability) -> Result<(), SignalBrokerError> {
        let (source, context) = self
            .contexts
            .lock()
            .unwrap()
            .remove(&cap.selector())
            .ok_or(SignalBrokerError::InvalidHandle)?;
        source.free_context(&context);
        Ok(())
    }

    /// Submit `num` to the context behind a capability selector
    pub fn submit(&self, selector: Selector, num: u64) -> Result<(), SignalBrokerError> {
        let entry = self.contexts.lock().unwrap().get(&selector).cloned();
        match entry {
            Some((source, context)) => {
                source.submit(&context, num);
                Ok(())
            }
            None => Err(SignalBrokerError::InvalidHandle),
        }
    }

    pub fn live_contexts(&self) -> usize {
        self.contexts.lock().unwrap().len()
    }
}
