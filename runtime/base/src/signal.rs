//! Asynchronous signals: counted one-way notifications
//!
//! The producer half lives in the resource server: a `SignalSource` owns
//! the contexts of one receiver, coalesces submitted counts per context,
//! and wakes whoever blocks on the source. The consumer half lives in the
//! receiving component: a dedicated handler thread drains the source,
//! validates each imprint against the component's context registry, and
//! batches counts into the target `SignalReceiver`. Signals racing with
//! context destruction are detected by the registry lookup and dropped
//! with a warning.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;

use crossbeam::channel::{unbounded, Receiver, Sender};

/// One delivery out of a signal source: imprint plus accumulated count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signal {
    pub imprint: u64,
    pub num: u64,
}

/// Producer-side context state owned by a signal source
#[derive(Debug)]
pub struct SourceContext {
    imprint: u64,
    pending: Mutex<u64>,
    dead: AtomicBool,
}

impl SourceContext {
    pub fn imprint(&self) -> u64 {
        self.imprint
    }
}

/// Producer half of a signal channel
///
/// Owned by the resource server on behalf of one signal receiver.
#[derive(Debug)]
pub struct SignalSource {
    contexts: Mutex<Vec<Arc<SourceContext>>>,
    wake_tx: Mutex<Option<Sender<()>>>,
    wake_rx: Receiver<()>,
}

impl SignalSource {
    pub fn new() -> Arc<Self> {
        let (wake_tx, wake_rx) = unbounded();
        Arc::new(Self {
            contexts: Mutex::new(Vec::new()),
            wake_tx: Mutex::new(Some(wake_tx)),
            wake_rx,
        })
    }

    /// Create a context identified by the caller-chosen imprint
    pub fn alloc_context(&self, imprint: u64) -> Arc<SourceContext> {
        let context = Arc::new(SourceContext {
            imprint,
            pending: Mutex::new(0),
            dead: AtomicBool::new(false),
        });
        self.contexts.lock().unwrap().push(context.clone());
        context
    }

    /// Dissolve a context; signals in flight against it are dropped
    pub fn free_context(&self, context: &Arc<SourceContext>) {
        context.dead.store(true, Ordering::SeqCst);
        self.contexts
            .lock()
            .unwrap()
            .retain(|c| !Arc::ptr_eq(c, context));
    }

    /// Submit `num` to a context, coalescing with counts not yet fetched
    pub fn submit(&self, context: &Arc<SourceContext>, num: u64) {
        if num == 0 {
            log::warn!(
                "signal with count 0 submitted to context {:#x}",
                context.imprint
            );
        }
        if context.dead.load(Ordering::SeqCst) {
            log::warn!(
                "dropping signal for dissolved context {:#x}",
                context.imprint
            );
            return;
        }
        *context.pending.lock().unwrap() += num;
        if let Some(tx) = self.wake_tx.lock().unwrap().as_ref() {
            let _ = tx.send(());
        }
    }

    /// Block until a context has pending counts; `None` after `close`
    pub fn wait(&self) -> Option<Signal> {
        loop {
            self.wake_rx.recv().ok()?;
            if let Some(signal) = self.take_pending() {
                return Some(signal);
            }
            // the count behind this wakeup was coalesced into an earlier
            // delivery or its context is gone
        }
    }

    /// Non-blocking variant of `wait`
    pub fn try_wait(&self) -> Option<Signal> {
        while self.wake_rx.try_recv().is_ok() {
            if let Some(signal) = self.take_pending() {
                return Some(signal);
            }
        }
        None
    }

    /// Unblock waiters for good; subsequent submissions are not delivered
    pub fn close(&self) {
        self.wake_tx.lock().unwrap().take();
    }

    fn take_pending(&self) -> Option<Signal> {
        let contexts = self.contexts.lock().unwrap();
        for context in contexts.iter() {
            let mut pending = context.pending.lock().unwrap();
            if *pending > 0 {
                let num = core::mem::take(&mut *pending);
                return Some(Signal {
                    imprint: context.imprint,
                    num,
                });
            }
        }
        None
    }
}

struct ReceiverCore {
    contexts: Mutex<Vec<Arc<SignalContext>>>,
    /// number of contexts that became pending and were not yet fetched
    ready: Mutex<usize>,
    cond: Condvar,
}

/// Consumer-side signal context
pub struct SignalContext {
    imprint: u64,
    pending: Mutex<u64>,
    receiver: Weak<ReceiverCore>,
}

impl SignalContext {
    pub fn imprint(&self) -> u64 {
        self.imprint
    }

    /// Deliver an already-validated signal to the owning receiver
    pub fn local_submit(&self, num: u64) {
        let Some(receiver) = self.receiver.upgrade() else {
            log::warn!(
                "dropping signal for context {:#x} without receiver",
                self.imprint
            );
            return;
        };
        let became_pending = {
            let mut pending = self.pending.lock().unwrap();
            let was_zero = *pending == 0;
            *pending += num;
            was_zero && num > 0
        };
        if became_pending {
            *receiver.ready.lock().unwrap() += 1;
            receiver.cond.notify_one();
        }
    }
}

/// Consumer half: owns contexts and hands out batched signals
pub struct SignalReceiver {
    core: Arc<ReceiverCore>,
}

impl SignalReceiver {
    pub fn new() -> Self {
        Self {
            core: Arc::new(ReceiverCore {
                contexts: Mutex::new(Vec::new()),
                ready: Mutex::new(0),
                cond: Condvar::new(),
            }),
        }
    }

    /// Associate a fresh context with this receiver
    pub fn manage(&self, imprint: u64) -> Arc<SignalContext> {
        let context = Arc::new(SignalContext {
            imprint,
            pending: Mutex::new(0),
            receiver: Arc::downgrade(&self.core),
        });
        self.core.contexts.lock().unwrap().push(context.clone());
        context
    }

    /// Detach a context from the receiver
    pub fn dissolve(&self, context: &Arc<SignalContext>) {
        self.core
            .contexts
            .lock()
            .unwrap()
            .retain(|c| !Arc::ptr_eq(c, context));
        let mut pending = context.pending.lock().unwrap();
        if *pending > 0 {
            *pending = 0;
            let mut ready = self.core.ready.lock().unwrap();
            *ready = ready.saturating_sub(1);
        }
    }

    /// Whether any context holds undelivered counts
    pub fn pending(&self) -> bool {
        *self.core.ready.lock().unwrap() > 0
    }

    /// Block until a signal is available, then return the batched counts
    /// accumulated since the context was last fetched
    pub fn wait_for_signal(&self) -> Signal {
        loop {
            {
                let mut ready = self.core.ready.lock().unwrap();
                while *ready == 0 {
                    ready = self.core.cond.wait(ready).unwrap();
                }
                *ready -= 1;
            }
            // a context dissolved after raising `ready` may leave this
            // wakeup empty-handed
            if let Some(signal) = self.take_pending() {
                return signal;
            }
        }
    }

    fn take_pending(&self) -> Option<Signal> {
        let contexts = self.core.contexts.lock().unwrap();
        for context in contexts.iter() {
            let mut pending = context.pending.lock().unwrap();
            if *pending > 0 {
                let num = core::mem::take(&mut *pending);
                return Some(Signal {
                    imprint: context.imprint,
                    num,
                });
            }
        }
        None
    }
}

impl Default for SignalReceiver {
    fn default() -> Self {
        Self::new()
    }
}

/// Component-wide registry validating context liveness by imprint
///
/// Constructed by the component environment and passed explicitly to the
/// dispatcher; holds weak references so destruction of a context is
/// observed naturally.
pub struct SignalContextRegistry {
    entries: Mutex<Vec<(u64, Weak<SignalContext>)>>,
}

impl SignalContextRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(Vec::new()),
        })
    }

    pub fn insert(&self, context: &Arc<SignalContext>) {
        self.entries
            .lock()
            .unwrap()
            .push((context.imprint, Arc::downgrade(context)));
    }

    pub fn remove(&self, context: &Arc<SignalContext>) {
        self.entries.lock().unwrap().retain(|(_, weak)| {
            weak.upgrade()
                .map(|c| !Arc::ptr_eq(&c, context))
                .unwrap_or(false)
        });
    }

    /// Resolve an imprint to a live context
    pub fn lookup(&self, imprint: u64) -> Option<Arc<SignalContext>> {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|(_, weak)| weak.strong_count() > 0);
        entries
            .iter()
            .find(|(i, _)| *i == imprint)
            .and_then(|(_, weak)| weak.upgrade())
    }
}

/// The component's signal-handler thread
///
/// Blocks on the source, validates imprints through the registry, and
/// forwards counts to the owning receivers. Handlers of the signals run on
/// this thread, never on an entrypoint, so they may safely invoke RPC.
pub struct SignalDispatcher {
    source: Arc<SignalSource>,
    thread: Option<JoinHandle<()>>,
}

impl SignalDispatcher {
    pub fn spawn(source: Arc<SignalSource>, registry: Arc<SignalContextRegistry>) -> Self {
        let loop_source = source.clone();
        let thread = std::thread::Builder::new()
            .name("signal handler".into())
            .spawn(move || {
                while let Some(signal) = loop_source.wait() {
                    match registry.lookup(signal.imprint) {
                        Some(context) => context.local_submit(signal.num),
                        None => log::warn!(
                            "dropping signal for dead context {:#x}",
                            signal.imprint
                        ),
                    }
                }
            })
            .ok();
        if thread.is_none() {
            log::error!("failed to spawn signal-handler thread");
        }
        Self { source, thread }
    }
}

impl Drop for SignalDispatcher {
    fn drop(&mut self) {
        self.source.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_coalesces_counts() {
        let source = SignalSource::new();
        let context = source.alloc_context(0xbeef);

        source.submit(&context, 3);
        source.submit(&context, 2);

        let signal = source.wait().unwrap();
        assert_eq!(signal.imprint, 0xbeef);
        assert_eq!(signal.num, 5);
        assert!(source.try_wait().is_none());
    }

    #[test]
    fn test_submit_to_dissolved_context_is_dropped() {
        let source = SignalSource::new();
        let context = source.alloc_context(0x1);
        source.free_context(&context);

        source.submit(&context, 1);
        assert!(source.try_wait().is_none());
    }

    #[test]
    fn test_receiver_batches_per_context() {
        let receiver = SignalReceiver::new();
        let context = receiver.manage(0xbeef);

        context.local_submit(3);
        context.local_submit(2);

        let signal = receiver.wait_for_signal();
        assert_eq!(signal.imprint, 0xbeef);
        assert_eq!(signal.num, 5);
        assert!(!receiver.pending());
    }

    #[test]
    fn test_registry_detects_dead_contexts() {
        let receiver = SignalReceiver::new();
        let registry = SignalContextRegistry::new();

        let context = receiver.manage(0xcafe);
        registry.insert(&context);
        assert!(registry.lookup(0xcafe).is_some());

        receiver.dissolve(&context);
        drop(context);
        assert!(registry.lookup(0xcafe).is_none());
    }

    #[test]
    fn test_end_to_end_delivery_through_dispatcher() {
        let source = SignalSource::new();
        let registry = SignalContextRegistry::new();
        let receiver = SignalReceiver::new();

        let context = receiver.manage(0xbeef);
        registry.insert(&context);
        let producer = source.alloc_context(0xbeef);

        let dispatcher = SignalDispatcher::spawn(source.clone(), registry);

        source.submit(&producer, 3);
        source.submit(&producer, 2);

        let signal = receiver.wait_for_signal();
        assert_eq!(signal.imprint, 0xbeef);
        // batched into one or two deliveries depending on thread timing
        let mut total = signal.num;
        while total < 5 {
            total += receiver.wait_for_signal().num;
        }
        assert_eq!(total, 5);

        drop(dispatcher);
    }

    #[test]
    fn test_multiple_contexts_keep_counts_apart() {
        let receiver = SignalReceiver::new();
        let a = receiver.manage(0xa);
        let b = receiver.manage(0xb);

        a.local_submit(1);
        b.local_submit(7);

        let mut seen = std::collections::HashMap::new();
        for _ in 0..2 {
            let signal = receiver.wait_for_signal();
            seen.insert(signal.imprint, signal.num);
        }
        assert_eq!(seen[&0xa], 1);
        assert_eq!(seen[&0xb], 7);
    }
}
