//! In-memory kernel used for development and the test suite
//!
//! All kernel objects live in one table guarded by a single lock. Interrupts
//! are raised programmatically via `raise_irq`, which models the latched
//! hardware line: one handler invocation per acknowledge.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::{
    EndpointHandle, IrqHandle, IrqPolarity, IrqTrigger, KernelError, KernelInterface, MmioHandle,
    ObjectId, PdHandle, Result, Selector, ThreadHandle, ThreadState, ThreadStatus,
};

enum Object {
    Pd {
        label: String,
        next_selector: Selector,
    },
    Thread {
        pd: ObjectId,
        name: String,
        state: ThreadState,
    },
    Endpoint {
        pd: ObjectId,
    },
    Irq {
        number: u32,
        trigger: IrqTrigger,
        polarity: IrqPolarity,
        masked: bool,
        /// an interrupt was delivered and not yet acknowledged
        in_flight: bool,
        /// an interrupt arrived while one was in flight
        latched: bool,
        handler: Option<Box<dyn Fn() + Send + Sync>>,
    },
    Mmio {
        base: u64,
        size: u64,
        write_combined: bool,
    },
}

#[derive(Default)]
struct Table {
    objects: HashMap<ObjectId, Object>,
    /// capability spaces: (pd object, selector) -> referenced object
    caps: HashMap<(ObjectId, Selector), ObjectId>,
    ports: HashMap<u16, u32>,
    next_id: ObjectId,
}

impl Table {
    fn insert(&mut self, object: Object) -> ObjectId {
        self.next_id += 1;
        let id = self.next_id;
        self.objects.insert(id, object);
        id
    }

    fn pd_mut(&mut self, pd: ObjectId) -> Result<(&mut Selector, ObjectId)> {
        match self.objects.get_mut(&pd) {
            Some(Object::Pd { next_selector, .. }) => Ok((next_selector, pd)),
            _ => Err(KernelError::InvalidHandle),
        }
    }

    fn thread_mut(&mut self, thread: ObjectId) -> Result<&mut ThreadState> {
        match self.objects.get_mut(&thread) {
            Some(Object::Thread { state, .. }) => Ok(state),
            _ => Err(KernelError::InvalidHandle),
        }
    }
}

/// Hosted kernel mock backing the entire test suite
pub struct MockKernel {
    table: Mutex<Table>,
}

impl MockKernel {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(Table::default()),
        }
    }

    /// Test hook: raise the interrupt line of an IRQ object
    ///
    /// Invokes the registered handler unless an earlier interrupt is still
    /// unacknowledged, in which case the new one is latched and fires on the
    /// next `irq_ack`.
    pub fn raise_irq(&self, irq: IrqHandle) -> Result<()> {
        let handler = {
            let mut table = self.table.lock().unwrap();
            match table.objects.get_mut(&irq.0) {
                Some(Object::Irq {
                    masked,
                    in_flight,
                    latched,
                    handler,
                    ..
                }) => {
                    if *masked {
                        return Ok(());
                    }
                    if *in_flight {
                        *latched = true;
                        return Ok(());
                    }
                    *in_flight = true;
                    // handler invoked outside the table lock
                    handler.take()
                }
                _ => return Err(KernelError::InvalidHandle),
            }
        };
        self.run_irq_handler(irq, handler);
        Ok(())
    }

    /// Test hook: number of live kernel objects
    pub fn object_count(&self) -> usize {
        self.table.lock().unwrap().objects.len()
    }

    fn run_irq_handler(&self, irq: IrqHandle, handler: Option<Box<dyn Fn() + Send + Sync>>) {
        if let Some(handler) = handler {
            handler();
            let mut table = self.table.lock().unwrap();
            if let Some(Object::Irq { handler: slot, .. }) = table.objects.get_mut(&irq.0) {
                *slot = Some(handler);
            }
        } else {
            log::warn!("interrupt {} raised without a registered handler", irq.0);
        }
    }

    fn destroy(&self, id: ObjectId, expect_pd: bool) -> Result<()> {
        let mut table = self.table.lock().unwrap();
        let matches = match table.objects.get(&id) {
            Some(Object::Pd { .. }) => expect_pd,
            Some(_) => !expect_pd,
            None => return Err(KernelError::InvalidHandle),
        };
        if !matches {
            return Err(KernelError::InvalidHandle);
        }
        table.objects.remove(&id);
        table.caps.retain(|(pd, _), object| *pd != id && *object != id);
        Ok(())
    }
}

impl Default for MockKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelInterface for MockKernel {
    fn create_pd(&self, label: &str) -> Result<PdHandle> {
        let mut table = self.table.lock().unwrap();
        let id = table.insert(Object::Pd {
            label: label.into(),
            next_selector: 1,
        });
        log::debug!("created PD {} ({})", id, label);
        Ok(PdHandle(id))
    }

    fn destroy_pd(&self, pd: PdHandle) -> Result<()> {
        // threads bound to the PD die with it
        let mut table = self.table.lock().unwrap();
        if !matches!(table.objects.get(&pd.0), Some(Object::Pd { .. })) {
            return Err(KernelError::InvalidHandle);
        }
        table.objects.remove(&pd.0);
        let dead: Vec<ObjectId> = table
            .objects
            .iter()
            .filter_map(|(id, object)| match object {
                Object::Thread { pd: owner, .. } | Object::Endpoint { pd: owner } => {
                    (*owner == pd.0).then_some(*id)
                }
                _ => None,
            })
            .collect();
        for id in &dead {
            table.objects.remove(id);
        }
        table
            .caps
            .retain(|(owner, _), object| *owner != pd.0 && *object != pd.0 && !dead.contains(object));
        Ok(())
    }

    fn create_thread(&self, pd: PdHandle, name: &str) -> Result<ThreadHandle> {
        let mut table = self.table.lock().unwrap();
        if !matches!(table.objects.get(&pd.0), Some(Object::Pd { .. })) {
            return Err(KernelError::InvalidHandle);
        }
        let id = table.insert(Object::Thread {
            pd: pd.0,
            name: name.into(),
            state: ThreadState {
                status: ThreadStatus::Inactive,
                ip: 0,
                sp: 0,
                cpu: 0,
                single_step: false,
            },
        });
        Ok(ThreadHandle(id))
    }

    fn destroy_thread(&self, thread: ThreadHandle) -> Result<()> {
        self.destroy(thread.0, false)
    }

    fn thread_start(&self, thread: ThreadHandle, ip: u64, sp: u64) -> Result<()> {
        let mut table = self.table.lock().unwrap();
        let state = table.thread_mut(thread.0)?;
        state.ip = ip;
        state.sp = sp;
        state.status = ThreadStatus::Running;
        Ok(())
    }

    fn thread_pause(&self, thread: ThreadHandle) -> Result<()> {
        let mut table = self.table.lock().unwrap();
        table.thread_mut(thread.0)?.status = ThreadStatus::Paused;
        Ok(())
    }

    fn thread_resume(&self, thread: ThreadHandle) -> Result<()> {
        let mut table = self.table.lock().unwrap();
        let state = table.thread_mut(thread.0)?;
        if state.status == ThreadStatus::Paused || state.status == ThreadStatus::Inactive {
            state.status = ThreadStatus::Running;
        }
        Ok(())
    }

    fn thread_state(&self, thread: ThreadHandle) -> Result<ThreadState> {
        let mut table = self.table.lock().unwrap();
        table.thread_mut(thread.0).map(|state| *state)
    }

    fn thread_affinity(&self, thread: ThreadHandle, cpu: usize) -> Result<()> {
        let mut table = self.table.lock().unwrap();
        table.thread_mut(thread.0)?.cpu = cpu;
        Ok(())
    }

    fn thread_single_step(&self, thread: ThreadHandle, enabled: bool) -> Result<()> {
        let mut table = self.table.lock().unwrap();
        table.thread_mut(thread.0)?.single_step = enabled;
        Ok(())
    }

    fn create_endpoint(&self, pd: PdHandle) -> Result<EndpointHandle> {
        let mut table = self.table.lock().unwrap();
        if !matches!(table.objects.get(&pd.0), Some(Object::Pd { .. })) {
            return Err(KernelError::InvalidHandle);
        }
        let id = table.insert(Object::Endpoint { pd: pd.0 });
        Ok(EndpointHandle(id))
    }

    fn create_irq(
        &self,
        number: u32,
        trigger: IrqTrigger,
        polarity: IrqPolarity,
    ) -> Result<IrqHandle> {
        let mut table = self.table.lock().unwrap();
        let id = table.insert(Object::Irq {
            number,
            trigger,
            polarity,
            masked: false,
            in_flight: false,
            latched: false,
            handler: None,
        });
        Ok(IrqHandle(id))
    }

    fn destroy_irq(&self, irq: IrqHandle) -> Result<()> {
        self.destroy(irq.0, false)
    }

    fn irq_register(&self, irq: IrqHandle, new: Box<dyn Fn() + Send + Sync>) -> Result<()> {
        let mut table = self.table.lock().unwrap();
        match table.objects.get_mut(&irq.0) {
            Some(Object::Irq { handler, .. }) => {
                *handler = Some(new);
                Ok(())
            }
            _ => Err(KernelError::InvalidHandle),
        }
    }

    fn irq_ack(&self, irq: IrqHandle) -> Result<()> {
        let handler = {
            let mut table = self.table.lock().unwrap();
            match table.objects.get_mut(&irq.0) {
                Some(Object::Irq {
                    in_flight,
                    latched,
                    handler,
                    ..
                }) => {
                    if !*in_flight {
                        return Ok(());
                    }
                    if *latched {
                        // deliver the latched interrupt right away
                        *latched = false;
                        handler.take()
                    } else {
                        *in_flight = false;
                        return Ok(());
                    }
                }
                _ => return Err(KernelError::InvalidHandle),
            }
        };
        self.run_irq_handler(irq, handler);
        Ok(())
    }

    fn irq_mask(&self, irq: IrqHandle, value: bool) -> Result<()> {
        let mut table = self.table.lock().unwrap();
        match table.objects.get_mut(&irq.0) {
            Some(Object::Irq { masked, .. }) => {
                *masked = value;
                Ok(())
            }
            _ => Err(KernelError::InvalidHandle),
        }
    }

    fn map_mmio(&self, base: u64, size: u64, write_combined: bool) -> Result<MmioHandle> {
        let mut table = self.table.lock().unwrap();
        let id = table.insert(Object::Mmio {
            base,
            size,
            write_combined,
        });
        Ok(MmioHandle(id))
    }

    fn unmap_mmio(&self, mapping: MmioHandle) -> Result<()> {
        self.destroy(mapping.0, false)
    }

    fn mint(&self, pd: PdHandle, object: ObjectId) -> Result<Selector> {
        let mut table = self.table.lock().unwrap();
        if !table.objects.contains_key(&object) {
            return Err(KernelError::InvalidHandle);
        }
        let (next, pd_id) = table.pd_mut(pd.0)?;
        let selector = *next;
        *next += 1;
        table.caps.insert((pd_id, selector), object);
        Ok(selector)
    }

    fn delegate(&self, from: PdHandle, selector: Selector, to: PdHandle) -> Result<Selector> {
        let object = self.lookup(from, selector)?;
        self.mint(to, object)
    }

    fn lookup(&self, pd: PdHandle, selector: Selector) -> Result<ObjectId> {
        let table = self.table.lock().unwrap();
        let object = *table
            .caps
            .get(&(pd.0, selector))
            .ok_or(KernelError::InvalidSelector)?;
        if !table.objects.contains_key(&object) {
            return Err(KernelError::InvalidSelector);
        }
        Ok(object)
    }

    fn revoke(&self, object: ObjectId) -> Result<()> {
        let mut table = self.table.lock().unwrap();
        table.caps.retain(|_, target| *target != object);
        Ok(())
    }

    fn port_read(&self, port: u16, width: u8) -> Result<u32> {
        let table = self.table.lock().unwrap();
        let mask = match width {
            1 => 0xff,
            2 => 0xffff,
            4 => 0xffff_ffff,
            _ => return Err(KernelError::Unsupported),
        };
        Ok(table.ports.get(&port).copied().unwrap_or(0) & mask)
    }

    fn port_write(&self, port: u16, width: u8, value: u32) -> Result<()> {
        let mut table = self.table.lock().unwrap();
        let mask: u32 = match width {
            1 => 0xff,
            2 => 0xffff,
            4 => 0xffff_ffff,
            _ => return Err(KernelError::Unsupported),
        };
        table.ports.insert(port, value & mask);
        Ok(())
    }
}
