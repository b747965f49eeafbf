//! Kernel-Object Primitives - The boundary between the framework and the microkernel
//!
//! # Purpose
//! Everything above this crate treats the microkernel as an external
//! collaborator that manufactures and destroys kernel objects: protection
//! domains, threads, IPC endpoints, interrupt objects, and MMIO mappings.
//! The `KernelInterface` trait enumerates exactly the primitives the root
//! resource server relies on; nothing else of the kernel is visible.
//!
//! # Integration Points
//! - Depends on: nothing (leaf crate)
//! - Provides to: allocators, the capability layer, and all core services
//!
//! # Dual-Mode Integration
//! Production deployments implement `KernelInterface` against a real
//! microkernel binding. Development and the test suite use `MockKernel`,
//! an in-memory implementation with a kernel-object table, IRQ latching
//! with acknowledge gating, and a shadowed port-I/O space.
//!
//! # Testing Strategy
//! - Unit tests: object lifecycle, selector delegation, revocation
//! - Integration tests: exercised indirectly by every crate above

mod mock;

pub use mock::MockKernel;

use thiserror::Error;

/// Error surface of the kernel-object primitives
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    #[error("invalid kernel object handle")]
    InvalidHandle,

    #[error("invalid capability selector")]
    InvalidSelector,

    #[error("kernel reports unrecoverable resource shortage")]
    Fatal,

    #[error("operation not supported on this platform")]
    Unsupported,
}

pub type Result<T> = core::result::Result<T, KernelError>;

/// Slot in a per-PD capability space
pub type Selector = u64;

/// Kernel-global object identifier
pub type ObjectId = u64;

/// Handle of a protection-domain kernel object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PdHandle(pub ObjectId);

/// Handle of a thread kernel object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadHandle(pub ObjectId);

/// Handle of an IPC endpoint kernel object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointHandle(pub ObjectId);

/// Handle of an interrupt kernel object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IrqHandle(pub ObjectId);

/// Handle of an MMIO mapping established by the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MmioHandle(pub ObjectId);

/// Execution status of a thread as reported by the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    /// Created but never started
    Inactive,
    Running,
    Paused,
    Dead,
}

/// Register-level thread state readout
#[derive(Debug, Clone, Copy)]
pub struct ThreadState {
    pub status: ThreadStatus,
    pub ip: u64,
    pub sp: u64,
    /// CPU the thread is currently assigned to
    pub cpu: usize,
    pub single_step: bool,
}

/// Interrupt trigger mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IrqTrigger {
    #[default]
    Unchanged,
    Edge,
    Level,
}

/// Interrupt polarity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IrqPolarity {
    #[default]
    Unchanged,
    High,
    Low,
}

/// Kernel-object primitives assumed by the root resource server
///
/// All operations are safe to call from multiple threads; implementations
/// synchronize internally. Handles become invalid after the corresponding
/// destroy operation; later use yields `KernelError::InvalidHandle`.
pub trait KernelInterface: Send + Sync {
    /// Create a protection domain (address space + capability space)
    fn create_pd(&self, label: &str) -> Result<PdHandle>;

    /// Destroy a protection domain, revoking every capability issued from it
    fn destroy_pd(&self, pd: PdHandle) -> Result<()>;

    /// Create a thread bound to the given PD
    fn create_thread(&self, pd: PdHandle, name: &str) -> Result<ThreadHandle>;

    fn destroy_thread(&self, thread: ThreadHandle) -> Result<()>;

    /// Initialize instruction and stack pointer and begin execution
    fn thread_start(&self, thread: ThreadHandle, ip: u64, sp: u64) -> Result<()>;

    fn thread_pause(&self, thread: ThreadHandle) -> Result<()>;

    fn thread_resume(&self, thread: ThreadHandle) -> Result<()>;

    fn thread_state(&self, thread: ThreadHandle) -> Result<ThreadState>;

    fn thread_affinity(&self, thread: ThreadHandle, cpu: usize) -> Result<()>;

    fn thread_single_step(&self, thread: ThreadHandle, enabled: bool) -> Result<()>;

    /// Create an IPC endpoint owned by the given PD
    fn create_endpoint(&self, pd: PdHandle) -> Result<EndpointHandle>;

    /// Create an interrupt object for the given interrupt line
    fn create_irq(&self, number: u32, trigger: IrqTrigger, polarity: IrqPolarity)
        -> Result<IrqHandle>;

    fn destroy_irq(&self, irq: IrqHandle) -> Result<()>;

    /// Register the handler invoked on each latched interrupt
    ///
    /// At most one interrupt is in flight per object: after the handler ran,
    /// further interrupts stay latched until `irq_ack` re-arms the line.
    fn irq_register(&self, irq: IrqHandle, handler: Box<dyn Fn() + Send + Sync>) -> Result<()>;

    /// Acknowledge the most recent interrupt, re-arming the line
    fn irq_ack(&self, irq: IrqHandle) -> Result<()>;

    fn irq_mask(&self, irq: IrqHandle, masked: bool) -> Result<()>;

    /// Establish an MMIO mapping with an optional write-combining hint
    fn map_mmio(&self, base: u64, size: u64, write_combined: bool) -> Result<MmioHandle>;

    fn unmap_mmio(&self, mapping: MmioHandle) -> Result<()>;

    /// Install a capability slot referring to the given object in a PD
    fn mint(&self, pd: PdHandle, object: ObjectId) -> Result<Selector>;

    /// Copy a capability from one PD's capability space into another's
    fn delegate(&self, from: PdHandle, selector: Selector, to: PdHandle) -> Result<Selector>;

    /// Resolve a selector to the referenced object, checking liveness
    fn lookup(&self, pd: PdHandle, selector: Selector) -> Result<ObjectId>;

    /// Revoke an object: every selector referring to it becomes invalid
    fn revoke(&self, object: ObjectId) -> Result<()>;

    /// Read from the port-I/O space (x86 only; `Unsupported` elsewhere)
    fn port_read(&self, port: u16, width: u8) -> Result<u32>;

    /// Write to the port-I/O space (x86 only; `Unsupported` elsewhere)
    fn port_write(&self, port: u16, width: u8, value: u32) -> Result<()>;
}
