//! Core - The root resource server
//!
//! # Purpose
//! Core owns every physical resource at boot: RAM, MMIO windows, I/O
//! ports, interrupt lines, and the boot modules. It partitions them into
//! typed allocators, manufactures capabilities from kernel objects, and
//! answers the session requests that bottom out in hardware: PD, CPU,
//! ROM, IO_MEM, IO_PORT, IRQ, TRACE, and LOG.
//!
//! # Integration Points
//! - Depends on: the kernel-object primitives, allocators, base
//!   primitives, and the session fabric
//! - Provides to: every component, through the session router
//!
//! # Architecture
//! The boot platform turns the bootloader hand-over into allocator
//! ranges. Each per-resource service is a thin wrapper around one of the
//! typed allocators plus the kernel-object wrappers, published as a
//! local service of core's own session router. Core reads no
//! configuration; what lands where is decided by routing in the
//! components above.
//!
//! # Testing Strategy
//! - Unit tests: boot import, region maps, per-service behaviour
//! - Integration tests: full bring-up against the mock kernel, sessions
//!   driven through the router and the RPC stubs

pub mod bootinfo;
pub mod dataspace;
pub mod elf;
pub mod iface;
pub mod multiboot;
pub mod platform;
pub mod region_map;
pub mod root;
pub mod services;

pub use bootinfo::{BootInfo, BootModule, IrqRange, PhysRegion, PortRegion};
pub use dataspace::{CacheAttribute, Dataspace, DataspaceKind};
pub use platform::Platform;
pub use region_map::{Perms, RegionMap};
pub use root::Core;
