//! RPC interface identities of the core services

use lattice_base::IfaceId;

pub const PD: IfaceId = IfaceId(1);
pub const CPU: IfaceId = IfaceId(2);
pub const REGION_MAP: IfaceId = IfaceId(3);
pub const ROM: IfaceId = IfaceId(4);
pub const IO_MEM: IfaceId = IfaceId(5);
pub const IO_PORT: IfaceId = IfaceId(6);
pub const IRQ: IfaceId = IfaceId(7);
pub const TRACE: IfaceId = IfaceId(8);
pub const LOG: IfaceId = IfaceId(9);
pub const DATASPACE: IfaceId = IfaceId(10);
pub const SIGNAL_SOURCE: IfaceId = IfaceId(11);
pub const SIGNAL_CONTEXT: IfaceId = IfaceId(12);
pub const THREAD: IfaceId = IfaceId(13);
