//! Base Primitives - The vocabulary every Lattice component speaks
//!
//! # Purpose
//! Home of the concepts shared between clients, servers, and the resource
//! server: capabilities, quota accounts with reference-account trading,
//! id spaces, session argument strings, the RPC entrypoint/stub framework,
//! and the asynchronous signal fabric.
//!
//! # Integration Points
//! - Depends on: nothing below it but the standard library
//! - Provides to: the session fabric and the core resource server
//!
//! # Architecture
//! All state is owned explicitly: accounts, registries, and dispatch
//! threads are constructed by the component environment and torn down on
//! drop. Cross-thread hand-off uses channels; blocking waits use condvars.
//!
//! # Testing Strategy
//! - Unit tests: account arithmetic, transfers, arg parsing, id spaces
//! - Integration tests: RPC round trips and signal delivery across threads

pub mod affinity;
pub mod args;
pub mod cap;
pub mod id_space;
pub mod quota;
pub mod rpc;
pub mod signal;

pub use affinity::{Affinity, AffinityLocation, AffinitySpace};
pub use args::{Args, Label};
pub use cap::{Capability, IfaceId, Selector, SessionKind};
pub use id_space::{Id, IdSpace, IdSpaceError};
pub use quota::{Account, CapQuota, QuotaError, QuotaUnit, RamQuota, Reservation};
