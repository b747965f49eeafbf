//! Service interfaces: local, sibling-provided, and parent-provided
//!
//! The router resolves every session request to one of three shapes. A
//! local service is implemented in the routing component itself (all of
//! core's services are local to core). A sibling service is implemented
//! by another child, reached through its server endpoint. A parent
//! service forwards the request up the hierarchy.

use thiserror::Error;

use lattice_base::{Affinity, Args, Capability};

use crate::state::{Phase, SessionRef};

/// Refusals a session request can come back with
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    #[error("service denied the request")]
    Denied,

    #[error("out of RAM quota")]
    OutOfRam,

    #[error("out of capability quota")]
    OutOfCaps,

    #[error("donated RAM quota does not cover the session")]
    InsufficientRamQuota,

    #[error("donated capability quota does not cover the session")]
    InsufficientCapQuota,

    #[error("service temporarily unavailable")]
    Unavailable,
}

impl SessionError {
    /// The terminal phase a refused session transitions into
    pub fn phase(&self) -> Phase {
        match self {
            SessionError::InsufficientRamQuota => Phase::InsufficientRamQuota,
            SessionError::InsufficientCapQuota => Phase::InsufficientCapQuota,
            _ => Phase::ServiceDenied,
        }
    }
}

/// A service implemented by the routing component itself
pub trait LocalService: Send + Sync {
    fn name(&self) -> &str;

    /// Create the session and return its capability
    fn initiate(&self, session: &SessionRef) -> Result<Capability, SessionError>;

    /// Accept an already-transferred quota upgrade
    fn upgrade(&self, _session: &SessionRef) -> Result<(), SessionError> {
        Ok(())
    }

    fn close(&self, session: &SessionRef);
}

/// The request-delivery half of a child that announced services
///
/// The server answers through the router's `session_ready`,
/// `session_denied`, and `session_closed` entry points, either from
/// within these callbacks (synchronous server) or later (asynchronous
/// server, `async_client_notify` set on the session).
pub trait ServerEndpoint: Send + Sync {
    fn session_request(&self, session: SessionRef);
    fn upgrade_request(&self, session: SessionRef);
    fn close_request(&self, session: SessionRef);
}

/// The parent protocol as seen from a forwarding router
pub trait ParentInterface: Send + Sync {
    fn session(
        &self,
        service: &str,
        args: &Args,
        affinity: &Affinity,
    ) -> Result<Capability, SessionError>;

    fn upgrade(&self, cap: Capability, args: &Args) -> Result<(), SessionError>;

    fn close(&self, cap: Capability);
}
