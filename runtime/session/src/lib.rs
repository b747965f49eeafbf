//! Session Fabric - How components obtain services from one another
//!
//! # Purpose
//! Implements the machinery every component that hosts children embeds:
//! the session state machine, the parent protocol surface, the dynamic
//! service resolver, and the quota-donation plumbing that accompanies
//! every session across the component hierarchy.
//!
//! # Integration Points
//! - Depends on: base primitives (capabilities, accounts, id spaces)
//! - Provides to: the resource server and every parent component
//!
//! # Architecture
//! A session object lives in two id spaces, the client's and the
//! server's, and moves through an explicit phase machine. The router
//! resolves a request to a local service, a sibling child, or the
//! component's own parent; quota donations hop account by account along
//! the same path and are rolled back when a hop fails.
//!
//! # Testing Strategy
//! - Unit tests: phase transitions, donation bookkeeping
//! - Integration tests: routing across mock children, retry protocol

pub mod child;
pub mod router;
pub mod service;
pub mod state;

pub use child::Child;
pub use router::{RoutePolicy, RouteTarget, SessionOutcome, SessionRouter};
pub use service::{LocalService, ParentInterface, ServerEndpoint, SessionError};
pub use state::{Phase, Session, SessionFactory, SessionRef, SessionState};
