//! The session router embedded in every component that hosts children
//!
//! Resolves session requests to a local service, a sibling child, or the
//! component's own parent, and drives the session state machine. Quota
//! donated by the client hops along the same path: client account to
//! router account, then router account to server account. A failing hop
//! or a refusing server unwinds the hops already taken.

use std::sync::{Arc, Mutex};

use lattice_base::{Account, Affinity, Args, CapQuota, Capability, Id, Label, RamQuota};

use crate::child::Child;
use crate::service::{LocalService, ParentInterface, SessionError};
use crate::state::{Phase, SessionFactory, SessionRef, SessionState};

/// Where the routing policy sends a session request
#[derive(Clone)]
pub enum RouteTarget {
    Local(Arc<dyn LocalService>),
    Sibling(Arc<Child>),
    Parent,
    Deny,
}

/// The routing decision is policy; only its mechanism lives here
pub trait RoutePolicy: Send + Sync {
    fn resolve(&self, child: &str, service: &str, label: &Label) -> RouteTarget;
}

/// Answer to a session request that was not refused outright
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The capability is ready for use
    Ready(Capability),
    /// The server answers asynchronously; await the session's response
    /// and fetch the capability via `session_cap`
    Pending,
}

/// Client-side retry configuration for quota-refused requests
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { attempts: 2 }
    }
}

type ResourceHandler = Box<dyn Fn(&SessionRouter, &Arc<Child>, &Args) + Send + Sync>;

pub struct SessionRouter {
    policy: Box<dyn RoutePolicy>,
    factory: SessionFactory,
    ram: Arc<Account<RamQuota>>,
    caps: Arc<Account<CapQuota>>,
    parent: Mutex<Option<Arc<dyn ParentInterface>>>,
    children: Mutex<Vec<Arc<Child>>>,
    resource_handler: Mutex<Option<ResourceHandler>>,
}

impl SessionRouter {
    pub fn new(
        policy: Box<dyn RoutePolicy>,
        ram: Arc<Account<RamQuota>>,
        caps: Arc<Account<CapQuota>>,
    ) -> Self {
        Self {
            policy,
            factory: SessionFactory::new(16),
            ram,
            caps,
            parent: Mutex::new(None),
            children: Mutex::new(Vec::new()),
            resource_handler: Mutex::new(None),
        }
    }

    pub fn set_parent(&self, parent: Arc<dyn ParentInterface>) {
        *self.parent.lock().unwrap() = Some(parent);
    }

    pub fn add_child(&self, child: Arc<Child>) {
        self.children.lock().unwrap().push(child);
    }

    pub fn ram_account(&self) -> &Arc<Account<RamQuota>> {
        &self.ram
    }

    pub fn cap_account(&self) -> &Arc<Account<CapQuota>> {
        &self.caps
    }

    /// Policy hook invoked when a child asks its parent for more quota
    pub fn on_resource_request(&self, handler: ResourceHandler) {
        *self.resource_handler.lock().unwrap() = Some(handler);
    }

    pub fn live_sessions(&self) -> usize {
        self.factory.live_sessions()
    }

    /// Handle a child's session request
    pub fn session(
        &self,
        child: &Arc<Child>,
        service: &str,
        args: &Args,
        affinity: &Affinity,
    ) -> Result<(Id, SessionOutcome), SessionError> {
        let label = Label::from_args(args).prefixed(child.name());
        let server_args = args.with("label", &format!("\"{}\"", label.as_str()));

        let target = self.policy.resolve(child.name(), service, &label);
        if matches!(target, RouteTarget::Deny) {
            log::warn!("denied session request '{}' from '{}'", service, child.name());
            return Err(SessionError::Denied);
        }

        let session = self
            .factory
            .create(SessionState::new(service, label, server_args, *affinity));
        let id = child.client_ids.insert(session.clone());
        session.with(|s| s.id_at_client = Some(id));

        let (ram, caps) = session.with(|s| (s.donated_ram(), s.donated_caps()));

        // first hop: client to router
        if let Err(refusal) = donate(
            child.ram_account(),
            &self.ram,
            ram,
            child.cap_account(),
            &self.caps,
            caps,
        ) {
            session.transition(refusal.phase());
            self.discard_client_side(child, &session, false);
            return Err(refusal);
        }

        match target {
            RouteTarget::Deny => Err(SessionError::Denied),
            RouteTarget::Local(local) => match local.initiate(&session) {
                Ok(cap) => {
                    session.with(|s| s.cap = cap);
                    session.transition(Phase::Available);
                    session.transition(Phase::CapHandedOut);
                    Ok((id, SessionOutcome::Ready(cap)))
                }
                Err(refusal) => {
                    session.transition(refusal.phase());
                    self.discard_client_side(child, &session, true);
                    Err(refusal)
                }
            },
            RouteTarget::Sibling(server) => {
                let Some(endpoint) = server.endpoint() else {
                    session.transition(Phase::ServiceDenied);
                    self.discard_client_side(child, &session, true);
                    return Err(SessionError::Denied);
                };

                // second hop: router to server
                if let Err(refusal) = donate(
                    &self.ram,
                    server.ram_account(),
                    ram,
                    &self.caps,
                    server.cap_account(),
                    caps,
                ) {
                    session.transition(refusal.phase());
                    self.discard_client_side(child, &session, true);
                    return Err(refusal);
                }
                let server_id = server.server_ids.insert(session.clone());
                session.with(|s| s.id_at_server = Some(server_id));

                endpoint.session_request(session.clone());

                match session.phase() {
                    Phase::Available => {
                        let cap = session.with(|s| s.cap);
                        session.transition(Phase::CapHandedOut);
                        Ok((id, SessionOutcome::Ready(cap)))
                    }
                    Phase::CreateRequested => {
                        session.with(|s| s.async_client_notify = true);
                        Ok((id, SessionOutcome::Pending))
                    }
                    refused => {
                        // the server already unwound its hop via
                        // `session_denied`
                        let refusal = refusal_for_phase(refused);
                        self.discard_client_side(child, &session, true);
                        Err(refusal)
                    }
                }
            }
            RouteTarget::Parent => {
                let parent = self.parent.lock().unwrap().clone();
                let Some(parent) = parent else {
                    session.transition(Phase::ServiceDenied);
                    self.discard_client_side(child, &session, true);
                    return Err(SessionError::Denied);
                };
                let (forward_args, forward_affinity) =
                    session.with(|s| (s.args().clone(), *s.affinity()));
                match parent.session(service, &forward_args, &forward_affinity) {
                    Ok(cap) => {
                        session.with(|s| {
                            s.cap = cap;
                            s.forwarded = true;
                        });
                        session.transition(Phase::Available);
                        session.transition(Phase::CapHandedOut);
                        Ok((id, SessionOutcome::Ready(cap)))
                    }
                    Err(refusal) => {
                        session.transition(refusal.phase());
                        self.discard_client_side(child, &session, true);
                        Err(refusal)
                    }
                }
            }
        }
    }

    /// Retry a session request, asking the parent for quota between
    /// attempts; on an insufficient-donation refusal the donation is
    /// doubled for the next attempt
    pub fn session_with_retry(
        &self,
        child: &Arc<Child>,
        service: &str,
        args: &Args,
        affinity: &Affinity,
        retry: RetryPolicy,
    ) -> Result<(Id, SessionOutcome), SessionError> {
        let attempts = retry.attempts.max(2);
        let mut args = args.clone();
        let mut refusal = SessionError::Unavailable;
        for _ in 0..attempts {
            match self.session(child, service, &args, affinity) {
                Err(e @ (SessionError::OutOfRam | SessionError::InsufficientRamQuota)) => {
                    refusal = e;
                    let donation = args.ulong("ram_quota", 4096).max(4096);
                    self.resource_request(child, &Args::new(&format!("ram_quota={donation}")));
                    child.wait_resource_avail();
                    if e == SessionError::InsufficientRamQuota {
                        args = args.with("ram_quota", &(donation * 2).to_string());
                    }
                }
                Err(e @ (SessionError::OutOfCaps | SessionError::InsufficientCapQuota)) => {
                    refusal = e;
                    let donation = args.ulong("cap_quota", 2).max(2);
                    self.resource_request(child, &Args::new(&format!("cap_quota={donation}")));
                    child.wait_resource_avail();
                    if e == SessionError::InsufficientCapQuota {
                        args = args.with("cap_quota", &(donation * 2).to_string());
                    }
                }
                other => return other,
            }
        }
        Err(refusal)
    }

    /// Fetch the capability of a session that reached `Available`
    pub fn session_cap(&self, child: &Arc<Child>, id: Id) -> Result<Capability, SessionError> {
        let session = child
            .client_ids
            .get(id)
            .map_err(|_| SessionError::Unavailable)?;
        match session.phase() {
            Phase::Available => {
                let cap = session.with(|s| s.cap);
                session.transition(Phase::CapHandedOut);
                Ok(cap)
            }
            Phase::CapHandedOut => Ok(session.with(|s| s.cap)),
            phase if session.with(|s| s.closed()) => {
                let refusal = refusal_for_phase(phase);
                self.discard_client_side(child, &session, true);
                Err(refusal)
            }
            _ => Err(SessionError::Unavailable),
        }
    }

    /// Raise the quota donated to an existing session
    pub fn upgrade(&self, child: &Arc<Child>, id: Id, args: &Args) -> Result<(), SessionError> {
        let session = child
            .client_ids
            .get(id)
            .map_err(|_| SessionError::Unavailable)?;
        if !session.with(|s| s.alive()) {
            return Err(SessionError::Unavailable);
        }
        let ram = RamQuota {
            value: args.ulong("ram_quota", 0),
        };
        let caps = CapQuota {
            value: args.ulong("cap_quota", 0),
        };

        donate(
            child.ram_account(),
            &self.ram,
            ram,
            child.cap_account(),
            &self.caps,
            caps,
        )?;
        session.transition(Phase::UpgradeRequested);

        match self.server_of(&session) {
            None => {
                // forwarded sessions pass the upgrade on; for local
                // services the router-side account is the destination
                if session.with(|s| s.forwarded) {
                    let parent = self.parent.lock().unwrap().clone();
                    if let Some(parent) = parent {
                        let cap = session.with(|s| s.cap);
                        if let Err(refusal) = parent.upgrade(cap, args) {
                            self.refund_first_hop(child, ram, caps);
                            session.transition(Phase::CapHandedOut);
                            return Err(refusal);
                        }
                    }
                }
                session.with(|s| {
                    s.increase_donated_quota(ram, caps);
                    s.confirm_upgrade();
                });
                session.transition(Phase::CapHandedOut);
                Ok(())
            }
            Some(server) => {
                if let Err(refusal) = donate(
                    &self.ram,
                    server.ram_account(),
                    ram,
                    &self.caps,
                    server.cap_account(),
                    caps,
                ) {
                    self.refund_first_hop(child, ram, caps);
                    session.transition(Phase::CapHandedOut);
                    return Err(refusal);
                }
                session.with(|s| s.increase_donated_quota(ram, caps));
                if let Some(endpoint) = server.endpoint() {
                    endpoint.upgrade_request(session.clone());
                }
                if session.phase() == Phase::UpgradeRequested {
                    session.await_response();
                }
                Ok(())
            }
        }
    }

    /// Close a session, returning the donated quota to the client
    ///
    /// Closing an id that is already gone is a successful no-op.
    pub fn close(&self, child: &Arc<Child>, id: Id) -> Result<(), SessionError> {
        let Ok(session) = child.client_ids.get(id) else {
            return Ok(());
        };

        if session.with(|s| s.closed()) {
            self.discard_client_side(child, &session, true);
            return Ok(());
        }

        match self.server_of(&session) {
            None => {
                session.transition(Phase::CloseRequested);
                if session.with(|s| s.forwarded) {
                    let parent = self.parent.lock().unwrap().clone();
                    if let Some(parent) = parent {
                        parent.close(session.with(|s| s.cap));
                    }
                } else if let Some(local) = self.local_service_of(child, &session) {
                    local.close(&session);
                }
                session.transition(Phase::Closed);
                self.discard_client_side(child, &session, true);
                Ok(())
            }
            Some(server) => {
                session.transition(Phase::CloseRequested);
                if let Some(endpoint) = server.endpoint() {
                    endpoint.close_request(session.clone());
                }
                if session.phase() == Phase::CloseRequested {
                    session.await_response();
                }
                self.discard_client_side(child, &session, true);
                Ok(())
            }
        }
    }

    /// A served session is ready; hand the capability to the client
    pub fn session_ready(&self, session: &SessionRef, cap: Capability) {
        session.with(|s| s.cap = cap);
        session.transition(Phase::Available);
    }

    /// A served session was refused; the server's donation hop unwinds
    pub fn session_denied(&self, session: &SessionRef, refusal: SessionError) {
        self.unwind_server_side(session);
        session.transition(refusal.phase());
    }

    /// A served session finished closing
    pub fn session_closed(&self, session: &SessionRef) {
        self.unwind_server_side(session);
        session.transition(Phase::Closed);
    }

    /// The server accepted a quota upgrade
    pub fn upgrade_done(&self, session: &SessionRef) {
        session.with(|s| s.confirm_upgrade());
        session.transition(Phase::CapHandedOut);
    }

    pub fn announce(&self, child: &Arc<Child>, service: &str) {
        child.announce(service);
    }

    /// A child ran against its quota and asks the parent for more; the
    /// response arrives asynchronously via `notify_resource_avail`
    pub fn resource_request(&self, child: &Arc<Child>, args: &Args) {
        let handler = self.resource_handler.lock().unwrap();
        match handler.as_ref() {
            Some(handler) => handler(self, child, args),
            None => {
                log::warn!(
                    "resource request '{}' from '{}' left unanswered",
                    args.as_str(),
                    child.name()
                );
            }
        }
    }

    /// Transfer quota from the router's accounts to a child and unblock
    /// its resource-availability wait
    pub fn grant_resources(
        &self,
        child: &Arc<Child>,
        ram: RamQuota,
        caps: CapQuota,
    ) -> Result<(), SessionError> {
        donate(
            &self.ram,
            child.ram_account(),
            ram,
            &self.caps,
            child.cap_account(),
            caps,
        )?;
        child.notify_resource_avail();
        Ok(())
    }

    pub fn exit(&self, child: &Arc<Child>, value: i64) {
        child.record_exit(value);
        log::debug!("child '{}' exited with value {}", child.name(), value);
    }

    /// The sibling serving this session, if any
    fn server_of(&self, session: &SessionRef) -> Option<Arc<Child>> {
        let server_id = session.with(|s| s.id_at_server)?;
        let children = self.children.lock().unwrap();
        children
            .iter()
            .find(|child| {
                child
                    .server_ids
                    .get(server_id)
                    .map(|s| Arc::ptr_eq(&s, session))
                    .unwrap_or(false)
            })
            .cloned()
    }

    fn local_service_of(&self, child: &Arc<Child>, session: &SessionRef) -> Option<Arc<dyn LocalService>> {
        let (service, label) = session.with(|s| (s.service().to_string(), s.label().clone()));
        match self.policy.resolve(child.name(), &service, &label) {
            RouteTarget::Local(local) => Some(local),
            _ => None,
        }
    }

    /// Return the server-side donation hop and drop the server-side id
    fn unwind_server_side(&self, session: &SessionRef) {
        let Some(server) = self.server_of(session) else {
            return;
        };
        let (ram, caps, server_id) =
            session.with(|s| (s.donated_ram(), s.donated_caps(), s.id_at_server.take()));
        if let Some(server_id) = server_id {
            let _ = server.server_ids.remove(server_id);
        }
        if server.ram_account().transfer_to(&self.ram, ram).is_err()
            || server.cap_account().transfer_to(&self.caps, caps).is_err()
        {
            log::error!(
                "server '{}' cannot return quota donated for '{}'",
                server.name(),
                session.with(|s| s.service().to_string())
            );
        }
    }

    /// Drop the client-side id and, when `refund` is set, return the
    /// first donation hop to the client
    fn discard_client_side(&self, child: &Arc<Child>, session: &SessionRef, refund: bool) {
        let (ram, caps, client_id) =
            session.with(|s| (s.donated_ram(), s.donated_caps(), s.id_at_client.take()));
        if let Some(client_id) = client_id {
            let _ = child.client_ids.remove(client_id);
        }
        if refund {
            if self.ram.transfer_to(child.ram_account(), ram).is_err()
                || self.caps.transfer_to(child.cap_account(), caps).is_err()
            {
                log::error!(
                    "cannot return quota donated by '{}' for '{}'",
                    child.name(),
                    session.with(|s| s.service().to_string())
                );
            }
        }
        self.factory.destroy(session);
    }

    fn refund_first_hop(&self, child: &Arc<Child>, ram: RamQuota, caps: CapQuota) {
        let _ = self.ram.transfer_to(child.ram_account(), ram);
        let _ = self.caps.transfer_to(child.cap_account(), caps);
    }
}

/// Two-resource donation with rollback when the second transfer fails
fn donate(
    ram_from: &Arc<Account<RamQuota>>,
    ram_to: &Arc<Account<RamQuota>>,
    ram: RamQuota,
    caps_from: &Arc<Account<CapQuota>>,
    caps_to: &Arc<Account<CapQuota>>,
    caps: CapQuota,
) -> Result<(), SessionError> {
    caps_from
        .transfer_to(caps_to, caps)
        .map_err(|_| SessionError::OutOfCaps)?;
    if ram_from.transfer_to(ram_to, ram).is_err() {
        let _ = caps_to.transfer_to(caps_from, caps);
        return Err(SessionError::OutOfRam);
    }
    Ok(())
}

fn refusal_for_phase(phase: Phase) -> SessionError {
    match phase {
        Phase::InsufficientRamQuota => SessionError::InsufficientRamQuota,
        Phase::InsufficientCapQuota => SessionError::InsufficientCapQuota,
        _ => SessionError::Denied,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ServerEndpoint;
    use lattice_base::IfaceId;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    struct FnPolicy(Box<dyn Fn(&str, &str, &Label) -> RouteTarget + Send + Sync>);

    impl RoutePolicy for FnPolicy {
        fn resolve(&self, child: &str, service: &str, label: &Label) -> RouteTarget {
            (self.0)(child, service, label)
        }
    }

    fn router_with(policy: impl Fn(&str, &str, &Label) -> RouteTarget + Send + Sync + 'static) -> Arc<SessionRouter> {
        Arc::new(SessionRouter::new(
            Box::new(FnPolicy(Box::new(policy))),
            Account::new("router", RamQuota { value: 1 << 20 }),
            Account::new("router", CapQuota { value: 1024 }),
        ))
    }

    fn child_with(name: &str, ram: u64, caps: u64) -> Arc<Child> {
        Child::new(
            name,
            Account::new(name, RamQuota { value: ram }),
            Account::new(name, CapQuota { value: caps }),
        )
    }

    /// Local service refusing sessions donating less than `min_ram`
    struct DemandingService {
        min_ram: u64,
        next_selector: AtomicU64,
        open: AtomicUsize,
    }

    impl DemandingService {
        fn new(min_ram: u64) -> Arc<Self> {
            Arc::new(Self {
                min_ram,
                next_selector: AtomicU64::new(1),
                open: AtomicUsize::new(0),
            })
        }
    }

    impl LocalService for DemandingService {
        fn name(&self) -> &str {
            "ROM"
        }

        fn initiate(&self, session: &SessionRef) -> Result<Capability, SessionError> {
            if session.with(|s| s.donated_ram().value) < self.min_ram {
                return Err(SessionError::InsufficientRamQuota);
            }
            self.open.fetch_add(1, Ordering::SeqCst);
            let selector = self.next_selector.fetch_add(1, Ordering::SeqCst);
            Ok(Capability::new(selector, IfaceId(4)))
        }

        fn close(&self, _session: &SessionRef) {
            self.open.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_local_session_lifecycle_and_donation() {
        let service = DemandingService::new(0);
        let routed = service.clone();
        let router = router_with(move |_, name, _| match name {
            "ROM" => RouteTarget::Local(routed.clone()),
            _ => RouteTarget::Deny,
        });
        let child = child_with("app", 64 << 10, 16);
        router.add_child(child.clone());

        let (id, outcome) = router
            .session(
                &child,
                "ROM",
                &Args::new("ram_quota=8K, cap_quota=2, label=\"config\""),
                &Affinity::default(),
            )
            .unwrap();
        let SessionOutcome::Ready(cap) = outcome else {
            panic!("expected a synchronous capability");
        };
        assert!(cap.is_valid());
        assert_eq!(service.open.load(Ordering::SeqCst), 1);

        // the donation moved limit from the client to the router
        assert_eq!(child.ram_account().limit().value, (64 << 10) - 8192);
        assert_eq!(child.cap_account().limit().value, 14);
        assert_eq!(router.ram_account().limit().value, (1 << 20) + 8192);
        assert_eq!(router.live_sessions(), 1);

        router.close(&child, id).unwrap();
        assert_eq!(service.open.load(Ordering::SeqCst), 0);
        assert_eq!(child.ram_account().limit().value, 64 << 10);
        assert_eq!(child.cap_account().limit().value, 16);
        assert_eq!(router.ram_account().limit().value, 1 << 20);
        assert_eq!(router.live_sessions(), 0);
        assert!(child.client_ids.is_empty());

        // closing again is a no-op
        router.close(&child, id).unwrap();
    }

    #[test]
    fn test_denied_by_policy_leaves_accounts_untouched() {
        let router = router_with(|_, _, _| RouteTarget::Deny);
        let child = child_with("app", 4096, 4);

        let refusal = router
            .session(&child, "ROM", &Args::new("ram_quota=4K"), &Affinity::default())
            .unwrap_err();
        assert_eq!(refusal, SessionError::Denied);
        assert_eq!(child.ram_account().limit().value, 4096);
        assert_eq!(router.live_sessions(), 0);
    }

    #[test]
    fn test_client_quota_shortage_refuses_without_side_effects() {
        let service = DemandingService::new(0);
        let routed = service.clone();
        let router = router_with(move |_, _, _| RouteTarget::Local(routed.clone()));
        let child = child_with("app", 4096, 4);

        let refusal = router
            .session(&child, "ROM", &Args::new("ram_quota=8K"), &Affinity::default())
            .unwrap_err();
        assert_eq!(refusal, SessionError::OutOfRam);
        assert_eq!(child.ram_account().limit().value, 4096);
        assert_eq!(child.cap_account().limit().value, 4);
        assert_eq!(router.live_sessions(), 0);
    }

    #[test]
    fn test_session_retry_after_resource_request() {
        // the server demands 16K while the client starts out donating 8K
        let service = DemandingService::new(16 << 10);
        let routed = service.clone();
        let router = router_with(move |_, _, _| RouteTarget::Local(routed.clone()));
        let child = child_with("app", 9 << 10, 16);
        router.add_child(child.clone());

        let requests = Arc::new(AtomicUsize::new(0));
        let seen = requests.clone();
        router.on_resource_request(Box::new(move |router, child, args| {
            seen.fetch_add(1, Ordering::SeqCst);
            let ram = RamQuota {
                value: args.ulong("ram_quota", 0),
            };
            router
                .grant_resources(child, ram, CapQuota { value: 0 })
                .unwrap();
        }));

        let (_, outcome) = router
            .session_with_retry(
                &child,
                "ROM",
                &Args::new("ram_quota=8K, cap_quota=2"),
                &Affinity::default(),
                RetryPolicy::default(),
            )
            .unwrap();
        assert!(matches!(outcome, SessionOutcome::Ready(_)));
        assert_eq!(requests.load(Ordering::SeqCst), 1);
        assert_eq!(service.open.load(Ordering::SeqCst), 1);
    }

    /// Sibling server answering synchronously from within the delivery
    struct SyncServer {
        router: Arc<SessionRouter>,
        next_selector: AtomicU64,
        min_ram: u64,
        labels: Mutex<Vec<String>>,
    }

    impl ServerEndpoint for SyncServer {
        fn session_request(&self, session: SessionRef) {
            self.labels
                .lock()
                .unwrap()
                .push(session.with(|s| s.label().as_str().to_string()));
            if session.with(|s| s.donated_ram().value) < self.min_ram {
                self.router
                    .session_denied(&session, SessionError::InsufficientRamQuota);
                return;
            }
            let selector = self.next_selector.fetch_add(1, Ordering::SeqCst);
            self.router
                .session_ready(&session, Capability::new(selector, IfaceId(9)));
        }

        fn upgrade_request(&self, session: SessionRef) {
            self.router.upgrade_done(&session);
        }

        fn close_request(&self, session: SessionRef) {
            self.router.session_closed(&session);
        }
    }

    fn sibling_setup(min_ram: u64) -> (Arc<SessionRouter>, Arc<Child>, Arc<Child>) {
        let server = child_with("fs", 0, 0);
        let target = server.clone();
        let router = router_with(move |_, name, _| match name {
            "File_system" => RouteTarget::Sibling(target.clone()),
            _ => RouteTarget::Deny,
        });
        server.serve(Arc::new(SyncServer {
            router: router.clone(),
            next_selector: AtomicU64::new(1),
            min_ram,
            labels: Mutex::new(Vec::new()),
        }));
        let client = child_with("app", 64 << 10, 16);
        router.add_child(client.clone());
        router.add_child(server.clone());
        (router, client, server)
    }

    #[test]
    fn test_sibling_session_donates_across_two_hops() {
        let (router, client, server) = sibling_setup(0);

        let (id, outcome) = router
            .session(
                &client,
                "File_system",
                &Args::new("ram_quota=8K, cap_quota=2, label=\"home\""),
                &Affinity::default(),
            )
            .unwrap();
        assert!(matches!(outcome, SessionOutcome::Ready(_)));

        // the donation travelled client -> router -> server
        assert_eq!(client.ram_account().limit().value, (64 << 10) - 8192);
        assert_eq!(server.ram_account().limit().value, 8192);
        assert_eq!(router.ram_account().limit().value, 1 << 20);

        // one session, two id spaces
        assert_eq!(client.client_ids.len(), 1);
        assert_eq!(server.server_ids.len(), 1);

        // the server saw the child-prefixed label
        let endpoint = server.endpoint().unwrap();
        let _ = endpoint;

        router.upgrade(&client, id, &Args::new("ram_quota=4K")).unwrap();
        assert_eq!(server.ram_account().limit().value, 8192 + 4096);

        router.close(&client, id).unwrap();
        assert_eq!(client.ram_account().limit().value, 64 << 10);
        assert_eq!(server.ram_account().limit().value, 0);
        assert!(client.client_ids.is_empty());
        assert!(server.server_ids.is_empty());
        assert_eq!(router.live_sessions(), 0);
    }

    #[test]
    fn test_sibling_denial_unwinds_both_hops() {
        let (router, client, server) = sibling_setup(1 << 20);

        let refusal = router
            .session(
                &client,
                "File_system",
                &Args::new("ram_quota=8K, cap_quota=2"),
                &Affinity::default(),
            )
            .unwrap_err();
        assert_eq!(refusal, SessionError::InsufficientRamQuota);
        assert_eq!(client.ram_account().limit().value, 64 << 10);
        assert_eq!(client.cap_account().limit().value, 16);
        assert_eq!(server.ram_account().limit().value, 0);
        assert_eq!(router.ram_account().limit().value, 1 << 20);
        assert_eq!(router.live_sessions(), 0);
    }

    /// Sibling server deferring its answer to another thread
    struct AsyncServer {
        router: Arc<SessionRouter>,
        pending: Mutex<Vec<SessionRef>>,
    }

    impl ServerEndpoint for AsyncServer {
        fn session_request(&self, session: SessionRef) {
            self.pending.lock().unwrap().push(session);
        }

        fn upgrade_request(&self, session: SessionRef) {
            self.router.upgrade_done(&session);
        }

        fn close_request(&self, session: SessionRef) {
            self.router.session_closed(&session);
        }
    }

    #[test]
    fn test_async_server_notifies_blocked_client() {
        let server_child = child_with("gui", 0, 0);
        let target = server_child.clone();
        let router = router_with(move |_, _, _| RouteTarget::Sibling(target.clone()));
        let endpoint = Arc::new(AsyncServer {
            router: router.clone(),
            pending: Mutex::new(Vec::new()),
        });
        server_child.serve(endpoint.clone());
        let client = child_with("app", 64 << 10, 16);
        router.add_child(client.clone());
        router.add_child(server_child.clone());

        let (id, outcome) = router
            .session(&client, "Gui", &Args::new("ram_quota=4K"), &Affinity::default())
            .unwrap();
        assert_eq!(outcome, SessionOutcome::Pending);

        let session = endpoint.pending.lock().unwrap().pop().unwrap();
        assert!(session.with(|s| s.async_client_notify));

        let answering_router = router.clone();
        let answer = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            answering_router.session_ready(&session, Capability::new(77, IfaceId(9)));
        });

        let waiting = client.client_ids.get(id).unwrap();
        assert_eq!(waiting.await_response(), Phase::Available);
        answer.join().unwrap();

        let cap = router.session_cap(&client, id).unwrap();
        assert_eq!(cap.selector(), 77);
        assert_eq!(waiting.phase(), Phase::CapHandedOut);

        router.close(&client, id).unwrap();
        assert_eq!(router.live_sessions(), 0);
    }

    struct StubParent {
        sessions: AtomicUsize,
        upgrades: AtomicUsize,
        closes: AtomicUsize,
    }

    impl ParentInterface for StubParent {
        fn session(
            &self,
            _service: &str,
            _args: &Args,
            _affinity: &Affinity,
        ) -> Result<Capability, SessionError> {
            self.sessions.fetch_add(1, Ordering::SeqCst);
            Ok(Capability::new(500, IfaceId(2)))
        }

        fn upgrade(&self, _cap: Capability, _args: &Args) -> Result<(), SessionError> {
            self.upgrades.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn close(&self, _cap: Capability) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_forwarding_to_parent() {
        let router = router_with(|_, _, _| RouteTarget::Parent);
        let parent = Arc::new(StubParent {
            sessions: AtomicUsize::new(0),
            upgrades: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        });
        router.set_parent(parent.clone());
        let child = child_with("app", 64 << 10, 16);
        router.add_child(child.clone());

        let (id, outcome) = router
            .session(&child, "Timer", &Args::new("ram_quota=4K"), &Affinity::default())
            .unwrap();
        assert!(matches!(outcome, SessionOutcome::Ready(_)));
        assert_eq!(parent.sessions.load(Ordering::SeqCst), 1);

        router.upgrade(&child, id, &Args::new("ram_quota=4K")).unwrap();
        assert_eq!(parent.upgrades.load(Ordering::SeqCst), 1);

        router.close(&child, id).unwrap();
        assert_eq!(parent.closes.load(Ordering::SeqCst), 1);
        assert_eq!(child.ram_account().limit().value, 64 << 10);
    }

    #[test]
    fn test_announce_and_exit() {
        let router = router_with(|_, _, _| RouteTarget::Deny);
        let child = child_with("driver", 0, 0);
        router.add_child(child.clone());

        router.announce(&child, "Block");
        assert!(child.announced("Block"));

        router.exit(&child, 0);
        assert_eq!(child.exited(), Some(0));
    }
}
