//! Representation of one session request and its life cycle
//!
//! A session progresses from `CreateRequested` either into the alive
//! phases (`Available`, `CapHandedOut`, `UpgradeRequested`,
//! `CloseRequested`) or into one of the terminal refusal phases. The
//! donated quota only ever grows while the session is alive; it is
//! returned in full when the session closes.

use std::sync::{Arc, Condvar, Mutex};

use lattice_alloc::{Slab, SlabKey};
use lattice_base::{Affinity, Args, CapQuota, Capability, Id, Label, RamQuota};

/// Phases of the session state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    CreateRequested,
    ServiceDenied,
    InsufficientRamQuota,
    InsufficientCapQuota,
    Available,
    CapHandedOut,
    UpgradeRequested,
    CloseRequested,
    Closed,
}

/// Observer invoked on every phase transition
pub type PhaseObserver = Box<dyn Fn(Phase) + Send>;

pub struct SessionState {
    service: String,
    label: Label,
    args: Args,
    affinity: Affinity,
    donated_ram: RamQuota,
    donated_caps: CapQuota,
    pub phase: Phase,
    /// the server answers asynchronously; the client blocks for a
    /// notification before fetching the session capability
    pub async_client_notify: bool,
    pub id_at_client: Option<Id>,
    pub id_at_server: Option<Id>,
    /// the session was forwarded to the component's own parent
    pub forwarded: bool,
    pub cap: Capability,
    pub ram_upgrade: RamQuota,
    pub cap_upgrade: CapQuota,
    phase_observer: Option<PhaseObserver>,
    factory_key: Option<SlabKey>,
}

impl SessionState {
    pub fn new(service: &str, label: Label, args: Args, affinity: Affinity) -> Self {
        let donated_ram = RamQuota {
            value: args.ulong("ram_quota", 0),
        };
        let donated_caps = CapQuota {
            value: args.ulong("cap_quota", 0),
        };
        Self {
            service: service.into(),
            label,
            args,
            affinity,
            donated_ram,
            donated_caps,
            phase: Phase::CreateRequested,
            async_client_notify: false,
            id_at_client: None,
            id_at_server: None,
            forwarded: false,
            cap: Capability::invalid(),
            ram_upgrade: RamQuota::default(),
            cap_upgrade: CapQuota::default(),
            phase_observer: None,
            factory_key: None,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Label presented to the server, ancestor prefixes included
    pub fn label(&self) -> &Label {
        &self.label
    }

    pub fn args(&self) -> &Args {
        &self.args
    }

    pub fn affinity(&self) -> &Affinity {
        &self.affinity
    }

    pub fn donated_ram(&self) -> RamQuota {
        self.donated_ram
    }

    pub fn donated_caps(&self) -> CapQuota {
        self.donated_caps
    }

    /// Record an upgrade; quotas never shrink while the session is alive
    pub fn increase_donated_quota(&mut self, ram: RamQuota, caps: CapQuota) {
        self.donated_ram.value += ram.value;
        self.donated_caps.value += caps.value;
        self.ram_upgrade = ram;
        self.cap_upgrade = caps;
    }

    pub fn confirm_upgrade(&mut self) {
        self.ram_upgrade = RamQuota::default();
        self.cap_upgrade = CapQuota::default();
    }

    pub fn observe_phases(&mut self, observer: PhaseObserver) {
        self.phase_observer = Some(observer);
    }

    fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
        if let Some(observer) = &self.phase_observer {
            observer(phase);
        }
    }

    pub fn alive(&self) -> bool {
        matches!(
            self.phase,
            Phase::Available | Phase::CapHandedOut | Phase::UpgradeRequested | Phase::CloseRequested
        )
    }

    pub fn closed(&self) -> bool {
        matches!(
            self.phase,
            Phase::ServiceDenied
                | Phase::InsufficientRamQuota
                | Phase::InsufficientCapQuota
                | Phase::Closed
        )
    }
}

/// A session object shared between the two id spaces it lives in
pub struct Session {
    state: Mutex<SessionState>,
    cond: Condvar,
}

pub type SessionRef = Arc<Session>;

impl Session {
    pub fn new(state: SessionState) -> SessionRef {
        Arc::new(Self {
            state: Mutex::new(state),
            cond: Condvar::new(),
        })
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn phase(&self) -> Phase {
        self.state.lock().unwrap().phase
    }

    /// Transition phases and wake anyone blocked in `await_response`
    pub fn transition(&self, phase: Phase) {
        self.state.lock().unwrap().set_phase(phase);
        self.cond.notify_all();
    }

    /// Block until the server answered the outstanding request
    pub fn await_response(&self) -> Phase {
        let mut state = self.state.lock().unwrap();
        while matches!(
            state.phase,
            Phase::CreateRequested | Phase::UpgradeRequested | Phase::CloseRequested
        ) {
            state = self.cond.wait(state).unwrap();
        }
        state.phase
    }
}

/// Allocator of session objects, slab-backed with batch granularity
pub struct SessionFactory {
    slab: Mutex<Slab<SessionRef>>,
}

impl SessionFactory {
    /// `batch` determines how many sessions one backing block holds
    pub fn new(batch: usize) -> Self {
        let block_size = core::mem::size_of::<SessionRef>().max(16) * batch.max(1) * 2;
        Self {
            slab: Mutex::new(Slab::new(block_size)),
        }
    }

    pub fn create(&self, state: SessionState) -> SessionRef {
        let session = Session::new(state);
        let key = self.slab.lock().unwrap().insert(session.clone());
        session.with(|s| s.factory_key = Some(key));
        session
    }

    pub fn destroy(&self, session: &SessionRef) {
        let key = session.with(|s| s.factory_key.take());
        if let Some(key) = key {
            self.slab.lock().unwrap().remove(key);
        }
    }

    /// Number of live sessions created by this factory
    pub fn live_sessions(&self) -> usize {
        self.slab.lock().unwrap().len()
    }

    /// Backing-store bytes consumed per session, metadata included
    pub fn session_costs(&self) -> usize {
        let slab = self.slab.lock().unwrap();
        slab.consumed() / slab.entries_per_block().max(1)
    }
}
