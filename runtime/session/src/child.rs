//! Parent-side representation of one child component
//!
//! Carries the child's quota accounts, its two session id spaces (one for
//! sessions it consumes, one for sessions it serves), the services it
//! announced, and the blocking hand-over used when the child waits for
//! its parent to answer a resource request.

use std::sync::{Arc, Condvar, Mutex};

use lattice_base::{Account, CapQuota, IdSpace, RamQuota};

use crate::service::ServerEndpoint;
use crate::state::SessionRef;

pub struct Child {
    name: String,
    ram: Arc<Account<RamQuota>>,
    caps: Arc<Account<CapQuota>>,
    /// sessions this child requested
    pub client_ids: IdSpace<SessionRef>,
    /// sessions this child serves
    pub server_ids: IdSpace<SessionRef>,
    endpoint: Mutex<Option<Arc<dyn ServerEndpoint>>>,
    announced: Mutex<Vec<String>>,
    resource_avail: Mutex<u64>,
    resource_cond: Condvar,
    exit_value: Mutex<Option<i64>>,
}

impl std::fmt::Debug for Child {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Child").field("name", &self.name).finish()
    }
}

impl Child {
    pub fn new(name: &str, ram: Arc<Account<RamQuota>>, caps: Arc<Account<CapQuota>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            ram,
            caps,
            client_ids: IdSpace::new(),
            server_ids: IdSpace::new(),
            endpoint: Mutex::new(None),
            announced: Mutex::new(Vec::new()),
            resource_avail: Mutex::new(0),
            resource_cond: Condvar::new(),
            exit_value: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ram_account(&self) -> &Arc<Account<RamQuota>> {
        &self.ram
    }

    pub fn cap_account(&self) -> &Arc<Account<CapQuota>> {
        &self.caps
    }

    /// Install the endpoint serving this child's announced services
    pub fn serve(&self, endpoint: Arc<dyn ServerEndpoint>) {
        *self.endpoint.lock().unwrap() = Some(endpoint);
    }

    pub fn endpoint(&self) -> Option<Arc<dyn ServerEndpoint>> {
        self.endpoint.lock().unwrap().clone()
    }

    pub fn announce(&self, service: &str) {
        let mut announced = self.announced.lock().unwrap();
        if !announced.iter().any(|s| s == service) {
            announced.push(service.into());
        }
    }

    pub fn announced(&self, service: &str) -> bool {
        self.announced.lock().unwrap().iter().any(|s| s == service)
    }

    /// Parent answered a resource request; unblock the waiting client
    pub fn notify_resource_avail(&self) {
        *self.resource_avail.lock().unwrap() += 1;
        self.resource_cond.notify_all();
    }

    /// Fallback handler blocking the client until the parent answers
    pub fn wait_resource_avail(&self) {
        let mut avail = self.resource_avail.lock().unwrap();
        while *avail == 0 {
            avail = self.resource_cond.wait(avail).unwrap();
        }
        *avail -= 1;
    }

    pub fn record_exit(&self, value: i64) {
        *self.exit_value.lock().unwrap() = Some(value);
    }

    pub fn exited(&self) -> Option<i64> {
        *self.exit_value.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn child() -> Arc<Child> {
        Child::new(
            "noux",
            Account::new("noux", RamQuota { value: 1 << 20 }),
            Account::new("noux", CapQuota { value: 64 }),
        )
    }

    #[test]
    fn test_announce_deduplicates() {
        let child = child();
        child.announce("Framebuffer");
        child.announce("Framebuffer");
        assert!(child.announced("Framebuffer"));
        assert!(!child.announced("Input"));
    }

    #[test]
    fn test_resource_wait_blocks_until_notified() {
        let child = child();
        let waiter = child.clone();
        let resumed = Arc::new(AtomicBool::new(false));
        let flag = resumed.clone();

        let thread = std::thread::spawn(move || {
            waiter.wait_resource_avail();
            flag.store(true, Ordering::SeqCst);
        });

        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!resumed.load(Ordering::SeqCst));

        child.notify_resource_avail();
        thread.join().unwrap();
        assert!(resumed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_exit_records_value() {
        let child = child();
        assert!(child.exited().is_none());
        child.record_exit(0);
        assert_eq!(child.exited(), Some(0));
    }
}
