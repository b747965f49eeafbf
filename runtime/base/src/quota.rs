//! Quota accounts for RAM bytes and capability counts
//!
//! Each protection domain holds one account per resource. An account tracks
//! a limit and a used value and may name a reference account, the parent
//! account it trades quota with. Withdrawals are all-or-nothing; transfers
//! move limit between two accounts and never touch the used values. Every
//! transfer path terminates at the root accounts owned by the resource
//! server.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Quota exhaustion, reported without side effects
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QuotaError {
    #[error("out of RAM quota")]
    OutOfRam,

    #[error("out of capability quota")]
    OutOfCaps,
}

/// RAM byte quota
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct RamQuota {
    pub value: u64,
}

/// Capability count quota
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct CapQuota {
    pub value: u64,
}

/// Unit of a quota account
pub trait QuotaUnit: Copy + Send + Sync + core::fmt::Debug + 'static {
    const RESOURCE: &'static str;

    fn from_value(value: u64) -> Self;
    fn value(self) -> u64;
    fn exhausted() -> QuotaError;
}

impl QuotaUnit for RamQuota {
    const RESOURCE: &'static str = "RAM";

    fn from_value(value: u64) -> Self {
        Self { value }
    }

    fn value(self) -> u64 {
        self.value
    }

    fn exhausted() -> QuotaError {
        QuotaError::OutOfRam
    }
}

impl QuotaUnit for CapQuota {
    const RESOURCE: &'static str = "caps";

    fn from_value(value: u64) -> Self {
        Self { value }
    }

    fn value(self) -> u64 {
        self.value
    }

    fn exhausted() -> QuotaError {
        QuotaError::OutOfCaps
    }
}

struct State {
    limit: u64,
    used: u64,
}

/// One quota account: limit, used value, and reference-account link
///
/// The numeric account identity orders lock acquisition during transfers,
/// which rules out deadlock between concurrent opposite-direction trades.
pub struct Account<U: QuotaUnit> {
    id: u64,
    label: String,
    state: Mutex<State>,
    reference: Mutex<Option<Arc<Account<U>>>>,
}

static NEXT_ACCOUNT_ID: AtomicU64 = AtomicU64::new(1);

impl<U: QuotaUnit> Account<U> {
    pub fn new(label: &str, limit: U) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_ACCOUNT_ID.fetch_add(1, Ordering::Relaxed),
            label: label.into(),
            state: Mutex::new(State {
                limit: limit.value(),
                used: 0,
            }),
            reference: Mutex::new(None),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn limit(&self) -> U {
        U::from_value(self.state.lock().unwrap().limit)
    }

    pub fn used(&self) -> U {
        U::from_value(self.state.lock().unwrap().used)
    }

    /// Quota still available for withdrawal
    pub fn avail(&self) -> U {
        let state = self.state.lock().unwrap();
        U::from_value(state.limit - state.used)
    }

    /// Designate the account this one trades quota with
    pub fn ref_account(&self, reference: &Arc<Account<U>>) {
        *self.reference.lock().unwrap() = Some(reference.clone());
    }

    pub fn reference(&self) -> Option<Arc<Account<U>>> {
        self.reference.lock().unwrap().clone()
    }

    /// Consume quota; fails without side effects when the limit is hit
    pub fn withdraw(&self, amount: U) -> Result<(), QuotaError> {
        let mut state = self.state.lock().unwrap();
        let amount = amount.value();
        if state.used + amount > state.limit {
            return Err(U::exhausted());
        }
        state.used += amount;
        Ok(())
    }

    /// Return previously withdrawn quota
    pub fn replenish(&self, amount: U) {
        let mut state = self.state.lock().unwrap();
        let amount = amount.value();
        if amount > state.used {
            log::warn!(
                "account '{}': replenish of {} {} exceeds used value {}",
                self.label,
                amount,
                U::RESOURCE,
                state.used
            );
            state.used = 0;
        } else {
            state.used -= amount;
        }
    }

    /// Move `amount` of limit from this account to `recipient`
    ///
    /// Both used values stay untouched. The donor must have `amount` of
    /// unconsumed limit. A zero amount is a successful no-op.
    pub fn transfer_to(
        self: &Arc<Self>,
        recipient: &Arc<Account<U>>,
        amount: U,
    ) -> Result<(), QuotaError> {
        let amount = amount.value();
        if amount == 0 || Arc::ptr_eq(self, recipient) {
            return Ok(());
        }

        // lock order by account identity
        let (low, high) = if self.id < recipient.id {
            (self, recipient)
        } else {
            (recipient, self)
        };
        let mut low_state = low.state.lock().unwrap();
        let mut high_state = high.state.lock().unwrap();
        let (donor, rcpt) = if self.id < recipient.id {
            (&mut *low_state, &mut *high_state)
        } else {
            (&mut *high_state, &mut *low_state)
        };

        if donor.limit - donor.used < amount {
            return Err(U::exhausted());
        }
        donor.limit -= amount;
        rcpt.limit += amount;
        Ok(())
    }

    /// Raise this account's limit at the expense of `donor`
    pub fn upgrade_from(self: &Arc<Self>, donor: &Arc<Account<U>>, amount: U) -> Result<(), QuotaError> {
        donor.transfer_to(self, amount)
    }

    /// Lower this account's limit in favour of `recipient`
    pub fn downgrade_to(
        self: &Arc<Self>,
        recipient: &Arc<Account<U>>,
        amount: U,
    ) -> Result<(), QuotaError> {
        self.transfer_to(recipient, amount)
    }

    /// Pre-commit a withdrawal that rolls back unless acknowledged
    pub fn reserve(&self, amount: U) -> Result<Reservation<'_, U>, QuotaError> {
        self.withdraw(amount)?;
        Ok(Reservation {
            account: self,
            amount,
            committed: false,
        })
    }
}

impl<U: QuotaUnit> Drop for Account<U> {
    fn drop(&mut self) {
        let state = self.state.lock().unwrap();
        if state.used > 0 {
            log::error!(
                "account '{}' destroyed with {} {} still in use",
                self.label,
                state.used,
                U::RESOURCE
            );
        }
    }
}

impl<U: QuotaUnit> core::fmt::Debug for Account<U> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.state.lock().unwrap();
        write!(
            f,
            "Account(\"{}\", {} used: {}/{})",
            self.label,
            U::RESOURCE,
            state.used,
            state.limit
        )
    }
}

/// A withdrawal that auto-replenishes on drop unless acknowledged
pub struct Reservation<'a, U: QuotaUnit> {
    account: &'a Account<U>,
    amount: U,
    committed: bool,
}

impl<U: QuotaUnit> Reservation<'_, U> {
    /// Keep the withdrawal
    pub fn acknowledge(mut self) {
        self.committed = true;
    }

    /// Roll the withdrawal back immediately
    pub fn cancel(self) {}

    pub fn amount(&self) -> U {
        self.amount
    }
}

impl<U: QuotaUnit> Drop for Reservation<'_, U> {
    fn drop(&mut self) {
        if !self.committed {
            self.account.replenish(self.amount);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_withdraw_is_all_or_nothing() {
        let account = Account::new("client", RamQuota { value: 1000 });

        account.withdraw(RamQuota { value: 600 }).unwrap();
        assert_eq!(
            account.withdraw(RamQuota { value: 500 }).unwrap_err(),
            QuotaError::OutOfRam
        );
        assert_eq!(account.used().value, 600);

        account.replenish(RamQuota { value: 600 });
        account.withdraw(RamQuota { value: 1000 }).unwrap();
        account.replenish(RamQuota { value: 1000 });
    }

    #[test]
    fn test_cap_account_reports_out_of_caps() {
        let account = Account::new("client", CapQuota { value: 2 });
        account.withdraw(CapQuota { value: 2 }).unwrap();
        assert_eq!(
            account.withdraw(CapQuota { value: 1 }).unwrap_err(),
            QuotaError::OutOfCaps
        );
        account.replenish(CapQuota { value: 2 });
    }

    #[test]
    fn test_transfer_charges_limits_not_used() {
        let parent = Account::new("parent", RamQuota { value: 4096 });
        let child = Account::new("child", RamQuota { value: 0 });
        child.ref_account(&parent);

        parent.transfer_to(&child, RamQuota { value: 1024 }).unwrap();
        assert_eq!(parent.limit().value, 3072);
        assert_eq!(parent.used().value, 0);
        assert_eq!(child.limit().value, 1024);
        assert_eq!(child.used().value, 0);

        child.withdraw(RamQuota { value: 500 }).unwrap();

        // the child cannot donate what it does not have
        assert_eq!(
            child.transfer_to(&parent, RamQuota { value: 4096 }).unwrap_err(),
            QuotaError::OutOfRam
        );
        assert_eq!(child.limit().value, 1024);
        assert_eq!(parent.limit().value, 3072);

        child.replenish(RamQuota { value: 500 });
    }

    #[test]
    fn test_transfer_respects_outstanding_used() {
        let donor = Account::new("donor", RamQuota { value: 100 });
        let rcpt = Account::new("rcpt", RamQuota { value: 0 });

        donor.withdraw(RamQuota { value: 60 }).unwrap();
        assert_eq!(
            donor.transfer_to(&rcpt, RamQuota { value: 50 }).unwrap_err(),
            QuotaError::OutOfRam
        );
        donor.transfer_to(&rcpt, RamQuota { value: 40 }).unwrap();
        donor.replenish(RamQuota { value: 60 });
    }

    #[test]
    fn test_upgrade_and_downgrade() {
        let parent = Account::new("parent", CapQuota { value: 10 });
        let child = Account::new("child", CapQuota { value: 0 });

        child.upgrade_from(&parent, CapQuota { value: 4 }).unwrap();
        assert_eq!(child.limit().value, 4);
        child.downgrade_to(&parent, CapQuota { value: 4 }).unwrap();
        assert_eq!(child.limit().value, 0);
        assert_eq!(parent.limit().value, 10);
    }

    #[test]
    fn test_zero_transfer_is_silent_success() {
        let a = Account::new("a", CapQuota { value: 0 });
        let b = Account::new("b", CapQuota { value: 0 });
        a.transfer_to(&b, CapQuota { value: 0 }).unwrap();
    }

    #[test]
    fn test_reservation_rolls_back_on_drop() {
        let account = Account::new("session", RamQuota { value: 100 });
        {
            let reservation = account.reserve(RamQuota { value: 80 }).unwrap();
            assert_eq!(account.used().value, 80);
            drop(reservation);
        }
        assert_eq!(account.used().value, 0);

        let reservation = account.reserve(RamQuota { value: 80 }).unwrap();
        reservation.acknowledge();
        assert_eq!(account.used().value, 80);
        account.replenish(RamQuota { value: 80 });

        let reservation = account.reserve(RamQuota { value: 30 }).unwrap();
        reservation.cancel();
        assert_eq!(account.used().value, 0);
    }

    #[test]
    fn test_concurrent_opposite_transfers_do_not_deadlock() {
        use std::thread;

        let a = Account::new("a", RamQuota { value: 1_000_000 });
        let b = Account::new("b", RamQuota { value: 1_000_000 });

        let (a2, b2) = (a.clone(), b.clone());
        let forward = thread::spawn(move || {
            for _ in 0..1000 {
                let _ = a2.transfer_to(&b2, RamQuota { value: 10 });
            }
        });
        let (a3, b3) = (a.clone(), b.clone());
        let backward = thread::spawn(move || {
            for _ in 0..1000 {
                let _ = b3.transfer_to(&a3, RamQuota { value: 10 });
            }
        });
        forward.join().unwrap();
        backward.join().unwrap();

        assert_eq!(a.limit().value + b.limit().value, 2_000_000);
    }
}
