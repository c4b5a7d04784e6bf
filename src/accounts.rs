//! Multi-account upstream pool: round-robin selection over N upstream
//! credentials, advancing past a credential on its own failure.

use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub name: String,
    pub bearer_token: String,
    pub media_user_token: String,
}

/// Lock-free round-robin over an immutable account list. With zero
/// accounts every operation reports "no account" instead of panicking.
pub struct AccountPool {
    accounts: Vec<Account>,
    next: AtomicUsize,
}

impl AccountPool {
    pub fn new(accounts: Vec<Account>) -> Self {
        Self {
            accounts,
            next: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Read-then-advance of the cursor modulo the account count. Two
    /// concurrent callers may observe the same index if the counter
    /// wrapped, but no caller starves.
    pub fn select_next(&self) -> Option<(Account, usize)> {
        if self.accounts.is_empty() {
            return None;
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.accounts.len();
        self.accounts.get(idx).cloned().map(|account| (account, idx))
    }

    /// Advances the cursor past `current_index` so the next `select_next`
    /// returns a different account. Safe under races: the operation only
    /// guarantees "at least advance by one", not exact positioning.
    pub fn skip(&self, current_index: usize) {
        if self.accounts.is_empty() {
            return;
        }
        let target = current_index + 1;
        // CAS loop: only advance the shared cursor forward, never backward,
        // so a concurrent skip from another caller is never undone.
        let mut observed = self.next.load(Ordering::Relaxed);
        while observed < target {
            match self.next.compare_exchange_weak(
                observed,
                target,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => observed = current,
            }
        }
    }
}
