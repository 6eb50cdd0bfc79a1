//! Keyed Lock Manager
//!
//! Explicit locks keyed by resource class and id: per-address row locks,
//! per-account locks, and named global locks (portable IP pool). Guards
//! release on drop, so every exit path including errors unlocks.

use crate::model::{AccountId, IpAddressId};
use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use std::time::Duration;

/// Lock key: resource class plus id
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockKey {
    /// Row lock on a single address record
    Row(IpAddressId),
    /// Account-level lock serializing claim-and-associate sequences
    Account(AccountId),
    /// Process-wide named lock
    Named(&'static str),
}

impl std::fmt::Display for LockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Row(id) => write!(f, "ip:{}", id),
            Self::Account(id) => write!(f, "account:{}", id),
            Self::Named(name) => write!(f, "named:{}", name),
        }
    }
}

/// Name of the global lock serializing all portable IP operations
pub const PORTABLE_IP_LOCK: &str = "portable-ip-pool";

/// Keyed pessimistic lock table
pub struct LockManager {
    held: Mutex<HashSet<LockKey>>,
    released: Condvar,
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            held: Mutex::new(HashSet::new()),
            released: Condvar::new(),
        }
    }

    /// Block until the key is acquired
    pub fn acquire(&self, key: LockKey) -> LockGuard<'_> {
        let mut held = self.held.lock();
        while held.contains(&key) {
            self.released.wait(&mut held);
        }
        held.insert(key.clone());
        LockGuard { manager: self, key }
    }

    /// Acquire without blocking; `None` if the key is already held
    pub fn try_acquire(&self, key: LockKey) -> Option<LockGuard<'_>> {
        let mut held = self.held.lock();
        if held.contains(&key) {
            return None;
        }
        held.insert(key.clone());
        Some(LockGuard { manager: self, key })
    }

    /// Acquire with a bounded wait; `None` on timeout
    pub fn try_acquire_for(&self, key: LockKey, wait: Duration) -> Option<LockGuard<'_>> {
        let deadline = std::time::Instant::now() + wait;
        let mut held = self.held.lock();
        while held.contains(&key) {
            let timeout = self.released.wait_until(&mut held, deadline);
            if timeout.timed_out() && held.contains(&key) {
                return None;
            }
        }
        held.insert(key.clone());
        Some(LockGuard { manager: self, key })
    }

    fn release(&self, key: &LockKey) {
        let mut held = self.held.lock();
        held.remove(key);
        self.released.notify_all();
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Held lock; releasing happens on drop
pub struct LockGuard<'a> {
    manager: &'a LockManager,
    key: LockKey,
}

impl LockGuard<'_> {
    pub fn key(&self) -> &LockKey {
        &self.key
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.manager.release(&self.key);
    }
}
