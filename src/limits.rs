//! Public IP Quota Accounting
//!
//! The resource-limit service participates in the allocation transaction:
//! the engine checks and increments under its allocation mutex and
//! decrements exactly once on release.

use crate::error::{IpamError, IpamResult};
use crate::model::{AccountId, IpOwner};
use dashmap::DashMap;

/// Per-account resource accounting for public IPs
pub trait ResourceAccountant: Send + Sync {
    /// Fail with `ResourceAllocationLimit` if one more address would
    /// exceed the account's ceiling
    fn check_limit(&self, owner: &IpOwner) -> IpamResult<()>;
    fn increment(&self, owner: &IpOwner);
    fn decrement(&self, owner: &IpOwner);
    fn usage(&self, account_id: AccountId) -> u64;
}

/// In-memory accountant with per-account ceilings
pub struct InMemoryAccountant {
    counts: DashMap<AccountId, u64>,
    limits: DashMap<AccountId, u64>,
}

impl InMemoryAccountant {
    pub fn new() -> Self {
        Self {
            counts: DashMap::new(),
            limits: DashMap::new(),
        }
    }

    /// Set an account's public IP ceiling; unset accounts are unlimited
    pub fn set_limit(&self, account_id: AccountId, limit: u64) {
        self.limits.insert(account_id, limit);
    }
}

impl Default for InMemoryAccountant {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceAccountant for InMemoryAccountant {
    fn check_limit(&self, owner: &IpOwner) -> IpamResult<()> {
        let Some(limit) = self.limits.get(&owner.account_id).map(|l| *l) else {
            return Ok(());
        };
        let used = self.usage(owner.account_id);
        if used >= limit {
            return Err(IpamError::ResourceAllocationLimit {
                account: owner.account_id,
                limit,
            });
        }
        Ok(())
    }

    fn increment(&self, owner: &IpOwner) {
        *self.counts.entry(owner.account_id).or_insert(0) += 1;
    }

    fn decrement(&self, owner: &IpOwner) {
        if let Some(mut count) = self.counts.get_mut(&owner.account_id) {
            *count = count.saturating_sub(1);
        }
    }

    fn usage(&self, account_id: AccountId) -> u64 {
        self.counts.get(&account_id).map(|c| *c).unwrap_or(0)
    }
}
