//! Engine Configuration

use crate::model::{AccountId, DomainId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// System-VM pool reservation behavior
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReservationMode {
    /// System VMs may only draw from the reserved pool
    Strict,
    /// Fall through to the general pool when the reserved pool is exhausted
    Preferred,
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpamConfig {
    /// Quarantine window in minutes; 0 or negative disables quarantine
    pub quarantine_minutes: i64,
    /// Per-domain quarantine overrides
    pub quarantine_overrides: HashMap<DomainId, i64>,
    /// System-VM reserved pool behavior
    pub system_vm_reservation: ReservationMode,
    /// Accounts barred from drawing on shared (system) ranges; absent means allowed
    pub system_ip_entitlements: HashMap<AccountId, bool>,
    /// How long to wait on the account-level lock before failing
    pub account_lock_wait_secs: u64,
}

impl IpamConfig {
    /// Effective quarantine duration for a domain
    pub fn quarantine_minutes_for(&self, domain_id: DomainId) -> i64 {
        self.quarantine_overrides
            .get(&domain_id)
            .copied()
            .unwrap_or(self.quarantine_minutes)
    }

    /// Whether the account may fall back to non-dedicated system ranges
    pub fn can_use_system_ips(&self, account_id: AccountId) -> bool {
        self.system_ip_entitlements.get(&account_id).copied().unwrap_or(true)
    }

    pub fn account_lock_wait(&self) -> Duration {
        Duration::from_secs(self.account_lock_wait_secs)
    }
}

impl Default for IpamConfig {
    fn default() -> Self {
        Self {
            quarantine_minutes: 0,
            quarantine_overrides: HashMap::new(),
            system_vm_reservation: ReservationMode::Preferred,
            system_ip_entitlements: HashMap::new(),
            account_lock_wait_secs: 30,
        }
    }
}
