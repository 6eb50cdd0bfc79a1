//! Quarantine Manager
//!
//! Holds a released address out of the pool for a per-domain configurable
//! window before a different owner may reuse it. The previous owner can
//! always take the address back immediately, which also lifts the hold.
//! Quarantine gates reuse; it never changes the address's lifecycle state.

use crate::config::IpamConfig;
use crate::error::{IpamError, IpamResult};
use crate::events::{UsageEvent, UsageEventSink};
use crate::model::{
    AccountId, IpAddressId, IpOwner, PublicIp, QuarantineRecord, QuarantineRemoval,
};
use crate::store::{QuarantineStore, RangeStore};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

pub struct QuarantineManager {
    store: Arc<dyn QuarantineStore>,
    ranges: Arc<dyn RangeStore>,
    events: Arc<dyn UsageEventSink>,
    config: Arc<IpamConfig>,
}

impl QuarantineManager {
    pub fn new(
        store: Arc<dyn QuarantineStore>,
        ranges: Arc<dyn RangeStore>,
        events: Arc<dyn UsageEventSink>,
        config: Arc<IpamConfig>,
    ) -> Self {
        Self { store, ranges, events, config }
    }

    /// File a quarantine record for a released address.
    ///
    /// Returns `None` when the domain's window is disabled, the address is
    /// a system address, or its range is dedicated (a dedicated range can
    /// only ever serve the same tenant again).
    pub fn add_to_quarantine(&self, ip: &PublicIp) -> IpamResult<Option<QuarantineRecord>> {
        let Some(owner) = ip.owner else {
            return Ok(None);
        };
        if ip.is_system {
            return Ok(None);
        }
        if self.ranges.get(ip.vlan_id).map(|r| r.is_dedicated()).unwrap_or(false) {
            return Ok(None);
        }
        let minutes = self.config.quarantine_minutes_for(owner.domain_id);
        if minutes <= 0 {
            return Ok(None);
        }

        let now = Utc::now();
        let record = QuarantineRecord {
            ip_id: ip.id,
            previous_owner: owner,
            started_at: now,
            end_at: now + Duration::minutes(minutes),
            removal: None,
        };
        self.store.upsert(record.clone())?;
        tracing::debug!(ip = %ip.address, until = %record.end_at, "address quarantined");
        self.events.publish(UsageEvent::IpQuarantined {
            ip_id: ip.id,
            address: ip.address,
            previous_account: owner.account_id,
            until: record.end_at,
        });
        Ok(Some(record))
    }

    /// Whether `new_owner` may take the address right now
    pub fn is_allocatable(&self, ip_id: IpAddressId, new_owner: &IpOwner) -> bool {
        match self.active_record(ip_id) {
            Some(record) => record.previous_owner.account_id == new_owner.account_id,
            None => true,
        }
    }

    /// Active quarantine record, if its window is still in force
    pub fn active_record(&self, ip_id: IpAddressId) -> Option<QuarantineRecord> {
        let record = self.store.get(ip_id)?;
        if record.removal.is_some() || record.end_at <= Utc::now() {
            return None;
        }
        Some(record)
    }

    /// Lift the hold because the previous owner reacquired the address
    pub fn fast_return(&self, ip_id: IpAddressId, owner: &IpOwner) -> IpamResult<()> {
        let Some(record) = self.active_record(ip_id) else {
            return Ok(());
        };
        if record.previous_owner.account_id != owner.account_id {
            return Err(IpamError::invalid(format!(
                "address {} is quarantined for a different account",
                ip_id
            )));
        }
        self.end(record, "reacquired by previous owner", Some(owner.account_id))
    }

    /// End the window early by administrative action
    pub fn remove_early(
        &self,
        ip_id: IpAddressId,
        reason: &str,
        removed_by: Option<AccountId>,
    ) -> IpamResult<()> {
        let Some(record) = self.active_record(ip_id) else {
            return Err(IpamError::invalid(format!("no active quarantine on {}", ip_id)));
        };
        self.end(record, reason, removed_by)
    }

    /// Push the window's end out to a later date
    pub fn extend(&self, ip_id: IpAddressId, new_end: DateTime<Utc>) -> IpamResult<QuarantineRecord> {
        let Some(mut record) = self.active_record(ip_id) else {
            return Err(IpamError::invalid(format!("no active quarantine on {}", ip_id)));
        };
        if new_end <= record.end_at {
            return Err(IpamError::invalid("new end date must extend the current window"));
        }
        record.end_at = new_end;
        self.store.upsert(record.clone())?;
        Ok(record)
    }

    fn end(
        &self,
        mut record: QuarantineRecord,
        reason: &str,
        removed_by: Option<AccountId>,
    ) -> IpamResult<()> {
        record.removal = Some(QuarantineRemoval {
            at: Utc::now(),
            reason: reason.to_string(),
            removed_by,
        });
        self.store.upsert(record.clone())?;
        tracing::debug!(ip_id = %record.ip_id, reason, "quarantine lifted");
        self.events.publish(UsageEvent::IpQuarantineLifted {
            ip_id: record.ip_id,
            reason: reason.to_string(),
        });
        Ok(())
    }
}
