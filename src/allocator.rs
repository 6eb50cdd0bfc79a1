//! Allocation Engine
//!
//! Claims exactly one address from a candidate list under the row lock,
//! confirms the claim with a quota-checked transition to `Allocated`, and
//! walks the release path back to `Free`. The first caller to lock and
//! re-verify a row wins; later callers move on to the next candidate.

use crate::config::IpamConfig;
use crate::error::{CapacityScope, IpamError, IpamResult};
use crate::events::{UsageEvent, UsageEventSink};
use crate::limits::ResourceAccountant;
use crate::locks::{LockKey, LockManager};
use crate::model::{
    IpAddressId, IpOwner, IpState, NetworkId, PublicIp, QuarantineRecord, VpcId,
};
use crate::quarantine::QuarantineManager;
use crate::selector::{PoolSelector, SelectionOutcome, SelectionRequest};
use crate::store::{AddressFilter, AddressStore, NetworkDirectory, RangeStore};
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;

/// What the claimed address is for
#[derive(Debug, Clone)]
pub struct AllocationSpec {
    pub owner: IpOwner,
    pub network_id: Option<NetworkId>,
    pub vpc_id: Option<VpcId>,
    pub source_nat: bool,
    pub is_system: bool,
    pub display: bool,
}

impl AllocationSpec {
    pub fn new(owner: IpOwner) -> Self {
        Self {
            owner,
            network_id: None,
            vpc_id: None,
            source_nat: false,
            is_system: false,
            display: true,
        }
    }
}

/// Result of a completed release
#[derive(Debug, Clone)]
pub struct ReleaseOutcome {
    pub ip: PublicIp,
    pub quarantine: Option<QuarantineRecord>,
}

pub struct AllocationEngine {
    addresses: Arc<dyn AddressStore>,
    ranges: Arc<dyn RangeStore>,
    networks: Arc<dyn NetworkDirectory>,
    accountant: Arc<dyn ResourceAccountant>,
    quarantine: Arc<QuarantineManager>,
    selector: Arc<PoolSelector>,
    locks: Arc<LockManager>,
    events: Arc<dyn UsageEventSink>,
    config: Arc<IpamConfig>,
    /// Serializes the quota check-and-increment across all allocations;
    /// the row lock alone cannot prevent double counting there
    alloc_mutex: Mutex<()>,
}

impl AllocationEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        addresses: Arc<dyn AddressStore>,
        ranges: Arc<dyn RangeStore>,
        networks: Arc<dyn NetworkDirectory>,
        accountant: Arc<dyn ResourceAccountant>,
        quarantine: Arc<QuarantineManager>,
        selector: Arc<PoolSelector>,
        locks: Arc<LockManager>,
        events: Arc<dyn UsageEventSink>,
        config: Arc<IpamConfig>,
    ) -> Self {
        Self {
            addresses,
            ranges,
            networks,
            accountant,
            quarantine,
            selector,
            locks,
            events,
            config,
            alloc_mutex: Mutex::new(()),
        }
    }

    /// Select, claim and confirm one address for `spec.owner`.
    ///
    /// Held under the account lock so that concurrent calls for the same
    /// account cannot both conclude "no source-NAT address exists yet".
    pub fn allocate(
        &self,
        req: &SelectionRequest,
        spec: &AllocationSpec,
    ) -> IpamResult<PublicIp> {
        let account_key = LockKey::Account(spec.owner.account_id);
        let _account = self
            .locks
            .try_acquire_for(account_key.clone(), self.config.account_lock_wait())
            .ok_or_else(|| IpamError::ConcurrentOperation {
                resource: account_key.to_string(),
            })?;

        if spec.source_nat {
            self.assert_source_nat_free(spec)?;
        }

        let outcome = self.selector.select(req)?;
        let claimed = self.claim(&outcome, spec, req.capacity_scope())?;
        match self.mark_allocated(claimed.id) {
            Ok(ip) => Ok(ip),
            Err(e) => {
                // undo the claim; never mask the original failure
                if let Err(rollback) = self.rollback_claim(claimed.id) {
                    tracing::warn!(
                        ip = %claimed.address,
                        error = %rollback,
                        "rollback of claimed address failed"
                    );
                }
                Err(e)
            }
        }
    }

    /// Claim the first still-free candidate under its row lock
    pub fn claim(
        &self,
        outcome: &SelectionOutcome,
        spec: &AllocationSpec,
        scope: CapacityScope,
    ) -> IpamResult<PublicIp> {
        for &id in &outcome.candidates {
            let _row = self.locks.acquire(LockKey::Row(id));
            let Some(mut ip) = self.addresses.get(id) else {
                continue;
            };
            // selection ran without the lock; re-verify under it
            if ip.state != IpState::Free {
                continue;
            }
            if !self.quarantine.is_allocatable(id, &spec.owner) {
                continue;
            }
            if self.quarantine.active_record(id).is_some() {
                // previous owner taking the address back lifts the hold
                self.quarantine.fast_return(id, &spec.owner)?;
            }

            ip.state = IpState::Allocating;
            ip.owner = Some(spec.owner);
            ip.associated_network_id = spec.network_id;
            ip.vpc_id = spec.vpc_id;
            ip.source_nat = spec.source_nat;
            ip.is_system = spec.is_system;
            ip.display = spec.display;
            ip.allocated_at = Some(Utc::now());
            self.addresses.update(&ip)?;
            tracing::debug!(ip = %ip.address, account = %spec.owner.account_id, "address claimed");
            return Ok(ip);
        }
        Err(IpamError::InsufficientCapacity { scope })
    }

    /// Confirm a claim: transition to `Allocated` and commit the quota
    /// increment. Idempotent on an already-`Allocated` address.
    pub fn mark_allocated(&self, ip_id: IpAddressId) -> IpamResult<PublicIp> {
        let _row = self.locks.acquire(LockKey::Row(ip_id));
        let mut ip = self
            .addresses
            .get(ip_id)
            .ok_or_else(|| IpamError::invalid(format!("address record {} not found", ip_id)))?;

        if ip.state == IpState::Allocated {
            return Ok(ip);
        }
        if !ip.state.allocatable() {
            return Err(IpamError::invalid(format!(
                "address {} cannot be confirmed from state {:?}",
                ip.address, ip.state
            )));
        }
        let owner = ip
            .owner
            .ok_or_else(|| IpamError::invalid(format!("address {} has no owner", ip.address)))?;

        let was_reserved = ip.state == IpState::Reserved;
        let dedicated = self
            .ranges
            .get(ip.vlan_id)
            .map(|r| r.is_dedicated())
            .unwrap_or(false);
        let exempt = was_reserved || ip.is_system || dedicated || ip.is_direct();

        ip.state = IpState::Allocated;
        if exempt {
            self.addresses.update(&ip)?;
        } else {
            // the increment spans a second lock acquisition; serialize it
            let _alloc = self.alloc_mutex.lock();
            self.accountant.check_limit(&owner)?;
            self.accountant.increment(&owner);
            ip.counted = true;
            if let Err(e) = self.addresses.update(&ip) {
                // release the held reservation so the counter stays consistent
                self.accountant.decrement(&owner);
                return Err(e);
            }
        }

        tracing::info!(ip = %ip.address, account = %owner.account_id, "address allocated");
        self.events.publish(UsageEvent::IpAssigned {
            ip_id: ip.id,
            address: ip.address,
            account_id: owner.account_id,
            network_id: ip.associated_network_id,
            source_nat: ip.source_nat,
        });
        Ok(ip)
    }

    /// Return a claimed but never-delivered address straight to `Free`.
    ///
    /// This is the compensation for a failed claim-and-confirm sequence,
    /// not a release: the caller never held the address, so no quarantine
    /// record is filed and no release event is published. A held quota
    /// increment is handed back.
    pub fn rollback_claim(&self, ip_id: IpAddressId) -> IpamResult<PublicIp> {
        let _row = self.locks.acquire(LockKey::Row(ip_id));
        let mut ip = self
            .addresses
            .get(ip_id)
            .ok_or_else(|| IpamError::invalid(format!("address record {} not found", ip_id)))?;
        if ip.state == IpState::Free {
            return Ok(ip);
        }
        if ip.counted {
            if let Some(owner) = ip.owner {
                self.accountant.decrement(&owner);
            }
            ip.counted = false;
        }
        ip.state = IpState::Free;
        ip.owner = None;
        ip.associated_network_id = None;
        ip.vpc_id = None;
        ip.source_nat = false;
        ip.is_system = false;
        ip.allocated_at = None;
        self.addresses.update(&ip)?;
        tracing::debug!(ip = %ip.address, "claim rolled back");
        Ok(ip)
    }

    /// Pre-reserve a free address for a later explicit allocation
    pub fn reserve(&self, ip_id: IpAddressId, owner: IpOwner) -> IpamResult<PublicIp> {
        let _row = self.locks.acquire(LockKey::Row(ip_id));
        let mut ip = self
            .addresses
            .get(ip_id)
            .ok_or_else(|| IpamError::invalid(format!("address record {} not found", ip_id)))?;
        if ip.state != IpState::Free {
            return Err(IpamError::AddressUnavailable { address: ip.address });
        }
        ip.state = IpState::Reserved;
        ip.owner = Some(owner);
        ip.allocated_at = Some(Utc::now());
        self.addresses.update(&ip)?;
        Ok(ip)
    }

    /// Move an address into the transient `Releasing` state
    pub fn begin_release(&self, ip_id: IpAddressId) -> IpamResult<PublicIp> {
        let _row = self.locks.acquire(LockKey::Row(ip_id));
        let mut ip = self
            .addresses
            .get(ip_id)
            .ok_or_else(|| IpamError::invalid(format!("address record {} not found", ip_id)))?;
        if ip.state == IpState::Releasing {
            return Ok(ip);
        }
        if !ip.state.can_transition_to(IpState::Releasing) {
            return Err(IpamError::invalid(format!(
                "address {} cannot be released from state {:?}",
                ip.address, ip.state
            )));
        }
        ip.state = IpState::Releasing;
        self.addresses.update(&ip)?;
        Ok(ip)
    }

    /// Return a `Releasing` address to `Free`: decrement the quota once if
    /// one was held, file the quarantine record, clear ownership
    pub fn finalize_release(&self, ip_id: IpAddressId) -> IpamResult<ReleaseOutcome> {
        let _row = self.locks.acquire(LockKey::Row(ip_id));
        let mut ip = self
            .addresses
            .get(ip_id)
            .ok_or_else(|| IpamError::invalid(format!("address record {} not found", ip_id)))?;
        if ip.state != IpState::Releasing {
            return Err(IpamError::invalid(format!(
                "address {} is not in Releasing state",
                ip.address
            )));
        }

        if ip.counted {
            if let Some(owner) = ip.owner {
                self.accountant.decrement(&owner);
            }
            ip.counted = false;
        }

        // quarantine decision needs the owner still on the record
        let quarantine = self.quarantine.add_to_quarantine(&ip)?;

        let previous_account = ip.owner.map(|o| o.account_id);
        let address = ip.address;
        ip.state = IpState::Free;
        ip.owner = None;
        ip.associated_network_id = None;
        ip.vpc_id = None;
        ip.source_nat = false;
        ip.is_system = false;
        ip.allocated_at = None;
        self.addresses.update(&ip)?;

        tracing::info!(ip = %address, "address released");
        self.events.publish(UsageEvent::IpReleased {
            ip_id,
            address,
            account_id: previous_account,
        });
        Ok(ReleaseOutcome { ip, quarantine })
    }

    /// Full release for an address with no provider binding
    pub fn release(&self, ip_id: IpAddressId) -> IpamResult<ReleaseOutcome> {
        self.begin_release(ip_id)?;
        self.finalize_release(ip_id)
    }

    /// Abort an in-flight release, returning the address to `Allocated`
    pub fn cancel_release(&self, ip_id: IpAddressId) -> IpamResult<PublicIp> {
        let _row = self.locks.acquire(LockKey::Row(ip_id));
        let mut ip = self
            .addresses
            .get(ip_id)
            .ok_or_else(|| IpamError::invalid(format!("address record {} not found", ip_id)))?;
        if ip.state != IpState::Releasing {
            return Ok(ip);
        }
        ip.state = IpState::Allocated;
        self.addresses.update(&ip)?;
        Ok(ip)
    }

    fn assert_source_nat_free(&self, spec: &AllocationSpec) -> IpamResult<()> {
        let Some(network_id) = spec.network_id else {
            return Ok(());
        };
        let network = self
            .networks
            .network(network_id)
            .ok_or_else(|| IpamError::invalid(format!("network {} not found", network_id)))?;
        if network.shared_source_nat {
            return Ok(());
        }
        let existing = self.addresses.find(&AddressFilter {
            account_id: Some(spec.owner.account_id),
            network_id: Some(network_id),
            source_nat: Some(true),
            ..Default::default()
        });
        if let Some(existing) = existing.first() {
            return Err(IpamError::invalid(format!(
                "network {} already has source-NAT address {}",
                network_id, existing.address
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullEventSink;
    use crate::limits::InMemoryAccountant;
    use crate::model::{NetworkInfo, NetworkState, RangeDedication, RangeKind, VlanRange, ZoneId};
    use crate::store::{
        provision_range_addresses, InMemoryAddressStore, InMemoryNetworkDirectory,
        InMemoryQuarantineStore, InMemoryRangeStore,
    };
    use uuid::Uuid;

    struct Fixture {
        engine: Arc<AllocationEngine>,
        addresses: Arc<dyn AddressStore>,
        ranges: Arc<InMemoryRangeStore>,
        networks: Arc<InMemoryNetworkDirectory>,
        accountant: Arc<InMemoryAccountant>,
        zone: ZoneId,
    }

    fn fixture(config: IpamConfig) -> Fixture {
        let addresses: Arc<dyn AddressStore> = Arc::new(InMemoryAddressStore::new());
        let ranges = Arc::new(InMemoryRangeStore::new());
        let networks = Arc::new(InMemoryNetworkDirectory::new());
        let accountant = Arc::new(InMemoryAccountant::new());
        let locks = Arc::new(LockManager::new());
        let events: Arc<dyn UsageEventSink> = Arc::new(NullEventSink);
        let config = Arc::new(config);
        let quarantine = Arc::new(QuarantineManager::new(
            Arc::new(InMemoryQuarantineStore::new()),
            ranges.clone(),
            events.clone(),
            config.clone(),
        ));
        let selector = Arc::new(PoolSelector::new(
            addresses.clone(),
            ranges.clone(),
            networks.clone(),
            quarantine.clone(),
            config.clone(),
        ));
        let engine = Arc::new(AllocationEngine::new(
            addresses.clone(),
            ranges.clone(),
            networks.clone(),
            accountant.clone(),
            quarantine,
            selector,
            locks,
            events,
            config,
        ));
        Fixture {
            engine,
            addresses,
            ranges,
            networks,
            accountant,
            zone: Uuid::new_v4(),
        }
    }

    fn add_range(f: &Fixture, cidr: &str, gateway: &str, dedication: Option<RangeDedication>) {
        let range = VlanRange {
            id: Uuid::new_v4(),
            zone_id: f.zone,
            network_id: Uuid::new_v4(),
            physical_network_id: Uuid::new_v4(),
            pod_id: None,
            kind: RangeKind::VirtualNetwork,
            cidr: cidr.parse().unwrap(),
            gateway: gateway.parse().unwrap(),
            dedication,
            system_reserved: false,
        };
        f.ranges.insert(range.clone()).unwrap();
        provision_range_addresses(&f.addresses, &range).unwrap();
    }

    fn add_network(f: &Fixture, shared_source_nat: bool) -> NetworkId {
        let id = Uuid::new_v4();
        f.networks.put_network(NetworkInfo {
            id,
            zone_id: f.zone,
            state: NetworkState::Implemented,
            vpc_id: None,
            shared_source_nat,
            router_ip: None,
            providers: vec![],
        });
        id
    }

    fn owner() -> IpOwner {
        IpOwner::new(Uuid::new_v4(), Uuid::new_v4())
    }

    #[test]
    fn test_source_nat_scenario() {
        let f = fixture(IpamConfig::default());
        add_range(&f, "10.0.0.0/29", "10.0.0.7", None);
        let network = add_network(&f, false);
        let account_x = owner();

        let mut spec = AllocationSpec::new(account_x);
        spec.network_id = Some(network);
        spec.source_nat = true;

        let ip = f.engine.allocate(&SelectionRequest::new(f.zone, account_x), &spec).unwrap();
        assert_eq!(ip.address, "10.0.0.1".parse::<std::net::Ipv4Addr>().unwrap());
        assert_eq!(ip.state, IpState::Allocated);
        assert!(ip.source_nat);
        assert_eq!(f.accountant.usage(account_x.account_id), 1);
    }

    #[test]
    fn test_source_nat_uniqueness_per_network() {
        let f = fixture(IpamConfig::default());
        add_range(&f, "10.0.0.0/28", "10.0.0.14", None);
        let network = add_network(&f, false);
        let account = owner();

        let mut spec = AllocationSpec::new(account);
        spec.network_id = Some(network);
        spec.source_nat = true;

        f.engine.allocate(&SelectionRequest::new(f.zone, account), &spec).unwrap();
        let err = f.engine.allocate(&SelectionRequest::new(f.zone, account), &spec).unwrap_err();
        assert!(matches!(err, IpamError::InvalidParameter { .. }));

        let nats = f.addresses.find(&AddressFilter {
            account_id: Some(account.account_id),
            source_nat: Some(true),
            ..Default::default()
        });
        assert_eq!(nats.len(), 1);
    }

    #[test]
    fn test_shared_source_nat_offering_allows_second() {
        let f = fixture(IpamConfig::default());
        add_range(&f, "10.0.0.0/28", "10.0.0.14", None);
        let network = add_network(&f, true);
        let account = owner();

        let mut spec = AllocationSpec::new(account);
        spec.network_id = Some(network);
        spec.source_nat = true;

        f.engine.allocate(&SelectionRequest::new(f.zone, account), &spec).unwrap();
        f.engine.allocate(&SelectionRequest::new(f.zone, account), &spec).unwrap();
    }

    #[test]
    fn test_mutual_exclusion_under_concurrency() {
        let f = fixture(IpamConfig::default());
        // /29 minus gateway: exactly 5 free addresses
        add_range(&f, "10.0.0.0/29", "10.0.0.1", None);
        let network = add_network(&f, false);

        let mut handles = Vec::new();
        for _ in 0..5 {
            let engine = Arc::clone(&f.engine);
            let zone = f.zone;
            handles.push(std::thread::spawn(move || {
                let account = IpOwner::new(Uuid::new_v4(), Uuid::new_v4());
                let mut spec = AllocationSpec::new(account);
                spec.network_id = Some(network);
                engine.allocate(&SelectionRequest::new(zone, account), &spec)
            }));
        }
        let mut got: Vec<std::net::Ipv4Addr> = handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap().address)
            .collect();
        got.sort();
        got.dedup();
        assert_eq!(got.len(), 5, "every caller received a distinct address");

        // the pool is now empty
        let account = owner();
        let mut spec = AllocationSpec::new(account);
        spec.network_id = Some(network);
        let err = f.engine.allocate(&SelectionRequest::new(f.zone, account), &spec).unwrap_err();
        assert!(matches!(err, IpamError::InsufficientCapacity { .. }));
    }

    #[test]
    fn test_mark_allocated_idempotent() {
        let f = fixture(IpamConfig::default());
        add_range(&f, "10.0.0.0/29", "10.0.0.1", None);
        let network = add_network(&f, false);
        let account = owner();

        let mut spec = AllocationSpec::new(account);
        spec.network_id = Some(network);
        let ip = f.engine.allocate(&SelectionRequest::new(f.zone, account), &spec).unwrap();
        assert_eq!(f.accountant.usage(account.account_id), 1);

        let again = f.engine.mark_allocated(ip.id).unwrap();
        assert_eq!(again.state, IpState::Allocated);
        assert_eq!(f.accountant.usage(account.account_id), 1, "no double increment");
    }

    #[test]
    fn test_quota_limit_rolls_back_claim() {
        let f = fixture(IpamConfig::default());
        add_range(&f, "10.0.0.0/29", "10.0.0.1", None);
        let network = add_network(&f, false);
        let account = owner();
        f.accountant.set_limit(account.account_id, 0);

        let mut spec = AllocationSpec::new(account);
        spec.network_id = Some(network);
        let err = f.engine.allocate(&SelectionRequest::new(f.zone, account), &spec).unwrap_err();
        assert!(matches!(err, IpamError::ResourceAllocationLimit { .. }));

        // the claimed row went back to Free
        let free = f.addresses.find(&AddressFilter {
            zone_id: Some(f.zone),
            state: Some(IpState::Free),
            ..Default::default()
        });
        assert_eq!(free.len(), 5);
        assert_eq!(f.accountant.usage(account.account_id), 0);
    }

    #[test]
    fn test_failed_allocation_leaves_address_unquarantined() {
        let f = fixture(IpamConfig { quarantine_minutes: 30, ..Default::default() });
        // single usable address
        add_range(&f, "10.0.0.0/30", "10.0.0.1", None);
        let network = add_network(&f, false);
        let blocked = owner();
        f.accountant.set_limit(blocked.account_id, 0);

        let mut spec = AllocationSpec::new(blocked);
        spec.network_id = Some(network);
        let err = f.engine.allocate(&SelectionRequest::new(f.zone, blocked), &spec).unwrap_err();
        assert!(matches!(err, IpamError::ResourceAllocationLimit { .. }));

        // the rollback filed no quarantine record for the never-held address
        let free = f.addresses.find(&AddressFilter {
            zone_id: Some(f.zone),
            state: Some(IpState::Free),
            ..Default::default()
        });
        assert_eq!(free.len(), 1);
        assert!(f.engine.quarantine.active_record(free[0].id).is_none());

        // another account can take it at once
        let other = owner();
        let mut spec = AllocationSpec::new(other);
        spec.network_id = Some(network);
        let ip = f.engine.allocate(&SelectionRequest::new(f.zone, other), &spec).unwrap();
        assert_eq!(ip.state, IpState::Allocated);
    }

    #[test]
    fn test_dedicated_allocation_skips_quota() {
        let f = fixture(IpamConfig::default());
        let account = owner();
        add_range(
            &f,
            "10.0.0.0/29",
            "10.0.0.1",
            Some(RangeDedication::Account {
                account_id: account.account_id,
                domain_id: account.domain_id,
            }),
        );
        let network = add_network(&f, false);

        let mut spec = AllocationSpec::new(account);
        spec.network_id = Some(network);
        let ip = f.engine.allocate(&SelectionRequest::new(f.zone, account), &spec).unwrap();
        assert_eq!(ip.state, IpState::Allocated);
        assert_eq!(f.accountant.usage(account.account_id), 0);
    }

    #[test]
    fn test_direct_allocation_skips_quota() {
        let f = fixture(IpamConfig::default());
        add_range(&f, "10.0.0.0/29", "10.0.0.1", None);
        let account = owner();

        // no network: a direct address
        let spec = AllocationSpec::new(account);
        let ip = f.engine.allocate(&SelectionRequest::new(f.zone, account), &spec).unwrap();
        assert!(ip.is_direct());
        assert_eq!(f.accountant.usage(account.account_id), 0);
    }

    #[test]
    fn test_release_round_trip() {
        let f = fixture(IpamConfig::default());
        add_range(&f, "10.0.0.0/29", "10.0.0.1", None);
        let network = add_network(&f, false);
        let account = owner();

        let mut spec = AllocationSpec::new(account);
        spec.network_id = Some(network);
        spec.source_nat = true;
        let ip = f.engine.allocate(&SelectionRequest::new(f.zone, account), &spec).unwrap();
        assert_eq!(f.accountant.usage(account.account_id), 1);

        let outcome = f.engine.release(ip.id).unwrap();
        assert_eq!(outcome.ip.state, IpState::Free);
        assert!(outcome.ip.owner.is_none());
        assert!(outcome.ip.associated_network_id.is_none());
        assert!(!outcome.ip.source_nat);
        assert_eq!(f.accountant.usage(account.account_id), 0, "net-zero quota");
    }

    #[test]
    fn test_reserved_confirmation_skips_quota() {
        let f = fixture(IpamConfig::default());
        add_range(&f, "10.0.0.0/29", "10.0.0.1", None);
        let account = owner();

        let free = f.addresses.find(&AddressFilter {
            zone_id: Some(f.zone),
            state: Some(IpState::Free),
            ..Default::default()
        });
        let reserved = f.engine.reserve(free[0].id, account).unwrap();
        assert_eq!(reserved.state, IpState::Reserved);

        let ip = f.engine.mark_allocated(reserved.id).unwrap();
        assert_eq!(ip.state, IpState::Allocated);
        assert_eq!(f.accountant.usage(account.account_id), 0);
    }

    #[test]
    fn test_quarantined_address_skipped_then_reused_by_owner() {
        let f = fixture(IpamConfig { quarantine_minutes: 30, ..Default::default() });
        // single usable address
        add_range(&f, "10.0.0.0/30", "10.0.0.1", None);
        let network = add_network(&f, false);
        let first = owner();

        let mut spec = AllocationSpec::new(first);
        spec.network_id = Some(network);
        let ip = f.engine.allocate(&SelectionRequest::new(f.zone, first), &spec).unwrap();
        let outcome = f.engine.release(ip.id).unwrap();
        assert!(outcome.quarantine.is_some());

        // a different account is gated off the only address
        let stranger = owner();
        let mut spec = AllocationSpec::new(stranger);
        spec.network_id = Some(network);
        let err = f.engine.allocate(&SelectionRequest::new(f.zone, stranger), &spec).unwrap_err();
        assert!(matches!(err, IpamError::InsufficientCapacity { .. }));

        // the previous owner gets it back at once, clearing the hold
        let mut spec = AllocationSpec::new(first);
        spec.network_id = Some(network);
        let back = f.engine.allocate(&SelectionRequest::new(f.zone, first), &spec).unwrap();
        assert_eq!(back.address, ip.address);
        f.engine.release(back.id).unwrap();
    }
}
