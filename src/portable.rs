//! Portable IP Coordinator
//!
//! Portable addresses are provisioned against a region-level pool and then
//! emulated as a normal zone-scoped address/range pair so the rest of the
//! engine treats them uniformly. All operations here run under one named
//! global lock; the pool is small and low-frequency, so region-wide
//! serialization is acceptable.

use crate::allocator::{AllocationEngine, AllocationSpec, ReleaseOutcome};
use crate::association::{AssociationOrchestrator, RuleQuery};
use crate::error::{IpamError, IpamResult};
use crate::events::{UsageEvent, UsageEventSink};
use crate::locks::{LockKey, LockManager, PORTABLE_IP_LOCK};
use crate::model::{
    IpAddressId, IpOwner, IpState, NetworkId, PublicIp, RangeKind, VlanId, VlanRange, ZoneId,
};
use crate::selector::SelectionRequest;
use crate::store::{AddressFilter, AddressStore, NetworkDirectory, RangeStore};
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use std::sync::Arc;
use uuid::Uuid;

pub struct PortableIpCoordinator {
    addresses: Arc<dyn AddressStore>,
    ranges: Arc<dyn RangeStore>,
    networks: Arc<dyn NetworkDirectory>,
    allocator: Arc<AllocationEngine>,
    association: Arc<AssociationOrchestrator>,
    rules: Arc<dyn RuleQuery>,
    locks: Arc<LockManager>,
    events: Arc<dyn UsageEventSink>,
}

impl PortableIpCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        addresses: Arc<dyn AddressStore>,
        ranges: Arc<dyn RangeStore>,
        networks: Arc<dyn NetworkDirectory>,
        allocator: Arc<AllocationEngine>,
        association: Arc<AssociationOrchestrator>,
        rules: Arc<dyn RuleQuery>,
        locks: Arc<LockManager>,
        events: Arc<dyn UsageEventSink>,
    ) -> Self {
        Self { addresses, ranges, networks, allocator, association, rules, locks, events }
    }

    fn pool_lock(&self) -> IpamResult<crate::locks::LockGuard<'_>> {
        self.locks
            .try_acquire_for(LockKey::Named(PORTABLE_IP_LOCK), std::time::Duration::from_secs(30))
            .ok_or_else(|| IpamError::ConcurrentOperation {
                resource: PORTABLE_IP_LOCK.to_string(),
            })
    }

    /// Provision a region pool block into a zone as a portable range with
    /// one address row per host
    pub fn provision(
        &self,
        zone_id: ZoneId,
        cidr: Ipv4Net,
        gateway: Ipv4Addr,
    ) -> IpamResult<VlanRange> {
        let _pool = self.pool_lock()?;
        let physical_network_id = self
            .networks
            .physical_network(zone_id)
            .ok_or_else(|| IpamError::invalid(format!("no physical network in zone {}", zone_id)))?;
        let range = VlanRange {
            id: Uuid::new_v4(),
            zone_id,
            network_id: Uuid::new_v4(),
            physical_network_id,
            pod_id: None,
            kind: RangeKind::Portable,
            cidr,
            gateway,
            dedication: None,
            system_reserved: false,
        };
        self.ranges.insert(range.clone())?;
        crate::store::provision_range_addresses(&self.addresses, &range)?;
        tracing::info!(zone = %zone_id, cidr = %cidr, "portable range provisioned");
        Ok(range)
    }

    /// Allocate a portable address to `owner`, optionally bound to a network
    pub fn allocate(
        &self,
        owner: IpOwner,
        zone_id: ZoneId,
        network_id: Option<NetworkId>,
    ) -> IpamResult<PublicIp> {
        let _pool = self.pool_lock()?;
        let mut req = SelectionRequest::new(zone_id, owner);
        req.range_kind = RangeKind::Portable;
        let mut spec = AllocationSpec::new(owner);
        spec.network_id = network_id;
        self.allocator.allocate(&req, &spec)
    }

    /// Move a portable address to another network, rewriting its zone
    /// binding when the destination lies in a different zone.
    ///
    /// Rejected before any mutation if active rules exist on the address in
    /// its current network.
    pub fn transfer(&self, ip_id: IpAddressId, to_network_id: NetworkId) -> IpamResult<PublicIp> {
        let _pool = self.pool_lock()?;
        let ip = self
            .addresses
            .get(ip_id)
            .ok_or_else(|| IpamError::invalid(format!("address record {} not found", ip_id)))?;
        if !ip.is_portable {
            return Err(IpamError::invalid(format!("address {} is not portable", ip.address)));
        }
        if ip.state != IpState::Allocated {
            return Err(IpamError::invalid(format!(
                "portable address {} must be Allocated to transfer, is {:?}",
                ip.address, ip.state
            )));
        }
        let dest = self
            .networks
            .network(to_network_id)
            .ok_or_else(|| IpamError::invalid(format!("network {} not found", to_network_id)))?;
        let from_network = ip.associated_network_id;
        if from_network == Some(to_network_id) {
            return Err(IpamError::invalid(format!(
                "address {} is already associated with network {}",
                ip.address, to_network_id
            )));
        }
        if let Some(from) = from_network {
            if self.rules.has_rules_in_network(ip_id, from) {
                return Err(IpamError::invalid(format!(
                    "address {} still has active rules in network {}",
                    ip.address, from
                )));
            }
        }

        // (a) unbind from the source side
        if from_network.is_some() {
            self.association.unbind(ip_id)?;
        }

        // (b) cross-zone: rewrite the address and its backing range together
        let cross_zone = ip.zone_id != dest.zone_id;
        if cross_zone {
            self.rewrite_zone(ip_id, ip.vlan_id, dest.zone_id)?;
        }

        // (c) bind to the destination side
        let bound = self.association.bind(ip_id, to_network_id)?;
        self.events.publish(UsageEvent::PortableIpTransferred {
            ip_id,
            from_network,
            to_network: to_network_id,
            cross_zone,
        });
        tracing::info!(ip = %bound.address, network = %to_network_id, cross_zone, "portable address transferred");
        Ok(bound)
    }

    /// Release a portable address back to the region pool
    pub fn release(&self, ip_id: IpAddressId) -> IpamResult<ReleaseOutcome> {
        let _pool = self.pool_lock()?;
        let ip = self
            .addresses
            .get(ip_id)
            .ok_or_else(|| IpamError::invalid(format!("address record {} not found", ip_id)))?;
        if !ip.is_portable {
            return Err(IpamError::invalid(format!("address {} is not portable", ip.address)));
        }
        self.allocator.release(ip_id)
    }

    /// Admin-level physical deprovisioning of an idle portable range
    pub fn deprovision(&self, range_id: VlanId) -> IpamResult<()> {
        let _pool = self.pool_lock()?;
        let range = self
            .ranges
            .get(range_id)
            .ok_or_else(|| IpamError::invalid(format!("range {} not found", range_id)))?;
        let rows = self.addresses.find(&AddressFilter {
            vlan_ids: Some(vec![range_id]),
            ..Default::default()
        });
        if rows.iter().any(|ip| ip.state != IpState::Free) {
            return Err(IpamError::invalid(format!(
                "range {} still has allocated addresses",
                range_id
            )));
        }
        for ip in rows {
            self.addresses.remove(ip.id)?;
        }
        self.ranges.remove(range_id)?;
        tracing::info!(range = %range_id, zone = %range.zone_id, "portable range deprovisioned");
        Ok(())
    }

    /// Atomically move the address and its backing range to `new_zone`;
    /// both records change or neither does
    fn rewrite_zone(&self, ip_id: IpAddressId, vlan_id: VlanId, new_zone: ZoneId) -> IpamResult<()> {
        let _row = self.locks.acquire(LockKey::Row(ip_id));
        let mut ip = self
            .addresses
            .get(ip_id)
            .ok_or_else(|| IpamError::invalid(format!("address record {} not found", ip_id)))?;
        let mut range = self
            .ranges
            .get(vlan_id)
            .ok_or_else(|| IpamError::invalid(format!("range {} not found", vlan_id)))?;
        let physical = self
            .networks
            .physical_network(new_zone)
            .ok_or_else(|| IpamError::invalid(format!("no physical network in zone {}", new_zone)))?;

        let old_zone = range.zone_id;
        let old_physical = range.physical_network_id;
        range.zone_id = new_zone;
        range.physical_network_id = physical;
        self.ranges.update(&range)?;

        ip.zone_id = new_zone;
        if let Err(e) = self.addresses.update(&ip) {
            // revert the range so the pair stays consistent
            range.zone_id = old_zone;
            range.physical_network_id = old_physical;
            if let Err(revert) = self.ranges.update(&range) {
                tracing::warn!(range = %vlan_id, error = %revert, "failed to revert range zone rewrite");
            }
            return Err(e);
        }
        Ok(())
    }
}
