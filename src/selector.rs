//! Pool Selector
//!
//! Builds the ordered candidate list of free addresses for one allocation
//! request: system-VM reserved pool first when asked for, otherwise
//! dedicated ranges before shared ranges, with the shared fallback gated by
//! the account's system-IP entitlement. The selector never mutates state.

use crate::config::{IpamConfig, ReservationMode};
use crate::error::{CapacityScope, IpamError, IpamResult};
use crate::model::{
    IpAddressId, IpOwner, IpState, NetworkId, PodId, PublicIp, RangeKind, VlanId, VlanRange, ZoneId,
};
use crate::quarantine::QuarantineManager;
use crate::store::{AddressFilter, AddressStore, NetworkDirectory, RangeStore};
use std::net::Ipv4Addr;
use std::sync::Arc;

/// One allocation request's selection parameters
#[derive(Debug, Clone)]
pub struct SelectionRequest {
    pub zone_id: ZoneId,
    pub pod_id: Option<PodId>,
    /// Restrict the search to these ranges
    pub range_ids: Option<Vec<VlanId>>,
    pub owner: IpOwner,
    pub range_kind: RangeKind,
    pub guest_network_id: Option<NetworkId>,
    pub requested_address: Option<Ipv4Addr>,
    pub requested_gateway: Option<Ipv4Addr>,
    pub for_system_vms: bool,
}

impl SelectionRequest {
    pub fn new(zone_id: ZoneId, owner: IpOwner) -> Self {
        Self {
            zone_id,
            pod_id: None,
            range_ids: None,
            owner,
            range_kind: RangeKind::VirtualNetwork,
            guest_network_id: None,
            requested_address: None,
            requested_gateway: None,
            for_system_vms: false,
        }
    }

    pub fn capacity_scope(&self) -> CapacityScope {
        match self.pod_id {
            Some(pod) => CapacityScope::Pod(pod),
            None => CapacityScope::Zone(self.zone_id),
        }
    }
}

/// Ordered candidates plus where they came from
#[derive(Debug, Clone)]
pub struct SelectionOutcome {
    pub candidates: Vec<IpAddressId>,
    pub from_dedicated_range: bool,
}

pub struct PoolSelector {
    addresses: Arc<dyn AddressStore>,
    ranges: Arc<dyn RangeStore>,
    networks: Arc<dyn NetworkDirectory>,
    quarantine: Arc<QuarantineManager>,
    config: Arc<IpamConfig>,
}

impl PoolSelector {
    pub fn new(
        addresses: Arc<dyn AddressStore>,
        ranges: Arc<dyn RangeStore>,
        networks: Arc<dyn NetworkDirectory>,
        quarantine: Arc<QuarantineManager>,
        config: Arc<IpamConfig>,
    ) -> Self {
        Self { addresses, ranges, networks, quarantine, config }
    }

    /// Produce the ordered free-candidate list for a request
    pub fn select(&self, req: &SelectionRequest) -> IpamResult<SelectionOutcome> {
        let mut ranges = self.ranges.find_in_zone(req.zone_id, req.range_kind);
        if let Some(pod) = req.pod_id {
            ranges.retain(|r| r.pod_id == Some(pod));
        }
        if let Some(ref ids) = req.range_ids {
            ranges.retain(|r| ids.contains(&r.id));
        }

        if let Some(requested) = req.requested_address {
            if !ranges.iter().any(|r| r.cidr.contains(&requested)) {
                return Err(IpamError::invalid(format!(
                    "requested address {} is not within any eligible range",
                    requested
                )));
            }
        }

        let router_ip = req
            .guest_network_id
            .and_then(|n| self.networks.network(n))
            .and_then(|n| n.router_ip);

        let (candidates, from_dedicated) = if req.for_system_vms {
            self.select_for_system_vms(req, &ranges, router_ip)?
        } else {
            self.select_for_tenant(req, &ranges, router_ip)?
        };

        if candidates.is_empty() {
            if let Some(requested) = req.requested_address {
                return Err(IpamError::AddressUnavailable { address: requested });
            }
            if let Some(gateway) = req.requested_gateway {
                return Err(IpamError::invalid(format!(
                    "no free address on a range with gateway {}",
                    gateway
                )));
            }
            return Err(IpamError::InsufficientCapacity { scope: req.capacity_scope() });
        }

        Ok(SelectionOutcome {
            candidates: candidates.into_iter().map(|ip| ip.id).collect(),
            from_dedicated_range: from_dedicated,
        })
    }

    fn select_for_system_vms(
        &self,
        req: &SelectionRequest,
        ranges: &[VlanRange],
        router_ip: Option<Ipv4Addr>,
    ) -> IpamResult<(Vec<PublicIp>, bool)> {
        let reserved: Vec<VlanRange> =
            ranges.iter().filter(|r| r.system_reserved).cloned().collect();
        let mut pool = self.free_addresses(req, &reserved, router_ip);
        if pool.is_empty() {
            if !reserved.is_empty()
                && self.config.system_vm_reservation == ReservationMode::Strict
            {
                return Err(IpamError::InsufficientCapacity { scope: req.capacity_scope() });
            }
            let general: Vec<VlanRange> =
                ranges.iter().filter(|r| !r.system_reserved && !r.is_dedicated()).cloned().collect();
            pool = self.free_addresses(req, &general, router_ip);
        }
        Ok((pool, false))
    }

    fn select_for_tenant(
        &self,
        req: &SelectionRequest,
        ranges: &[VlanRange],
        router_ip: Option<Ipv4Addr>,
    ) -> IpamResult<(Vec<PublicIp>, bool)> {
        let dedicated: Vec<VlanRange> =
            ranges.iter().filter(|r| r.dedicated_to(&req.owner)).cloned().collect();
        let pool = self.free_addresses(req, &dedicated, router_ip);
        if !pool.is_empty() {
            return Ok((pool, true));
        }

        if !self.config.can_use_system_ips(req.owner.account_id) {
            tracing::debug!(
                account = %req.owner.account_id,
                "dedicated ranges exhausted and account may not use system IPs"
            );
            return Err(IpamError::InsufficientCapacity { scope: req.capacity_scope() });
        }

        let shared: Vec<VlanRange> =
            ranges.iter().filter(|r| !r.is_dedicated() && !r.system_reserved).cloned().collect();
        Ok((self.free_addresses(req, &shared, router_ip), false))
    }

    /// Free addresses across `ranges`, ordered by address, with the network
    /// router address, quarantined addresses and non-matching requested
    /// address/gateway filtered out
    fn free_addresses(
        &self,
        req: &SelectionRequest,
        ranges: &[VlanRange],
        router_ip: Option<Ipv4Addr>,
    ) -> Vec<PublicIp> {
        if ranges.is_empty() {
            return Vec::new();
        }
        let filter = AddressFilter {
            zone_id: Some(req.zone_id),
            vlan_ids: Some(ranges.iter().map(|r| r.id).collect()),
            state: Some(IpState::Free),
            address: req.requested_address,
            ..Default::default()
        };
        self.addresses
            .find(&filter)
            .into_iter()
            .filter(|ip| Some(ip.address) != router_ip)
            .filter(|ip| {
                req.requested_gateway
                    .map(|gw| ranges.iter().any(|r| r.id == ip.vlan_id && r.gateway == gw))
                    .unwrap_or(true)
            })
            .filter(|ip| self.quarantine.is_allocatable(ip.id, &req.owner))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullEventSink;
    use crate::model::RangeDedication;
    use crate::store::{
        provision_range_addresses, InMemoryAddressStore, InMemoryNetworkDirectory,
        InMemoryQuarantineStore, InMemoryRangeStore,
    };
    use uuid::Uuid;

    struct Fixture {
        selector: PoolSelector,
        addresses: Arc<dyn AddressStore>,
        ranges: Arc<InMemoryRangeStore>,
        zone: ZoneId,
    }

    fn fixture(config: IpamConfig) -> Fixture {
        let addresses: Arc<dyn AddressStore> = Arc::new(InMemoryAddressStore::new());
        let ranges = Arc::new(InMemoryRangeStore::new());
        let networks = Arc::new(InMemoryNetworkDirectory::new());
        let config = Arc::new(config);
        let quarantine = QuarantineManager::new(
            Arc::new(InMemoryQuarantineStore::new()),
            ranges.clone(),
            Arc::new(NullEventSink),
            config.clone(),
        );
        let selector = PoolSelector::new(
            addresses.clone(),
            ranges.clone(),
            networks,
            Arc::new(quarantine),
            config,
        );
        Fixture { selector, addresses, ranges, zone: Uuid::new_v4() }
    }

    fn add_range(
        f: &Fixture,
        cidr: &str,
        gateway: &str,
        dedication: Option<RangeDedication>,
        system_reserved: bool,
    ) -> VlanRange {
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
            system_reserved,
        };
        f.ranges.insert(range.clone()).unwrap();
        provision_range_addresses(&f.addresses, &range).unwrap();
        range
    }

    fn owner() -> IpOwner {
        IpOwner::new(Uuid::new_v4(), Uuid::new_v4())
    }

    #[test]
    fn test_dedicated_before_shared() {
        let f = fixture(IpamConfig::default());
        let owner = owner();
        add_range(&f, "10.0.1.0/29", "10.0.1.1", None, false);
        let dedicated = add_range(
            &f,
            "10.0.2.0/29",
            "10.0.2.1",
            Some(RangeDedication::Account {
                account_id: owner.account_id,
                domain_id: owner.domain_id,
            }),
            false,
        );

        let outcome = f.selector.select(&SelectionRequest::new(f.zone, owner)).unwrap();
        assert!(outcome.from_dedicated_range);
        let first = f.addresses.get(outcome.candidates[0]).unwrap();
        assert_eq!(first.vlan_id, dedicated.id);
    }

    #[test]
    fn test_shared_fallback_when_dedicated_exhausted() {
        let f = fixture(IpamConfig::default());
        let owner = owner();
        // dedicated range exists but every address in it is taken
        let dedicated = add_range(
            &f,
            "10.0.2.0/30",
            "10.0.2.1",
            Some(RangeDedication::Domain { domain_id: owner.domain_id }),
            false,
        );
        for mut ip in f.addresses.find(&AddressFilter {
            vlan_ids: Some(vec![dedicated.id]),
            ..Default::default()
        }) {
            ip.state = IpState::Allocated;
            f.addresses.update(&ip).unwrap();
        }
        add_range(&f, "10.0.1.0/29", "10.0.1.1", None, false);

        let outcome = f.selector.select(&SelectionRequest::new(f.zone, owner)).unwrap();
        assert!(!outcome.from_dedicated_range);
        assert!(!outcome.candidates.is_empty());
    }

    #[test]
    fn test_entitlement_blocks_shared_fallback() {
        let owner = owner();
        let mut config = IpamConfig::default();
        config.system_ip_entitlements.insert(owner.account_id, false);
        let f = fixture(config);
        add_range(&f, "10.0.1.0/29", "10.0.1.1", None, false);

        let err = f.selector.select(&SelectionRequest::new(f.zone, owner)).unwrap_err();
        assert!(matches!(err, IpamError::InsufficientCapacity { .. }));
    }

    #[test]
    fn test_strict_system_vm_pool() {
        let mut config = IpamConfig::default();
        config.system_vm_reservation = ReservationMode::Strict;
        let f = fixture(config);
        let reserved = add_range(&f, "10.0.3.0/30", "10.0.3.1", None, true);
        add_range(&f, "10.0.1.0/29", "10.0.1.1", None, false);

        let mut req = SelectionRequest::new(f.zone, owner());
        req.for_system_vms = true;

        // reserved pool has capacity: candidates come from it
        let outcome = f.selector.select(&req).unwrap();
        let first = f.addresses.get(outcome.candidates[0]).unwrap();
        assert_eq!(first.vlan_id, reserved.id);

        // exhaust the reserved pool; strict mode refuses the general pool
        for mut ip in f.addresses.find(&AddressFilter {
            vlan_ids: Some(vec![reserved.id]),
            ..Default::default()
        }) {
            ip.state = IpState::Allocated;
            f.addresses.update(&ip).unwrap();
        }
        let err = f.selector.select(&req).unwrap_err();
        assert!(matches!(err, IpamError::InsufficientCapacity { .. }));
    }

    #[test]
    fn test_preferred_system_vm_pool_falls_through() {
        let f = fixture(IpamConfig::default());
        let reserved = add_range(&f, "10.0.3.0/30", "10.0.3.1", None, true);
        let general = add_range(&f, "10.0.1.0/29", "10.0.1.1", None, false);
        for mut ip in f.addresses.find(&AddressFilter {
            vlan_ids: Some(vec![reserved.id]),
            ..Default::default()
        }) {
            ip.state = IpState::Allocated;
            f.addresses.update(&ip).unwrap();
        }

        let mut req = SelectionRequest::new(f.zone, owner());
        req.for_system_vms = true;
        let outcome = f.selector.select(&req).unwrap();
        let first = f.addresses.get(outcome.candidates[0]).unwrap();
        assert_eq!(first.vlan_id, general.id);
    }

    #[test]
    fn test_requested_address_must_be_in_cidr() {
        let f = fixture(IpamConfig::default());
        add_range(&f, "10.0.1.0/29", "10.0.1.1", None, false);

        let mut req = SelectionRequest::new(f.zone, owner());
        req.requested_address = Some("192.168.9.9".parse().unwrap());
        let err = f.selector.select(&req).unwrap_err();
        assert!(matches!(err, IpamError::InvalidParameter { .. }));
    }

    #[test]
    fn test_requested_address_taken_is_unavailable() {
        let f = fixture(IpamConfig::default());
        add_range(&f, "10.0.1.0/29", "10.0.1.1", None, false);

        let taken: Ipv4Addr = "10.0.1.2".parse().unwrap();
        let mut ip = f
            .addresses
            .find(&AddressFilter { address: Some(taken), ..Default::default() })
            .remove(0);
        ip.state = IpState::Allocated;
        f.addresses.update(&ip).unwrap();

        let mut req = SelectionRequest::new(f.zone, owner());
        req.requested_address = Some(taken);
        let err = f.selector.select(&req).unwrap_err();
        assert!(matches!(err, IpamError::AddressUnavailable { address } if address == taken));
    }

    #[test]
    fn test_requested_gateway_mismatch_is_invalid() {
        let f = fixture(IpamConfig::default());
        add_range(&f, "10.0.1.0/29", "10.0.1.1", None, false);

        let mut req = SelectionRequest::new(f.zone, owner());
        req.requested_gateway = Some("10.0.9.1".parse().unwrap());
        let err = f.selector.select(&req).unwrap_err();
        assert!(matches!(err, IpamError::InvalidParameter { .. }));
    }

    #[test]
    fn test_pod_scoped_capacity_error() {
        let f = fixture(IpamConfig::default());
        let pod = Uuid::new_v4();
        let mut req = SelectionRequest::new(f.zone, owner());
        req.pod_id = Some(pod);

        let err = f.selector.select(&req).unwrap_err();
        match err {
            IpamError::InsufficientCapacity { scope } => {
                assert_eq!(scope, CapacityScope::Pod(pod));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
