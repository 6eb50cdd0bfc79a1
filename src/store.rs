//! Store Traits and In-Memory Implementations
//!
//! The persistent address/range/quarantine stores and the network directory
//! are collaborator contracts; the in-memory implementations back tests and
//! single-process deployments. Pessimistic locking lives in the
//! [`crate::locks::LockManager`], not here: stores only do atomic reads and
//! writes of whole records.

use crate::error::{IpamError, IpamResult};
use crate::model::{
    AccountId, IpAddressId, IpState, NetworkId, NetworkInfo, PhysicalNetworkId, PublicIp,
    QuarantineRecord, RangeKind, VlanId, VlanRange, ZoneId,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// Search filter over address records
#[derive(Debug, Clone, Default)]
pub struct AddressFilter {
    pub zone_id: Option<ZoneId>,
    pub vlan_ids: Option<Vec<VlanId>>,
    pub state: Option<IpState>,
    pub account_id: Option<AccountId>,
    pub network_id: Option<NetworkId>,
    pub source_nat: Option<bool>,
    pub address: Option<Ipv4Addr>,
}

impl AddressFilter {
    fn matches(&self, ip: &PublicIp) -> bool {
        if self.zone_id.is_some_and(|z| z != ip.zone_id) {
            return false;
        }
        if let Some(ref vlans) = self.vlan_ids {
            if !vlans.contains(&ip.vlan_id) {
                return false;
            }
        }
        if self.state.is_some_and(|s| s != ip.state) {
            return false;
        }
        if let Some(account) = self.account_id {
            if ip.owner.map(|o| o.account_id) != Some(account) {
                return false;
            }
        }
        if let Some(network) = self.network_id {
            if ip.associated_network_id != Some(network) {
                return false;
            }
        }
        if self.source_nat.is_some_and(|s| s != ip.source_nat) {
            return false;
        }
        if self.address.is_some_and(|a| a != ip.address) {
            return false;
        }
        true
    }
}

/// Address record store
pub trait AddressStore: Send + Sync {
    fn get(&self, id: IpAddressId) -> Option<PublicIp>;
    /// Filtered search, ordered by literal address value
    fn find(&self, filter: &AddressFilter) -> Vec<PublicIp>;
    fn insert(&self, ip: PublicIp) -> IpamResult<()>;
    fn update(&self, ip: &PublicIp) -> IpamResult<()>;
    fn remove(&self, id: IpAddressId) -> IpamResult<()>;
}

/// VLAN range store
pub trait RangeStore: Send + Sync {
    fn get(&self, id: VlanId) -> Option<VlanRange>;
    fn find_in_zone(&self, zone_id: ZoneId, kind: RangeKind) -> Vec<VlanRange>;
    fn insert(&self, range: VlanRange) -> IpamResult<()>;
    fn update(&self, range: &VlanRange) -> IpamResult<()>;
    fn remove(&self, id: VlanId) -> IpamResult<()>;
}

/// Quarantine record store; one record per address at a time
pub trait QuarantineStore: Send + Sync {
    fn get(&self, ip_id: IpAddressId) -> Option<QuarantineRecord>;
    fn upsert(&self, record: QuarantineRecord) -> IpamResult<()>;
}

/// Guest network lookup, consumed from the network orchestration layer
pub trait NetworkDirectory: Send + Sync {
    fn network(&self, id: NetworkId) -> Option<NetworkInfo>;
    fn physical_network(&self, zone_id: ZoneId) -> Option<PhysicalNetworkId>;
}

/// In-memory address store
pub struct InMemoryAddressStore {
    rows: RwLock<HashMap<IpAddressId, PublicIp>>,
}

impl InMemoryAddressStore {
    pub fn new() -> Self {
        Self { rows: RwLock::new(HashMap::new()) }
    }
}

impl Default for InMemoryAddressStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressStore for InMemoryAddressStore {
    fn get(&self, id: IpAddressId) -> Option<PublicIp> {
        self.rows.read().get(&id).cloned()
    }

    fn find(&self, filter: &AddressFilter) -> Vec<PublicIp> {
        let mut hits: Vec<PublicIp> =
            self.rows.read().values().filter(|ip| filter.matches(ip)).cloned().collect();
        hits.sort_by_key(|ip| u32::from(ip.address));
        hits
    }

    fn insert(&self, ip: PublicIp) -> IpamResult<()> {
        let mut rows = self.rows.write();
        // literal address is unique within its zone
        if rows.values().any(|r| r.zone_id == ip.zone_id && r.address == ip.address) {
            return Err(IpamError::invalid(format!(
                "address {} already provisioned in zone {}",
                ip.address, ip.zone_id
            )));
        }
        rows.insert(ip.id, ip);
        Ok(())
    }

    fn update(&self, ip: &PublicIp) -> IpamResult<()> {
        let mut rows = self.rows.write();
        match rows.get_mut(&ip.id) {
            Some(row) => {
                *row = ip.clone();
                Ok(())
            }
            None => Err(IpamError::invalid(format!("address record {} not found", ip.id))),
        }
    }

    fn remove(&self, id: IpAddressId) -> IpamResult<()> {
        self.rows
            .write()
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| IpamError::invalid(format!("address record {} not found", id)))
    }
}

/// In-memory range store
pub struct InMemoryRangeStore {
    rows: RwLock<HashMap<VlanId, VlanRange>>,
}

impl InMemoryRangeStore {
    pub fn new() -> Self {
        Self { rows: RwLock::new(HashMap::new()) }
    }
}

impl Default for InMemoryRangeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RangeStore for InMemoryRangeStore {
    fn get(&self, id: VlanId) -> Option<VlanRange> {
        self.rows.read().get(&id).cloned()
    }

    fn find_in_zone(&self, zone_id: ZoneId, kind: RangeKind) -> Vec<VlanRange> {
        let mut hits: Vec<VlanRange> = self
            .rows
            .read()
            .values()
            .filter(|r| r.zone_id == zone_id && r.kind == kind)
            .cloned()
            .collect();
        hits.sort_by_key(|r| r.id);
        hits
    }

    fn insert(&self, range: VlanRange) -> IpamResult<()> {
        self.rows.write().insert(range.id, range);
        Ok(())
    }

    fn update(&self, range: &VlanRange) -> IpamResult<()> {
        let mut rows = self.rows.write();
        match rows.get_mut(&range.id) {
            Some(row) => {
                *row = range.clone();
                Ok(())
            }
            None => Err(IpamError::invalid(format!("range {} not found", range.id))),
        }
    }

    fn remove(&self, id: VlanId) -> IpamResult<()> {
        self.rows
            .write()
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| IpamError::invalid(format!("range {} not found", id)))
    }
}

/// In-memory quarantine store
pub struct InMemoryQuarantineStore {
    rows: RwLock<HashMap<IpAddressId, QuarantineRecord>>,
}

impl InMemoryQuarantineStore {
    pub fn new() -> Self {
        Self { rows: RwLock::new(HashMap::new()) }
    }
}

impl Default for InMemoryQuarantineStore {
    fn default() -> Self {
        Self::new()
    }
}

impl QuarantineStore for InMemoryQuarantineStore {
    fn get(&self, ip_id: IpAddressId) -> Option<QuarantineRecord> {
        self.rows.read().get(&ip_id).cloned()
    }

    fn upsert(&self, record: QuarantineRecord) -> IpamResult<()> {
        self.rows.write().insert(record.ip_id, record);
        Ok(())
    }
}

/// In-memory network directory
pub struct InMemoryNetworkDirectory {
    networks: RwLock<HashMap<NetworkId, NetworkInfo>>,
    physical: RwLock<HashMap<ZoneId, PhysicalNetworkId>>,
}

impl InMemoryNetworkDirectory {
    pub fn new() -> Self {
        Self {
            networks: RwLock::new(HashMap::new()),
            physical: RwLock::new(HashMap::new()),
        }
    }

    pub fn put_network(&self, network: NetworkInfo) {
        self.networks.write().insert(network.id, network);
    }

    pub fn put_physical_network(&self, zone_id: ZoneId, physical: PhysicalNetworkId) {
        self.physical.write().insert(zone_id, physical);
    }
}

impl Default for InMemoryNetworkDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkDirectory for InMemoryNetworkDirectory {
    fn network(&self, id: NetworkId) -> Option<NetworkInfo> {
        self.networks.read().get(&id).cloned()
    }

    fn physical_network(&self, zone_id: ZoneId) -> Option<PhysicalNetworkId> {
        self.physical.read().get(&zone_id).copied()
    }
}

/// Provision address rows for every host address of a range's CIDR,
/// skipping the gateway. Returns the created record ids in address order.
pub fn provision_range_addresses(
    addresses: &Arc<dyn AddressStore>,
    range: &VlanRange,
) -> IpamResult<Vec<IpAddressId>> {
    let mut ids = Vec::new();
    for host in range.cidr.hosts() {
        if host == range.gateway {
            continue;
        }
        let ip = PublicIp::new(range, host);
        ids.push(ip.id);
        addresses.insert(ip)?;
    }
    Ok(ids)
}
