//! Public IP Data Model

use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use uuid::Uuid;

/// Zone ID
pub type ZoneId = Uuid;
/// Pod ID
pub type PodId = Uuid;
/// Account ID
pub type AccountId = Uuid;
/// Domain ID
pub type DomainId = Uuid;
/// Guest network ID
pub type NetworkId = Uuid;
/// VPC ID
pub type VpcId = Uuid;
/// VLAN range ID
pub type VlanId = Uuid;
/// Public IP record ID
pub type IpAddressId = Uuid;
/// Physical network ID
pub type PhysicalNetworkId = Uuid;

/// Owning account of an allocated address
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct IpOwner {
    pub account_id: AccountId,
    pub domain_id: DomainId,
}

impl IpOwner {
    pub fn new(account_id: AccountId, domain_id: DomainId) -> Self {
        Self { account_id, domain_id }
    }
}

/// Lifecycle state of a public IP address
///
/// `Allocating` and `Releasing` are in-flight markers only ever mutated
/// under the row lock; callers outside an active operation observe
/// `Free`, `Reserved` or `Allocated`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum IpState {
    Free,
    Allocating,
    Allocated,
    Releasing,
    Reserved,
}

impl IpState {
    /// Valid transitions of the allocation cycle
    pub fn can_transition_to(self, next: IpState) -> bool {
        matches!(
            (self, next),
            (IpState::Free, IpState::Allocating)
                | (IpState::Free, IpState::Reserved)
                | (IpState::Allocating, IpState::Allocated)
                | (IpState::Reserved, IpState::Allocated)
                | (IpState::Allocated, IpState::Releasing)
                | (IpState::Allocating, IpState::Releasing)
                | (IpState::Reserved, IpState::Releasing)
                | (IpState::Releasing, IpState::Free)
        )
    }

    /// States from which a confirmation to `Allocated` is accepted
    pub fn allocatable(self) -> bool {
        matches!(self, IpState::Free | IpState::Allocating | IpState::Reserved)
    }
}

/// A single public IP address record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicIp {
    pub id: IpAddressId,
    pub zone_id: ZoneId,
    pub vlan_id: VlanId,
    pub address: Ipv4Addr,
    pub state: IpState,
    pub owner: Option<IpOwner>,
    pub associated_network_id: Option<NetworkId>,
    pub vpc_id: Option<VpcId>,
    pub source_nat: bool,
    pub is_system: bool,
    pub is_portable: bool,
    pub for_system_vms: bool,
    pub display: bool,
    pub allocated_at: Option<DateTime<Utc>>,
    /// A quota increment is held for the current allocation cycle
    pub counted: bool,
}

impl PublicIp {
    /// New free address backed by a range
    pub fn new(range: &VlanRange, address: Ipv4Addr) -> Self {
        Self {
            id: Uuid::new_v4(),
            zone_id: range.zone_id,
            vlan_id: range.id,
            address,
            state: IpState::Free,
            owner: None,
            associated_network_id: None,
            vpc_id: None,
            source_nat: false,
            is_system: false,
            is_portable: range.kind == RangeKind::Portable,
            for_system_vms: range.system_reserved,
            display: true,
            allocated_at: None,
            counted: false,
        }
    }

    /// Direct address: allocated but bound to no guest network
    pub fn is_direct(&self) -> bool {
        self.associated_network_id.is_none() && self.vpc_id.is_none()
    }
}

/// Range type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RangeKind {
    VirtualNetwork,
    DirectAttached,
    Portable,
}

/// Dedication of a range to a tenant
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RangeDedication {
    Account { account_id: AccountId, domain_id: DomainId },
    Domain { domain_id: DomainId },
}

impl RangeDedication {
    /// Whether `owner` may draw from a range carrying this dedication
    pub fn covers(&self, owner: &IpOwner) -> bool {
        match self {
            Self::Account { account_id, .. } => *account_id == owner.account_id,
            Self::Domain { domain_id } => *domain_id == owner.domain_id,
        }
    }
}

/// A provisioned VLAN range backing a set of public addresses
///
/// Created by administrative provisioning; the allocation engine reads it
/// and only rewrites zone/physical-network fields during a portable
/// cross-zone transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VlanRange {
    pub id: VlanId,
    pub zone_id: ZoneId,
    pub network_id: NetworkId,
    pub physical_network_id: PhysicalNetworkId,
    pub pod_id: Option<PodId>,
    pub kind: RangeKind,
    pub cidr: Ipv4Net,
    pub gateway: Ipv4Addr,
    pub dedication: Option<RangeDedication>,
    pub system_reserved: bool,
}

impl VlanRange {
    pub fn dedicated_to(&self, owner: &IpOwner) -> bool {
        self.dedication.map(|d| d.covers(owner)).unwrap_or(false)
    }

    pub fn is_dedicated(&self) -> bool {
        self.dedication.is_some()
    }
}

/// Quarantine hold on a released address
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuarantineRecord {
    pub ip_id: IpAddressId,
    pub previous_owner: IpOwner,
    pub started_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub removal: Option<QuarantineRemoval>,
}

/// Early end of a quarantine window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuarantineRemoval {
    pub at: DateTime<Utc>,
    pub reason: String,
    pub removed_by: Option<AccountId>,
}

/// Network services a public address can carry
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum NetworkService {
    SourceNat,
    StaticNat,
    PortForwarding,
    LoadBalancer,
    Firewall,
}

/// Implementation state of a guest network
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NetworkState {
    Allocated,
    Implementing,
    Implemented,
    Shutdown,
}

/// Guest network view consumed from the network orchestration layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub id: NetworkId,
    pub zone_id: ZoneId,
    pub state: NetworkState,
    pub vpc_id: Option<VpcId>,
    /// Offering allows multiple source-NAT addresses
    pub shared_source_nat: bool,
    /// Router address excluded from the candidate pool
    pub router_ip: Option<Ipv4Addr>,
    /// Service to provider-name mapping from the network offering
    pub providers: Vec<(NetworkService, String)>,
}

impl NetworkInfo {
    /// Provider names serving this network, deduplicated
    pub fn provider_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.iter().map(|(_, p)| p.clone()).collect();
        names.sort();
        names.dedup();
        names
    }

    /// Services handled by one provider
    pub fn services_of(&self, provider: &str) -> Vec<NetworkService> {
        self.providers
            .iter()
            .filter(|(_, p)| p == provider)
            .map(|(s, _)| *s)
            .collect()
    }
}

/// State of a firewall/NAT/LB rule on an address
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RuleState {
    Add,
    Active,
    Revoke,
    Removed,
}

/// Purpose of a rule
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RulePurpose {
    Firewall,
    PortForwarding,
    StaticNat,
    LoadBalancing,
}

/// Reference to a rule pending application on a provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirewallRuleRef {
    pub id: Uuid,
    pub ip_id: IpAddressId,
    pub network_id: NetworkId,
    pub purpose: RulePurpose,
    pub state: RuleState,
}

/// One-to-one static NAT mapping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticNat {
    pub ip_id: IpAddressId,
    pub network_id: NetworkId,
    pub destination: Ipv4Addr,
    pub revoke: bool,
}
