//! Public IP Allocation Engine
//!
//! The address-pool side of an IaaS control plane: hands out scarce public
//! IP addresses from VLAN ranges to competing concurrent callers, tracks
//! each address through its allocation lifecycle, lazily binds it to
//! network-service providers, enforces per-account quotas, and optionally
//! quarantines released addresses before reuse by a different owner.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      ALLOCATION ENGINE                           │
//! │                                                                  │
//! │  request ──► PoolSelector ──► AllocationEngine ──► PublicIp      │
//! │               │ ordered         │ claim one row                  │
//! │               │ candidates      │ under row lock                 │
//! │               ▼                 ▼                                │
//! │        QuarantineManager   ResourceAccountant (quota)            │
//! │                                                                  │
//! │  rules ──► AssociationOrchestrator ──► IpDeployer providers      │
//! │              lazy bind / unbind          (per provider name)     │
//! │                                                                  │
//! │  region ──► PortableIpCoordinator (named global lock)            │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every mutation happens through the [`locks::LockManager`]'s row,
//! account, and named global locks; the stores are the single source of
//! truth and nothing caches address state across calls.

#![warn(missing_docs)]
#![allow(dead_code)]

pub mod allocator;
pub mod association;
pub mod config;
pub mod error;
pub mod events;
pub mod limits;
pub mod locks;
pub mod model;
pub mod portable;
pub mod quarantine;
pub mod selector;
pub mod store;

pub use allocator::{AllocationEngine, AllocationSpec, ReleaseOutcome};
pub use association::{AssociationOrchestrator, IpDeployer, ProviderRegistry, RuleQuery};
pub use config::{IpamConfig, ReservationMode};
pub use error::{CapacityScope, IpamError, IpamResult};
pub use events::{TracingEventSink, UsageEvent, UsageEventSink};
pub use limits::{InMemoryAccountant, ResourceAccountant};
pub use locks::{LockKey, LockManager};
pub use model::{IpOwner, IpState, PublicIp, QuarantineRecord, RangeKind, VlanRange};
pub use portable::PortableIpCoordinator;
pub use quarantine::QuarantineManager;
pub use selector::{PoolSelector, SelectionOutcome, SelectionRequest};

use crate::limits::ResourceAccountant as Accountant;
use crate::store::{AddressStore, NetworkDirectory, QuarantineStore, RangeStore};
use std::sync::Arc;

/// Fully wired engine: the selector, transactor, orchestrator, quarantine
/// manager and portable coordinator over one set of collaborators.
///
/// All collaborators are injected at construction; there is no ambient
/// global state.
pub struct IpamEngine {
    /// Candidate selection
    pub selector: Arc<PoolSelector>,
    /// Claim/confirm/release transactor
    pub allocator: Arc<AllocationEngine>,
    /// Lazy provider binding
    pub association: Arc<AssociationOrchestrator>,
    /// Release-side reuse gate
    pub quarantine: Arc<QuarantineManager>,
    /// Region-scoped portable pool
    pub portable: Arc<PortableIpCoordinator>,
    /// Keyed lock table shared by every component
    pub locks: Arc<LockManager>,
}

/// Collaborator set handed to [`IpamEngine::new`]
pub struct Collaborators {
    /// Address record store
    pub addresses: Arc<dyn AddressStore>,
    /// VLAN range store
    pub ranges: Arc<dyn RangeStore>,
    /// Quarantine record store
    pub quarantine: Arc<dyn QuarantineStore>,
    /// Guest network lookup
    pub networks: Arc<dyn NetworkDirectory>,
    /// Public IP quota accounting
    pub accountant: Arc<dyn Accountant>,
    /// Provider plugins keyed by name
    pub registry: Arc<ProviderRegistry>,
    /// Firewall/NAT/LB rule counts
    pub rules: Arc<dyn RuleQuery>,
    /// Usage event sink
    pub events: Arc<dyn UsageEventSink>,
}

impl IpamEngine {
    /// Wire the engine from its collaborators and configuration
    pub fn new(collab: Collaborators, config: IpamConfig) -> Self {
        let config = Arc::new(config);
        let locks = Arc::new(LockManager::new());
        let quarantine = Arc::new(QuarantineManager::new(
            collab.quarantine,
            collab.ranges.clone(),
            collab.events.clone(),
            config.clone(),
        ));
        let selector = Arc::new(PoolSelector::new(
            collab.addresses.clone(),
            collab.ranges.clone(),
            collab.networks.clone(),
            quarantine.clone(),
            config.clone(),
        ));
        let allocator = Arc::new(AllocationEngine::new(
            collab.addresses.clone(),
            collab.ranges.clone(),
            collab.networks.clone(),
            collab.accountant,
            quarantine.clone(),
            selector.clone(),
            locks.clone(),
            collab.events.clone(),
            config,
        ));
        let association = Arc::new(AssociationOrchestrator::new(
            collab.addresses.clone(),
            collab.networks.clone(),
            allocator.clone(),
            collab.registry,
            collab.rules.clone(),
        ));
        let portable = Arc::new(PortableIpCoordinator::new(
            collab.addresses,
            collab.ranges,
            collab.networks,
            allocator.clone(),
            association.clone(),
            collab.rules,
            locks.clone(),
            collab.events,
        ));
        Self { selector, allocator, association, quarantine, portable, locks }
    }
}
