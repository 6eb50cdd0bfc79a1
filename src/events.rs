//! Usage Event Publication
//!
//! Fire-and-forget notifications on allocate/release/quarantine/transfer
//! transitions. Sink failures must never roll back the address transaction,
//! so `publish` is infallible from the caller's point of view.

use crate::model::{AccountId, IpAddressId, NetworkId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Usage events emitted by the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum UsageEvent {
    IpAssigned {
        ip_id: IpAddressId,
        address: Ipv4Addr,
        account_id: AccountId,
        network_id: Option<NetworkId>,
        source_nat: bool,
    },
    IpReleased {
        ip_id: IpAddressId,
        address: Ipv4Addr,
        account_id: Option<AccountId>,
    },
    IpQuarantined {
        ip_id: IpAddressId,
        address: Ipv4Addr,
        previous_account: AccountId,
        until: DateTime<Utc>,
    },
    IpQuarantineLifted {
        ip_id: IpAddressId,
        reason: String,
    },
    PortableIpTransferred {
        ip_id: IpAddressId,
        from_network: Option<NetworkId>,
        to_network: NetworkId,
        cross_zone: bool,
    },
}

/// Event sink collaborator
pub trait UsageEventSink: Send + Sync {
    fn publish(&self, event: UsageEvent);
}

/// Sink that emits events as structured log lines
pub struct TracingEventSink;

impl UsageEventSink for TracingEventSink {
    fn publish(&self, event: UsageEvent) {
        match serde_json::to_string(&event) {
            Ok(payload) => tracing::info!(target: "ipam::usage", %payload, "usage event"),
            Err(e) => tracing::warn!(error = %e, "failed to encode usage event"),
        }
    }
}

/// Sink that drops everything; for callers that do their own accounting
pub struct NullEventSink;

impl UsageEventSink for NullEventSink {
    fn publish(&self, _event: UsageEvent) {}
}
