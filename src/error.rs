//! Error types for the allocation engine

use crate::model::{AccountId, PodId, ZoneId};
use std::net::Ipv4Addr;
use thiserror::Error;

/// Exhausted scope of a capacity failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityScope {
    Pod(PodId),
    Zone(ZoneId),
    Region,
}

impl std::fmt::Display for CapacityScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pod(id) => write!(f, "pod {}", id),
            Self::Zone(id) => write!(f, "zone {}", id),
            Self::Region => write!(f, "region"),
        }
    }
}

/// Allocation engine error type
#[derive(Error, Debug)]
pub enum IpamError {
    /// No free address left in the requested scope
    #[error("insufficient public IP capacity in {scope}")]
    InsufficientCapacity { scope: CapacityScope },

    /// A required lock is held by another operation
    #[error("resource busy, operation already in progress on {resource}")]
    ConcurrentOperation { resource: String },

    /// Per-account public IP quota exhausted
    #[error("public IP limit {limit} reached for account {account}")]
    ResourceAllocationLimit { account: AccountId, limit: u64 },

    /// A network element provider failed to apply or revoke
    #[error("provider {provider} failed: {reason}")]
    ResourceUnavailable { provider: String, reason: String },

    /// Caller-supplied ids or ownership do not line up
    #[error("invalid parameter: {reason}")]
    InvalidParameter { reason: String },

    /// A specifically requested address exists but is not free
    #[error("requested address {address} is not available")]
    AddressUnavailable { address: Ipv4Addr },

    /// Reuse blocked by an active quarantine window of a previous owner
    #[error("address {address} is quarantined for previous owner {previous_account}")]
    AddressInQuarantine { address: Ipv4Addr, previous_account: AccountId },
}

impl IpamError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidParameter { reason: reason.into() }
    }
}

/// Result type for the allocation engine
pub type IpamResult<T> = Result<T, IpamError>;

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_capacity_scope_display() {
        let zone = Uuid::new_v4();
        let err = IpamError::InsufficientCapacity { scope: CapacityScope::Zone(zone) };
        assert!(err.to_string().contains(&zone.to_string()));

        let err = IpamError::InsufficientCapacity { scope: CapacityScope::Region };
        assert!(err.to_string().contains("region"));
    }

    #[test]
    fn test_quarantine_error_names_previous_owner() {
        let prev = Uuid::new_v4();
        let err = IpamError::AddressInQuarantine {
            address: "10.0.0.1".parse().unwrap(),
            previous_account: prev,
        };
        assert!(err.to_string().contains(&prev.to_string()));
    }
}
