//! Association Orchestrator
//!
//! Binding a public address to a network-service provider is expensive, so
//! association is lazy: it happens when a rule first needs the address, and
//! unbinding happens only once every rule on the address has been removed.
//! Provider calls go through the [`IpDeployer`] registry; failures either
//! abort the batch or downgrade it to partial success per `continue_on_error`.

use crate::allocator::AllocationEngine;
use crate::error::{IpamError, IpamResult};
use crate::model::{
    FirewallRuleRef, IpAddressId, IpState, NetworkId, NetworkInfo, NetworkService, NetworkState,
    PublicIp, RulePurpose, RuleState, StaticNat,
};
use crate::store::{AddressStore, NetworkDirectory};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Network element plugin able to program public addresses and rules
pub trait IpDeployer: Send + Sync {
    fn name(&self) -> &str;
    fn apply_ips(
        &self,
        network: &NetworkInfo,
        ips: &[PublicIp],
        services: &[NetworkService],
    ) -> IpamResult<()>;
    fn apply_static_nats(&self, network: &NetworkInfo, nats: &[StaticNat]) -> IpamResult<()>;
    fn apply_rules(&self, network: &NetworkInfo, rules: &[FirewallRuleRef]) -> IpamResult<()>;
}

/// Provider name to implementation map, resolved once at startup
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn IpDeployer>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self { providers: HashMap::new() }
    }

    pub fn register(&mut self, deployer: Arc<dyn IpDeployer>) {
        self.providers.insert(deployer.name().to_string(), deployer);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn IpDeployer>> {
        self.providers.get(name).cloned()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Rule-count queries against the firewall/NAT/LB rule managers
pub trait RuleQuery: Send + Sync {
    /// Rules currently live on the address (not yet fully removed)
    fn active_rule_count(&self, ip_id: IpAddressId) -> usize;
    /// Rules already applied on a provider (in `Active` state)
    fn applied_rule_count(&self, ip_id: IpAddressId) -> usize;
    fn all_rules_removed(&self, ip_id: IpAddressId) -> bool;
    fn has_rules_in_network(&self, ip_id: IpAddressId, network_id: NetworkId) -> bool;
}

/// In-memory rule table
pub struct InMemoryRuleTable {
    rules: RwLock<Vec<FirewallRuleRef>>,
}

impl InMemoryRuleTable {
    pub fn new() -> Self {
        Self { rules: RwLock::new(Vec::new()) }
    }

    pub fn add(&self, rule: FirewallRuleRef) {
        self.rules.write().push(rule);
    }

    pub fn set_state(&self, rule_id: uuid::Uuid, state: RuleState) {
        let mut rules = self.rules.write();
        if let Some(rule) = rules.iter_mut().find(|r| r.id == rule_id) {
            rule.state = state;
        }
    }
}

impl Default for InMemoryRuleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleQuery for InMemoryRuleTable {
    fn active_rule_count(&self, ip_id: IpAddressId) -> usize {
        self.rules
            .read()
            .iter()
            .filter(|r| r.ip_id == ip_id && r.state != RuleState::Removed)
            .count()
    }

    fn applied_rule_count(&self, ip_id: IpAddressId) -> usize {
        self.rules
            .read()
            .iter()
            .filter(|r| r.ip_id == ip_id && r.state == RuleState::Active)
            .count()
    }

    fn all_rules_removed(&self, ip_id: IpAddressId) -> bool {
        self.active_rule_count(ip_id) == 0
    }

    fn has_rules_in_network(&self, ip_id: IpAddressId, network_id: NetworkId) -> bool {
        self.rules
            .read()
            .iter()
            .any(|r| r.ip_id == ip_id && r.network_id == network_id && r.state != RuleState::Removed)
    }
}

fn service_for(purpose: RulePurpose) -> NetworkService {
    match purpose {
        RulePurpose::Firewall => NetworkService::Firewall,
        RulePurpose::PortForwarding => NetworkService::PortForwarding,
        RulePurpose::StaticNat => NetworkService::StaticNat,
        RulePurpose::LoadBalancing => NetworkService::LoadBalancer,
    }
}

pub struct AssociationOrchestrator {
    addresses: Arc<dyn AddressStore>,
    networks: Arc<dyn NetworkDirectory>,
    allocator: Arc<AllocationEngine>,
    registry: Arc<ProviderRegistry>,
    rules: Arc<dyn RuleQuery>,
}

impl AssociationOrchestrator {
    pub fn new(
        addresses: Arc<dyn AddressStore>,
        networks: Arc<dyn NetworkDirectory>,
        allocator: Arc<AllocationEngine>,
        registry: Arc<ProviderRegistry>,
        rules: Arc<dyn RuleQuery>,
    ) -> Self {
        Self { addresses, networks, allocator, registry, rules }
    }

    /// Push pending bindings and unbindings for `ip_ids` to the network's
    /// providers.
    ///
    /// Addresses in `Allocating`/`Reserved` are confirmed and bound;
    /// addresses in `Releasing` are unbound and finalized, but only once
    /// every rule on them has been removed. With `post_apply_rules` the
    /// call runs ahead of a rule application and skips release
    /// finalization. Returns `Ok(true)` only if every provider succeeded.
    pub fn apply_ip_associations(
        &self,
        network_id: NetworkId,
        post_apply_rules: bool,
        continue_on_error: bool,
        ip_ids: &[IpAddressId],
    ) -> IpamResult<bool> {
        let network = self.lookup_network(network_id)?;

        let mut to_add = Vec::new();
        let mut to_revoke = Vec::new();
        for &id in ip_ids {
            let ip = self
                .addresses
                .get(id)
                .ok_or_else(|| IpamError::invalid(format!("address record {} not found", id)))?;
            match ip.state {
                IpState::Allocating | IpState::Reserved => to_add.push(ip),
                IpState::Releasing => {
                    if self.rules.all_rules_removed(ip.id) {
                        to_revoke.push(ip);
                    } else {
                        tracing::debug!(ip = %ip.address, "rules still present, leaving address bound");
                    }
                }
                _ => {}
            }
        }

        // confirm and associate new claims before any provider sees them
        let mut newly_bound = Vec::new();
        for ip in &to_add {
            self.allocator.mark_allocated(ip.id)?;
            self.associate(ip.id, network_id)?;
            newly_bound.push(ip.id);
        }

        let mut batch: Vec<PublicIp> = Vec::new();
        for ip in newly_bound.iter().chain(to_revoke.iter().map(|ip| &ip.id)) {
            if let Some(ip) = self.addresses.get(*ip) {
                batch.push(ip);
            }
        }

        let mut success = true;
        for provider_name in network.provider_names() {
            let Some(deployer) = self.registry.get(&provider_name) else {
                return Err(IpamError::invalid(format!(
                    "no provider registered under name {}",
                    provider_name
                )));
            };
            let services = network.services_of(&provider_name);
            if let Err(e) = deployer.apply_ips(&network, &batch, &services) {
                tracing::warn!(provider = %provider_name, error = %e, "provider failed to apply IPs");
                if continue_on_error {
                    success = false;
                    continue;
                }
                self.rollback_new_claims(&newly_bound);
                return Err(IpamError::ResourceUnavailable {
                    provider: provider_name,
                    reason: e.to_string(),
                });
            }
        }

        if !post_apply_rules {
            for ip in &to_revoke {
                self.allocator.finalize_release(ip.id)?;
            }
        }

        Ok(success)
    }

    /// Bind an allocated address to a guest network
    pub fn associate(&self, ip_id: IpAddressId, network_id: NetworkId) -> IpamResult<PublicIp> {
        let network = self.lookup_network(network_id)?;
        let mut ip = self
            .addresses
            .get(ip_id)
            .ok_or_else(|| IpamError::invalid(format!("address record {} not found", ip_id)))?;
        if ip.owner.is_none() {
            return Err(IpamError::invalid(format!("address {} is not allocated", ip.address)));
        }
        if let Some(existing) = ip.associated_network_id {
            if existing != network_id {
                return Err(IpamError::invalid(format!(
                    "address {} is already associated with network {}",
                    ip.address, existing
                )));
            }
            return Ok(ip);
        }
        if ip.zone_id != network.zone_id {
            return Err(IpamError::invalid(format!(
                "address {} and network {} are in different zones",
                ip.address, network_id
            )));
        }
        ip.associated_network_id = Some(network_id);
        ip.vpc_id = network.vpc_id;
        self.addresses.update(&ip)?;
        Ok(ip)
    }

    /// Unbind and release an address once its rules are gone.
    ///
    /// Returns `Ok(false)` without mutating anything while rules survive.
    pub fn disassociate(&self, ip_id: IpAddressId) -> IpamResult<bool> {
        let ip = self
            .addresses
            .get(ip_id)
            .ok_or_else(|| IpamError::invalid(format!("address record {} not found", ip_id)))?;
        if !self.rules.all_rules_removed(ip_id) {
            tracing::debug!(ip = %ip.address, "disassociate deferred, rules still present");
            return Ok(false);
        }
        let Some(network_id) = ip.associated_network_id else {
            // never bound to a provider; plain release
            self.allocator.release(ip_id)?;
            return Ok(true);
        };
        self.allocator.begin_release(ip_id)?;
        if let Err(e) = self.apply_ip_associations(network_id, false, false, &[ip_id]) {
            // do not leave the row parked in a transient state
            if let Err(revert) = self.allocator.cancel_release(ip_id) {
                tracing::warn!(ip_id = %ip_id, error = %revert, "failed to revert release state");
            }
            return Err(e);
        }
        Ok(true)
    }

    /// Whether a rule operation on this address needs a provider
    /// association round-trip first
    pub fn association_required(
        &self,
        network: &NetworkInfo,
        ip_id: IpAddressId,
        adding: bool,
    ) -> bool {
        if network.state == NetworkState::Implementing {
            return true;
        }
        let applied = self.rules.applied_rule_count(ip_id);
        if adding {
            // first active rule going onto the address
            applied == 0
        } else {
            // last active rule coming off
            applied <= 1
        }
    }

    /// Apply firewall/PF/LB rules through the owning providers, associating
    /// addresses first only where required
    pub fn apply_rules(
        &self,
        network_id: NetworkId,
        rules: &[FirewallRuleRef],
        continue_on_error: bool,
    ) -> IpamResult<bool> {
        let network = self.lookup_network(network_id)?;

        let mut needs_association: Vec<IpAddressId> = Vec::new();
        for rule in rules {
            let adding = rule.state != RuleState::Revoke;
            if self.association_required(&network, rule.ip_id, adding)
                && !needs_association.contains(&rule.ip_id)
            {
                needs_association.push(rule.ip_id);
            }
        }
        let mut success = if needs_association.is_empty() {
            true
        } else {
            self.apply_ip_associations(network_id, true, continue_on_error, &needs_association)?
        };

        let mut by_provider: HashMap<String, Vec<FirewallRuleRef>> = HashMap::new();
        for rule in rules {
            let service = service_for(rule.purpose);
            let provider = network
                .providers
                .iter()
                .find(|(s, _)| *s == service)
                .map(|(_, p)| p.clone())
                .ok_or_else(|| IpamError::invalid(format!(
                    "network {} offers no provider for {:?}",
                    network_id, service
                )))?;
            by_provider.entry(provider).or_default().push(rule.clone());
        }

        for (provider_name, group) in by_provider {
            let Some(deployer) = self.registry.get(&provider_name) else {
                return Err(IpamError::invalid(format!(
                    "no provider registered under name {}",
                    provider_name
                )));
            };
            if let Err(e) = deployer.apply_rules(&network, &group) {
                tracing::warn!(provider = %provider_name, error = %e, "provider failed to apply rules");
                if continue_on_error {
                    success = false;
                    continue;
                }
                return Err(IpamError::ResourceUnavailable {
                    provider: provider_name,
                    reason: e.to_string(),
                });
            }
        }
        Ok(success)
    }

    /// Apply static NAT mappings through the static-NAT provider
    pub fn apply_static_nats(
        &self,
        network_id: NetworkId,
        nats: &[StaticNat],
        continue_on_error: bool,
    ) -> IpamResult<bool> {
        let network = self.lookup_network(network_id)?;

        let mut needs_association: Vec<IpAddressId> = Vec::new();
        for nat in nats {
            if self.association_required(&network, nat.ip_id, !nat.revoke)
                && !needs_association.contains(&nat.ip_id)
            {
                needs_association.push(nat.ip_id);
            }
        }
        let mut success = if needs_association.is_empty() {
            true
        } else {
            self.apply_ip_associations(network_id, true, continue_on_error, &needs_association)?
        };

        let provider = network
            .providers
            .iter()
            .find(|(s, _)| *s == NetworkService::StaticNat)
            .map(|(_, p)| p.clone())
            .ok_or_else(|| {
                IpamError::invalid(format!("network {} offers no static NAT provider", network_id))
            })?;
        let Some(deployer) = self.registry.get(&provider) else {
            return Err(IpamError::invalid(format!(
                "no provider registered under name {}",
                provider
            )));
        };
        if let Err(e) = deployer.apply_static_nats(&network, nats) {
            tracing::warn!(provider = %provider, error = %e, "provider failed to apply static NATs");
            if continue_on_error {
                success = false;
            } else {
                return Err(IpamError::ResourceUnavailable {
                    provider,
                    reason: e.to_string(),
                });
            }
        }
        Ok(success)
    }

    /// Associate and push the binding to the network's providers; the
    /// portable transfer path uses this for the destination side
    pub fn bind(&self, ip_id: IpAddressId, network_id: NetworkId) -> IpamResult<PublicIp> {
        let ip = self.associate(ip_id, network_id)?;
        let network = self.lookup_network(network_id)?;
        self.dispatch_single(&network, &ip)?;
        Ok(ip)
    }

    /// Remove the provider binding and network association while keeping
    /// ownership; the portable transfer path uses this for the source side
    pub fn unbind(&self, ip_id: IpAddressId) -> IpamResult<PublicIp> {
        let mut ip = self
            .addresses
            .get(ip_id)
            .ok_or_else(|| IpamError::invalid(format!("address record {} not found", ip_id)))?;
        let Some(network_id) = ip.associated_network_id else {
            return Ok(ip);
        };
        let network = self.lookup_network(network_id)?;
        if network.vpc_id.is_some() {
            tracing::debug!(ip = %ip.address, vpc = ?network.vpc_id, "unbinding from VPC tier");
        }
        self.dispatch_single(&network, &ip)?;
        ip.associated_network_id = None;
        ip.vpc_id = None;
        self.addresses.update(&ip)?;
        Ok(ip)
    }

    fn dispatch_single(&self, network: &NetworkInfo, ip: &PublicIp) -> IpamResult<()> {
        let batch = std::slice::from_ref(ip);
        for provider_name in network.provider_names() {
            let Some(deployer) = self.registry.get(&provider_name) else {
                return Err(IpamError::invalid(format!(
                    "no provider registered under name {}",
                    provider_name
                )));
            };
            let services = network.services_of(&provider_name);
            deployer
                .apply_ips(network, batch, &services)
                .map_err(|e| IpamError::ResourceUnavailable {
                    provider: provider_name,
                    reason: e.to_string(),
                })?;
        }
        Ok(())
    }

    fn lookup_network(&self, network_id: NetworkId) -> IpamResult<NetworkInfo> {
        self.networks
            .network(network_id)
            .ok_or_else(|| IpamError::invalid(format!("network {} not found", network_id)))
    }

    fn rollback_new_claims(&self, ip_ids: &[IpAddressId]) {
        for &id in ip_ids {
            if let Err(e) = self.allocator.rollback_claim(id) {
                tracing::warn!(ip_id = %id, error = %e, "rollback of claimed address failed");
            }
        }
    }
}
