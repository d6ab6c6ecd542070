//! Network and subnet resolution for launches
//!
//! Builds the ordered attachment list for a create call. Backends differ in
//! how networking is discovered, so discovery sits behind the
//! [`NetworkingStrategy`] trait; [`DefaultNetworking`] implements it
//! directly over the backend and suits most deployments.

use crate::error::{ProvisionError, Result};
use armada_cloud::{ComputeBackend, Network, NetworkAttachment, Subnet};
use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Backend-specific network discovery, injectable per deployment.
#[async_trait]
pub trait NetworkingStrategy: Send + Sync {
    /// Networks every instance gets attached to before any resolution.
    async fn default_networks(&self) -> Result<Vec<NetworkAttachment>>;

    /// Resolves a network name or id to a single network id. An empty name
    /// means "the one usable internal network".
    async fn resolve_network(&self, name: &str) -> Result<String>;

    /// Detail for the subnets with the given ids. Empty ids means all.
    async fn subnets(&self, ids: &[String]) -> Result<Vec<Subnet>>;

    /// Detail for one network, used for the port-security probe.
    async fn network_detail(&self, id: &str) -> Result<Network>;
}

/// [`NetworkingStrategy`] implemented straight over the backend.
pub struct DefaultNetworking {
    backend: Arc<dyn ComputeBackend>,
}

impl DefaultNetworking {
    pub fn new(backend: Arc<dyn ComputeBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl NetworkingStrategy for DefaultNetworking {
    async fn default_networks(&self) -> Result<Vec<NetworkAttachment>> {
        Ok(Vec::new())
    }

    async fn resolve_network(&self, name: &str) -> Result<String> {
        let networks = self.backend.list_networks().await?;
        let matches: Vec<&Network> = networks
            .iter()
            .filter(|n| !n.external && (name.is_empty() || n.name == name || n.id == name))
            .collect();
        match matches.as_slice() {
            [single] => Ok(single.id.clone()),
            [] => Err(ProvisionError::NetworkNotFound(name.to_string())),
            many => Err(ProvisionError::NetworkAmbiguous {
                name: name.to_string(),
                matches: many.iter().map(|n| n.id.clone()).collect(),
            }),
        }
    }

    async fn subnets(&self, ids: &[String]) -> Result<Vec<Subnet>> {
        Ok(self.backend.list_subnets(ids).await?)
    }

    async fn network_detail(&self, id: &str) -> Result<Network> {
        Ok(self.backend.get_network(id).await?)
    }
}

/// Produces the attachment list for one launch.
///
/// Resolution failures are tolerated only when no network is configured and
/// the failure is absence rather than ambiguity; an ambiguous default means
/// the operator has to choose. When the request carries a subnet-to-zone
/// mapping, a qualifying subnet CIDR is bound to every attachment with a
/// resolved network id; several equally valid subnets are split by a
/// uniform random pick to spread allocation pressure.
pub async fn networks_for_instance<R: Rng + ?Sized>(
    strategy: &dyn NetworkingStrategy,
    configured_network: Option<&str>,
    zone: Option<&str>,
    subnets_to_zones: &HashMap<String, Vec<String>>,
    rng: &mut R,
) -> Result<Vec<NetworkAttachment>> {
    let mut networks = strategy.default_networks().await?;

    let configured = configured_network.unwrap_or("");
    match strategy.resolve_network(configured).await {
        Ok(network_id) => {
            debug!(network_id, "using network");
            networks.push(NetworkAttachment {
                network_id: Some(network_id),
                subnet_cidr: None,
            });
        }
        Err(err) => {
            if !configured.is_empty() {
                return Err(err);
            }
            match err {
                ProvisionError::NetworkAmbiguous { matches, .. } => {
                    return Err(ProvisionError::NoDefaultNetwork(matches));
                }
                // Some deployments have no usable internal network at all;
                // the instance is then attached by the backend's default.
                ProvisionError::NetworkNotFound(_) => {}
                other => return Err(other),
            }
        }
    }

    if subnets_to_zones.is_empty() {
        return Ok(networks);
    }

    let zone_key = zone.unwrap_or("");
    let mut candidate_ids: Vec<String> = subnets_to_zones
        .iter()
        .filter(|(_, zones)| zones.iter().any(|z| z == zone_key))
        .map(|(id, _)| id.clone())
        .collect();
    candidate_ids.sort();
    if candidate_ids.is_empty() {
        return Err(ProvisionError::NoSubnetsInZone(zone_key.to_string()));
    }

    let subnets = strategy.subnets(&candidate_ids).await?;
    if subnets.is_empty() {
        return Err(ProvisionError::NoSubnetsInZone(zone_key.to_string()));
    }
    // Uniform among the current candidates; nothing stronger is promised
    // about the distribution across repeated calls.
    let chosen = if subnets.len() == 1 {
        &subnets[0]
    } else {
        &subnets[rng.gen_range(0..subnets.len())]
    };
    debug!(subnet_id = %chosen.id, cidr = %chosen.cidr, "bound launch to subnet");

    for network in networks.iter_mut().filter(|n| n.network_id.is_some()) {
        network.subnet_cidr = Some(chosen.cidr.clone());
    }
    Ok(networks)
}

/// Whether rule groups can be attached on the given networks.
///
/// A network with port security explicitly disabled rejects instances that
/// carry security groups, so group creation is skipped for the launch.
pub async fn rule_groups_supported(
    strategy: &dyn NetworkingStrategy,
    attachments: &[NetworkAttachment],
) -> Result<bool> {
    for id in attachments.iter().filter_map(|a| a.network_id.as_deref()) {
        let network = strategy.network_detail(id).await?;
        if network.port_security_enabled == Some(false) {
            info!(
                network_id = id,
                "network has port_security_enabled set to false, not using security groups"
            );
            return Ok(false);
        }
    }
    Ok(true)
}
