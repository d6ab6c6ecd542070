//! Compute backend trait definition

use crate::error::Result;
use crate::types::{
    AvailabilityZone, CreateServerOpts, CreatedServer, Flavor, GroupRule, Network, PublicAddress,
    RuleGroup, RuleSpec, ServerDetail, ServerFilter, Subnet,
};
use async_trait::async_trait;
use std::collections::HashMap;

/// Compute backend abstraction trait
///
/// One implementation per cloud API. The provisioning core is written
/// entirely against this trait; wire protocols, authentication and request
/// shaping live behind it.
#[async_trait]
pub trait ComputeBackend: Send + Sync {
    /// Returns the backend name (e.g. "openstack", "stub")
    fn name(&self) -> &str;

    /// Create a server.
    ///
    /// Returns `Ok(None)` when the backend accepted the call but handed back
    /// no entity at all, which some clouds do while recovering from an
    /// outage. Callers must treat that as a lost response, not a success.
    async fn create_server(&self, opts: &CreateServerOpts) -> Result<Option<CreatedServer>>;

    /// Fetch the current detail of one server
    async fn get_server(&self, server_id: &str) -> Result<ServerDetail>;

    /// List servers passing the filter
    async fn list_servers(&self, filter: &ServerFilter) -> Result<Vec<ServerDetail>>;

    /// Delete a server
    async fn delete_server(&self, server_id: &str) -> Result<()>;

    /// Merge metadata tags onto a server
    async fn set_server_metadata(
        &self,
        server_id: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<()>;

    /// List the hardware offerings
    async fn list_flavors(&self) -> Result<Vec<Flavor>>;

    /// List availability zones.
    ///
    /// Backends without zone support return
    /// [`BackendError::NotImplemented`](crate::BackendError::NotImplemented).
    async fn list_availability_zones(&self) -> Result<Vec<AvailabilityZone>>;

    /// List all networks visible to the project
    async fn list_networks(&self) -> Result<Vec<Network>>;

    /// Fetch one network by id
    async fn get_network(&self, network_id: &str) -> Result<Network>;

    /// Fetch subnets by id; an empty slice means all subnets
    async fn list_subnets(&self, subnet_ids: &[String]) -> Result<Vec<Subnet>>;

    /// Allocate a public address from the project pool
    async fn allocate_public_address(&self) -> Result<PublicAddress>;

    /// Point a public address at a server
    async fn associate_public_address(&self, address: &str, server_id: &str) -> Result<()>;

    /// Return a public address to the pool
    async fn release_public_address(&self, address: &str) -> Result<()>;

    /// Create a rule group with an initial rule set
    async fn create_rule_group(
        &self,
        name: &str,
        description: &str,
        rules: &[RuleSpec],
    ) -> Result<RuleGroup>;

    /// Delete a rule group by name
    async fn delete_rule_group(&self, name: &str) -> Result<()>;

    /// List all rule groups owned by the project
    async fn list_rule_groups(&self) -> Result<Vec<RuleGroup>>;

    /// Rename a rule group, keeping its rules
    async fn update_rule_group(
        &self,
        group_id: &str,
        name: &str,
        description: &str,
    ) -> Result<RuleGroup>;

    /// Add one rule to an existing group
    async fn add_group_rule(&self, group_id: &str, rule: &RuleSpec) -> Result<GroupRule>;

    /// Remove one rule by id
    async fn remove_group_rule(&self, rule_id: &str) -> Result<()>;
}
