//! In-memory compute backend for tests
//!
//! [`StubBackend`] models just enough backend behavior to exercise the
//! provisioning flows: servers with scripted status transitions, a
//! floating address pool with the allocate/associate race real clouds
//! have, rule groups, and per-operation failure injection. All state
//! sits behind one mutex; call counts are tracked for every operation so
//! tests can assert how often the backend was hit.

use armada_cloud::{
    AvailabilityZone, BackendError, ComputeBackend, CreateServerOpts, CreatedServer, Flavor,
    GroupRule, IpAddress, Network, RuleGroup, RuleSpec, ServerDetail, ServerFault, ServerFilter,
    ServerStatus, Subnet,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// How many times each backend operation has run, failures included.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallCounts {
    pub create_server: u32,
    pub get_server: u32,
    pub list_servers: u32,
    pub delete_server: u32,
    pub set_metadata: u32,
    pub list_flavors: u32,
    pub list_zones: u32,
    pub list_networks: u32,
    pub get_network: u32,
    pub list_subnets: u32,
    pub allocate_address: u32,
    pub associate_address: u32,
    pub release_address: u32,
    pub create_rule_group: u32,
    pub delete_rule_group: u32,
    pub list_rule_groups: u32,
    pub update_rule_group: u32,
    pub add_group_rule: u32,
    pub remove_group_rule: u32,
}

#[derive(Default)]
struct StubState {
    servers: Vec<ServerDetail>,
    // Status sequence get_server walks through, per server id. The last
    // entry sticks once the script runs out.
    scripts: HashMap<String, VecDeque<ServerStatus>>,
    faults: HashMap<String, String>,
    pending_script: Option<(VecDeque<ServerStatus>, Option<String>)>,
    create_without_entity: bool,
    // Remaining observation calls for which a server stays invisible.
    hidden: HashMap<String, u32>,
    flavors: Vec<Flavor>,
    zones: Vec<AvailabilityZone>,
    zones_not_implemented: bool,
    networks: Vec<Network>,
    subnets: Vec<Subnet>,
    // Every address ever created. Released addresses stay minted and get
    // handed out again.
    minted: Vec<String>,
    allocated: Vec<String>,
    associations: HashMap<String, String>,
    groups: Vec<RuleGroup>,
    failures: HashMap<String, VecDeque<Option<BackendError>>>,
    associate_failures: u32,
    last_create_opts: Option<CreateServerOpts>,
    counts: CallCounts,
    next_server: u32,
    next_group: u32,
    next_rule: u32,
    next_address: u32,
}

impl StubState {
    fn take_failure(&mut self, op: &str) -> Option<BackendError> {
        self.failures
            .get_mut(op)
            .and_then(VecDeque::pop_front)
            .flatten()
    }

    fn server_index(&self, id: &str) -> Option<usize> {
        self.servers.iter().position(|s| s.id == id)
    }

    fn group_by_name(&mut self, name: &str) -> Option<&mut RuleGroup> {
        self.groups.iter_mut().find(|g| g.name == name)
    }

    fn mint(&mut self) -> String {
        let address = format!("203.0.113.{}", self.next_address);
        self.next_address += 1;
        self.minted.push(address.clone());
        address
    }

    /// Advances a scripted server by one observation and returns its
    /// current detail.
    fn observe_server(&mut self, index: usize) -> ServerDetail {
        let id = self.servers[index].id.clone();
        if let Some(script) = self.scripts.get_mut(&id) {
            if let Some(next) = script.pop_front() {
                self.servers[index].status = next;
            }
        }
        if self.servers[index].status == ServerStatus::Error {
            let message = self
                .faults
                .get(&id)
                .cloned()
                .unwrap_or_else(|| "unexpected fault".to_string());
            self.servers[index].fault = Some(ServerFault {
                code: None,
                message,
            });
        }
        self.servers[index].clone()
    }
}

/// In-memory [`ComputeBackend`] with scripted failures.
pub struct StubBackend {
    state: Mutex<StubState>,
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl StubBackend {
    /// A backend with a small fixed catalog: three flavors, zones `az1`
    /// and `az2` (plus the unavailable `az3`), one internal network with
    /// one subnet.
    pub fn new() -> Self {
        let state = StubState {
            flavors: vec![
                Flavor {
                    id: "1".into(),
                    name: "m1.small".into(),
                    vcpus: 1,
                    ram_mib: 2048,
                    root_disk_gib: 20,
                },
                Flavor {
                    id: "2".into(),
                    name: "m1.medium".into(),
                    vcpus: 2,
                    ram_mib: 4096,
                    root_disk_gib: 40,
                },
                Flavor {
                    id: "3".into(),
                    name: "m1.large".into(),
                    vcpus: 4,
                    ram_mib: 8192,
                    root_disk_gib: 80,
                },
            ],
            zones: vec![
                AvailabilityZone::new("az1", true),
                AvailabilityZone::new("az2", true),
                AvailabilityZone::new("az3", false),
            ],
            networks: vec![Network {
                id: "net-1".into(),
                name: "internal".into(),
                external: false,
                port_security_enabled: None,
            }],
            subnets: vec![Subnet {
                id: "subnet-1".into(),
                network_id: "net-1".into(),
                cidr: "10.0.0.0/24".into(),
            }],
            next_server: 1,
            next_group: 1,
            next_rule: 1,
            next_address: 1,
            ..StubState::default()
        };
        Self {
            state: Mutex::new(state),
        }
    }

    fn state(&self) -> MutexGuard<'_, StubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Call counts so far.
    pub fn counts(&self) -> CallCounts {
        self.state().counts
    }

    /// Queues an error for the next call of the named operation. Errors
    /// queue up in order, one per call.
    pub fn fail_next(&self, op: &str, error: BackendError) {
        self.state()
            .failures
            .entry(op.to_string())
            .or_default()
            .push_back(Some(error));
    }

    /// Lets the next call of the named operation through untouched,
    /// deferring queued errors to the calls after it.
    pub fn pass_next(&self, op: &str) {
        self.state()
            .failures
            .entry(op.to_string())
            .or_default()
            .push_back(None);
    }

    /// Creates a running server directly, bypassing the create flow.
    pub fn seed_server(&self, name: &str, metadata: HashMap<String, String>) -> String {
        let mut state = self.state();
        let id = format!("srv-{}", state.next_server);
        let fixed = format!("10.0.0.{}", state.next_server);
        state.next_server += 1;
        state.servers.push(ServerDetail {
            id: id.clone(),
            name: name.to_string(),
            status: ServerStatus::Active,
            fault: None,
            availability_zone: Some("az1".into()),
            flavor_id: "1".into(),
            addresses: BTreeMap::from([("internal".to_string(), vec![IpAddress::fixed(fixed, 4)])]),
            metadata,
            created: Utc::now(),
        });
        id
    }

    /// Current detail of one server, scripted transitions not advanced.
    pub fn server(&self, id: &str) -> Option<ServerDetail> {
        let state = self.state();
        state
            .server_index(id)
            .map(|index| state.servers[index].clone())
    }

    pub fn set_server_status(&self, id: &str, status: ServerStatus) {
        let mut state = self.state();
        if let Some(index) = state.server_index(id) {
            state.servers[index].status = status;
        }
    }

    /// Makes a server invisible to the next `calls` get or list
    /// observations, imitating listing lag after a create.
    pub fn hide_server(&self, id: &str, calls: u32) {
        self.state().hidden.insert(id.to_string(), calls);
    }

    /// Scripts the status sequence the next created server walks through,
    /// one entry per get call, with an optional fault message for the
    /// error state. The server is created in build state.
    pub fn script_next_server(&self, statuses: Vec<ServerStatus>, fault: Option<&str>) {
        self.state().pending_script = Some((statuses.into(), fault.map(str::to_string)));
    }

    /// Makes the next create call return success without an entity.
    pub fn script_create_no_entity(&self) {
        self.state().create_without_entity = true;
    }

    /// Fails the next `count` associate calls with a transient error.
    pub fn set_associate_failures(&self, count: u32) {
        self.state().associate_failures = count;
    }

    /// Mints an address into the pool and marks it held.
    pub fn mint_address(&self) -> String {
        let mut state = self.state();
        let address = state.mint();
        state.allocated.push(address.clone());
        address
    }

    /// Addresses currently held by the project.
    pub fn held_addresses(&self) -> Vec<String> {
        self.state().allocated.clone()
    }

    /// Address-to-server bindings currently in effect.
    pub fn associated_addresses(&self) -> HashMap<String, String> {
        self.state().associations.clone()
    }

    pub fn add_network(&self, network: Network) {
        self.state().networks.push(network);
    }

    pub fn clear_networks(&self) {
        self.state().networks.clear();
    }

    pub fn add_subnet(&self, subnet: Subnet) {
        self.state().subnets.push(subnet);
    }

    pub fn set_zones_not_implemented(&self, value: bool) {
        self.state().zones_not_implemented = value;
    }

    /// Names of all rule groups, in creation order.
    pub fn rule_group_names(&self) -> Vec<String> {
        self.state().groups.iter().map(|g| g.name.clone()).collect()
    }

    /// Rules currently on the named group; empty when the group does not
    /// exist.
    pub fn rule_group_rules(&self, name: &str) -> Vec<RuleSpec> {
        let mut state = self.state();
        state
            .group_by_name(name)
            .map(|g| g.rules.iter().map(|r| r.spec.clone()).collect())
            .unwrap_or_default()
    }

    /// The options the most recent create call was given.
    pub fn last_create_opts(&self) -> Option<CreateServerOpts> {
        self.state().last_create_opts.clone()
    }
}

#[async_trait]
impl ComputeBackend for StubBackend {
    fn name(&self) -> &str {
        "stub"
    }

    async fn create_server(&self, opts: &CreateServerOpts) -> Result<Option<CreatedServer>, BackendError> {
        let mut state = self.state();
        state.counts.create_server += 1;
        if let Some(err) = state.take_failure("create_server") {
            return Err(err);
        }
        state.last_create_opts = Some(opts.clone());
        if state.create_without_entity {
            state.create_without_entity = false;
            return Ok(None);
        }

        let id = format!("srv-{}", state.next_server);
        let fixed = format!("10.0.0.{}", state.next_server);
        state.next_server += 1;
        let script = state.pending_script.take();
        let status = if script.is_some() {
            ServerStatus::Building
        } else {
            ServerStatus::Active
        };
        if let Some((statuses, fault)) = script {
            state.scripts.insert(id.clone(), statuses);
            if let Some(message) = fault {
                state.faults.insert(id.clone(), message);
            }
        }
        state.servers.push(ServerDetail {
            id: id.clone(),
            name: opts.name.clone(),
            status,
            fault: None,
            availability_zone: Some(opts.availability_zone.clone().unwrap_or_else(|| "az1".into())),
            flavor_id: opts.flavor_id.clone(),
            addresses: BTreeMap::from([("internal".to_string(), vec![IpAddress::fixed(fixed, 4)])]),
            metadata: opts.metadata.clone(),
            created: Utc::now(),
        });
        Ok(Some(CreatedServer { id }))
    }

    async fn get_server(&self, server_id: &str) -> Result<ServerDetail, BackendError> {
        let mut state = self.state();
        state.counts.get_server += 1;
        if let Some(err) = state.take_failure("get_server") {
            return Err(err);
        }
        if let Some(remaining) = state.hidden.get_mut(server_id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(BackendError::NotFound(format!("Server not found: {server_id}")));
            }
        }
        match state.server_index(server_id) {
            Some(index) => Ok(state.observe_server(index)),
            None => Err(BackendError::NotFound(format!("Server not found: {server_id}"))),
        }
    }

    async fn list_servers(&self, filter: &ServerFilter) -> Result<Vec<ServerDetail>, BackendError> {
        let mut state = self.state();
        state.counts.list_servers += 1;
        if let Some(err) = state.take_failure("list_servers") {
            return Err(err);
        }
        let mut visible = Vec::new();
        for index in 0..state.servers.len() {
            let id = state.servers[index].id.clone();
            if let Some(remaining) = state.hidden.get_mut(&id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    continue;
                }
            }
            if filter.matches(&state.servers[index].name) {
                visible.push(state.observe_server(index));
            }
        }
        Ok(visible)
    }

    async fn delete_server(&self, server_id: &str) -> Result<(), BackendError> {
        let mut state = self.state();
        state.counts.delete_server += 1;
        if let Some(err) = state.take_failure("delete_server") {
            return Err(err);
        }
        match state.server_index(server_id) {
            Some(index) => {
                state.servers.remove(index);
                state.scripts.remove(server_id);
                state.faults.remove(server_id);
                Ok(())
            }
            None => Err(BackendError::NotFound(format!("Server not found: {server_id}"))),
        }
    }

    async fn set_server_metadata(
        &self,
        server_id: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<(), BackendError> {
        let mut state = self.state();
        state.counts.set_metadata += 1;
        if let Some(err) = state.take_failure("set_metadata") {
            return Err(err);
        }
        match state.server_index(server_id) {
            Some(index) => {
                state.servers[index]
                    .metadata
                    .extend(metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
                Ok(())
            }
            None => Err(BackendError::NotFound(format!("Server not found: {server_id}"))),
        }
    }

    async fn list_flavors(&self) -> Result<Vec<Flavor>, BackendError> {
        let mut state = self.state();
        state.counts.list_flavors += 1;
        if let Some(err) = state.take_failure("list_flavors") {
            return Err(err);
        }
        Ok(state.flavors.clone())
    }

    async fn list_availability_zones(&self) -> Result<Vec<AvailabilityZone>, BackendError> {
        let mut state = self.state();
        state.counts.list_zones += 1;
        if let Some(err) = state.take_failure("list_zones") {
            return Err(err);
        }
        if state.zones_not_implemented {
            return Err(BackendError::NotImplemented("availability zones".into()));
        }
        Ok(state.zones.clone())
    }

    async fn list_networks(&self) -> Result<Vec<Network>, BackendError> {
        let mut state = self.state();
        state.counts.list_networks += 1;
        if let Some(err) = state.take_failure("list_networks") {
            return Err(err);
        }
        Ok(state.networks.clone())
    }

    async fn get_network(&self, network_id: &str) -> Result<Network, BackendError> {
        let mut state = self.state();
        state.counts.get_network += 1;
        if let Some(err) = state.take_failure("get_network") {
            return Err(err);
        }
        state
            .networks
            .iter()
            .find(|n| n.id == network_id)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(format!("Network not found: {network_id}")))
    }

    async fn list_subnets(&self, subnet_ids: &[String]) -> Result<Vec<Subnet>, BackendError> {
        let mut state = self.state();
        state.counts.list_subnets += 1;
        if let Some(err) = state.take_failure("list_subnets") {
            return Err(err);
        }
        Ok(state
            .subnets
            .iter()
            .filter(|s| subnet_ids.is_empty() || subnet_ids.contains(&s.id))
            .cloned()
            .collect())
    }

    async fn allocate_public_address(&self) -> Result<armada_cloud::PublicAddress, BackendError> {
        let mut state = self.state();
        state.counts.allocate_address += 1;
        if let Some(err) = state.take_failure("allocate_address") {
            return Err(err);
        }
        // The pool hands out the first address no server is using. Two
        // callers that allocate before either associates get the same
        // address, exactly like a real pool.
        let unused = state
            .minted
            .iter()
            .find(|a| !state.associations.contains_key(*a))
            .cloned();
        let address = match unused {
            Some(address) => address,
            None => state.mint(),
        };
        if !state.allocated.contains(&address) {
            state.allocated.push(address.clone());
        }
        let id = format!("fip-{address}");
        Ok(armada_cloud::PublicAddress { id, address })
    }

    async fn associate_public_address(
        &self,
        address: &str,
        server_id: &str,
    ) -> Result<(), BackendError> {
        let mut state = self.state();
        state.counts.associate_address += 1;
        if state.associate_failures > 0 {
            state.associate_failures -= 1;
            return Err(BackendError::Transient("Floating address backlog".into()));
        }
        if let Some(err) = state.take_failure("associate_address") {
            return Err(err);
        }
        if !state.minted.iter().any(|a| a == address) {
            return Err(BackendError::NotFound(format!("Floating address not found: {address}")));
        }
        let Some(index) = state.server_index(server_id) else {
            return Err(BackendError::NotFound(format!("Server not found: {server_id}")));
        };
        state.associations.insert(address.to_string(), server_id.to_string());
        state.servers[index]
            .addresses
            .entry("public".to_string())
            .or_default()
            .push(IpAddress::floating(address, 4));
        Ok(())
    }

    async fn release_public_address(&self, address: &str) -> Result<(), BackendError> {
        let mut state = self.state();
        state.counts.release_address += 1;
        if let Some(err) = state.take_failure("release_address") {
            return Err(err);
        }
        let Some(index) = state.allocated.iter().position(|a| a == address) else {
            return Err(BackendError::NotFound(format!("Floating address not found: {address}")));
        };
        state.allocated.remove(index);
        state.associations.remove(address);
        Ok(())
    }

    async fn create_rule_group(
        &self,
        name: &str,
        description: &str,
        rules: &[RuleSpec],
    ) -> Result<RuleGroup, BackendError> {
        let mut state = self.state();
        state.counts.create_rule_group += 1;
        if let Some(err) = state.take_failure("create_rule_group") {
            return Err(err);
        }
        if state.groups.iter().any(|g| g.name == name) {
            return Err(BackendError::Duplicate(format!("Rule group exists: {name}")));
        }
        let group_id = format!("sg-{}", state.next_group);
        state.next_group += 1;
        let mut group = RuleGroup {
            id: group_id.clone(),
            name: name.to_string(),
            description: description.to_string(),
            rules: Vec::new(),
        };
        for spec in rules {
            let rule_id = format!("rule-{}", state.next_rule);
            state.next_rule += 1;
            group.rules.push(GroupRule {
                id: rule_id,
                group_id: group_id.clone(),
                spec: spec.clone(),
            });
        }
        state.groups.push(group.clone());
        Ok(group)
    }

    async fn delete_rule_group(&self, name: &str) -> Result<(), BackendError> {
        let mut state = self.state();
        state.counts.delete_rule_group += 1;
        if let Some(err) = state.take_failure("delete_rule_group") {
            return Err(err);
        }
        match state.groups.iter().position(|g| g.name == name) {
            Some(index) => {
                state.groups.remove(index);
                Ok(())
            }
            None => Err(BackendError::NotFound(format!("Rule group not found: {name}"))),
        }
    }

    async fn list_rule_groups(&self) -> Result<Vec<RuleGroup>, BackendError> {
        let mut state = self.state();
        state.counts.list_rule_groups += 1;
        if let Some(err) = state.take_failure("list_rule_groups") {
            return Err(err);
        }
        Ok(state.groups.clone())
    }

    async fn update_rule_group(
        &self,
        group_id: &str,
        name: &str,
        description: &str,
    ) -> Result<RuleGroup, BackendError> {
        let mut state = self.state();
        state.counts.update_rule_group += 1;
        if let Some(err) = state.take_failure("update_rule_group") {
            return Err(err);
        }
        match state.groups.iter_mut().find(|g| g.id == group_id) {
            Some(group) => {
                group.name = name.to_string();
                group.description = description.to_string();
                Ok(group.clone())
            }
            None => Err(BackendError::NotFound(format!("Rule group not found: {group_id}"))),
        }
    }

    async fn add_group_rule(&self, group_id: &str, rule: &RuleSpec) -> Result<GroupRule, BackendError> {
        let mut state = self.state();
        state.counts.add_group_rule += 1;
        if let Some(err) = state.take_failure("add_group_rule") {
            return Err(err);
        }
        let rule_id = format!("rule-{}", state.next_rule);
        state.next_rule += 1;
        match state.groups.iter_mut().find(|g| g.id == group_id) {
            Some(group) => {
                let added = GroupRule {
                    id: rule_id,
                    group_id: group_id.to_string(),
                    spec: rule.clone(),
                };
                group.rules.push(added.clone());
                Ok(added)
            }
            None => Err(BackendError::NotFound(format!("Rule group not found: {group_id}"))),
        }
    }

    async fn remove_group_rule(&self, rule_id: &str) -> Result<(), BackendError> {
        let mut state = self.state();
        state.counts.remove_group_rule += 1;
        if let Some(err) = state.take_failure("remove_group_rule") {
            return Err(err);
        }
        for group in &mut state.groups {
            if let Some(index) = group.rules.iter().position(|r| r.id == rule_id) {
                group.rules.remove(index);
                return Ok(());
            }
        }
        Err(BackendError::NotFound(format!("Rule not found: {rule_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_statuses_advance_per_observation() {
        let backend = StubBackend::new();
        backend.script_next_server(
            vec![ServerStatus::Building, ServerStatus::Error],
            Some("boom"),
        );
        let created = backend
            .create_server(&CreateServerOpts::default())
            .await
            .unwrap()
            .unwrap();

        let first = backend.get_server(&created.id).await.unwrap();
        assert_eq!(first.status, ServerStatus::Building);
        let second = backend.get_server(&created.id).await.unwrap();
        assert_eq!(second.status, ServerStatus::Error);
        assert_eq!(second.fault.unwrap().message, "boom");
        // The script is exhausted; the last status sticks.
        let third = backend.get_server(&created.id).await.unwrap();
        assert_eq!(third.status, ServerStatus::Error);
    }

    #[tokio::test]
    async fn test_pool_reuses_released_addresses() {
        let backend = StubBackend::new();
        let id = backend.seed_server("web-0", HashMap::new());

        let first = backend.allocate_public_address().await.unwrap();
        backend
            .associate_public_address(&first.address, &id)
            .await
            .unwrap();
        let second = backend.allocate_public_address().await.unwrap();
        assert_ne!(first.address, second.address);

        backend.release_public_address(&first.address).await.unwrap();
        let reused = backend.allocate_public_address().await.unwrap();
        assert_eq!(reused.address, first.address);
    }

    #[tokio::test]
    async fn test_duplicate_group_name_is_rejected() {
        let backend = StubBackend::new();
        backend.create_rule_group("shared", "d", &[]).await.unwrap();
        let err = backend
            .create_rule_group("shared", "d", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Duplicate(_)));
    }

    #[tokio::test]
    async fn test_hidden_server_reappears_after_budgeted_calls() {
        let backend = StubBackend::new();
        let id = backend.seed_server("web-0", HashMap::new());
        backend.hide_server(&id, 2);

        assert!(backend.get_server(&id).await.is_err());
        assert!(backend.get_server(&id).await.is_err());
        assert!(backend.get_server(&id).await.is_ok());
    }
}
