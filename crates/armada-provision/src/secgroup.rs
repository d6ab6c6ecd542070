//! Rule group provisioning and firewall management
//!
//! Instances attach a shared model group (members talk to each other
//! freely) plus either a per-instance group or, in global firewall mode, a
//! single shared group holding all opened ports. Group names encode the
//! controller and model identity, which is what cleanup and ownership
//! transfer select on.

use crate::config::{FirewallMode, ProvisionConfig, RESOURCE_PREFIX};
use crate::error::{ProvisionError, Result};
use crate::request::IngressRule;
use armada_cloud::{
    BackendError, ComputeBackend, CredentialClassifier, RuleDirection, RuleGroup, RuleSpec,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

/// Source CIDR applied when an ingress rule names none.
pub const OPEN_TO_ANYWHERE: &str = "0.0.0.0/0";

/// Groups prepared for one launch.
#[derive(Debug, Clone, Default)]
pub struct LaunchGroups {
    /// Group names to attach to the create call, in order.
    pub names: Vec<String>,

    /// Name of the group created for this instance alone, when one was.
    /// Shared groups are never torn down on launch failure; this one is.
    pub instance_group: Option<String>,
}

/// Creates, converges and tears down rule groups for a model.
pub struct SecurityGroupManager {
    backend: Arc<dyn ComputeBackend>,
    classifier: Arc<dyn CredentialClassifier>,
    config: ProvisionConfig,
}

impl SecurityGroupManager {
    pub fn new(
        backend: Arc<dyn ComputeBackend>,
        classifier: Arc<dyn CredentialClassifier>,
        config: ProvisionConfig,
    ) -> Self {
        Self {
            backend,
            classifier,
            config,
        }
    }

    /// Name of the shared group every model instance attaches.
    pub fn model_group_name(&self) -> String {
        format!(
            "{}-{}-{}",
            RESOURCE_PREFIX, self.config.controller_uuid, self.config.model_uuid
        )
    }

    /// Name of the group dedicated to one instance.
    pub fn instance_group_name(&self, instance: &str) -> String {
        format!("{}-{}", self.model_group_name(), instance)
    }

    /// Name of the shared group used in global firewall mode.
    pub fn global_group_name(&self) -> String {
        format!("{}-global", self.model_group_name())
    }

    fn group_description(&self) -> String {
        format!("rule group owned by armada model {}", self.config.model_uuid)
    }

    /// Prepares the groups a launch attaches, per the firewall mode.
    pub async fn setup_groups(
        &self,
        instance: &str,
        rules: &[IngressRule],
    ) -> Result<LaunchGroups> {
        match self.config.firewall_mode {
            FirewallMode::None => Ok(LaunchGroups::default()),
            FirewallMode::Global => {
                let model = self.ensure_model_group().await?;
                let global = self.ensure_group_exists(&self.global_group_name()).await?;
                self.add_missing_rules(&global, &expand_rules(rules)).await?;
                Ok(LaunchGroups {
                    names: vec![model.name, global.name],
                    instance_group: None,
                })
            }
            FirewallMode::Instance => {
                let model = self.ensure_model_group().await?;
                let group = self
                    .ensure_group_exists(&self.instance_group_name(instance))
                    .await?;
                self.converge_rules(&group, &expand_rules(rules)).await?;
                Ok(LaunchGroups {
                    names: vec![model.name, group.name.clone()],
                    instance_group: Some(group.name),
                })
            }
        }
    }

    /// Opens ports on the shared global group.
    pub async fn open(&self, rules: &[IngressRule]) -> Result<()> {
        self.require_mode(FirewallMode::Global, "opening ports on model")?;
        let group = self.ensure_group_exists(&self.global_group_name()).await?;
        self.add_missing_rules(&group, &expand_rules(rules)).await
    }

    /// Closes ports on the shared global group.
    pub async fn close(&self, rules: &[IngressRule]) -> Result<()> {
        self.require_mode(FirewallMode::Global, "closing ports on model")?;
        let group = self.find_group(&self.global_group_name()).await?;
        self.remove_matching_rules(&group, &expand_rules(rules)).await
    }

    /// Ingress currently open on the shared global group.
    pub async fn current_rules(&self) -> Result<Vec<IngressRule>> {
        self.require_mode(FirewallMode::Global, "listing ports on model")?;
        let group = self.find_group(&self.global_group_name()).await?;
        Ok(collapse_rules(&group))
    }

    /// Opens ports on one instance's own group.
    pub async fn open_for_instance(&self, instance: &str, rules: &[IngressRule]) -> Result<()> {
        self.require_mode(FirewallMode::Instance, "opening ports on an instance")?;
        let group = self.find_group(&self.instance_group_name(instance)).await?;
        self.add_missing_rules(&group, &expand_rules(rules)).await
    }

    /// Closes ports on one instance's own group.
    pub async fn close_for_instance(&self, instance: &str, rules: &[IngressRule]) -> Result<()> {
        self.require_mode(FirewallMode::Instance, "closing ports on an instance")?;
        let group = self.find_group(&self.instance_group_name(instance)).await?;
        self.remove_matching_rules(&group, &expand_rules(rules)).await
    }

    /// Ingress currently open on one instance's own group.
    pub async fn instance_rules(&self, instance: &str) -> Result<Vec<IngressRule>> {
        self.require_mode(FirewallMode::Instance, "listing ports on an instance")?;
        let group = self.find_group(&self.instance_group_name(instance)).await?;
        Ok(collapse_rules(&group))
    }

    /// Deletes one group. A group already gone counts as success.
    pub async fn delete_group(&self, name: &str) -> Result<()> {
        match self.backend.delete_rule_group(name).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Deletes every group belonging to this model, best effort.
    pub async fn delete_all_for_model(&self) -> Result<()> {
        let prefix = self.model_group_name();
        self.delete_matching(|name| name == prefix || name.starts_with(&format!("{prefix}-")))
            .await
    }

    /// Deletes every group belonging to any model of a controller.
    pub async fn delete_all_for_controller(&self, controller_uuid: &str) -> Result<()> {
        let prefix = format!("{RESOURCE_PREFIX}-{controller_uuid}-");
        self.delete_matching(|name| name.starts_with(&prefix)).await
    }

    /// Renames this model's groups so they carry a new controller identity.
    /// Per-group failures are collected; credential denial stops the pass.
    pub async fn update_controller_ownership(&self, new_controller_uuid: &str) -> Result<()> {
        let old_prefix = self.model_group_name();
        let groups = self.backend.list_rule_groups().await?;
        let mut failed = Vec::new();
        for group in groups {
            if group.name != old_prefix && !group.name.starts_with(&format!("{old_prefix}-")) {
                continue;
            }
            let new_name = group.name.replacen(
                &self.config.controller_uuid,
                new_controller_uuid,
                1,
            );
            let description = self.group_description();
            match self
                .backend
                .update_rule_group(&group.id, &new_name, &description)
                .await
            {
                Ok(_) => {}
                Err(err) if self.classifier.is_auth_failure(&err) => {
                    return Err(ProvisionError::CredentialDenied { source: err });
                }
                Err(err) => {
                    warn!(group = %group.name, error = %err, "failed to update group controller");
                    failed.push(group.id);
                }
            }
        }
        if !failed.is_empty() {
            return Err(ProvisionError::GroupAdoptionIncomplete(failed));
        }
        Ok(())
    }

    fn require_mode(&self, wanted: FirewallMode, operation: &str) -> Result<()> {
        if self.config.firewall_mode != wanted {
            return Err(ProvisionError::InvalidFirewallMode {
                mode: self.config.firewall_mode.to_string(),
                operation: operation.to_string(),
            });
        }
        Ok(())
    }

    /// The shared model group allows members unrestricted traffic to each
    /// other via self-referencing rules.
    async fn ensure_model_group(&self) -> Result<RuleGroup> {
        let group = self.ensure_group_exists(&self.model_group_name()).await?;
        let wanted = model_group_rules(&group.id);
        self.converge_rules(&group, &wanted).await?;
        Ok(group)
    }

    /// Creates a group, or fetches it when it already exists. Rules are
    /// left untouched either way.
    async fn ensure_group_exists(&self, name: &str) -> Result<RuleGroup> {
        let description = self.group_description();
        match self
            .backend
            .create_rule_group(name, &description, &[])
            .await
        {
            Ok(group) => Ok(group),
            Err(BackendError::Duplicate(_)) => self.find_group(name).await,
            Err(err) => Err(err.into()),
        }
    }

    async fn find_group(&self, name: &str) -> Result<RuleGroup> {
        let groups = self.backend.list_rule_groups().await?;
        groups
            .into_iter()
            .find(|g| g.name == name)
            .ok_or_else(|| BackendError::NotFound(format!("Rule group not found: {name}")).into())
    }

    /// Makes the group's rules exactly `wanted`: stale rules are removed,
    /// missing ones added. Used for groups owned by a single instance.
    async fn converge_rules(&self, group: &RuleGroup, wanted: &[RuleSpec]) -> Result<()> {
        for rule in &group.rules {
            if !wanted.contains(&rule.spec) {
                self.backend.remove_group_rule(&rule.id).await?;
            }
        }
        self.add_missing_rules(group, wanted).await
    }

    /// Removes the rules from `unwanted` the group currently holds.
    /// Rules outside the set are left alone.
    async fn remove_matching_rules(&self, group: &RuleGroup, unwanted: &[RuleSpec]) -> Result<()> {
        for rule in &group.rules {
            if unwanted.contains(&rule.spec) {
                self.backend.remove_group_rule(&rule.id).await?;
            }
        }
        Ok(())
    }

    /// Adds the rules from `wanted` the group does not already hold.
    /// Never removes anything, which matters for shared groups.
    async fn add_missing_rules(&self, group: &RuleGroup, wanted: &[RuleSpec]) -> Result<()> {
        for spec in wanted {
            if !group.rules.iter().any(|r| r.spec == *spec) {
                self.backend.add_group_rule(&group.id, spec).await?;
            }
        }
        Ok(())
    }

    async fn delete_matching<F>(&self, matches: F) -> Result<()>
    where
        F: Fn(&str) -> bool,
    {
        let groups = self.backend.list_rule_groups().await?;
        for group in groups.iter().filter(|g| matches(&g.name)) {
            match self.backend.delete_rule_group(&group.name).await {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) if self.classifier.is_auth_failure(&err) => {
                    return Err(ProvisionError::CredentialDenied { source: err });
                }
                Err(err) => {
                    // The group may still be attached to a terminating
                    // instance; a later cleanup pass will catch it.
                    warn!(group = %group.name, error = %err, "cannot delete rule group");
                }
            }
        }
        Ok(())
    }
}

fn model_group_rules(group_id: &str) -> Vec<RuleSpec> {
    let member = |protocol: &str, ports: Option<(u16, u16)>| RuleSpec {
        direction: RuleDirection::Ingress,
        protocol: Some(protocol.to_string()),
        port_min: ports.map(|p| p.0),
        port_max: ports.map(|p| p.1),
        remote_cidr: None,
        remote_group_id: Some(group_id.to_string()),
    };
    vec![
        member("tcp", Some((1, 65535))),
        member("udp", Some((1, 65535))),
        member("icmp", None),
    ]
}

/// Expands ingress rules into backend rule entries, one per source CIDR.
pub fn expand_rules(rules: &[IngressRule]) -> Vec<RuleSpec> {
    let mut specs = Vec::new();
    for rule in rules {
        let cidrs: Vec<&str> = if rule.source_cidrs.is_empty() {
            vec![OPEN_TO_ANYWHERE]
        } else {
            rule.source_cidrs.iter().map(String::as_str).collect()
        };
        for cidr in cidrs {
            let ports = (rule.port_min, rule.port_max) != (0, 0);
            specs.push(RuleSpec {
                direction: RuleDirection::Ingress,
                protocol: Some(rule.protocol.clone()),
                port_min: ports.then_some(rule.port_min),
                port_max: ports.then_some(rule.port_max),
                remote_cidr: Some(cidr.to_string()),
                remote_group_id: None,
            });
        }
    }
    specs
}

/// Collapses backend rule entries back into ingress rules, merging source
/// CIDRs per protocol and port range. Self-referencing rules are internal
/// plumbing and are not reported.
fn collapse_rules(group: &RuleGroup) -> Vec<IngressRule> {
    let mut merged: BTreeMap<(String, u16, u16), Vec<String>> = BTreeMap::new();
    for rule in &group.rules {
        let spec = &rule.spec;
        if spec.direction != RuleDirection::Ingress || spec.remote_group_id.is_some() {
            continue;
        }
        let key = (
            spec.protocol.clone().unwrap_or_else(|| "any".to_string()),
            spec.port_min.unwrap_or(0),
            spec.port_max.unwrap_or(0),
        );
        let cidr = spec
            .remote_cidr
            .clone()
            .unwrap_or_else(|| OPEN_TO_ANYWHERE.to_string());
        merged.entry(key).or_default().push(cidr);
    }
    merged
        .into_iter()
        .map(|((protocol, port_min, port_max), mut cidrs)| {
            cidrs.sort();
            cidrs.dedup();
            IngressRule {
                protocol,
                port_min,
                port_max,
                source_cidrs: cidrs,
            }
        })
        .collect()
}
