//! Instance teardown and model-wide cleanup
//!
//! Batch deletions keep going past individual failures so one stuck
//! server does not strand the rest, with one exception: a credential
//! denial stops the batch immediately, before any further id is touched.

use crate::config::{FirewallMode, ProvisionConfig, TAG_CONTROLLER};
use crate::error::{ProvisionError, Result};
use crate::instance::ComputeInstance;
use crate::registry::{InstanceLookup, InstanceRegistry};
use crate::secgroup::SecurityGroupManager;
use armada_cloud::{BackendError, ComputeBackend, CredentialClassifier};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Tears down instances, whole models and whole controllers.
pub struct LifecycleTerminator {
    backend: Arc<dyn ComputeBackend>,
    classifier: Arc<dyn CredentialClassifier>,
    config: ProvisionConfig,
    registry: InstanceRegistry,
    groups: SecurityGroupManager,
}

impl LifecycleTerminator {
    pub fn new(
        backend: Arc<dyn ComputeBackend>,
        classifier: Arc<dyn CredentialClassifier>,
        config: ProvisionConfig,
    ) -> Self {
        let registry = InstanceRegistry::new(backend.clone(), config.clone());
        let groups = SecurityGroupManager::new(backend.clone(), classifier.clone(), config.clone());
        Self {
            backend,
            classifier,
            config,
            registry,
            groups,
        }
    }

    /// Deletes the given servers.
    ///
    /// A server already gone counts as deleted. Other failures are noted
    /// and the loop moves on; the first one is what the caller gets back.
    /// A credential denial breaks the loop at once, leaving the remaining
    /// ids untouched.
    pub async fn terminate_instances(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut first_failure: Option<BackendError> = None;
        for id in ids {
            match self.backend.delete_server(id).await {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => {
                    debug!(instance = %id, error = %err, "error terminating instance");
                    let denied = self.classifier.is_auth_failure(&err);
                    if first_failure.is_none() {
                        first_failure = Some(err);
                    }
                    if denied {
                        break;
                    }
                }
            }
        }
        match first_failure {
            None => Ok(()),
            Some(source) if self.classifier.is_auth_failure(&source) => {
                Err(ProvisionError::CredentialDenied { source })
            }
            Some(source) => Err(ProvisionError::DeleteInstance { source }),
        }
    }

    /// Deletes the given servers along with the public addresses they
    /// held and their per-instance rule groups. When none of the ids
    /// resolve there is nothing to stop.
    pub async fn stop_instances(&self, ids: &[String]) -> Result<()> {
        let doomed = match self.registry.instances(ids).await {
            Ok(InstanceLookup::Full(found)) => found,
            Ok(InstanceLookup::Partial(slots)) => slots.into_iter().flatten().collect(),
            Err(ProvisionError::NoInstances) => return Ok(()),
            Err(err) => return Err(err),
        };
        let doomed_groups = self.instance_group_names(&doomed);
        debug!(?ids, "terminating instances");
        self.terminate_instances(ids).await?;
        self.release_addresses(&doomed).await;
        for name in &doomed_groups {
            self.groups.delete_group(name).await?;
        }
        Ok(())
    }

    /// Deletes every instance of the model and the addresses they held,
    /// then every rule group the model owns.
    pub async fn destroy_model(&self) -> Result<()> {
        let instances = self.registry.all_instances().await?;
        let ids: Vec<String> = instances.iter().map(|i| i.id().to_string()).collect();
        self.terminate_instances(&ids).await?;
        self.release_addresses(&instances).await;
        self.groups.delete_all_for_model().await
    }

    /// Destroys the controller model, then sweeps up instances and rule
    /// groups of any hosted model the controller still manages.
    pub async fn destroy_controller(&self, controller_uuid: &str) -> Result<()> {
        self.destroy_model().await?;
        let hosted = self
            .registry
            .controller_managed_instances(controller_uuid)
            .await?;
        let ids: Vec<String> = hosted.iter().map(|i| i.id().to_string()).collect();
        self.terminate_instances(&ids).await?;
        self.release_addresses(&hosted).await;
        self.groups.delete_all_for_controller(controller_uuid).await
    }

    /// Hands back the public addresses the deleted instances held. The
    /// sweep is best effort; an address that cannot be released is logged
    /// and left for a later reconciliation pass.
    async fn release_addresses(&self, instances: &[ComputeInstance]) {
        for instance in instances {
            let Some(address) = &instance.public_address else {
                continue;
            };
            match self.backend.release_public_address(address).await {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => {
                    warn!(%address, error = %err, "cannot release public address");
                }
            }
        }
    }

    /// Points every model resource at a new controller: retags each
    /// instance, then renames the model's rule groups.
    ///
    /// Tagging failures are collected per instance and reported together;
    /// group renames only run once every instance is tagged.
    pub async fn adopt_resources(&self, controller_uuid: &str) -> Result<()> {
        let tag: HashMap<String, String> = HashMap::from([(
            TAG_CONTROLLER.to_string(),
            controller_uuid.to_string(),
        )]);
        let instances = self.registry.all_instances().await?;
        let mut failed = Vec::new();
        for instance in &instances {
            match self.backend.set_server_metadata(instance.id(), &tag).await {
                Ok(()) => {}
                Err(err) => {
                    error!(
                        instance = %instance.id(),
                        error = %err,
                        "error updating controller tag"
                    );
                    let denied = self.classifier.is_auth_failure(&err);
                    failed.push(instance.id().to_string());
                    if denied {
                        break;
                    }
                }
            }
        }
        if !failed.is_empty() {
            return Err(ProvisionError::AdoptionIncomplete(failed));
        }
        self.groups.update_controller_ownership(controller_uuid).await
    }

    /// Per-instance groups to remove alongside the servers, derived from
    /// the live servers' names. Shared groups are never candidates.
    fn instance_group_names(&self, instances: &[ComputeInstance]) -> Vec<String> {
        if self.config.firewall_mode != FirewallMode::Instance {
            return Vec::new();
        }
        let prefix = self.config.resource_name("");
        let mut names = Vec::new();
        for instance in instances {
            if let Some(suffix) = instance.name().strip_prefix(&prefix) {
                if !suffix.is_empty() {
                    names.push(self.groups.instance_group_name(suffix));
                }
            }
        }
        names
    }
}
