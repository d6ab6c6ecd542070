//! Instance queries with eventual-consistency absorption
//!
//! Backends routinely fail to report a server they created moments ago.
//! Lookups here retry listings within a short budget, distinguish "none of
//! the requested ids resolve" from "some do", and never error merely
//! because an id is missing.

use crate::config::{ProvisionConfig, RESOURCE_PREFIX, TAG_CONTROLLER, TAG_IS_CONTROLLER, TAG_MODEL};
use crate::error::{ProvisionError, Result};
use crate::instance::ComputeInstance;
use crate::retry::{retry, RetryError, SHORT_ATTEMPT};
use armada_cloud::{AddressKind, ComputeBackend, ServerDetail, ServerFilter, ServerStatus};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Whether the backend still counts this server as a live resource.
fn is_alive(status: ServerStatus) -> bool {
    matches!(
        status,
        ServerStatus::Building
            | ServerStatus::Active
            | ServerStatus::Shutoff
            | ServerStatus::Suspended
    )
}

/// Outcome of a multi-id lookup.
#[derive(Debug)]
pub enum InstanceLookup {
    /// Every requested id resolved, in request order.
    Full(Vec<ComputeInstance>),

    /// Some ids resolved; unresolved ones are holes, in request order.
    Partial(Vec<Option<ComputeInstance>>),
}

enum LookupError {
    /// Not every id resolved in this pass; worth retrying.
    Incomplete(Vec<Option<ServerDetail>>),

    /// The backend failed outright; the lookup stops here.
    Backend(ProvisionError),
}

/// Queries instances belonging to one model.
pub struct InstanceRegistry {
    backend: Arc<dyn ComputeBackend>,
    config: ProvisionConfig,
}

impl InstanceRegistry {
    pub fn new(backend: Arc<dyn ComputeBackend>, config: ProvisionConfig) -> Self {
        Self { backend, config }
    }

    /// Resolves the given ids, absorbing the backend's consistency lag.
    ///
    /// Retries until every id resolves or the budget runs out, then
    /// reports [`InstanceLookup::Partial`] when only some did. Zero
    /// resolved ids after the full budget is the distinguished
    /// [`ProvisionError::NoInstances`].
    pub async fn instances(&self, ids: &[String]) -> Result<InstanceLookup> {
        if ids.is_empty() {
            return Ok(InstanceLookup::Full(Vec::new()));
        }

        let outcome = retry(
            SHORT_ATTEMPT,
            |_| self.lookup_pass(ids),
            |err| matches!(err, LookupError::Incomplete(_)),
        )
        .await;
        let slots = match outcome {
            Ok(complete) => complete,
            Err(RetryError::Exhausted {
                last: LookupError::Incomplete(partial),
                ..
            }) => partial,
            Err(RetryError::Fatal(LookupError::Backend(err)))
            | Err(RetryError::Exhausted {
                last: LookupError::Backend(err),
                ..
            }) => return Err(err),
            Err(RetryError::Fatal(LookupError::Incomplete(_))) => unreachable!("incomplete passes are retried"),
        };

        let found = slots.iter().filter(|s| s.is_some()).count();
        if found == 0 {
            return Err(ProvisionError::NoInstances);
        }
        let mut instances: Vec<Option<ComputeInstance>> = slots
            .into_iter()
            .map(|slot| slot.map(ComputeInstance::new))
            .collect();
        self.enrich_public_addresses(&self.config.server_filter(), &mut instances)
            .await;

        if found == ids.len() {
            Ok(InstanceLookup::Full(
                instances.into_iter().flatten().collect(),
            ))
        } else {
            Ok(InstanceLookup::Partial(instances))
        }
    }

    /// Resolves a single id.
    pub async fn instance(&self, id: &str) -> Result<ComputeInstance> {
        match self.instances(std::slice::from_ref(&id.to_string())).await? {
            InstanceLookup::Full(mut found) => Ok(found.remove(0)),
            InstanceLookup::Partial(_) => Err(ProvisionError::NoInstances),
        }
    }

    /// Every live instance tagged as belonging to this model.
    pub async fn all_instances(&self) -> Result<Vec<ComputeInstance>> {
        self.instances_by_tag(&self.config.server_filter(), TAG_MODEL, &self.config.model_uuid)
            .await
    }

    /// Every live controller-hosting instance of the given controller.
    /// No matches is the distinguished no-instances condition.
    pub async fn controller_instances(&self, controller_uuid: &str) -> Result<Vec<ComputeInstance>> {
        let managed = self
            .controller_managed_instances(controller_uuid)
            .await?
            .into_iter()
            .filter(|i| {
                i.detail.metadata.get(TAG_IS_CONTROLLER).map(String::as_str) == Some("true")
            })
            .collect::<Vec<_>>();
        if managed.is_empty() {
            return Err(ProvisionError::NoInstances);
        }
        Ok(managed)
    }

    /// Every live instance of any model managed by the given controller.
    /// The listing must span models, so it is scoped by the resource
    /// prefix alone and the controller tag does the selection.
    pub async fn controller_managed_instances(
        &self,
        controller_uuid: &str,
    ) -> Result<Vec<ComputeInstance>> {
        let filter = ServerFilter::name_prefix(format!("{RESOURCE_PREFIX}-"));
        self.instances_by_tag(&filter, TAG_CONTROLLER, controller_uuid)
            .await
    }

    /// Zone of each requested instance, preserving holes for ids that did
    /// not resolve or report no zone.
    pub async fn instance_zones(&self, ids: &[String]) -> Result<Vec<Option<String>>> {
        let zones = |slots: Vec<Option<ComputeInstance>>| {
            slots
                .into_iter()
                .map(|slot| slot.and_then(|i| i.detail.availability_zone.clone()))
                .collect()
        };
        match self.instances(ids).await? {
            InstanceLookup::Full(found) => Ok(zones(found.into_iter().map(Some).collect())),
            InstanceLookup::Partial(slots) => Ok(zones(slots)),
        }
    }

    async fn instances_by_tag(
        &self,
        filter: &ServerFilter,
        tag: &str,
        value: &str,
    ) -> Result<Vec<ComputeInstance>> {
        let listing = self.backend.list_servers(filter).await?;
        let mut matched: Vec<Option<ComputeInstance>> = listing
            .into_iter()
            .filter(|server| {
                is_alive(server.status) && server.metadata.get(tag).map(String::as_str) == Some(value)
            })
            .map(|server| Some(ComputeInstance::new(server)))
            .collect();
        self.enrich_public_addresses(filter, &mut matched).await;
        Ok(matched.into_iter().flatten().collect())
    }

    /// One pass over the requested ids: a direct get for a single id, a
    /// filtered listing intersected with the id set otherwise.
    async fn lookup_pass(&self, ids: &[String]) -> std::result::Result<Vec<Option<ServerDetail>>, LookupError> {
        if let [id] = ids {
            // A reclaimed server still answers a direct get for a while;
            // it counts as absent, same as in the listing branch.
            return match self.backend.get_server(id).await {
                Ok(server) if is_alive(server.status) => Ok(vec![Some(server)]),
                Ok(_) => Err(LookupError::Incomplete(vec![None])),
                Err(err) if err.is_not_found() => Err(LookupError::Incomplete(vec![None])),
                Err(err) => Err(LookupError::Backend(err.into())),
            };
        }

        let listing = self
            .backend
            .list_servers(&self.config.server_filter())
            .await
            .map_err(|err| LookupError::Backend(err.into()))?;
        let mut by_id: HashMap<&str, &ServerDetail> = HashMap::new();
        for server in listing.iter().filter(|s| is_alive(s.status)) {
            by_id.insert(server.id.as_str(), server);
        }
        let slots: Vec<Option<ServerDetail>> = ids
            .iter()
            .map(|id| by_id.get(id.as_str()).map(|s| (*s).clone()))
            .collect();
        if slots.iter().all(|s| s.is_some()) {
            Ok(slots)
        } else {
            Err(LookupError::Incomplete(slots))
        }
    }

    /// Best-effort pass attaching floating addresses from a listing under
    /// the caller's name scope. A failed listing leaves the instances
    /// unannotated.
    async fn enrich_public_addresses(
        &self,
        filter: &ServerFilter,
        slots: &mut [Option<ComputeInstance>],
    ) {
        if !self.config.use_public_addresses {
            return;
        }
        let listing = match self.backend.list_servers(filter).await {
            Ok(listing) => listing,
            Err(err) => {
                warn!(error = %err, "could not list servers to attach public addresses");
                return;
            }
        };
        let mut floating: HashMap<String, String> = HashMap::new();
        for server in listing {
            let addr = server
                .addresses
                .values()
                .flatten()
                .find(|a| a.kind == AddressKind::Floating)
                .map(|a| a.address.clone());
            if let Some(addr) = addr {
                floating.insert(server.id, addr);
            }
        }
        for instance in slots.iter_mut().flatten() {
            if let Some(addr) = floating.get(instance.id()) {
                instance.public_address = Some(addr.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::StubBackend;

    fn config() -> ProvisionConfig {
        ProvisionConfig::new("deadbeef-cafe-4000-8000-000000000001", "ctrl-1")
    }

    fn seed(backend: &StubBackend, cfg: &ProvisionConfig, suffix: &str) -> String {
        backend.seed_server(&cfg.resource_name(suffix), cfg.model_tags())
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_absorbs_listing_lag() {
        let backend = Arc::new(StubBackend::new());
        let cfg = config();
        let id = seed(&backend, &cfg, "web-0");
        backend.hide_server(&id, 1);
        let registry = InstanceRegistry::new(backend.clone(), cfg);

        let found = registry.instance(&id).await.unwrap();
        assert_eq!(found.id(), id);
        assert_eq!(backend.counts().get_server, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_instances_only_after_budget() {
        let backend = Arc::new(StubBackend::new());
        let registry = InstanceRegistry::new(backend.clone(), config());

        let err = registry
            .instances(&["srv-missing".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::NoInstances));
        // The whole budget was spent looking.
        assert!(backend.counts().get_server > 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_lookup_keeps_holes_in_order() {
        let backend = Arc::new(StubBackend::new());
        let cfg = config();
        let id = seed(&backend, &cfg, "web-0");
        let registry = InstanceRegistry::new(backend.clone(), cfg);

        let lookup = registry
            .instances(&[id.clone(), "srv-missing".to_string()])
            .await
            .unwrap();
        match lookup {
            InstanceLookup::Partial(slots) => {
                assert_eq!(slots.len(), 2);
                assert_eq!(slots[0].as_ref().map(|i| i.id().to_string()), Some(id));
                assert!(slots[1].is_none());
            }
            other => panic!("expected partial lookup, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reclaimed_instances_are_not_alive() {
        let backend = Arc::new(StubBackend::new());
        let cfg = config();
        let kept = seed(&backend, &cfg, "web-0");
        let gone = seed(&backend, &cfg, "web-1");
        backend.set_server_status(&gone, ServerStatus::Deleted);
        let registry = InstanceRegistry::new(backend.clone(), cfg);

        let all = registry.all_instances().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id(), kept);
    }

    #[tokio::test]
    async fn test_model_scoping_ignores_other_models() {
        let backend = Arc::new(StubBackend::new());
        let cfg = config();
        seed(&backend, &cfg, "web-0");
        let other = ProvisionConfig::new("0badf00d-aaaa-4000-8000-000000000002", "ctrl-1");
        backend.seed_server(&other.resource_name("db-0"), other.model_tags());
        let registry = InstanceRegistry::new(backend.clone(), cfg);

        let all = registry.all_instances().await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_server_is_absent_on_the_direct_get_path() {
        let backend = Arc::new(StubBackend::new());
        let cfg = config();
        let id = seed(&backend, &cfg, "web-0");
        backend.set_server_status(&id, ServerStatus::Error);
        let registry = InstanceRegistry::new(backend.clone(), cfg);

        let err = registry.instances(&[id]).await.unwrap_err();
        assert!(matches!(err, ProvisionError::NoInstances));
    }

    #[tokio::test]
    async fn test_controller_scope_spans_hosted_models() {
        let backend = Arc::new(StubBackend::new());
        let cfg = config();
        let own = seed(&backend, &cfg, "web-0");
        let hosted_cfg = ProvisionConfig::new("0badf00d-aaaa-4000-8000-000000000002", "ctrl-1");
        let hosted = backend.seed_server(&hosted_cfg.resource_name("db-0"), hosted_cfg.model_tags());
        let registry = InstanceRegistry::new(backend.clone(), cfg);

        let managed = registry.controller_managed_instances("ctrl-1").await.unwrap();
        let mut ids: Vec<_> = managed.iter().map(|i| i.id().to_string()).collect();
        ids.sort();
        let mut expected = vec![own, hosted];
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn test_controller_instances_need_the_marker_tag() {
        let backend = Arc::new(StubBackend::new());
        let cfg = config();
        seed(&backend, &cfg, "web-0");
        let mut tags = cfg.model_tags();
        tags.insert(TAG_IS_CONTROLLER.to_string(), "true".to_string());
        let controller_id = backend.seed_server(&cfg.resource_name("controller-0"), tags);
        let registry = InstanceRegistry::new(backend.clone(), cfg);

        let controllers = registry.controller_instances("ctrl-1").await.unwrap();
        assert_eq!(controllers.len(), 1);
        assert_eq!(controllers[0].id(), controller_id);

        let err = registry.controller_instances("ctrl-9").await.unwrap_err();
        assert!(matches!(err, ProvisionError::NoInstances));
    }

    #[tokio::test]
    async fn test_public_address_enrichment_respects_config() {
        let backend = Arc::new(StubBackend::new());
        let cfg = config();
        let id = seed(&backend, &cfg, "web-0");
        let address = backend.allocate_public_address().await.unwrap();
        backend
            .associate_public_address(&address.address, &id)
            .await
            .unwrap();

        let registry = InstanceRegistry::new(backend.clone(), cfg.clone());
        let found = registry.instance(&id).await.unwrap();
        assert_eq!(found.public_address.as_deref(), Some(address.address.as_str()));

        let without = InstanceRegistry::new(backend.clone(), cfg.with_public_addresses(false));
        let found = without.instance(&id).await.unwrap();
        assert_eq!(found.public_address, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_instance_zones_preserve_partial_holes() {
        let backend = Arc::new(StubBackend::new());
        let cfg = config();
        let id = seed(&backend, &cfg, "web-0");
        let registry = InstanceRegistry::new(backend.clone(), cfg);

        let zones = registry
            .instance_zones(&[id, "srv-missing".to_string()])
            .await
            .unwrap();
        assert_eq!(zones.len(), 2);
        assert_eq!(zones[0].as_deref(), Some("az1"));
        assert_eq!(zones[1], None);
    }
}
