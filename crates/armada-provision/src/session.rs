//! Provisioning session facade
//!
//! A [`ProvisionSession`] ties one backend, one model configuration and
//! the shared caches together, and runs complete launches through them.
//! Sessions are cheap to share behind an [`Arc`]; every operation takes
//! `&self`, and concurrent launches are expected.

use crate::address::PublicAddressAllocator;
use crate::config::ProvisionConfig;
use crate::constraints::{check_root_disk_compatibility, resolve_spec, ConstraintValidator};
use crate::error::{ProvisionError, Result};
use crate::instance::{ComputeInstance, HardwareProfile};
use crate::launcher::{configure_root_disk, InstanceLauncher};
use crate::network::{
    networks_for_instance, rule_groups_supported, DefaultNetworking, NetworkingStrategy,
};
use crate::placement::{derive_availability_zone, validate_requested_zone};
use crate::registry::InstanceRegistry;
use crate::request::ProvisioningRequest;
use crate::rollback::{Compensation, RollbackLedger, RollbackReport};
use crate::secgroup::{LaunchGroups, SecurityGroupManager};
use crate::terminate::LifecycleTerminator;
use crate::zones::ZoneCache;
use armada_cloud::{
    AvailabilityZone, ComputeBackend, CreateServerOpts, CredentialClassifier,
    DeniedStatusClassifier,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};

/// A successfully launched instance with the hardware it ended up on.
#[derive(Debug)]
pub struct StartedInstance {
    /// The running instance.
    pub instance: ComputeInstance,

    /// Hardware characteristics derived from the chosen flavor.
    pub hardware: HardwareProfile,
}

/// A failed launch, together with what the rollback managed to undo.
#[derive(Debug)]
pub struct StartInstanceError {
    /// The failure that aborted the launch.
    pub error: ProvisionError,

    /// Outcome of unwinding the resources provisioned before the failure.
    pub rollback: RollbackReport,
}

impl fmt::Display for StartInstanceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.error.fmt(f)
    }
}

impl std::error::Error for StartInstanceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Builds a [`ProvisionSession`] with optional overrides.
pub struct SessionBuilder {
    backend: Arc<dyn ComputeBackend>,
    config: ProvisionConfig,
    networking: Option<Arc<dyn NetworkingStrategy>>,
    classifier: Option<Arc<dyn CredentialClassifier>>,
}

impl SessionBuilder {
    pub fn new(backend: Arc<dyn ComputeBackend>, config: ProvisionConfig) -> Self {
        Self {
            backend,
            config,
            networking: None,
            classifier: None,
        }
    }

    /// Replaces the default network discovery.
    pub fn networking(mut self, strategy: Arc<dyn NetworkingStrategy>) -> Self {
        self.networking = Some(strategy);
        self
    }

    /// Replaces the default credential classifier.
    pub fn classifier(mut self, classifier: Arc<dyn CredentialClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn build(self) -> ProvisionSession {
        let networking = self
            .networking
            .unwrap_or_else(|| Arc::new(DefaultNetworking::new(self.backend.clone())));
        let classifier = self
            .classifier
            .unwrap_or_else(|| Arc::new(DeniedStatusClassifier));
        ProvisionSession {
            backend: self.backend,
            networking,
            classifier,
            config: Mutex::new(self.config),
            zones: ZoneCache::new(),
            address_lock: tokio::sync::Mutex::new(()),
            credential_invalid: AtomicBool::new(false),
        }
    }
}

/// One model's provisioning state against one backend.
pub struct ProvisionSession {
    backend: Arc<dyn ComputeBackend>,
    networking: Arc<dyn NetworkingStrategy>,
    classifier: Arc<dyn CredentialClassifier>,
    config: Mutex<ProvisionConfig>,
    zones: ZoneCache,
    // Serializes the allocate-then-associate address sequence; without it
    // two concurrent launches can be handed the same free address.
    address_lock: tokio::sync::Mutex<()>,
    credential_invalid: AtomicBool,
}

impl ProvisionSession {
    pub fn builder(backend: Arc<dyn ComputeBackend>, config: ProvisionConfig) -> SessionBuilder {
        SessionBuilder::new(backend, config)
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> ProvisionConfig {
        self.config
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replaces the configuration for subsequent operations. Launches
    /// already in flight keep the snapshot they started with.
    pub fn set_config(&self, config: ProvisionConfig) {
        *self.config.lock().unwrap_or_else(PoisonError::into_inner) = config;
    }

    /// Whether no backend call has rejected the credentials so far.
    pub fn credentials_valid(&self) -> bool {
        !self.credential_invalid.load(Ordering::Relaxed)
    }

    /// Records a backend failure; credential denials latch the session
    /// into the invalid-credentials state.
    pub fn note_backend_error(&self, err: &ProvisionError) {
        if err.is_credential_denied() {
            self.credential_invalid.store(true, Ordering::Relaxed);
            warn!(error = %err, "backend denied the session credentials");
        }
    }

    /// Availability zones, fetched once and cached for the session.
    pub async fn availability_zones(&self) -> Result<Arc<Vec<AvailabilityZone>>> {
        self.noting(self.zones.zones(self.backend.as_ref()).await)
    }

    /// Availability zones fetched fresh, replacing the cached catalog.
    pub async fn availability_zones_uncached(&self) -> Result<Arc<Vec<AvailabilityZone>>> {
        self.noting(self.zones.zones_uncached(self.backend.as_ref()).await)
    }

    /// Checks one zone against the live catalog.
    pub async fn validate_zone(&self, zone: &str) -> Result<()> {
        self.noting(self.zones.validate_zone(self.backend.as_ref(), zone).await)
    }

    /// Instance queries scoped to the current configuration.
    pub fn registry(&self) -> InstanceRegistry {
        InstanceRegistry::new(self.backend.clone(), self.config())
    }

    /// Rule group management scoped to the current configuration.
    pub fn security_groups(&self) -> SecurityGroupManager {
        SecurityGroupManager::new(self.backend.clone(), self.classifier.clone(), self.config())
    }

    /// Teardown operations scoped to the current configuration.
    pub fn terminator(&self) -> LifecycleTerminator {
        LifecycleTerminator::new(self.backend.clone(), self.classifier.clone(), self.config())
    }

    /// Merges metadata tags onto a running instance.
    pub async fn tag_instance(&self, id: &str, tags: &HashMap<String, String>) -> Result<()> {
        let result = self
            .backend
            .set_server_metadata(id, tags)
            .await
            .map_err(ProvisionError::from);
        self.noting(result)
    }

    /// Validates a request without provisioning anything: the placement
    /// must parse and agree with volume zones, and an explicit instance
    /// type must exist in the live catalog.
    pub async fn precheck(&self, request: &ProvisioningRequest) -> Result<()> {
        let result = self.precheck_inner(request).await;
        self.noting(result)
    }

    async fn precheck_inner(&self, request: &ProvisioningRequest) -> Result<()> {
        derive_availability_zone(
            &self.zones,
            self.backend.as_ref(),
            request.placement.as_deref(),
            &request.volumes,
        )
        .await?;
        check_root_disk_compatibility(&request.constraints)?;
        if let Some(wanted) = &request.constraints.instance_type {
            let flavors = self.backend.list_flavors().await?;
            if !flavors.iter().any(|f| &f.name == wanted) {
                return Err(ProvisionError::InvalidFlavor(wanted.clone()));
            }
        }
        Ok(())
    }

    /// Runs one complete launch.
    ///
    /// On failure every resource provisioned so far is unwound, and the
    /// returned [`StartInstanceError`] carries both the original failure
    /// and the rollback outcome.
    pub async fn start_instance(
        &self,
        request: ProvisioningRequest,
    ) -> std::result::Result<StartedInstance, StartInstanceError> {
        let mut ledger = RollbackLedger::new();
        match self.run_launch(&request, &mut ledger).await {
            Ok(started) => {
                ledger.commit();
                Ok(started)
            }
            Err(error) => {
                self.note_backend_error(&error);
                info!(name = %request.name, error = %error, "launch failed, rolling back");
                let rollback = ledger.unwind(self.backend.as_ref()).await;
                Err(StartInstanceError { error, rollback })
            }
        }
    }

    async fn run_launch(
        &self,
        request: &ProvisioningRequest,
        ledger: &mut RollbackLedger,
    ) -> Result<StartedInstance> {
        let config = self.config();

        let zone = match &request.availability_zone {
            Some(zone) => {
                validate_requested_zone(
                    &self.zones,
                    self.backend.as_ref(),
                    zone,
                    &request.volumes,
                )
                .await?;
                Some(zone.clone())
            }
            None => {
                derive_availability_zone(
                    &self.zones,
                    self.backend.as_ref(),
                    request.placement.as_deref(),
                    &request.volumes,
                )
                .await?
            }
        };

        // Flavor and image selection failures cannot be fixed by trying
        // another zone, and neither can bad constraints.
        let flavors = self
            .backend
            .list_flavors()
            .await
            .map_err(|err| ProvisionError::zone_independent(err.into()))?;
        let validator = ConstraintValidator::new(&flavors);
        let unsupported = validator
            .validate(&request.constraints)
            .map_err(ProvisionError::zone_independent)?;
        for key in unsupported {
            warn!(constraint = %key, "ignoring unsupported constraint");
        }
        let spec = resolve_spec(
            &request.constraints,
            &request.images,
            &flavors,
            &request.architectures,
        )?;

        // A thread-local RNG would pin the future to one thread; launches
        // are spawned onto the multi-threaded runtime.
        let mut rng = StdRng::from_entropy();
        let networks = networks_for_instance(
            self.networking.as_ref(),
            config.network.as_deref(),
            zone.as_deref(),
            &request.subnets_to_zones,
            &mut rng,
        )
        .await
        .map_err(ProvisionError::zone_independent)?;

        let groups = if rule_groups_supported(self.networking.as_ref(), &networks)
            .await
            .map_err(ProvisionError::zone_independent)?
        {
            let groups = SecurityGroupManager::new(
                self.backend.clone(),
                self.classifier.clone(),
                config.clone(),
            )
            .setup_groups(&request.name, &request.ingress_rules)
            .await
            .map_err(|err| {
                ProvisionError::zone_independent(ProvisionError::GroupSetup {
                    source: Box::new(err),
                })
            })?;
            if let Some(name) = &groups.instance_group {
                ledger.record(Compensation::DeleteRuleGroup { name: name.clone() });
            }
            groups
        } else {
            LaunchGroups::default()
        };

        let (image_id, block_devices) = configure_root_disk(&request.constraints, &spec.image.id)
            .map_err(ProvisionError::zone_independent)?;
        let hardware = HardwareProfile::from_launch(
            &spec.flavor,
            Some(spec.image.arch.clone()),
            zone.as_deref(),
            &block_devices,
        );

        // Model identity tags win over caller-supplied ones.
        let mut metadata = request.tags.clone();
        metadata.extend(config.model_tags());

        let opts = CreateServerOpts {
            name: config.resource_name(&request.name),
            flavor_id: spec.flavor.id.clone(),
            image_id,
            availability_zone: zone.clone(),
            networks,
            security_groups: groups.names.clone(),
            metadata,
            user_data: request.user_data.clone(),
            block_devices,
        };

        let launcher = InstanceLauncher::new(self.backend.clone());
        let detail = launcher.launch(opts, request.status.as_ref(), ledger).await?;

        let wants_public = request
            .constraints
            .allocate_public_ip
            .unwrap_or(config.use_public_addresses);
        let mut instance = ComputeInstance::new(detail);
        if wants_public {
            let allocator = PublicAddressAllocator::new(self.backend.clone());
            let address = allocator
                .assign(&self.address_lock, instance.id(), ledger)
                .await?;
            instance.public_address = Some(address);
        }

        info!(
            instance_id = %instance.id(),
            zone = ?zone,
            flavor = %spec.flavor.name,
            "started instance"
        );
        Ok(StartedInstance { instance, hardware })
    }

    fn noting<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.note_backend_error(err);
        }
        result
    }
}
