//! Provisioning error types
//!
//! The taxonomy distinguishes validation failures (never retried), transient
//! backend failures (retried within a bounded budget), terminal launch
//! failures (compensated then surfaced), not-found (success for deletes,
//! empty result for queries) and credential denial (short-circuits batches).
//! Errors for which switching availability zone cannot help are wrapped in
//! [`ProvisionError::ZoneIndependent`] so schedulers know not to try the
//! next zone.

use armada_cloud::BackendError;
use std::time::Duration;
use thiserror::Error;

/// Marker text backends emit when a zone has no capacity left.
///
/// A launch failure carrying this text is worth retrying in another zone;
/// every other launch failure is not.
pub const NO_VALID_HOST_MARKER: &str = "No valid host was found";

/// Provisioning errors
#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("unknown placement directive: {0}")]
    UnknownPlacement(String),

    #[error("availability zone {0:?} not valid")]
    ZoneNotValid(String),

    #[error("availability zone {0:?} is unavailable")]
    ZoneUnavailable(String),

    #[error(
        "cannot attach volumes from multiple availability zones: \
         {first_volume} is in {first_zone}, {second_volume} is in {second_zone}"
    )]
    VolumeZoneConflict {
        first_volume: String,
        first_zone: String,
        second_volume: String,
        second_zone: String,
    },

    #[error(
        "cannot create instance in zone {zone:?}, as this will prevent \
         attaching the requested disks in zone {volume_zone:?}"
    )]
    ZoneMismatch { zone: String, volume_zone: String },

    #[error("cannot create instance with placement {placement:?}: {source}")]
    PlacementInvalid {
        placement: String,
        #[source]
        source: Box<ProvisionError>,
    },

    #[error("ambiguous constraints: {0:?} overlaps with {1:?}")]
    ConstraintConflict(String, String),

    #[error("invalid constraint value: {key}={value}, valid values are: {allowed:?}")]
    InvalidConstraintValue {
        key: String,
        value: String,
        allowed: Vec<String>,
    },

    #[error("unknown constraint {0:?}")]
    UnknownConstraint(String),

    #[error("malformed constraint {0:?}")]
    MalformedConstraint(String),

    #[error(
        "constraint root-disk cannot be specified with instance-type \
         unless constraint root-disk-source=volume"
    )]
    RootDiskWithInstanceType,

    #[error("invalid flavor {0:?} specified")]
    InvalidFlavor(String),

    #[error("no flavor satisfies constraints {0:?}")]
    NoMatchingFlavor(String),

    #[error("no candidate image matches architecture {0:?}")]
    NoMatchingImage(String),

    #[error("multiple networks match {name:?}: {matches:?}")]
    NetworkAmbiguous { name: String, matches: Vec<String> },

    #[error("multiple networks available, set the network configuration to choose one: {0:?}")]
    NoDefaultNetwork(Vec<String>),

    #[error("no network matching {0:?}")]
    NetworkNotFound(String),

    #[error("no subnets found in availability zone {0:?}")]
    NoSubnetsInZone(String),

    #[error("invalid root-disk-source {0:?}, expected local or volume")]
    InvalidRootDiskSource(String),

    #[error("server create returned no entity, backend may have lost the request")]
    LostCreateResponse,

    #[error("instance {0:?} still building")]
    StillBuilding(String),

    #[error("cannot run instance {server_id:?}: {fault}")]
    LaunchFailed { server_id: String, fault: String },

    #[error("cannot allocate a public address: {source}")]
    PublicAddressAllocation {
        #[source]
        source: BackendError,
    },

    #[error("cannot assign public address {address} to instance {server_id:?}: {source}")]
    PublicAddressAssignment {
        address: String,
        server_id: String,
        #[source]
        source: Box<ProvisionError>,
    },

    #[error("timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },

    #[error("instances not found")]
    NoInstances,

    #[error("cannot delete instance: {source}")]
    DeleteInstance {
        #[source]
        source: BackendError,
    },

    #[error("error updating controller tag for some resources: {0:?}")]
    AdoptionIncomplete(Vec<String>),

    #[error("errors updating controller for rule groups: {0:?}")]
    GroupAdoptionIncomplete(Vec<String>),

    #[error("invalid firewall mode {mode:?} for {operation}")]
    InvalidFirewallMode { mode: String, operation: String },

    #[error("cannot set up groups: {source}")]
    GroupSetup {
        #[source]
        source: Box<ProvisionError>,
    },

    #[error("credentials rejected by backend: {source}")]
    CredentialDenied {
        #[source]
        source: BackendError,
    },

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    ZoneIndependent(Box<ProvisionError>),
}

impl ProvisionError {
    /// Wraps an error to mark that retrying in another zone cannot help.
    /// Already wrapped errors are returned untouched.
    pub fn zone_independent(err: ProvisionError) -> ProvisionError {
        match err {
            wrapped @ ProvisionError::ZoneIndependent(_) => wrapped,
            // Credential denial already halts the whole batch; marking it
            // zone-independent would only bury the classification.
            denied @ ProvisionError::CredentialDenied { .. } => denied,
            other => ProvisionError::ZoneIndependent(Box::new(other)),
        }
    }

    /// Whether the caller should avoid retrying in a different zone.
    pub fn is_zone_independent(&self) -> bool {
        matches!(self, ProvisionError::ZoneIndependent(_))
    }

    /// Whether this error is a credential denial (at any wrapping depth).
    pub fn is_credential_denied(&self) -> bool {
        match self {
            ProvisionError::CredentialDenied { .. } => true,
            ProvisionError::ZoneIndependent(inner) => inner.is_credential_denied(),
            ProvisionError::Backend(e) => e.is_auth_denied(),
            _ => false,
        }
    }

    /// Whether the error is a backend not-found response.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProvisionError::Backend(e) if e.is_not_found())
    }

    /// Whether submitting the same call again may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ProvisionError::Backend(e) => e.is_transient(),
            ProvisionError::StillBuilding(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProvisionError>;
