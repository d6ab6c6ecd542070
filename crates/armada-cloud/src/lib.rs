//! Armada Compute Backend Abstraction
//!
//! This crate defines the capability interface the Armada provisioning core
//! is written against. A backend implementation wraps one cloud API and
//! exposes servers, flavors, zones, networks, addresses and security rule
//! groups through a single trait; everything above it is cloud-agnostic.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │               armada-provision                   │
//! │     (constraints, placement, launch, teardown)   │
//! └─────────────────┬───────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────┐
//! │                armada-cloud                      │
//! │  ┌──────────────────────────────────────────┐   │
//! │  │          Backend Abstraction              │   │
//! │  │  trait ComputeBackend { ... }             │   │
//! │  └──────────────────────────────────────────┘   │
//! │  ┌──────────────┐  ┌──────────────────────┐    │
//! │  │  Wire types  │  │  Error / credential   │    │
//! │  │              │  │  classification       │    │
//! │  └──────────────┘  └──────────────────────┘    │
//! └───────┬─────────────────┬───────────────────────┘
//!         │                 │
//! ┌───────▼───────┐ ┌───────▼───────┐
//! │  openstack    │ │   in-memory   │
//! │   backend     │ │  stub backend │
//! └───────────────┘ └───────────────┘
//! ```

pub mod backend;
pub mod error;
pub mod status;
pub mod types;

// Re-exports
pub use backend::ComputeBackend;
pub use error::{BackendError, CredentialClassifier, DeniedStatusClassifier, Result};
pub use status::{NoopReporter, ProvisioningPhase, StatusReporter, TracingReporter};
pub use types::{
    AddressKind, AvailabilityZone, BlockDeviceMapping, CreateServerOpts, CreatedServer, Flavor,
    GroupRule, IpAddress, Network, NetworkAttachment, PublicAddress, RuleDirection, RuleGroup,
    RuleSpec, ServerDetail, ServerFault, ServerFilter, ServerStatus, Subnet,
};
