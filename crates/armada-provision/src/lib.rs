//! Armada Provisioning Core
//!
//! Cloud-agnostic instance provisioning: constraint resolution against the
//! live flavor catalog, availability zone derivation from placement
//! directives and volume attachments, network and subnet selection, rule
//! group management, and the launch loop itself with full rollback of
//! partially provisioned resources. Everything is written against the
//! [`armada_cloud::ComputeBackend`] trait; no cloud API leaks above it.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                  ProvisionSession                     │
//! │        (facade: one model against one backend)        │
//! └──┬──────────┬──────────┬──────────┬─────────┬────────┘
//!    │          │          │          │         │
//! ┌──▼───┐ ┌────▼────┐ ┌───▼────┐ ┌───▼────┐ ┌──▼──────┐
//! │zones │ │placement│ │network │ │secgroup│ │registry │
//! │cache │ │ + cons- │ │ + sub- │ │ rule   │ │ lookups │
//! │      │ │ traints │ │ nets   │ │ groups │ │         │
//! └──────┘ └─────────┘ └────────┘ └────────┘ └─────────┘
//!    launcher ── retry ── rollback ── address ── terminate
//! ```
//!
//! A launch that fails mid-flight unwinds every resource it created, in
//! reverse order, and reports what the unwind achieved. Batch teardown
//! stops at the first credential denial so a revoked account is not
//! hammered with calls that can only fail.

pub mod address;
pub mod config;
pub mod constraints;
pub mod error;
pub mod instance;
pub mod launcher;
pub mod network;
pub mod placement;
pub mod registry;
pub mod request;
pub mod retry;
pub mod rollback;
pub mod secgroup;
pub mod session;
pub mod terminate;
pub mod zones;

#[cfg(any(test, feature = "test-utils"))]
pub mod stub;

// Re-exports
pub use address::PublicAddressAllocator;
pub use config::{
    FirewallMode, ProvisionConfig, RESOURCE_PREFIX, TAG_CONTROLLER, TAG_IS_CONTROLLER, TAG_MODEL,
};
pub use constraints::{Constraints, ConstraintValidator, ResolvedSpec};
pub use error::{ProvisionError, Result, NO_VALID_HOST_MARKER};
pub use instance::{AddressScope, ComputeInstance, HardwareProfile, InstanceAddress, InstanceStatus};
pub use launcher::{InstanceLauncher, DEFAULT_ROOT_DISK_MIB};
pub use network::{DefaultNetworking, NetworkingStrategy};
pub use registry::{InstanceLookup, InstanceRegistry};
pub use request::{ImageCandidate, IngressRule, ProvisioningRequest, VolumeAttachment};
pub use retry::{RetryError, RetryPolicy, BUILD_POLL, LONG_ATTEMPT, SHORT_ATTEMPT};
pub use rollback::{Compensation, RollbackLedger, RollbackReport};
pub use secgroup::{LaunchGroups, SecurityGroupManager, OPEN_TO_ANYWHERE};
pub use session::{ProvisionSession, SessionBuilder, StartInstanceError, StartedInstance};
pub use terminate::LifecycleTerminator;
pub use zones::ZoneCache;

#[cfg(any(test, feature = "test-utils"))]
pub use stub::{CallCounts, StubBackend};
