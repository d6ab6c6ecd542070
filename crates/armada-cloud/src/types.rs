//! Data types exchanged with a compute backend
//!
//! These mirror the entities a typical IaaS control plane exposes (servers,
//! flavors, availability zones, networks, subnets, floating addresses and
//! security rule groups), reduced to the fields the provisioning core
//! actually consumes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// A hardware offering (machine size) advertised by the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flavor {
    /// Backend identifier
    pub id: String,

    /// Human-readable name (e.g. "m1.small")
    pub name: String,

    /// Number of virtual CPUs
    pub vcpus: u64,

    /// Memory in MiB
    pub ram_mib: u64,

    /// Root disk in GiB; 0 means the root disk matches the image size
    pub root_disk_gib: u64,
}

/// An availability zone and whether it currently accepts new instances
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityZone {
    /// Zone name
    pub name: String,

    /// Whether the zone is accepting placements
    pub available: bool,
}

impl AvailabilityZone {
    pub fn new(name: impl Into<String>, available: bool) -> Self {
        Self {
            name: name.into(),
            available,
        }
    }
}

/// A network instances can attach to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    /// Backend identifier
    pub id: String,

    /// Human-readable name
    pub name: String,

    /// Whether this is an external (provider/public) network
    pub external: bool,

    /// Port security flag; `None` when the backend does not report it
    pub port_security_enabled: Option<bool>,
}

/// A subnet of a network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    /// Backend identifier
    pub id: String,

    /// Owning network identifier
    pub network_id: String,

    /// CIDR block, e.g. "10.0.4.0/24"
    pub cidr: String,
}

/// Lifecycle status of a server as reported by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    /// Server is still being built
    Building,
    /// Server is up
    Active,
    /// Server hit a terminal provisioning failure
    Error,
    /// Server is powered off but still allocated
    Shutoff,
    /// Server is suspended
    Suspended,
    /// Server has been deleted
    Deleted,
    /// Backend reported a status this client does not model
    Unknown,
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerStatus::Building => write!(f, "building"),
            ServerStatus::Active => write!(f, "active"),
            ServerStatus::Error => write!(f, "error"),
            ServerStatus::Shutoff => write!(f, "shutoff"),
            ServerStatus::Suspended => write!(f, "suspended"),
            ServerStatus::Deleted => write!(f, "deleted"),
            ServerStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Failure detail attached to a server in error state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerFault {
    /// Backend fault code, when reported
    pub code: Option<i32>,

    /// Backend-supplied failure message
    pub message: String,
}

/// How an address is bound to a server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressKind {
    /// Address assigned on the attached network
    #[default]
    Fixed,
    /// Floating (re-assignable public) address
    Floating,
}

/// An IP address attached to a server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpAddress {
    /// Address literal
    pub address: String,

    /// IP version, 4 or 6
    pub version: u8,

    /// Fixed or floating
    #[serde(default)]
    pub kind: AddressKind,
}

impl IpAddress {
    pub fn fixed(address: impl Into<String>, version: u8) -> Self {
        Self {
            address: address.into(),
            version,
            kind: AddressKind::Fixed,
        }
    }

    pub fn floating(address: impl Into<String>, version: u8) -> Self {
        Self {
            address: address.into(),
            version,
            kind: AddressKind::Floating,
        }
    }
}

/// Full view of a server as reported by the backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerDetail {
    /// Backend identifier
    pub id: String,

    /// Server name
    pub name: String,

    /// Lifecycle status
    pub status: ServerStatus,

    /// Failure detail, populated when status is `Error`
    pub fault: Option<ServerFault>,

    /// Zone the server landed in, when reported
    pub availability_zone: Option<String>,

    /// Flavor the server was created with
    pub flavor_id: String,

    /// Addresses grouped by network label, in stable order
    pub addresses: BTreeMap<String, Vec<IpAddress>>,

    /// Metadata tags
    pub metadata: HashMap<String, String>,

    /// Creation timestamp
    pub created: DateTime<Utc>,
}

/// The entity a successful create call returns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedServer {
    /// Identifier of the new server
    pub id: String,
}

/// Server listing filter
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerFilter {
    /// Only servers whose name starts with this prefix
    pub name_prefix: Option<String>,
}

impl ServerFilter {
    pub fn name_prefix(prefix: impl Into<String>) -> Self {
        Self {
            name_prefix: Some(prefix.into()),
        }
    }

    /// Whether a server name passes the filter
    pub fn matches(&self, name: &str) -> bool {
        match &self.name_prefix {
            Some(prefix) => name.starts_with(prefix.as_str()),
            None => true,
        }
    }
}

/// A network to attach at create time
///
/// An attachment without a resolved network id is passed through untouched
/// and left to the backend's default behavior.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAttachment {
    /// Network identifier, when resolved
    pub network_id: Option<String>,

    /// Subnet CIDR to allocate the port from, when constrained
    pub subnet_cidr: Option<String>,
}

/// Block device mapping for volume-backed servers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDeviceMapping {
    /// Boot order position; 0 is the root device
    pub boot_index: i32,

    /// Source type, e.g. "image"
    pub source_type: String,

    /// Identifier of the source (image id for image-sourced devices)
    pub source_id: String,

    /// Destination type, e.g. "volume"
    pub destination_type: String,

    /// Volume size in GiB
    pub volume_size_gib: u64,

    /// Whether the volume is deleted together with the server
    pub delete_on_termination: bool,
}

/// Parameters for creating a server
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateServerOpts {
    /// Server name
    pub name: String,

    /// Flavor to build from
    pub flavor_id: String,

    /// Image to boot from; unset when booting from a block device
    pub image_id: Option<String>,

    /// Target availability zone
    pub availability_zone: Option<String>,

    /// Networks to attach
    pub networks: Vec<NetworkAttachment>,

    /// Security rule groups to join, by name
    pub security_groups: Vec<String>,

    /// Metadata tags
    pub metadata: HashMap<String, String>,

    /// Opaque boot-time payload, passed through verbatim
    pub user_data: Option<Vec<u8>>,

    /// Block devices; at most one root mapping
    pub block_devices: Vec<BlockDeviceMapping>,
}

/// A public (floating) address held by the project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicAddress {
    /// Backend identifier
    pub id: String,

    /// Address literal
    pub address: String,
}

/// Direction of a security rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleDirection {
    /// Traffic into the instance
    #[default]
    Ingress,
    /// Traffic out of the instance
    Egress,
}

/// A rule to add to a rule group
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RuleSpec {
    /// Rule direction
    pub direction: RuleDirection,

    /// IP protocol ("tcp", "udp", "icmp"); `None` matches any
    pub protocol: Option<String>,

    /// Lowest port in range; `None` for protocols without ports
    pub port_min: Option<u16>,

    /// Highest port in range; `None` for protocols without ports
    pub port_max: Option<u16>,

    /// Source CIDR the rule applies to
    pub remote_cidr: Option<String>,

    /// Source rule group; traffic from members of that group matches
    pub remote_group_id: Option<String>,
}

/// A rule present on a rule group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRule {
    /// Backend identifier
    pub id: String,

    /// Owning group identifier
    pub group_id: String,

    /// The rule content
    #[serde(flatten)]
    pub spec: RuleSpec,
}

/// A security rule group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleGroup {
    /// Backend identifier
    pub id: String,

    /// Group name
    pub name: String,

    /// Free-form description; carries ownership tags
    pub description: String,

    /// Current rules
    pub rules: Vec<GroupRule>,
}
