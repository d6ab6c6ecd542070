//! Instance snapshots handed back to callers
//!
//! Wraps the backend's raw server detail with the provisioning-level view:
//! a normalized lifecycle status, a merged address list with the public
//! address first, and the hardware profile derived at launch.

use armada_cloud::{AddressKind, BlockDeviceMapping, Flavor, ServerDetail, ServerStatus};
use serde::{Deserialize, Serialize};

/// Reachability scope of one address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressScope {
    /// Reachable from outside the cloud.
    Public,
    /// Scope the backend did not declare.
    Unknown,
}

/// One address of an instance, classified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceAddress {
    /// Address literal.
    pub value: String,

    /// Reachability scope.
    pub scope: AddressScope,

    /// IP version, 4 or 6.
    pub version: u8,
}

/// Normalized lifecycle status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// The backend is still materializing the instance.
    Provisioning,
    /// Up and schedulable.
    Running,
    /// Present but not running.
    Stopped,
    /// Failed, with the backend fault text when one was reported.
    Error(String),
    /// A state this layer does not interpret, passed through raw.
    Unknown(String),
}

/// A provisioned instance as seen by callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeInstance {
    /// Raw backend detail snapshot.
    pub detail: ServerDetail,

    /// Public address held by this instance, when one is attached.
    pub public_address: Option<String>,
}

impl ComputeInstance {
    pub fn new(detail: ServerDetail) -> Self {
        Self {
            detail,
            public_address: None,
        }
    }

    pub fn with_public_address(mut self, address: impl Into<String>) -> Self {
        self.public_address = Some(address.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.detail.id
    }

    pub fn name(&self) -> &str {
        &self.detail.name
    }

    pub fn availability_zone(&self) -> Option<&str> {
        self.detail.availability_zone.as_deref()
    }

    /// Maps the backend state onto the provisioning lifecycle.
    pub fn status(&self) -> InstanceStatus {
        match self.detail.status {
            ServerStatus::Building => InstanceStatus::Provisioning,
            ServerStatus::Active => InstanceStatus::Running,
            ServerStatus::Shutoff | ServerStatus::Suspended => InstanceStatus::Stopped,
            ServerStatus::Error => {
                let fault = self
                    .detail
                    .fault
                    .as_ref()
                    .map(|f| f.message.clone())
                    .unwrap_or_else(|| "unknown failure".to_string());
                InstanceStatus::Error(fault)
            }
            other => InstanceStatus::Unknown(other.to_string()),
        }
    }

    /// All addresses, public address first, duplicates removed.
    ///
    /// Entries under the `public` network label and floating addresses are
    /// classified public; everything else keeps an unknown scope.
    pub fn addresses(&self) -> Vec<InstanceAddress> {
        let mut out = Vec::new();
        if let Some(public) = &self.public_address {
            out.push(InstanceAddress {
                value: public.clone(),
                scope: AddressScope::Public,
                version: 4,
            });
        }
        for (label, addrs) in &self.detail.addresses {
            for addr in addrs {
                if addr.address.is_empty() {
                    continue;
                }
                if Some(&addr.address) == self.public_address.as_ref() {
                    continue;
                }
                let scope = if label == "public" || addr.kind == AddressKind::Floating {
                    AddressScope::Public
                } else {
                    AddressScope::Unknown
                };
                out.push(InstanceAddress {
                    value: addr.address.clone(),
                    scope,
                    version: addr.version,
                });
            }
        }
        out
    }
}

/// Hardware reported back to the caller after a launch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareProfile {
    /// CPU architecture of the booted image.
    pub arch: Option<String>,

    /// CPU core count.
    pub cores: Option<u64>,

    /// Memory in MiB.
    pub mem_mib: Option<u64>,

    /// CPU power. Never reported by this layer.
    pub cpu_power: Option<u64>,

    /// Root disk size in MiB. `None` when the disk is image-sized.
    pub root_disk_mib: Option<u64>,

    /// Zone the instance landed in.
    pub availability_zone: Option<String>,
}

impl HardwareProfile {
    /// Derives the profile from the launch inputs. A volume-backed boot
    /// disk overrides the flavor's root disk size; a flavor root disk of
    /// zero means the disk is image-sized and stays unreported.
    pub fn from_launch(
        flavor: &Flavor,
        arch: Option<String>,
        zone: Option<&str>,
        block_devices: &[BlockDeviceMapping],
    ) -> Self {
        let boot_volume = block_devices
            .iter()
            .find(|b| b.boot_index == 0 && b.destination_type == "volume");
        let root_disk_mib = match boot_volume {
            Some(device) => Some(device.volume_size_gib * 1024),
            None if flavor.root_disk_gib == 0 => None,
            None => Some(flavor.root_disk_gib * 1024),
        };
        Self {
            arch,
            cores: Some(u64::from(flavor.vcpus)),
            mem_mib: Some(flavor.ram_mib),
            cpu_power: None,
            root_disk_mib,
            availability_zone: zone.map(str::to_string),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use armada_cloud::{IpAddress, ServerFault};
    use chrono::Utc;
    use std::collections::{BTreeMap, HashMap};

    fn detail(status: ServerStatus) -> ServerDetail {
        ServerDetail {
            id: "srv-1".into(),
            name: "armada-deadbeef-web-0".into(),
            status,
            fault: None,
            availability_zone: Some("az1".into()),
            flavor_id: "1".into(),
            addresses: BTreeMap::new(),
            metadata: HashMap::new(),
            created: Utc::now(),
        }
    }

    fn flavor() -> Flavor {
        Flavor {
            id: "1".into(),
            name: "m1.small".into(),
            vcpus: 2,
            ram_mib: 4096,
            root_disk_gib: 40,
        }
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ComputeInstance::new(detail(ServerStatus::Building)).status(),
            InstanceStatus::Provisioning
        );
        assert_eq!(
            ComputeInstance::new(detail(ServerStatus::Active)).status(),
            InstanceStatus::Running
        );
        assert_eq!(
            ComputeInstance::new(detail(ServerStatus::Shutoff)).status(),
            InstanceStatus::Stopped
        );

        let mut failed = detail(ServerStatus::Error);
        failed.fault = Some(ServerFault {
            code: Some(500),
            message: "No valid host was found".into(),
        });
        assert_eq!(
            ComputeInstance::new(failed).status(),
            InstanceStatus::Error("No valid host was found".into())
        );
    }

    #[test]
    fn test_addresses_public_first_without_duplicates() {
        let mut d = detail(ServerStatus::Active);
        d.addresses.insert(
            "internal".into(),
            vec![IpAddress::fixed("10.0.0.5", 4), IpAddress::fixed("fd00::5", 6)],
        );
        d.addresses.insert(
            "public".into(),
            vec![IpAddress::floating("203.0.113.7", 4)],
        );
        let instance = ComputeInstance::new(d).with_public_address("203.0.113.7");

        let addrs = instance.addresses();
        assert_eq!(addrs[0].value, "203.0.113.7");
        assert_eq!(addrs[0].scope, AddressScope::Public);
        // The floating entry equal to the held address is skipped.
        assert_eq!(
            addrs
                .iter()
                .filter(|a| a.value == "203.0.113.7")
                .count(),
            1
        );
        let v6 = addrs.iter().find(|a| a.value == "fd00::5").unwrap();
        assert_eq!(v6.version, 6);
        assert_eq!(v6.scope, AddressScope::Unknown);
    }

    #[test]
    fn test_hardware_profile_root_disk_variants() {
        let profile = HardwareProfile::from_launch(&flavor(), Some("amd64".into()), Some("az1"), &[]);
        assert_eq!(profile.root_disk_mib, Some(40 * 1024));
        assert_eq!(profile.cores, Some(2));

        let mut image_sized = flavor();
        image_sized.root_disk_gib = 0;
        let profile = HardwareProfile::from_launch(&image_sized, None, None, &[]);
        assert_eq!(profile.root_disk_mib, None);

        let boot_volume = BlockDeviceMapping {
            boot_index: 0,
            source_type: "image".into(),
            source_id: "img-1".into(),
            destination_type: "volume".into(),
            volume_size_gib: 10,
            delete_on_termination: true,
        };
        let profile = HardwareProfile::from_launch(&flavor(), None, None, &[boot_volume]);
        assert_eq!(profile.root_disk_mib, Some(10 * 1024));
    }
}
