//! Provisioning request vocabulary
//!
//! A [`ProvisioningRequest`] bundles everything a single launch needs:
//! the instance name, resolved constraints, placement input, volume
//! attachments, candidate images and the ingress rules to open at birth.

use crate::constraints::Constraints;
use armada_cloud::{NoopReporter, StatusReporter};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A volume the new instance must be able to attach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeAttachment {
    /// Backend identifier of the volume.
    pub volume_id: String,

    /// Availability zone the volume lives in.
    pub zone: String,
}

impl VolumeAttachment {
    pub fn new(volume_id: impl Into<String>, zone: impl Into<String>) -> Self {
        Self {
            volume_id: volume_id.into(),
            zone: zone.into(),
        }
    }
}

/// A bootable image candidate, qualified by CPU architecture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageCandidate {
    /// Backend identifier of the image.
    pub id: String,

    /// Architecture the image is built for, e.g. `amd64`.
    pub arch: String,
}

impl ImageCandidate {
    pub fn new(id: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            arch: arch.into(),
        }
    }
}

/// An ingress permission, expanded to one backend rule per source CIDR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressRule {
    /// Transport protocol, e.g. `tcp`, `udp` or `icmp`.
    pub protocol: String,

    /// First port of the permitted range.
    pub port_min: u16,

    /// Last port of the permitted range.
    pub port_max: u16,

    /// Source CIDRs granted access. Empty means everywhere.
    pub source_cidrs: Vec<String>,
}

impl IngressRule {
    pub fn new(protocol: impl Into<String>, port_min: u16, port_max: u16) -> Self {
        Self {
            protocol: protocol.into(),
            port_min,
            port_max,
            source_cidrs: Vec::new(),
        }
    }

    /// Restricts the rule to the given source CIDRs.
    pub fn with_sources<I, S>(mut self, cidrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.source_cidrs = cidrs.into_iter().map(Into::into).collect();
        self
    }
}

/// Everything needed to launch one instance.
#[derive(Clone)]
pub struct ProvisioningRequest {
    /// Instance name, unique within the model.
    pub name: String,

    /// Resolved constraints for flavor and disk selection.
    pub constraints: Constraints,

    /// Raw placement directive, e.g. `zone=az1`.
    pub placement: Option<String>,

    /// Availability zone chosen by the caller's scheduler, if any.
    pub availability_zone: Option<String>,

    /// Candidate subnets keyed by provider id, each with the zones it
    /// spans. Populated when space constraints are in play.
    pub subnets_to_zones: HashMap<String, Vec<String>>,

    /// Volumes that must be attachable from the instance's zone.
    pub volumes: Vec<VolumeAttachment>,

    /// Ingress rules to open on the instance's own rule group.
    pub ingress_rules: Vec<IngressRule>,

    /// Extra metadata tags to stamp on the instance.
    pub tags: HashMap<String, String>,

    /// Opaque boot payload handed to the backend untouched.
    pub user_data: Option<Vec<u8>>,

    /// Bootable images to choose from, matched by architecture.
    pub images: Vec<ImageCandidate>,

    /// Architectures acceptable to the caller, in preference order.
    /// Empty means any.
    pub architectures: Vec<String>,

    /// Receives progress callbacks while the launch runs.
    pub status: Arc<dyn StatusReporter>,
}

impl ProvisioningRequest {
    /// Creates a request with no constraints and a no-op status reporter.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            constraints: Constraints::default(),
            placement: None,
            availability_zone: None,
            subnets_to_zones: HashMap::new(),
            volumes: Vec::new(),
            ingress_rules: Vec::new(),
            tags: HashMap::new(),
            user_data: None,
            images: Vec::new(),
            architectures: Vec::new(),
            status: Arc::new(NoopReporter),
        }
    }

    pub fn with_constraints(mut self, constraints: Constraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn with_placement(mut self, placement: impl Into<String>) -> Self {
        self.placement = Some(placement.into());
        self
    }

    pub fn with_availability_zone(mut self, zone: impl Into<String>) -> Self {
        self.availability_zone = Some(zone.into());
        self
    }

    pub fn with_volume(mut self, volume: VolumeAttachment) -> Self {
        self.volumes.push(volume);
        self
    }

    pub fn with_image(mut self, image: ImageCandidate) -> Self {
        self.images.push(image);
        self
    }

    pub fn with_ingress_rule(mut self, rule: IngressRule) -> Self {
        self.ingress_rules.push(rule);
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_user_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.user_data = Some(data.into());
        self
    }

    pub fn with_status_reporter(mut self, reporter: Arc<dyn StatusReporter>) -> Self {
        self.status = reporter;
        self
    }
}

impl fmt::Debug for ProvisioningRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisioningRequest")
            .field("name", &self.name)
            .field("constraints", &self.constraints)
            .field("placement", &self.placement)
            .field("availability_zone", &self.availability_zone)
            .field("subnets_to_zones", &self.subnets_to_zones)
            .field("volumes", &self.volumes)
            .field("ingress_rules", &self.ingress_rules)
            .field("tags", &self.tags)
            .field("user_data_len", &self.user_data.as_ref().map(Vec::len))
            .field("images", &self.images)
            .field("architectures", &self.architectures)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_accumulates_volumes_and_rules() {
        let request = ProvisioningRequest::new("web-0")
            .with_volume(VolumeAttachment::new("vol-1", "az1"))
            .with_ingress_rule(IngressRule::new("tcp", 80, 80).with_sources(["10.0.0.0/8"]))
            .with_tag("team", "platform");
        assert_eq!(request.volumes.len(), 1);
        assert_eq!(request.ingress_rules[0].source_cidrs, vec!["10.0.0.0/8"]);
        assert_eq!(request.tags.get("team").map(String::as_str), Some("platform"));
    }

    #[test]
    fn test_debug_elides_user_data_payload() {
        let request = ProvisioningRequest::new("web-0").with_user_data(vec![0u8; 4096]);
        let text = format!("{request:?}");
        assert!(text.contains("user_data_len: Some(4096)"));
        assert!(!text.contains("0, 0, 0"));
    }
}
