//! Hardware constraint parsing, validation and resolution
//!
//! Constraints arrive in the canonical `key=value ...` string form, are
//! validated against a vocabulary built from the live flavor catalog, and
//! are finally resolved into a concrete flavor plus a bootable image.

use crate::error::{ProvisionError, Result};
use crate::request::ImageCandidate;
use armada_cloud::Flavor;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Virtualization kinds accepted by the `virt-type` constraint.
pub const VIRT_TYPES: &[&str] = &["kvm", "lxd"];

/// Values accepted for `root-disk-source`. A local, image-backed root disk
/// is the implicit default and is never spelled out explicitly.
pub const ROOT_DISK_SOURCES: &[&str] = &["volume"];

/// A typed hardware constraint set. Unset fields impose nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraints {
    /// Exact flavor name. Conflicts with `cores` and `mem`.
    pub instance_type: Option<String>,

    /// CPU architecture, e.g. `amd64`.
    pub arch: Option<String>,

    /// Minimum CPU core count.
    pub cores: Option<u64>,

    /// Minimum CPU power. Unsupported here; accepted and warned about.
    pub cpu_power: Option<u64>,

    /// Minimum memory in MiB.
    pub mem_mib: Option<u64>,

    /// Minimum root disk size in MiB.
    pub root_disk_mib: Option<u64>,

    /// Where the root disk lives, see [`ROOT_DISK_SOURCES`].
    pub root_disk_source: Option<String>,

    /// Virtualization kind, see [`VIRT_TYPES`].
    pub virt_type: Option<String>,

    /// Network spaces the instance must reach.
    pub spaces: Option<Vec<String>>,

    /// Instance tags. Unsupported here; accepted and warned about.
    pub tags: Option<Vec<String>>,

    /// Overrides the session-wide public-address setting for one launch.
    pub allocate_public_ip: Option<bool>,
}

impl Constraints {
    /// Whether the request carries space constraints, which force
    /// subnet-aware network resolution.
    pub fn has_spaces(&self) -> bool {
        self.spaces.as_ref().is_some_and(|s| !s.is_empty())
    }
}

fn parse_size_mib(value: &str) -> Option<u64> {
    let (digits, mult) = if let Some(rest) = value.strip_suffix('M') {
        (rest, 1.0)
    } else if let Some(rest) = value.strip_suffix('G') {
        (rest, 1024.0)
    } else if let Some(rest) = value.strip_suffix('T') {
        (rest, 1024.0 * 1024.0)
    } else if let Some(rest) = value.strip_suffix('P') {
        (rest, 1024.0 * 1024.0 * 1024.0)
    } else {
        (value, 1.0)
    };
    let n: f64 = digits.parse().ok()?;
    if !n.is_finite() || n < 0.0 {
        return None;
    }
    Some((n * mult).ceil() as u64)
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl FromStr for Constraints {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self> {
        let mut cons = Constraints::default();
        for token in s.split_whitespace() {
            let (key, value) = token
                .split_once('=')
                .ok_or_else(|| ProvisionError::MalformedConstraint(token.to_string()))?;
            let malformed = || ProvisionError::MalformedConstraint(token.to_string());
            match key {
                "instance-type" => cons.instance_type = Some(value.to_string()),
                "arch" => cons.arch = Some(value.to_string()),
                "cores" => cons.cores = Some(value.parse().map_err(|_| malformed())?),
                "cpu-power" => cons.cpu_power = Some(value.parse().map_err(|_| malformed())?),
                "mem" => cons.mem_mib = Some(parse_size_mib(value).ok_or_else(malformed)?),
                "root-disk" => {
                    cons.root_disk_mib = Some(parse_size_mib(value).ok_or_else(malformed)?)
                }
                "root-disk-source" => cons.root_disk_source = Some(value.to_string()),
                "virt-type" => cons.virt_type = Some(value.to_string()),
                "spaces" => cons.spaces = Some(parse_list(value)),
                "tags" => cons.tags = Some(parse_list(value)),
                "allocate-public-ip" => {
                    cons.allocate_public_ip = Some(value.parse().map_err(|_| malformed())?)
                }
                other => return Err(ProvisionError::UnknownConstraint(other.to_string())),
            }
        }
        Ok(cons)
    }
}

impl fmt::Display for Constraints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(v) = &self.arch {
            parts.push(format!("arch={v}"));
        }
        if let Some(v) = self.cores {
            parts.push(format!("cores={v}"));
        }
        if let Some(v) = self.cpu_power {
            parts.push(format!("cpu-power={v}"));
        }
        if let Some(v) = self.mem_mib {
            parts.push(format!("mem={v}M"));
        }
        if let Some(v) = self.root_disk_mib {
            parts.push(format!("root-disk={v}M"));
        }
        if let Some(v) = &self.root_disk_source {
            parts.push(format!("root-disk-source={v}"));
        }
        if let Some(v) = &self.instance_type {
            parts.push(format!("instance-type={v}"));
        }
        if let Some(v) = &self.virt_type {
            parts.push(format!("virt-type={v}"));
        }
        if let Some(v) = &self.spaces {
            parts.push(format!("spaces={}", v.join(",")));
        }
        if let Some(v) = &self.tags {
            parts.push(format!("tags={}", v.join(",")));
        }
        if let Some(v) = self.allocate_public_ip {
            parts.push(format!("allocate-public-ip={v}"));
        }
        write!(f, "{}", parts.join(" "))
    }
}

/// The concrete launch spec produced by constraint resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSpec {
    /// Flavor the instance will run as.
    pub flavor: Flavor,

    /// Image the instance will boot from.
    pub image: ImageCandidate,
}

/// Validates constraint sets against the live catalog.
///
/// Conflicts: `instance-type` against `cores` and `mem`. Unsupported keys
/// (`tags`, `cpu-power`) are reported back as warnings rather than errors.
pub struct ConstraintValidator {
    instance_types: Vec<String>,
}

impl ConstraintValidator {
    /// Builds the validator vocabulary from the live flavor catalog.
    pub fn new(flavors: &[Flavor]) -> Self {
        let mut instance_types: Vec<String> = flavors.iter().map(|f| f.name.clone()).collect();
        instance_types.sort();
        Self { instance_types }
    }

    /// Checks conflicts and vocabularies. Returns the names of any
    /// unsupported constraint keys present, as warnings.
    pub fn validate(&self, cons: &Constraints) -> Result<Vec<String>> {
        if cons.instance_type.is_some() {
            if cons.mem_mib.is_some() {
                return Err(ProvisionError::ConstraintConflict(
                    "instance-type".into(),
                    "mem".into(),
                ));
            }
            if cons.cores.is_some() {
                return Err(ProvisionError::ConstraintConflict(
                    "instance-type".into(),
                    "cores".into(),
                ));
            }
        }

        if let Some(name) = &cons.instance_type {
            if !self.instance_types.iter().any(|t| t == name) {
                return Err(ProvisionError::InvalidConstraintValue {
                    key: "instance-type".into(),
                    value: name.clone(),
                    allowed: self.instance_types.clone(),
                });
            }
        }
        if let Some(virt) = &cons.virt_type {
            if !VIRT_TYPES.contains(&virt.as_str()) {
                return Err(ProvisionError::InvalidConstraintValue {
                    key: "virt-type".into(),
                    value: virt.clone(),
                    allowed: VIRT_TYPES.iter().map(|s| s.to_string()).collect(),
                });
            }
        }
        if let Some(source) = &cons.root_disk_source {
            if !ROOT_DISK_SOURCES.contains(&source.as_str()) {
                return Err(ProvisionError::InvalidConstraintValue {
                    key: "root-disk-source".into(),
                    value: source.clone(),
                    allowed: ROOT_DISK_SOURCES.iter().map(|s| s.to_string()).collect(),
                });
            }
        }

        let mut unsupported = Vec::new();
        if cons.tags.is_some() {
            unsupported.push("tags".to_string());
        }
        if cons.cpu_power.is_some() {
            unsupported.push("cpu-power".to_string());
        }
        Ok(unsupported)
    }

    /// Merges two constraint sets. `overrides` wins on overlap; fallback
    /// values that would conflict with an override are dropped rather than
    /// merged in.
    pub fn merge(&self, base: &Constraints, overrides: &Constraints) -> Constraints {
        let mut merged = overrides.clone();
        let override_has_size = merged.mem_mib.is_some() || merged.cores.is_some();

        if merged.instance_type.is_none() && !override_has_size {
            merged.instance_type = base.instance_type.clone();
        }
        let keep_sizes = merged.instance_type.is_none();
        if merged.cores.is_none() && keep_sizes {
            merged.cores = base.cores;
        }
        if merged.mem_mib.is_none() && keep_sizes {
            merged.mem_mib = base.mem_mib;
        }

        merged.arch = merged.arch.or_else(|| base.arch.clone());
        merged.cpu_power = merged.cpu_power.or(base.cpu_power);
        merged.root_disk_mib = merged.root_disk_mib.or(base.root_disk_mib);
        merged.root_disk_source = merged
            .root_disk_source
            .or_else(|| base.root_disk_source.clone());
        merged.virt_type = merged.virt_type.or_else(|| base.virt_type.clone());
        merged.spaces = merged.spaces.or_else(|| base.spaces.clone());
        merged.tags = merged.tags.or_else(|| base.tags.clone());
        merged.allocate_public_ip = merged.allocate_public_ip.or(base.allocate_public_ip);
        merged
    }
}

/// Rejects root-disk sizing combined with an explicit instance type, which
/// only makes sense when the root disk is volume-backed.
pub fn check_root_disk_compatibility(cons: &Constraints) -> Result<()> {
    if cons.root_disk_mib.is_some()
        && cons.instance_type.is_some()
        && cons.root_disk_source.as_deref() != Some("volume")
    {
        return Err(ProvisionError::RootDiskWithInstanceType);
    }
    Ok(())
}

/// Resolves constraints and image candidates into a [`ResolvedSpec`].
///
/// An explicit instance type must exist by name; otherwise the smallest
/// flavor satisfying the core/memory bounds wins, ordered by memory then
/// cores. The image is the first candidate whose architecture is acceptable.
/// Both failure modes are zone independent.
pub fn resolve_spec(
    cons: &Constraints,
    images: &[ImageCandidate],
    flavors: &[Flavor],
    architectures: &[String],
) -> Result<ResolvedSpec> {
    let flavor = match &cons.instance_type {
        Some(name) => flavors
            .iter()
            .find(|f| &f.name == name)
            .cloned()
            .ok_or_else(|| {
                ProvisionError::zone_independent(ProvisionError::InvalidFlavor(name.clone()))
            })?,
        None => {
            let mut candidates: Vec<&Flavor> = flavors
                .iter()
                .filter(|f| {
                    cons.cores.is_none_or(|min| u64::from(f.vcpus) >= min)
                        && cons.mem_mib.is_none_or(|min| f.ram_mib >= min)
                })
                .collect();
            candidates.sort_by_key(|f| (f.ram_mib, f.vcpus));
            candidates.first().cloned().cloned().ok_or_else(|| {
                ProvisionError::zone_independent(ProvisionError::NoMatchingFlavor(
                    cons.to_string(),
                ))
            })?
        }
    };

    let arch_ok = |arch: &str| {
        if let Some(required) = &cons.arch {
            return arch == required;
        }
        architectures.is_empty() || architectures.iter().any(|a| a == arch)
    };
    let image = images
        .iter()
        .find(|img| arch_ok(&img.arch))
        .cloned()
        .ok_or_else(|| {
            let wanted = cons
                .arch
                .clone()
                .unwrap_or_else(|| architectures.join(","));
            ProvisionError::zone_independent(ProvisionError::NoMatchingImage(wanted))
        })?;

    Ok(ResolvedSpec { flavor, image })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Vec<Flavor> {
        vec![
            Flavor {
                id: "1".into(),
                name: "m1.small".into(),
                vcpus: 1,
                ram_mib: 2048,
                root_disk_gib: 20,
            },
            Flavor {
                id: "2".into(),
                name: "m1.medium".into(),
                vcpus: 2,
                ram_mib: 4096,
                root_disk_gib: 40,
            },
            Flavor {
                id: "3".into(),
                name: "m1.large".into(),
                vcpus: 4,
                ram_mib: 8192,
                root_disk_gib: 80,
            },
        ]
    }

    #[test]
    fn test_parse_canonical_form() {
        let cons: Constraints = "cores=2 mem=4G root-disk=10240M spaces=db,web"
            .parse()
            .unwrap();
        assert_eq!(cons.cores, Some(2));
        assert_eq!(cons.mem_mib, Some(4096));
        assert_eq!(cons.root_disk_mib, Some(10240));
        assert_eq!(cons.spaces, Some(vec!["db".to_string(), "web".to_string()]));
    }

    #[test]
    fn test_parse_rejects_unknown_key() {
        let err = "cores=2 gpus=1".parse::<Constraints>().unwrap_err();
        assert!(matches!(err, ProvisionError::UnknownConstraint(key) if key == "gpus"));
    }

    #[test]
    fn test_parse_rejects_malformed_value() {
        let err = "mem=lots".parse::<Constraints>().unwrap_err();
        assert!(matches!(err, ProvisionError::MalformedConstraint(_)));
    }

    #[test]
    fn test_display_round_trips() {
        let cons: Constraints = "arch=amd64 cores=2 mem=4096M instance-type=m1.medium"
            .parse()
            .unwrap();
        let rendered = cons.to_string();
        let reparsed: Constraints = rendered.parse().unwrap();
        assert_eq!(cons, reparsed);
    }

    #[test]
    fn test_validate_conflicting_pairs() {
        let validator = ConstraintValidator::new(&catalog());
        let cons: Constraints = "instance-type=m1.small mem=4G".parse().unwrap();
        let err = validator.validate(&cons).unwrap_err();
        assert!(matches!(err, ProvisionError::ConstraintConflict(a, b)
            if a == "instance-type" && b == "mem"));
    }

    #[test]
    fn test_validate_vocabulary_names_allowed_values() {
        let validator = ConstraintValidator::new(&catalog());
        let cons: Constraints = "instance-type=m9.gigantic".parse().unwrap();
        match validator.validate(&cons).unwrap_err() {
            ProvisionError::InvalidConstraintValue { key, value, allowed } => {
                assert_eq!(key, "instance-type");
                assert_eq!(value, "m9.gigantic");
                assert_eq!(allowed, vec!["m1.large", "m1.medium", "m1.small"]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_validate_reports_unsupported_as_warnings() {
        let validator = ConstraintValidator::new(&catalog());
        let cons: Constraints = "tags=gpu cpu-power=100 cores=2".parse().unwrap();
        let warnings = validator.validate(&cons).unwrap();
        assert_eq!(warnings, vec!["tags", "cpu-power"]);
    }

    #[test]
    fn test_validate_root_disk_source_vocabulary() {
        let validator = ConstraintValidator::new(&catalog());
        let cons: Constraints = "root-disk-source=local".parse().unwrap();
        assert!(matches!(
            validator.validate(&cons).unwrap_err(),
            ProvisionError::InvalidConstraintValue { key, .. } if key == "root-disk-source"
        ));
    }

    #[test]
    fn test_merge_overrides_win() {
        let validator = ConstraintValidator::new(&catalog());
        let base: Constraints = "cores=2 mem=4G arch=amd64".parse().unwrap();
        let overrides: Constraints = "mem=8G".parse().unwrap();
        let merged = validator.merge(&base, &overrides);
        assert_eq!(merged.mem_mib, Some(8192));
        assert_eq!(merged.cores, Some(2));
        assert_eq!(merged.arch, Some("amd64".into()));
    }

    #[test]
    fn test_merge_drops_conflicting_fallbacks() {
        let validator = ConstraintValidator::new(&catalog());
        let base: Constraints = "cores=2 mem=4G".parse().unwrap();
        let overrides: Constraints = "instance-type=m1.large".parse().unwrap();
        let merged = validator.merge(&base, &overrides);
        assert_eq!(merged.instance_type, Some("m1.large".into()));
        assert_eq!(merged.cores, None);
        assert_eq!(merged.mem_mib, None);
    }

    #[test]
    fn test_resolve_spec_picks_smallest_satisfying_flavor() {
        let cons: Constraints = "cores=2".parse().unwrap();
        let images = vec![ImageCandidate::new("img-1", "amd64")];
        let spec = resolve_spec(&cons, &images, &catalog(), &["amd64".into()]).unwrap();
        assert_eq!(spec.flavor.name, "m1.medium");
        assert_eq!(spec.image.id, "img-1");
    }

    #[test]
    fn test_resolve_spec_explicit_instance_type_must_exist() {
        let cons: Constraints = "instance-type=m9.gigantic".parse().unwrap();
        let images = vec![ImageCandidate::new("img-1", "amd64")];
        let err = resolve_spec(&cons, &images, &catalog(), &[]).unwrap_err();
        assert!(err.is_zone_independent());
        assert!(err.to_string().contains("m9.gigantic"));
    }

    #[test]
    fn test_resolve_spec_matches_image_architecture() {
        let cons = Constraints::default();
        let images = vec![
            ImageCandidate::new("img-arm", "arm64"),
            ImageCandidate::new("img-amd", "amd64"),
        ];
        let spec = resolve_spec(&cons, &images, &catalog(), &["amd64".into()]).unwrap();
        assert_eq!(spec.image.id, "img-amd");

        let err = resolve_spec(&cons, &images, &catalog(), &["ppc64el".into()]).unwrap_err();
        assert!(err.is_zone_independent());
    }

    #[test]
    fn test_root_disk_requires_volume_source_with_instance_type() {
        let cons: Constraints = "instance-type=m1.small root-disk=10G".parse().unwrap();
        assert!(matches!(
            check_root_disk_compatibility(&cons).unwrap_err(),
            ProvisionError::RootDiskWithInstanceType
        ));

        let cons: Constraints = "instance-type=m1.small root-disk=10G root-disk-source=volume"
            .parse()
            .unwrap();
        assert!(check_root_disk_compatibility(&cons).is_ok());
    }
}
