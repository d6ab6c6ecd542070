//! Placement directive parsing and zone derivation
//!
//! The target availability zone can be pinned by an explicit `zone=<name>`
//! placement directive, by the zones of volumes the instance must attach,
//! or by both, in which case they have to agree. Zones named in directives
//! are validated against the live catalog.

use crate::error::{ProvisionError, Result};
use crate::request::VolumeAttachment;
use crate::zones::ZoneCache;
use armada_cloud::ComputeBackend;

/// Parses a placement directive. Only `zone=<name>` is recognized.
pub fn parse_placement(placement: &str) -> Result<String> {
    match placement.split_once('=') {
        Some(("zone", value)) if !value.is_empty() => Ok(value.to_string()),
        _ => Err(ProvisionError::UnknownPlacement(placement.to_string())),
    }
}

/// Returns the single zone shared by all volume attachments, or `None`
/// when there are no attachments. Mixed zones are an error naming both
/// offending volumes.
pub fn volume_attachments_zone(volumes: &[VolumeAttachment]) -> Result<Option<String>> {
    let Some(first) = volumes.first() else {
        return Ok(None);
    };
    for volume in &volumes[1..] {
        if volume.zone != first.zone {
            return Err(ProvisionError::VolumeZoneConflict {
                first_volume: first.volume_id.clone(),
                first_zone: first.zone.clone(),
                second_volume: volume.volume_id.clone(),
                second_zone: volume.zone.clone(),
            });
        }
    }
    Ok(Some(first.zone.clone()))
}

/// Checks that a chosen zone does not strand the requested volumes.
pub fn validate_zone_consistency(zone: &str, volume_zone: Option<&str>) -> Result<()> {
    match volume_zone {
        Some(vz) if vz != zone => Err(ProvisionError::ZoneMismatch {
            zone: zone.to_string(),
            volume_zone: vz.to_string(),
        }),
        _ => Ok(()),
    }
}

/// Derives the target zone from the placement directive and volume
/// attachments. Returns `None` when nothing pins a zone. A backend without
/// zone support also yields `None` rather than an error.
pub async fn derive_availability_zone(
    cache: &ZoneCache,
    backend: &dyn ComputeBackend,
    placement: Option<&str>,
    volumes: &[VolumeAttachment],
) -> Result<Option<String>> {
    match derive_zone_strict(cache, backend, placement, volumes).await {
        Err(ProvisionError::Backend(err)) if err.is_not_implemented() => Ok(None),
        other => other,
    }
}

async fn derive_zone_strict(
    cache: &ZoneCache,
    backend: &dyn ComputeBackend,
    placement: Option<&str>,
    volumes: &[VolumeAttachment],
) -> Result<Option<String>> {
    let volume_zone = volume_attachments_zone(volumes).map_err(ProvisionError::zone_independent)?;
    let Some(placement) = placement.filter(|p| !p.is_empty()) else {
        return Ok(volume_zone);
    };
    let zone = parse_placement(placement)?;
    cache.validate_zone(backend, &zone).await?;
    validate_zone_consistency(&zone, volume_zone.as_deref()).map_err(|err| {
        ProvisionError::zone_independent(ProvisionError::PlacementInvalid {
            placement: placement.to_string(),
            source: Box::new(err),
        })
    })?;
    Ok(Some(zone))
}

/// Validates a caller-chosen zone: it must exist, accept placements and
/// agree with the zones of any requested volumes.
pub async fn validate_requested_zone(
    cache: &ZoneCache,
    backend: &dyn ComputeBackend,
    zone: &str,
    volumes: &[VolumeAttachment],
) -> Result<()> {
    cache.validate_zone(backend, zone).await?;
    let volume_zone = volume_attachments_zone(volumes).map_err(ProvisionError::zone_independent)?;
    validate_zone_consistency(zone, volume_zone.as_deref())
        .map_err(ProvisionError::zone_independent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::StubBackend;

    #[test]
    fn test_parse_placement_zone_directive() {
        assert_eq!(parse_placement("zone=az1").unwrap(), "az1");
        assert!(matches!(
            parse_placement("host=node-7").unwrap_err(),
            ProvisionError::UnknownPlacement(p) if p == "host=node-7"
        ));
        assert!(parse_placement("az1").is_err());
        assert!(parse_placement("zone=").is_err());
    }

    #[test]
    fn test_volume_zone_must_be_uniform() {
        let volumes = vec![
            VolumeAttachment::new("vol-1", "az1"),
            VolumeAttachment::new("vol-2", "az1"),
        ];
        assert_eq!(
            volume_attachments_zone(&volumes).unwrap(),
            Some("az1".to_string())
        );

        let mixed = vec![
            VolumeAttachment::new("vol-1", "az1"),
            VolumeAttachment::new("vol-2", "az2"),
        ];
        let err = volume_attachments_zone(&mixed).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("vol-1 is in az1"));
        assert!(text.contains("vol-2 is in az2"));
    }

    #[tokio::test]
    async fn test_derive_prefers_consistent_placement_zone() {
        let backend = StubBackend::new();
        let cache = ZoneCache::new();
        let volumes = vec![VolumeAttachment::new("vol-1", "az1")];
        let zone = derive_availability_zone(&cache, &backend, Some("zone=az1"), &volumes)
            .await
            .unwrap();
        assert_eq!(zone, Some("az1".to_string()));
    }

    #[tokio::test]
    async fn test_derive_rejects_zone_volume_mismatch() {
        let backend = StubBackend::new();
        let cache = ZoneCache::new();
        let volumes = vec![VolumeAttachment::new("vol-1", "az2")];
        let err = derive_availability_zone(&cache, &backend, Some("zone=az1"), &volumes)
            .await
            .unwrap_err();
        assert!(err.is_zone_independent());
        let text = err.to_string();
        assert!(text.contains("placement \"zone=az1\""));
        assert!(text.contains("disks in zone \"az2\""));
    }

    #[tokio::test]
    async fn test_derive_falls_back_to_volume_zone() {
        let backend = StubBackend::new();
        let cache = ZoneCache::new();
        let volumes = vec![VolumeAttachment::new("vol-1", "az2")];
        let zone = derive_availability_zone(&cache, &backend, None, &volumes)
            .await
            .unwrap();
        assert_eq!(zone, Some("az2".to_string()));

        let none = derive_availability_zone(&cache, &backend, None, &[])
            .await
            .unwrap();
        assert_eq!(none, None);
    }

    #[tokio::test]
    async fn test_derive_tolerates_missing_zone_support() {
        let backend = StubBackend::new();
        backend.set_zones_not_implemented(true);
        let cache = ZoneCache::new();
        let zone = derive_availability_zone(&cache, &backend, Some("zone=az1"), &[])
            .await
            .unwrap();
        assert_eq!(zone, None);
    }

    #[tokio::test]
    async fn test_requested_zone_checked_against_catalog_and_volumes() {
        let backend = StubBackend::new();
        let cache = ZoneCache::new();
        assert!(validate_requested_zone(&cache, &backend, "az1", &[])
            .await
            .is_ok());
        assert!(matches!(
            validate_requested_zone(&cache, &backend, "az3", &[])
                .await
                .unwrap_err(),
            ProvisionError::ZoneUnavailable(_)
        ));

        let volumes = vec![VolumeAttachment::new("vol-1", "az2")];
        let err = validate_requested_zone(&cache, &backend, "az1", &volumes)
            .await
            .unwrap_err();
        assert!(err.is_zone_independent());
    }
}
