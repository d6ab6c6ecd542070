//! Availability zone cache
//!
//! Zone listings change rarely, so the session caches them after the first
//! fetch and never invalidates within its lifetime. Callers needing fresh
//! data go through [`ZoneCache::zones_uncached`], which also refreshes the
//! cached copy.

use crate::error::{ProvisionError, Result};
use armada_cloud::{AvailabilityZone, ComputeBackend};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Session-scoped, populate-once zone cache.
#[derive(Default)]
pub struct ZoneCache {
    zones: Mutex<Option<Arc<Vec<AvailabilityZone>>>>,
}

impl ZoneCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the zone listing, fetching it on first use.
    ///
    /// A backend without zone support surfaces as
    /// [`armada_cloud::BackendError::NotImplemented`] so callers can treat
    /// "no zones" distinctly from an empty listing.
    pub async fn zones(&self, backend: &dyn ComputeBackend) -> Result<Arc<Vec<AvailabilityZone>>> {
        let mut cached = self.zones.lock().await;
        if let Some(zones) = cached.as_ref() {
            return Ok(Arc::clone(zones));
        }
        let fetched = Arc::new(backend.list_availability_zones().await?);
        *cached = Some(Arc::clone(&fetched));
        Ok(fetched)
    }

    /// Fetches a fresh listing, replacing the cached copy.
    pub async fn zones_uncached(
        &self,
        backend: &dyn ComputeBackend,
    ) -> Result<Arc<Vec<AvailabilityZone>>> {
        let fetched = Arc::new(backend.list_availability_zones().await?);
        *self.zones.lock().await = Some(Arc::clone(&fetched));
        Ok(fetched)
    }

    /// Checks that a zone exists and currently accepts placements.
    pub async fn validate_zone(&self, backend: &dyn ComputeBackend, name: &str) -> Result<()> {
        let zones = self.zones(backend).await?;
        match zones.iter().find(|z| z.name == name) {
            Some(zone) if zone.available => Ok(()),
            Some(_) => Err(ProvisionError::ZoneUnavailable(name.to_string())),
            None => Err(ProvisionError::ZoneNotValid(name.to_string())),
        }
    }
}
