//! Public address allocation and association
//!
//! Backends hand out the first free address they know of, so two launches
//! allocating concurrently can be given the same one. The allocate plus
//! associate pair therefore runs under a session-wide mutex held across
//! both remote calls; only an associated address stops being free.

use crate::error::{ProvisionError, Result};
use crate::retry::{retry, LONG_ATTEMPT};
use crate::rollback::{Compensation, RollbackLedger};
use armada_cloud::ComputeBackend;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Allocates and associates public addresses to new instances.
pub struct PublicAddressAllocator {
    backend: Arc<dyn ComputeBackend>,
}

impl PublicAddressAllocator {
    pub fn new(backend: Arc<dyn ComputeBackend>) -> Self {
        Self { backend }
    }

    /// Allocates an address and associates it with the instance, holding
    /// `lock` across both calls. The allocated address is registered on
    /// the ledger before association, so a failed association leaves it
    /// to the unwind to release.
    ///
    /// Association is retried on a long budget: backends reject it while
    /// the instance's network information is still being cached.
    pub async fn assign(
        &self,
        lock: &Mutex<()>,
        server_id: &str,
        ledger: &mut RollbackLedger,
    ) -> Result<String> {
        let _guard = lock.lock().await;

        let allocated = self.backend.allocate_public_address().await.map_err(|err| {
            ProvisionError::zone_independent(ProvisionError::PublicAddressAllocation {
                source: err,
            })
        })?;
        ledger.record(Compensation::ReleaseAddress {
            address: allocated.address.clone(),
        });

        let associate = retry(
            LONG_ATTEMPT,
            |_| {
                self.backend
                    .associate_public_address(&allocated.address, server_id)
            },
            |_| true,
        )
        .await;
        match associate {
            Ok(()) => {
                info!(address = %allocated.address, server_id, "associated public address");
                Ok(allocated.address)
            }
            Err(err) => Err(ProvisionError::zone_independent(
                ProvisionError::PublicAddressAssignment {
                    address: allocated.address.clone(),
                    server_id: server_id.to_string(),
                    source: Box::new(ProvisionError::Backend(err.into_inner())),
                },
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::StubBackend;
    use armada_cloud::BackendError;
    use std::collections::HashMap;
    use std::collections::HashSet;

    #[tokio::test]
    async fn test_concurrent_assignments_get_distinct_addresses() {
        let backend = Arc::new(StubBackend::new());
        let lock = Arc::new(Mutex::new(()));
        let mut servers = Vec::new();
        for i in 0..4 {
            servers.push(backend.seed_server(&format!("web-{i}"), HashMap::new()));
        }

        let mut handles = Vec::new();
        for server_id in servers {
            let backend = backend.clone();
            let lock = lock.clone();
            handles.push(tokio::spawn(async move {
                let allocator = PublicAddressAllocator::new(backend.clone());
                let mut ledger = RollbackLedger::new();
                allocator.assign(&lock, &server_id, &mut ledger).await
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            let address = handle.await.unwrap().unwrap();
            assert!(seen.insert(address), "an address was handed out twice");
        }
        assert_eq!(backend.associated_addresses().len(), 4);
    }

    #[tokio::test]
    async fn test_allocation_failure_is_zone_independent() {
        let backend = Arc::new(StubBackend::new());
        backend.fail_next(
            "allocate_address",
            BackendError::Api("Floating IP quota exceeded".into()),
        );
        let allocator = PublicAddressAllocator::new(backend.clone());
        let lock = Mutex::new(());
        let mut ledger = RollbackLedger::new();

        let err = allocator.assign(&lock, "srv-1", &mut ledger).await.unwrap_err();
        assert!(err.is_zone_independent());
        assert!(err.to_string().contains("cannot allocate a public address"));
        assert!(ledger.unwind(backend.as_ref()).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_association_retries_until_network_is_ready() {
        let backend = Arc::new(StubBackend::new());
        let server_id = backend.seed_server("web-0", HashMap::new());
        backend.set_associate_failures(2);
        let allocator = PublicAddressAllocator::new(backend.clone());
        let lock = Mutex::new(());
        let mut ledger = RollbackLedger::new();

        let address = allocator.assign(&lock, &server_id, &mut ledger).await.unwrap();
        assert_eq!(backend.counts().associate_address, 3);
        assert_eq!(
            backend.associated_addresses().get(&address),
            Some(&server_id)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_association_exhaustion_names_address_and_instance() {
        let backend = Arc::new(StubBackend::new());
        let server_id = backend.seed_server("web-0", HashMap::new());
        backend.set_associate_failures(u32::MAX);
        let allocator = PublicAddressAllocator::new(backend.clone());
        let lock = Mutex::new(());
        let mut ledger = RollbackLedger::new();

        let err = allocator.assign(&lock, &server_id, &mut ledger).await.unwrap_err();
        let text = err.to_string();
        assert!(text.contains("cannot assign public address"));
        assert!(text.contains(&server_id));

        // The unwind hands the address back.
        let report = ledger.unwind(backend.as_ref()).await;
        assert!(report.is_clean());
        assert_eq!(backend.counts().release_address, 1);
        assert!(backend.held_addresses().is_empty());
    }
}
