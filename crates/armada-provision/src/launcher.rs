//! Instance launch state machine
//!
//! A launch submits the create call under a short retry budget, polls the
//! new server out of its build state, and classifies the terminal outcome.
//! A server that lands in the error state is deleted best-effort before the
//! fault is surfaced; the fault is zone-specific only when the backend
//! reports capacity exhaustion, so schedulers know whether another zone is
//! worth trying.

use crate::constraints::Constraints;
use crate::error::{ProvisionError, Result, NO_VALID_HOST_MARKER};
use crate::retry::{retry, retry_with_notify, RetryError, BUILD_POLL, SHORT_ATTEMPT};
use crate::rollback::{Compensation, RollbackLedger};
use armada_cloud::{
    BackendError, BlockDeviceMapping, ComputeBackend, CreateServerOpts, ProvisioningPhase,
    ServerDetail, ServerStatus, StatusReporter,
};
use std::sync::Arc;
use tracing::{info, warn};

/// Root disk size used when a volume-backed disk has no size constraint.
pub const DEFAULT_ROOT_DISK_MIB: u64 = 8192;

fn mib_to_gib(mib: u64) -> u64 {
    mib.div_ceil(1024)
}

/// Derives the boot disk setup from the root-disk constraints.
///
/// Returns the image id to put on the create call, if any, plus the block
/// device mappings. A local root disk boots straight from the image; a
/// volume-backed one gets a boot volume sized from the constraint, rounded
/// up to whole GiB.
pub fn configure_root_disk(
    cons: &Constraints,
    image_id: &str,
) -> Result<(Option<String>, Vec<BlockDeviceMapping>)> {
    let source = cons.root_disk_source.as_deref().unwrap_or("local");
    let mut mapping = BlockDeviceMapping {
        boot_index: 0,
        source_type: "image".to_string(),
        source_id: image_id.to_string(),
        destination_type: source.to_string(),
        volume_size_gib: 0,
        delete_on_termination: true,
    };
    match source {
        "local" => Ok((Some(image_id.to_string()), vec![mapping])),
        "volume" => {
            let size_mib = match cons.root_disk_mib {
                Some(size) if size > 0 => size,
                _ => DEFAULT_ROOT_DISK_MIB,
            };
            mapping.volume_size_gib = mib_to_gib(size_mib);
            Ok((None, vec![mapping]))
        }
        other => Err(ProvisionError::InvalidRootDiskSource(other.to_string())),
    }
}

/// Submits create calls and waits servers out of their build state.
pub struct InstanceLauncher {
    backend: Arc<dyn ComputeBackend>,
}

impl InstanceLauncher {
    pub fn new(backend: Arc<dyn ComputeBackend>) -> Self {
        Self { backend }
    }

    /// Runs one full launch: submit, stabilize, classify.
    ///
    /// The created server is registered on the ledger as soon as it has an
    /// id, so callers can unwind it if a later step fails.
    pub async fn launch(
        &self,
        opts: CreateServerOpts,
        reporter: &dyn StatusReporter,
        ledger: &mut RollbackLedger,
    ) -> Result<ServerDetail> {
        let submitted = retry(
            SHORT_ATTEMPT,
            |_| self.backend.create_server(&opts),
            |err: &BackendError| err.is_transient(),
        )
        .await
        .map_err(|err| ProvisionError::Backend(err.into_inner()))?;

        let Some(created) = submitted else {
            warn!(
                name = %opts.name,
                "create call succeeded without returning an entity, \
                 stray instances may be left on the backend"
            );
            return Err(ProvisionError::LostCreateResponse);
        };
        info!(server_id = %created.id, name = %opts.name, "submitted server create");
        ledger.record(Compensation::DeleteServer {
            server_id: created.id.clone(),
        });

        let detail = self.wait_for_terminal(&created.id, reporter).await?;
        if detail.status != ServerStatus::Error {
            return Ok(detail);
        }

        let fault = detail
            .fault
            .as_ref()
            .map(|f| f.message.clone())
            .unwrap_or_else(|| "unknown failure".to_string());
        info!(server_id = %detail.id, %fault, "deleting instance in error state");
        ledger
            .discharge(
                &Compensation::DeleteServer {
                    server_id: detail.id.clone(),
                },
                self.backend.as_ref(),
            )
            .await;
        let failure = ProvisionError::LaunchFailed {
            server_id: detail.id.clone(),
            fault: fault.clone(),
        };
        if fault.contains(NO_VALID_HOST_MARKER) {
            // Capacity exhaustion in this zone; another zone may work.
            Err(failure)
        } else {
            Err(ProvisionError::zone_independent(failure))
        }
    }

    /// Polls until the server reaches a terminal state, notifying the
    /// reporter on every wait.
    async fn wait_for_terminal(
        &self,
        server_id: &str,
        reporter: &dyn StatusReporter,
    ) -> Result<ServerDetail> {
        let result = retry_with_notify(
            BUILD_POLL,
            |_| {
                let fetch = self.backend.get_server(server_id);
                async move {
                    let detail = fetch.await.map_err(ProvisionError::from)?;
                    match detail.status {
                        ServerStatus::Active | ServerStatus::Error => Ok(detail),
                        _ => Err(ProvisionError::StillBuilding(detail.id)),
                    }
                }
            },
            |err| matches!(err, ProvisionError::StillBuilding(_)),
            |err, attempt| {
                reporter.notify(
                    ProvisioningPhase::Provisioning,
                    &format!("{err}, wait 10 seconds before retry, attempt {attempt}"),
                    None,
                );
            },
        )
        .await;
        match result {
            Ok(detail) => Ok(detail),
            Err(RetryError::Fatal(err)) => Err(err),
            Err(RetryError::Exhausted { .. }) => Err(ProvisionError::Timeout {
                what: format!("instance {server_id:?} to become active"),
                after: BUILD_POLL.total,
            }),
        }
    }
}
