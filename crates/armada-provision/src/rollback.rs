//! Rollback ledger for partially provisioned launches
//!
//! Each launch step that creates a remote resource records a compensating
//! action. On failure the ledger runs them in reverse, and every outcome
//! lands in a [`RollbackReport`] so callers and tests can check that
//! nothing was left behind. Compensation failures never mask the error
//! that triggered the rollback.

use armada_cloud::{BackendError, ComputeBackend};
use std::fmt;
use tracing::{debug, warn};

/// A compensating action for one provisioned resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compensation {
    /// Delete a created server.
    DeleteServer { server_id: String },

    /// Release an allocated public address.
    ReleaseAddress { address: String },

    /// Delete a rule group created for this launch alone.
    DeleteRuleGroup { name: String },
}

impl fmt::Display for Compensation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compensation::DeleteServer { server_id } => write!(f, "delete server {server_id}"),
            Compensation::ReleaseAddress { address } => write!(f, "release address {address}"),
            Compensation::DeleteRuleGroup { name } => write!(f, "delete rule group {name}"),
        }
    }
}

impl Compensation {
    async fn execute(&self, backend: &dyn ComputeBackend) -> Result<(), BackendError> {
        let result = match self {
            Compensation::DeleteServer { server_id } => backend.delete_server(server_id).await,
            Compensation::ReleaseAddress { address } => {
                backend.release_public_address(address).await
            }
            Compensation::DeleteRuleGroup { name } => backend.delete_rule_group(name).await,
        };
        match result {
            Err(err) if err.is_not_found() => Ok(()),
            other => other,
        }
    }
}

/// What the rollback managed to undo.
#[derive(Debug, Default)]
pub struct RollbackReport {
    /// Compensations that ran to completion.
    pub completed: Vec<Compensation>,

    /// Compensations that failed, with the backend error.
    pub failed: Vec<(Compensation, BackendError)>,
}

impl RollbackReport {
    /// Whether every recorded compensation ran to completion.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    /// Whether the rollback had nothing to do at all.
    pub fn is_empty(&self) -> bool {
        self.completed.is_empty() && self.failed.is_empty()
    }
}

/// Records compensations as launch steps succeed and unwinds them in
/// reverse when the launch fails.
#[derive(Debug, Default)]
pub struct RollbackLedger {
    pending: Vec<Compensation>,
    report: RollbackReport,
}

impl RollbackLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a compensation for a resource that now exists.
    pub fn record(&mut self, compensation: Compensation) {
        debug!(%compensation, "recorded compensation");
        self.pending.push(compensation);
    }

    /// Runs one pending compensation immediately and takes it off the
    /// ledger, so a later unwind cannot run it a second time.
    pub async fn discharge(&mut self, compensation: &Compensation, backend: &dyn ComputeBackend) {
        if let Some(pos) = self.pending.iter().position(|c| c == compensation) {
            let comp = self.pending.remove(pos);
            self.run(comp, backend).await;
        }
    }

    /// Runs every pending compensation in reverse order.
    pub async fn unwind(mut self, backend: &dyn ComputeBackend) -> RollbackReport {
        while let Some(comp) = self.pending.pop() {
            self.run(comp, backend).await;
        }
        self.report
    }

    /// Drops the ledger without compensating, once the launch succeeded
    /// and its resources are meant to stay.
    pub fn commit(mut self) {
        self.pending.clear();
    }

    async fn run(&mut self, comp: Compensation, backend: &dyn ComputeBackend) {
        match comp.execute(backend).await {
            Ok(()) => self.report.completed.push(comp),
            Err(err) => {
                warn!(compensation = %comp, error = %err, "compensating action failed");
                self.report.failed.push((comp, err));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::StubBackend;
    use std::collections::HashMap;

    #[tokio::test]
    async fn test_unwind_releases_everything() {
        let backend = StubBackend::new();
        let server_id = backend.seed_server("web-0", HashMap::new());
        let address = backend.mint_address();

        let mut ledger = RollbackLedger::new();
        ledger.record(Compensation::DeleteRuleGroup {
            name: "armada-ctrl-model-web-0".into(),
        });
        ledger.record(Compensation::DeleteServer {
            server_id: server_id.clone(),
        });
        ledger.record(Compensation::ReleaseAddress { address });

        let report = ledger.unwind(&backend).await;
        assert!(report.is_clean());
        assert_eq!(report.completed.len(), 3);
        assert!(backend.server(&server_id).is_none());
        // Unwind runs newest first.
        assert!(matches!(
            report.completed[0],
            Compensation::ReleaseAddress { .. }
        ));
        assert!(matches!(
            report.completed[2],
            Compensation::DeleteRuleGroup { .. }
        ));
    }

    #[tokio::test]
    async fn test_discharge_prevents_double_execution() {
        let backend = StubBackend::new();
        let server_id = backend.seed_server("web-0", HashMap::new());

        let mut ledger = RollbackLedger::new();
        let comp = Compensation::DeleteServer {
            server_id: server_id.clone(),
        };
        ledger.record(comp.clone());
        ledger.discharge(&comp, &backend).await;
        let report = ledger.unwind(&backend).await;

        assert_eq!(backend.counts().delete_server, 1);
        assert_eq!(report.completed.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_resource_counts_as_compensated() {
        let backend = StubBackend::new();
        let mut ledger = RollbackLedger::new();
        ledger.record(Compensation::DeleteServer {
            server_id: "srv-never-existed".into(),
        });
        let report = ledger.unwind(&backend).await;
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn test_failures_are_collected_not_raised() {
        let backend = StubBackend::new();
        let server_id = backend.seed_server("web-0", HashMap::new());
        backend.fail_next(
            "delete_server",
            armada_cloud::BackendError::Api("Conflict: server locked".into()),
        );

        let mut ledger = RollbackLedger::new();
        ledger.record(Compensation::DeleteServer { server_id });
        let report = ledger.unwind(&backend).await;
        assert!(!report.is_clean());
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].1.to_string().contains("locked"));
    }
}
