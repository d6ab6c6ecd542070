//! Progress notification callback

use serde::{Deserialize, Serialize};

/// Coarse phase reported alongside a progress message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningPhase {
    /// The instance is being brought up
    Provisioning,
    /// The instance is up
    Running,
    /// Provisioning hit an error
    Error,
}

impl std::fmt::Display for ProvisioningPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProvisioningPhase::Provisioning => write!(f, "provisioning"),
            ProvisioningPhase::Running => write!(f, "running"),
            ProvisioningPhase::Error => write!(f, "error"),
        }
    }
}

/// Receives progress notifications during long-running operations
///
/// The provisioning core fires this at least on every wait-and-retry while a
/// server is still building, so callers can surface live progress.
pub trait StatusReporter: Send + Sync {
    /// Report a progress update
    fn notify(&self, phase: ProvisioningPhase, message: &str, data: Option<serde_json::Value>);
}

/// Reporter that drops all notifications
#[derive(Debug, Clone, Default)]
pub struct NoopReporter;

impl StatusReporter for NoopReporter {
    fn notify(&self, _phase: ProvisioningPhase, _message: &str, _data: Option<serde_json::Value>) {}
}

/// Reporter that forwards notifications to the tracing subscriber
#[derive(Debug, Clone, Default)]
pub struct TracingReporter;

impl StatusReporter for TracingReporter {
    fn notify(&self, phase: ProvisioningPhase, message: &str, _data: Option<serde_json::Value>) {
        tracing::info!(phase = %phase, "{}", message);
    }
}
