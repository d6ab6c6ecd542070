//! Provisioning configuration and resource naming
//!
//! Every cloud resource this crate creates is named and tagged so it can be
//! found again without local state. Names carry a deterministic prefix
//! derived from the model identity; tags carry the full model and controller
//! identifiers.

use armada_cloud::ServerFilter;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Prefix shared by every resource this crate creates.
pub const RESOURCE_PREFIX: &str = "armada";

/// Metadata tag carrying the owning model identifier.
pub const TAG_MODEL: &str = "armada-model-uuid";

/// Metadata tag carrying the owning controller identifier.
pub const TAG_CONTROLLER: &str = "armada-controller-uuid";

/// Metadata tag marking controller-hosting instances.
pub const TAG_IS_CONTROLLER: &str = "armada-is-controller";

/// How ingress is managed for instances in a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirewallMode {
    /// One rule group per instance, plus the shared model group.
    #[default]
    Instance,

    /// A single shared group takes all ingress rules for the model.
    Global,

    /// No rule groups are created or attached.
    None,
}

impl fmt::Display for FirewallMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FirewallMode::Instance => write!(f, "instance"),
            FirewallMode::Global => write!(f, "global"),
            FirewallMode::None => write!(f, "none"),
        }
    }
}

/// Settings a provisioning session operates under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionConfig {
    /// Identifier of the model owning the resources.
    pub model_uuid: String,

    /// Identifier of the controller managing the model.
    pub controller_uuid: String,

    /// Whether launched instances get a public address attached.
    #[serde(default = "default_use_public_addresses")]
    pub use_public_addresses: bool,

    /// Network to attach instances to. When unset, the backend's sole
    /// non-external network is used.
    #[serde(default)]
    pub network: Option<String>,

    /// Ingress management mode.
    #[serde(default)]
    pub firewall_mode: FirewallMode,
}

fn default_use_public_addresses() -> bool {
    true
}

impl ProvisionConfig {
    /// Creates a configuration with defaults: public addresses on,
    /// no configured network, per-instance firewalling.
    pub fn new(model_uuid: impl Into<String>, controller_uuid: impl Into<String>) -> Self {
        Self {
            model_uuid: model_uuid.into(),
            controller_uuid: controller_uuid.into(),
            use_public_addresses: true,
            network: None,
            firewall_mode: FirewallMode::default(),
        }
    }

    /// Sets whether launched instances get a public address.
    pub fn with_public_addresses(mut self, enabled: bool) -> Self {
        self.use_public_addresses = enabled;
        self
    }

    /// Sets the network instances attach to.
    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    /// Sets the ingress management mode.
    pub fn with_firewall_mode(mut self, mode: FirewallMode) -> Self {
        self.firewall_mode = mode;
        self
    }

    /// Short form of the model identifier used in resource names.
    pub fn short_model_id(&self) -> String {
        self.model_uuid.replace('-', "").chars().take(8).collect()
    }

    /// Deterministic name for a resource belonging to this model.
    pub fn resource_name(&self, suffix: &str) -> String {
        format!("{}-{}-{}", RESOURCE_PREFIX, self.short_model_id(), suffix)
    }

    /// Listing filter matching every server named by this model.
    pub fn server_filter(&self) -> ServerFilter {
        ServerFilter::name_prefix(format!("{}-{}", RESOURCE_PREFIX, self.short_model_id()))
    }

    /// Metadata tags stamped on every instance the model launches.
    pub fn model_tags(&self) -> HashMap<String, String> {
        HashMap::from([
            (TAG_MODEL.to_string(), self.model_uuid.clone()),
            (TAG_CONTROLLER.to_string(), self.controller_uuid.clone()),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ProvisionConfig {
        ProvisionConfig::new("deadbeef-cafe-4000-8000-000000000001", "ctrl-uuid-1")
    }

    #[test]
    fn test_short_model_id_strips_dashes() {
        assert_eq!(config().short_model_id(), "deadbeef");
    }

    #[test]
    fn test_resource_name_carries_prefix_and_model() {
        assert_eq!(config().resource_name("web-0"), "armada-deadbeef-web-0");
    }

    #[test]
    fn test_server_filter_matches_model_resources() {
        let filter = config().server_filter();
        assert!(filter.matches("armada-deadbeef-web-0"));
        assert!(!filter.matches("armada-0badf00d-web-0"));
        assert!(!filter.matches("unrelated"));
    }

    #[test]
    fn test_model_tags_hold_both_identifiers() {
        let tags = config().model_tags();
        assert_eq!(
            tags.get(TAG_MODEL).map(String::as_str),
            Some("deadbeef-cafe-4000-8000-000000000001")
        );
        assert_eq!(
            tags.get(TAG_CONTROLLER).map(String::as_str),
            Some("ctrl-uuid-1")
        );
    }

    #[test]
    fn test_firewall_mode_default_is_instance() {
        assert_eq!(FirewallMode::default(), FirewallMode::Instance);
        assert_eq!(FirewallMode::Global.to_string(), "global");
    }
}
