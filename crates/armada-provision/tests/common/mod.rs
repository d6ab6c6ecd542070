use armada_provision::{
    ImageCandidate, ProvisionConfig, ProvisionSession, ProvisioningRequest, StubBackend,
};
use armada_cloud::{ComputeBackend, ServerDetail, ServerFilter};
use std::sync::Arc;

pub const MODEL_UUID: &str = "deadbeef-cafe-4000-8000-000000000001";
pub const CONTROLLER_UUID: &str = "ctrl-1";

/// One model wired to a stub backend, the way the platform composes a
/// session in production.
pub struct TestModel {
    pub backend: Arc<StubBackend>,
    pub session: Arc<ProvisionSession>,
}

impl TestModel {
    pub fn new() -> Self {
        Self::with_config(ProvisionConfig::new(MODEL_UUID, CONTROLLER_UUID))
    }

    pub fn with_config(config: ProvisionConfig) -> Self {
        let backend = Arc::new(StubBackend::new());
        let session = Arc::new(ProvisionSession::builder(backend.clone(), config).build());
        Self { backend, session }
    }

    pub fn config(&self) -> ProvisionConfig {
        self.session.config()
    }

    /// A minimal launchable request for the named instance.
    pub fn request(&self, name: &str) -> ProvisioningRequest {
        ProvisioningRequest::new(name).with_image(ImageCandidate::new("img-1", "amd64"))
    }

    /// Every server the backend holds for this model.
    pub async fn model_servers(&self) -> Vec<ServerDetail> {
        self.backend
            .list_servers(&self.config().server_filter())
            .await
            .unwrap()
    }

    /// Every server the backend holds, regardless of model.
    #[allow(dead_code)]
    pub async fn all_servers(&self) -> Vec<ServerDetail> {
        self.backend
            .list_servers(&ServerFilter::default())
            .await
            .unwrap()
    }
}
