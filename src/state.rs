use std::sync::Arc;

use crate::config::ServiceConfig;
use crate::engine::WorkloadEngine;
use crate::launch::LaunchController;
use crate::measurement::{MeasurementBackend, MeasurementLedger};
use crate::shutdown::ShutdownSignal;
use crate::store::ProvisioningStore;

/// Process-wide singletons shared by the request handlers.
pub struct AppState {
    pub store: Arc<ProvisioningStore>,
    pub ledger: Arc<MeasurementLedger>,
    pub launcher: Arc<LaunchController>,
    pub shutdown: ShutdownSignal,
}

impl AppState {
    pub fn new(
        config: &ServiceConfig,
        backend: Arc<dyn MeasurementBackend>,
        engine: Arc<dyn WorkloadEngine>,
    ) -> Self {
        let ledger = Arc::new(MeasurementLedger::new(backend));
        let store = Arc::new(ProvisioningStore::new(
            config.provision_dir.clone(),
            config.max_artifact_bytes,
            ledger.clone(),
        ));
        let shutdown = ShutdownSignal::new();
        let launcher = Arc::new(LaunchController::new(
            store.clone(),
            engine,
            shutdown.clone(),
        ));
        Self {
            store,
            ledger,
            launcher,
            shutdown,
        }
    }

    /// Builds the state and readies the provisioning directory.
    pub async fn initialize(
        config: &ServiceConfig,
        backend: Arc<dyn MeasurementBackend>,
        engine: Arc<dyn WorkloadEngine>,
    ) -> std::io::Result<Arc<Self>> {
        let state = Self::new(config, backend, engine);
        let swept = state.store.prepare().await?;
        let provisioning = state.store.state().await;
        tracing::info!(
            dir = %state.store.dir().display(),
            swept,
            state = ?provisioning,
            measurement_backend = state.ledger.backend_name(),
            "provisioning store ready",
        );
        Ok(Arc::new(state))
    }
}
