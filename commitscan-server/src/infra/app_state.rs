use std::{fmt, sync::Arc};

use commitscan_core::{InstancePool, OperatorService, ScanStore};

use crate::infra::config::Config;

/// Shared handler state. Cloned per request; everything inside is `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ScanStore>,
    pub operator: OperatorService,
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

impl AppState {
    pub fn new(
        config: &Config,
        store: Arc<dyn ScanStore>,
        pool: InstancePool,
    ) -> Self {
        let operator = OperatorService::new(
            Arc::clone(&store),
            pool,
            config.orchestrator.clone(),
        );
        Self { store, operator }
    }

    pub fn operator(&self) -> &OperatorService {
        &self.operator
    }
}
