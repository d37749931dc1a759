//! Application state shared across handlers

use std::sync::Arc;

use sqlx::PgPool;

use crate::orchestrator::OrchestratorService;
use crate::reconciliation::ReconciliationService;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<OrchestratorService>,
    pub reconciliation: Arc<ReconciliationService>,
    pub db: PgPool,
}

impl AppState {
    pub fn new(
        orchestrator: Arc<OrchestratorService>,
        reconciliation: Arc<ReconciliationService>,
        db: PgPool,
    ) -> Self {
        Self {
            orchestrator,
            reconciliation,
            db,
        }
    }
}
