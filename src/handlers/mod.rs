pub mod artifact_handlers;
pub mod health_handlers;

use crate::services::preservation_service::PreservationService;
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::sync::Arc;

/// Shared state carried by the router.
#[derive(Clone)]
pub struct AppState {
    pub service: PreservationService,
    pub db: Arc<SqlitePool>,
    pub hot_dir: PathBuf,
    pub archive_dir: PathBuf,
}
