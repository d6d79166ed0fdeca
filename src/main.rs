use anyhow::Result;
use axum::Router;
use preservation_store::{
    config::AppConfig,
    handlers::AppState,
    repo,
    routes::routes::routes,
    services::{
        preservation_service::{PreservationService, ReplicationPolicy},
        replication::ReplicationCoordinator,
    },
    storage::fs::FsStorage,
};
use sqlx::sqlite::SqlitePoolOptions;
use std::{fs, io::ErrorKind, path::Path, sync::Arc, time::Duration};
use tokio::{net::TcpListener, sync::mpsc};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting preservation-store with config: {:?}", cfg);

    // --- Ensure tier directories exist ---
    for dir in [&cfg.hot_dir, &cfg.archive_dir] {
        if !Path::new(dir).exists() {
            fs::create_dir_all(dir)?;
            tracing::info!("Created storage directory at {}", dir);
        }
    }

    // --- Initialize SQLite connection ---
    let db_url = &cfg.database_url;
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("file:");

    // Create parent directory if needed
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    // SQLx refuses to create the database file itself with a plain URL
    if !Path::new(db_path).exists() {
        fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(db_path)?;
    }

    let db = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await?,
    );

    // --- Apply schema ---
    repo::migrate(&db).await?;
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Initialize core service + replication worker ---
    let hot: Arc<dyn preservation_store::storage::StorageAdapter> =
        Arc::new(FsStorage::new(&cfg.hot_dir));
    let archive: Arc<dyn preservation_store::storage::StorageAdapter> =
        Arc::new(FsStorage::new(&cfg.archive_dir));

    let policy = ReplicationPolicy {
        max_attempts: cfg.replication_max_attempts.max(1),
        initial_backoff: Duration::from_millis(cfg.replication_backoff_ms),
        attempt_timeout: Duration::from_secs(cfg.replication_timeout_secs.max(1)),
    };
    let ingest_timeout = match cfg.ingest_timeout_secs {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    };

    let (tx, rx) = mpsc::unbounded_channel();
    let service = PreservationService::new(
        db.clone(),
        hot,
        archive,
        policy,
        ingest_timeout,
        cfg.auto_replicate,
        tx,
    );
    ReplicationCoordinator::new(service.clone()).spawn(rx);

    // Artifacts stranded mid-replication by a previous crash get requeued.
    let requeued = service.requeue_interrupted().await?;
    if requeued > 0 {
        tracing::info!("Requeued {} interrupted replication(s)", requeued);
    }

    // --- Build router ---
    let state = AppState {
        service,
        db,
        hot_dir: cfg.hot_dir.clone().into(),
        archive_dir: cfg.archive_dir.clone().into(),
    };
    let app: Router = routes().with_state(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
