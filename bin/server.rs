// Budgetly - Invoice Extraction Web Server

use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use budgetly::{
    router, seed_default_categories, setup_database, AppState, Config, FileStore,
    OpenAiVisionClient, RetryPolicy,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "budgetly=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();

    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::create_dir_all(&config.storage_root)?;

    let conn = Connection::open(&config.db_path)?;
    setup_database(&conn)?;
    seed_default_categories(&conn)?;
    tracing::info!(db = ?config.db_path, "database ready");

    let extractor = OpenAiVisionClient::new(
        &config.vision_endpoint,
        &config.vision_model,
        config.vision_timeout,
    )?;

    let state = AppState {
        db: Arc::new(Mutex::new(conn)),
        store: Arc::new(FileStore::new(
            config.storage_root.clone(),
            config.max_upload_bytes,
        )),
        extractor: Arc::new(extractor),
        retry: RetryPolicy::new(config.retry_attempts, config.retry_base_delay),
    };

    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, version = budgetly::VERSION, "server listening");

    axum::serve(listener, app).await?;

    Ok(())
}
