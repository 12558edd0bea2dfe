use face_records::api::{self, AppState};
use face_records::config::Settings;
use face_records::db;
use face_records::detection::BlazeFaceDetector;
use face_records::error::{Error, Result};
use std::sync::Arc;

/// Wait for shutdown signal (SIGTERM or Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to install Ctrl+C handler: {e}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => log::info!("Received Ctrl+C, shutting down gracefully..."),
        _ = terminate => log::info!("Received SIGTERM, shutting down gracefully..."),
    }
}

async fn run(settings: Settings) -> Result<()> {
    let store = db::init_database(&settings.storage)?;
    let detector = BlazeFaceDetector::new(settings.detector.clone())?;

    let state = AppState {
        store: Arc::new(store),
        detector: Arc::new(detector),
        storage_timeout: settings.storage.timeout(),
    };
    let app = api::build_router(state, settings.server.max_upload_bytes);

    let listener = tokio::net::TcpListener::bind(&settings.server.bind_addr).await?;
    log::info!("Listening on {}", settings.server.bind_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let result = match Settings::from_env() {
        Ok(settings) => run(settings).await,
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        match &e {
            Error::StorageInit { .. } => log::error!("Refusing to serve: {e}"),
            _ => log::error!("Fatal: {e}"),
        }
        std::process::exit(1);
    }
}
