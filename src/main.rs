//! Service entry point
//!
//! Startup order follows the bootstrap contract: configuration, logging,
//! attachment directory, database table check, connection pool, scheduler,
//! HTTP server. Any configuration or bootstrap failure aborts startup.
//! Shutdown waits for the in-flight sync tick to finish.

use std::sync::Arc;

use mail_ingest_rs::config::Settings;
use mail_ingest_rs::extract::ProcessorRegistry;
use mail_ingest_rs::forward::Forwarder;
use mail_ingest_rs::pipeline::SyncService;
use mail_ingest_rs::repo::Repository;
use mail_ingest_rs::scheduler::MailScheduler;
use mail_ingest_rs::server::{self, AppState};
use mail_ingest_rs::storage::AttachmentStore;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let settings = Settings::load_from_env()?;
    init_tracing(&settings)?;
    info!("mail ingestion service starting");

    let store = AttachmentStore::new(settings.attachment_path.clone())?;

    let repo = Repository::connect(&settings.database).await?;
    repo.check_tables().await?;

    let service = Arc::new(SyncService::new(
        settings.mail.clone(),
        repo.clone(),
        store.clone(),
        ProcessorRegistry::with_defaults(),
    ));
    let scheduler = Arc::new(MailScheduler::new(
        Arc::clone(&service),
        settings.mail_check_interval,
    ));
    scheduler.start().await;

    let forwarder = Arc::new(Forwarder::new(settings.mail.clone(), repo, store));
    let app = server::router(AppState {
        scheduler: Arc::clone(&scheduler),
        forwarder,
    });

    let bind_addr = format!("{}:{}", settings.api_host, settings.api_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("mail ingestion service shutting down");
    scheduler.stop().await;
    info!("mail ingestion service stopped");
    Ok(())
}

/// Initialize tracing from settings
///
/// `RUST_LOG` overrides the configured level; log output goes to the
/// configured file when set, stderr otherwise.
fn init_tracing(settings: &Settings) -> Result<(), Box<dyn std::error::Error>> {
    let default_level = if settings.debug {
        "debug".to_owned()
    } else {
        settings.log_level.to_lowercase()
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    match &settings.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

/// Resolve when the process receives a termination signal
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
