use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

use backup_jobs::backup::{AdmissionMonitor, BackupManager, SystemProcessProbe};
use backup_jobs::crypto::StreamCipher;
use backup_jobs::remote::{CommandHandler, RemoteServer, StatusBroadcaster};
use backup_jobs::storage::{Storage, StorageSink};
use backup_jobs::utils::config::ConfigHandle;
use backup_jobs::utils::log_buffer::{FanOut, LogBuffer};
use backup_jobs::utils::logging::init_tracing;
use backup_jobs::utils::resource_monitor::{NetworkMonitor, NetworkProbe};
use backup_jobs::web::{self, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Ignoring .env: {}", e);
        }
    }
    init_tracing();

    // Load configuration
    let source = std::env::var("BACKUP_CONFIG").unwrap_or_else(|_| "backup".to_string());
    let config = ConfigHandle::from_source(source)?;
    let settings = config.config();

    info!("Starting backup-jobs v{}", env!("CARGO_PKG_VERSION"));
    info!("Parallel job slots: {}", settings.parallel_jobs());

    // Initialize storage layer
    let storage = Storage::new(&settings.database_url).await?;
    storage.run_migrations().await?;

    let log_buffer = LogBuffer::new(1000);
    let (storage_sink, event_writer) = StorageSink::spawn(storage.clone());
    let events = Arc::new(
        FanOut::new()
            .with(Arc::new(log_buffer))
            .with(Arc::new(storage_sink)),
    );

    let (admission, admission_events) =
        AdmissionMonitor::new(Arc::new(SystemProcessProbe::new()), settings.poll_interval());
    let manager = BackupManager::new(
        config.clone(),
        Some(storage),
        events,
        Arc::new(StreamCipher::new()),
        admission.clone(),
        admission_events,
    );

    // Jobs saved as RUNNING come back PAUSED
    manager.load_jobs().await?;

    admission.start_polling();
    NetworkMonitor::new(
        Box::new(NetworkProbe::new()),
        manager.throttle().gate().clone(),
        config.clone(),
    )
    .start();

    let handler: Arc<dyn CommandHandler> = Arc::new(manager.clone());
    let broadcaster = StatusBroadcaster::new();
    broadcaster.start(handler.clone(), settings.broadcast_every());

    let tcp_addr = SocketAddr::from(([0, 0, 0, 0], settings.tcp_port));
    RemoteServer::bind(tcp_addr, handler, broadcaster.clone())
        .await?
        .spawn();

    #[cfg(unix)]
    spawn_reload_on_sighup(config.clone())?;

    let app = web::router(AppState {
        manager: manager.clone(),
        broadcaster,
    });
    let addr = SocketAddr::from(([0, 0, 0, 0], settings.ws_port));
    info!("WebSocket listening on ws://{}/ws/", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    manager.persist().await?;
    event_writer.abort();
    info!("Server stopped gracefully");
    Ok(())
}

#[cfg(unix)]
fn spawn_reload_on_sighup(config: ConfigHandle) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            match config.reload() {
                Ok(()) => info!("Configuration reloaded"),
                Err(e) => warn!("Configuration reload failed, keeping previous: {:#}", e),
            }
        }
    });
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
