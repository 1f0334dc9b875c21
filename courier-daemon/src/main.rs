//! Courier relay daemon.
//!
//! Opens the RocksDB store, starts the push dispatcher (FCM when configured,
//! log-only otherwise) and serves WebSocket clients until Ctrl-C.

mod config;

use courier_relay::{
    AuthError, FcmConfig, FcmNotifier, LogNotifier, PushDispatcher, PushError, PushNotifier,
    RelayServer, RelayStore, ServiceAccountKey, ServiceAccountTokens,
};
use log::{error, info, warn};
use std::process::ExitCode;
use std::sync::Arc;

use config::{DaemonConfig, FcmSettings};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    info!("Starting Courier relay...");

    let config = match DaemonConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {e}");
            return ExitCode::from(2);
        }
    };

    let store = match RelayStore::open(config.store.clone()) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Failed to open store at {}: {e}", config.store.path.display());
            return ExitCode::FAILURE;
        }
    };

    let notifier: Arc<dyn PushNotifier> = match &config.fcm {
        Some(fcm) => match fcm_notifier(fcm, store.clone()) {
            Ok(notifier) => Arc::new(notifier),
            Err(e) => {
                error!("Failed to initialize FCM: {e}");
                return ExitCode::FAILURE;
            }
        },
        None => {
            warn!("FCM not configured; wake signals will only be logged");
            Arc::new(LogNotifier)
        }
    };

    let push = PushDispatcher::start(notifier, config.push.clone());
    let server = RelayServer::new(config.server.clone(), store.clone(), push.handle());

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {e}");
            std::future::pending::<()>().await;
        }
        info!("Shutdown requested");
    };

    let result = server.run_until(shutdown).await;

    let stats = server.stats();
    info!(
        "Relay stopped: {} connections served, {} frames, {} live, {} queued",
        stats.total_connections, stats.frames_received, stats.live_deliveries, stats.queued_deliveries
    );
    let push_stats = push.shutdown().await;
    info!(
        "Push dispatcher stopped: {} sent, {} failed, {} dropped, {} abandoned",
        push_stats.sent, push_stats.failed, push_stats.dropped, push_stats.abandoned
    );

    if let Err(e) = store.flush() {
        error!("Failed to flush store: {e}");
    }

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Relay server failed: {e}");
            ExitCode::FAILURE
        }
    }
}

fn fcm_notifier(settings: &FcmSettings, store: Arc<RelayStore>) -> Result<FcmNotifier, PushError> {
    let key = ServiceAccountKey::from_file(&settings.credentials_path)?;
    let project_id = settings
        .project_id
        .clone()
        .or_else(|| key.project_id.clone())
        .ok_or_else(|| {
            AuthError::Credentials("no project_id in key file and FCM_PROJECT_ID is unset".into())
        })?;

    let config = FcmConfig::new(project_id);
    let tokens = ServiceAccountTokens::new(key, config.timeout)?;
    info!(
        "FCM wake signals enabled for project {} as {}",
        config.project_id,
        tokens.client_email()
    );
    FcmNotifier::new(config, Arc::new(tokens), store)
}
