//! Wake-up push notifications for offline receivers.
//!
//! ```text
//! DeliveryEngine ──try_send──► bounded queue ──► N workers ──► PushNotifier
//!                 (never waits)                               (FCM / log)
//! ```
//!
//! Pushes are best effort. A full queue drops the request, and requests
//! still queued at shutdown are counted as abandoned.

use crate::oauth::{AuthError, TokenSource};
use crate::storage::{RelayStore, StoreError};
use async_trait::async_trait;
use serde_json::json;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;

/// Sends a "wake" signal to a user's device.
#[async_trait]
pub trait PushNotifier: Send + Sync {
    async fn notify(&self, user_id: &str) -> Result<(), PushError>;
}

/// Push errors.
#[derive(Debug, Clone)]
pub enum PushError {
    /// User has no registered device
    NoDeviceToken(String),
    Store(StoreError),
    /// No access token for the push service
    Auth(AuthError),
    /// HTTP client or network failure
    Transport(String),
    /// Push service answered with a non-success status
    Rejected { status: u16, body: String },
}

impl fmt::Display for PushError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushError::NoDeviceToken(user) => write!(f, "No device token for {user}"),
            PushError::Store(e) => write!(f, "Token lookup failed: {e}"),
            PushError::Auth(e) => write!(f, "Push authorization failed: {e}"),
            PushError::Transport(e) => write!(f, "Push transport error: {e}"),
            PushError::Rejected { status, body } => {
                write!(f, "Push rejected with status {status}: {body}")
            }
        }
    }
}

impl std::error::Error for PushError {}

impl From<StoreError> for PushError {
    fn from(e: StoreError) -> Self {
        PushError::Store(e)
    }
}

impl From<AuthError> for PushError {
    fn from(e: AuthError) -> Self {
        PushError::Auth(e)
    }
}

/// Notifier used when no push service is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl PushNotifier for LogNotifier {
    async fn notify(&self, user_id: &str) -> Result<(), PushError> {
        log::info!("Wake signal for {user_id} (push disabled)");
        Ok(())
    }
}

// ─── FCM ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct FcmConfig {
    pub project_id: String,
    /// API origin (default: https://fcm.googleapis.com)
    pub endpoint: String,
    pub timeout: Duration,
}

impl FcmConfig {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            endpoint: "https://fcm.googleapis.com".to_string(),
            timeout: Duration::from_secs(10),
        }
    }

    fn send_url(&self) -> String {
        format!(
            "{}/v1/projects/{}/messages:send",
            self.endpoint.trim_end_matches('/'),
            self.project_id
        )
    }
}

/// Firebase Cloud Messaging notifier.
///
/// Device tokens are read from the store's `push_tokens` table; bearer
/// tokens come from a [`TokenSource`].
pub struct FcmNotifier {
    config: FcmConfig,
    tokens: Arc<dyn TokenSource>,
    http: reqwest::Client,
    store: Arc<RelayStore>,
}

impl FcmNotifier {
    pub fn new(
        config: FcmConfig,
        tokens: Arc<dyn TokenSource>,
        store: Arc<RelayStore>,
    ) -> Result<Self, PushError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| PushError::Transport(e.to_string()))?;
        Ok(Self {
            config,
            tokens,
            http,
            store,
        })
    }
}

#[async_trait]
impl PushNotifier for FcmNotifier {
    async fn notify(&self, user_id: &str) -> Result<(), PushError> {
        let token = self
            .store
            .push_token(user_id)?
            .ok_or_else(|| PushError::NoDeviceToken(user_id.to_string()))?;

        let access_token = self.tokens.access_token().await?;
        let body = json!({
            "message": {
                "token": token,
                "data": { "signal": "wake" }
            }
        });

        let response = self
            .http
            .post(self.config.send_url())
            .bearer_auth(&access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| PushError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            if status == reqwest::StatusCode::UNAUTHORIZED {
                self.tokens.invalidate().await;
            }
            let body = response.text().await.unwrap_or_default();
            return Err(PushError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        log::debug!("FCM wake signal sent to {user_id}");
        Ok(())
    }
}

// ─── Dispatcher ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PushConfig {
    /// Concurrent notifier calls (default: 4)
    pub workers: usize,
    /// Pending requests before new ones are dropped (default: 1024)
    pub queue_capacity: usize,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
        }
    }
}

impl PushConfig {
    pub fn for_testing() -> Self {
        Self {
            workers: 1,
            queue_capacity: 16,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushStats {
    pub sent: u64,
    pub failed: u64,
    /// Rejected because the queue was full or closed
    pub dropped: u64,
    /// Still queued when the dispatcher shut down
    pub abandoned: u64,
}

#[derive(Debug, Default)]
struct PushCounters {
    sent: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    abandoned: AtomicU64,
}

impl PushCounters {
    fn snapshot(&self) -> PushStats {
        PushStats {
            sent: self.sent.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
        }
    }
}

/// Cloneable submit side of the dispatcher.
#[derive(Clone)]
pub struct PushHandle {
    tx: mpsc::Sender<String>,
    counters: Arc<PushCounters>,
}

impl PushHandle {
    /// Request a wake-up for `user_id`. Never waits.
    pub fn dispatch(&self, user_id: &str) {
        match self.tx.try_send(user_id.to_string()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("Push queue full, dropping wake signal for {user_id}");
            }
            Err(TrySendError::Closed(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("Push dispatcher stopped, dropping wake signal for {user_id}");
            }
        }
    }

    pub fn stats(&self) -> PushStats {
        self.counters.snapshot()
    }
}

/// Bounded worker pool in front of a [`PushNotifier`].
pub struct PushDispatcher {
    handle: PushHandle,
    queue: Arc<Mutex<mpsc::Receiver<String>>>,
    shutdown_tx: watch::Sender<bool>,
    workers: JoinSet<()>,
}

impl PushDispatcher {
    /// Spawn the worker pool. Must be called inside a tokio runtime.
    pub fn start(notifier: Arc<dyn PushNotifier>, config: PushConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let queue = Arc::new(Mutex::new(rx));
        let counters = Arc::new(PushCounters::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut workers = JoinSet::new();
        for worker in 0..config.workers.max(1) {
            workers.spawn(Self::worker_loop(
                worker,
                queue.clone(),
                notifier.clone(),
                counters.clone(),
                shutdown_rx.clone(),
            ));
        }

        log::info!(
            "Push dispatcher started: {} workers, queue capacity {}",
            config.workers.max(1),
            config.queue_capacity.max(1)
        );

        Self {
            handle: PushHandle { tx, counters },
            queue,
            shutdown_tx,
            workers,
        }
    }

    pub fn handle(&self) -> PushHandle {
        self.handle.clone()
    }

    pub fn stats(&self) -> PushStats {
        self.handle.stats()
    }

    async fn worker_loop(
        worker: usize,
        queue: Arc<Mutex<mpsc::Receiver<String>>>,
        notifier: Arc<dyn PushNotifier>,
        counters: Arc<PushCounters>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let user_id = {
                let mut rx = queue.lock().await;
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    next = rx.recv() => match next {
                        Some(user_id) => user_id,
                        None => break,
                    },
                }
            };

            match notifier.notify(&user_id).await {
                Ok(()) => {
                    counters.sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    log::warn!("Push worker {worker}: wake signal for {user_id} failed: {e}");
                }
            }
        }
        log::debug!("Push worker {worker} stopped");
    }

    /// Stop the workers and report final counts.
    ///
    /// Calls already in flight finish; queued requests are abandoned.
    pub async fn shutdown(mut self) -> PushStats {
        let _ = self.shutdown_tx.send(true);
        while let Some(result) = self.workers.join_next().await {
            if let Err(e) = result {
                log::error!("Push worker panicked: {e}");
            }
        }

        let mut abandoned = 0;
        {
            let mut rx = self.queue.lock().await;
            rx.close();
            while rx.try_recv().is_ok() {
                abandoned += 1;
            }
        }
        let counters = &self.handle.counters;
        counters.abandoned.fetch_add(abandoned, Ordering::Relaxed);

        let stats = counters.snapshot();
        log::info!(
            "Push dispatcher stopped: {} sent, {} failed, {} dropped, {} abandoned",
            stats.sent,
            stats.failed,
            stats.dropped,
            stats.abandoned
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreConfig;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct RecordingNotifier {
        calls: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PushNotifier for RecordingNotifier {
        async fn notify(&self, user_id: &str) -> Result<(), PushError> {
            self.calls.lock().unwrap().push(user_id.to_string());
            Ok(())
        }
    }

    /// Blocks every call until released.
    struct GatedNotifier {
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl PushNotifier for GatedNotifier {
        async fn notify(&self, _user_id: &str) -> Result<(), PushError> {
            self.gate.notified().await;
            Ok(())
        }
    }

    struct FailingNotifier;

    /// Hands out a fixed bearer token and counts invalidations.
    #[derive(Default)]
    struct FixedToken {
        invalidated: AtomicU64,
    }

    #[async_trait]
    impl TokenSource for FixedToken {
        async fn access_token(&self) -> Result<String, AuthError> {
            Ok("secret-token".to_string())
        }

        async fn invalidate(&self) {
            self.invalidated.fetch_add(1, Ordering::Relaxed);
        }
    }

    struct NoCredentials;

    #[async_trait]
    impl TokenSource for NoCredentials {
        async fn access_token(&self) -> Result<String, AuthError> {
            Err(AuthError::Credentials("no key".to_string()))
        }
    }

    #[async_trait]
    impl PushNotifier for FailingNotifier {
        async fn notify(&self, user_id: &str) -> Result<(), PushError> {
            Err(PushError::NoDeviceToken(user_id.to_string()))
        }
    }

    #[tokio::test]
    async fn test_dispatch_reaches_notifier() {
        let notifier = Arc::new(RecordingNotifier::default());
        let dispatcher = PushDispatcher::start(notifier.clone(), PushConfig::for_testing());
        let handle = dispatcher.handle();

        handle.dispatch("alice");
        handle.dispatch("bob");
        tokio::time::sleep(Duration::from_millis(100)).await;

        let stats = dispatcher.shutdown().await;
        assert_eq!(stats.sent, 2);
        assert_eq!(*notifier.calls.lock().unwrap(), vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn test_failures_counted() {
        let dispatcher = PushDispatcher::start(Arc::new(FailingNotifier), PushConfig::for_testing());
        dispatcher.handle().dispatch("ghost");
        tokio::time::sleep(Duration::from_millis(100)).await;

        let stats = dispatcher.shutdown().await;
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.sent, 0);
    }

    #[tokio::test]
    async fn test_full_queue_drops_and_shutdown_abandons() {
        let gate = Arc::new(Notify::new());
        let notifier = Arc::new(GatedNotifier { gate: gate.clone() });
        let config = PushConfig {
            workers: 1,
            queue_capacity: 1,
        };
        let dispatcher = PushDispatcher::start(notifier, config);
        let handle = dispatcher.handle();

        // First request occupies the only worker
        handle.dispatch("a");
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Second fills the queue, third has nowhere to go
        handle.dispatch("b");
        handle.dispatch("c");
        assert_eq!(handle.stats().dropped, 1);

        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            gate.notify_one();
        });
        let stats = dispatcher.shutdown().await;
        release.await.unwrap();

        assert_eq!(stats.sent, 1);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.abandoned, 1);
    }

    #[tokio::test]
    async fn test_dispatch_after_shutdown_dropped() {
        let dispatcher = PushDispatcher::start(Arc::new(LogNotifier), PushConfig::for_testing());
        let handle = dispatcher.handle();
        dispatcher.shutdown().await;

        handle.dispatch("late");
        assert_eq!(handle.stats().dropped, 1);
    }

    #[tokio::test]
    async fn test_fcm_without_token() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RelayStore::open(StoreConfig::for_testing(dir.path())).unwrap());
        let notifier =
            FcmNotifier::new(FcmConfig::new("proj"), Arc::new(FixedToken::default()), store).unwrap();

        let err = notifier.notify("bob").await.unwrap_err();
        assert!(matches!(err, PushError::NoDeviceToken(ref u) if u == "bob"));
    }

    /// Accepts one HTTP request, replies with `status_line`, returns the raw request.
    async fn fake_fcm(status_line: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("http://{}", listener.local_addr().unwrap());
        let task = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            while !String::from_utf8_lossy(&request).contains("\"wake\"") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            let response = format!("{status_line}\r\ncontent-length: 2\r\nconnection: close\r\n\r\n{{}}");
            socket.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&request).into_owned()
        });
        (endpoint, task)
    }

    #[tokio::test]
    async fn test_fcm_posts_wake_signal() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RelayStore::open(StoreConfig::for_testing(dir.path())).unwrap());
        store.set_push_token("bob", "device-123").unwrap();

        let (endpoint, server) = fake_fcm("HTTP/1.1 200 OK").await;
        let mut config = FcmConfig::new("courier-test");
        config.endpoint = endpoint;
        let notifier = FcmNotifier::new(config, Arc::new(FixedToken::default()), store).unwrap();

        notifier.notify("bob").await.unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /v1/projects/courier-test/messages:send"));
        assert!(request.to_lowercase().contains("authorization: bearer secret-token"));
        assert!(request.contains("device-123"));
    }

    #[tokio::test]
    async fn test_fcm_rejection_status() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RelayStore::open(StoreConfig::for_testing(dir.path())).unwrap());
        store.set_push_token("bob", "stale").unwrap();

        let (endpoint, server) = fake_fcm("HTTP/1.1 404 Not Found").await;
        let mut config = FcmConfig::new("courier-test");
        config.endpoint = endpoint;
        let notifier = FcmNotifier::new(config, Arc::new(FixedToken::default()), store).unwrap();

        let err = notifier.notify("bob").await.unwrap_err();
        assert!(matches!(err, PushError::Rejected { status: 404, .. }));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_fcm_unauthorized_invalidates_token() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RelayStore::open(StoreConfig::for_testing(dir.path())).unwrap());
        store.set_push_token("bob", "device-123").unwrap();

        let (endpoint, server) = fake_fcm("HTTP/1.1 401 Unauthorized").await;
        let mut config = FcmConfig::new("courier-test");
        config.endpoint = endpoint;
        let tokens = Arc::new(FixedToken::default());
        let notifier = FcmNotifier::new(config, tokens.clone(), store).unwrap();

        let err = notifier.notify("bob").await.unwrap_err();
        assert!(matches!(err, PushError::Rejected { status: 401, .. }));
        assert_eq!(tokens.invalidated.load(Ordering::Relaxed), 1);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_fcm_without_credentials() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RelayStore::open(StoreConfig::for_testing(dir.path())).unwrap());
        store.set_push_token("bob", "device-123").unwrap();
        let notifier = FcmNotifier::new(FcmConfig::new("proj"), Arc::new(NoCredentials), store).unwrap();

        let err = notifier.notify("bob").await.unwrap_err();
        assert!(matches!(err, PushError::Auth(AuthError::Credentials(_))));
    }
}
