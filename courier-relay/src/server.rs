//! WebSocket relay server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                      ┌── PresenceRegistry (user → session)
//!            ├── /ws?userId=… ──────┤
//! Client B ──┘   one task each      ├── Dispatcher ── DeliveryEngine ──┬── live write
//!                                   │                                  └── RelayStore + PushHandle
//!                                   └── RelayStats (atomics)
//! ```
//!
//! Per connection: upgrade (userId required) → register → replay queued
//! envelopes → read loop → compare-and-delete unregister.

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use async_trait::async_trait;

use crate::delivery::{DeliveryEngine, DeliveryError};
use crate::dispatch::{DispatchError, Dispatcher};
use crate::presence::{FrameSink, PresenceRegistry, SessionHandle, SinkError};
use crate::push::PushHandle;
use crate::stats::{RelayStats, ServerStats};
use crate::storage::RelayStore;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Upgrade path clients connect to
    pub ws_path: String,
    /// Longest a write to one client may take, lock wait included (default: 10s)
    pub write_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            ws_path: "/ws".to_string(),
            write_timeout: Duration::from_secs(10),
        }
    }
}

type WsWriter = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Write half of a client socket. The mutex serializes writes coming from
/// different sender tasks; a client that stops reading fails writes after
/// `write_timeout` instead of stalling its senders.
struct WsSink {
    writer: Mutex<WsWriter>,
    write_timeout: Duration,
}

impl WsSink {
    fn new(writer: WsWriter, write_timeout: Duration) -> Self {
        Self {
            writer: Mutex::new(writer),
            write_timeout,
        }
    }

    async fn send_message(&self, msg: Message) -> Result<(), SinkError> {
        let write = async { self.writer.lock().await.send(msg).await };
        match tokio::time::timeout(self.write_timeout, write).await {
            Ok(result) => result.map_err(|e| SinkError(e.to_string())),
            Err(_) => Err(SinkError(format!(
                "write timed out after {:?}",
                self.write_timeout
            ))),
        }
    }

    async fn close(&self) {
        let close = async { self.writer.lock().await.close().await };
        let _ = tokio::time::timeout(self.write_timeout, close).await;
    }
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send_frame(&self, frame: String) -> Result<(), SinkError> {
        self.send_message(Message::Text(frame.into())).await
    }
}

/// Everything a connection task needs.
#[derive(Clone)]
struct ConnectionContext {
    registry: Arc<PresenceRegistry>,
    engine: Arc<DeliveryEngine>,
    dispatcher: Arc<Dispatcher>,
    stats: Arc<RelayStats>,
    ws_path: String,
    write_timeout: Duration,
}

/// The relay server.
pub struct RelayServer {
    config: ServerConfig,
    ctx: ConnectionContext,
}

impl RelayServer {
    pub fn new(config: ServerConfig, store: Arc<RelayStore>, push: PushHandle) -> Self {
        let registry = Arc::new(PresenceRegistry::new());
        let stats = Arc::new(RelayStats::new());
        let engine = Arc::new(DeliveryEngine::new(
            registry.clone(),
            store,
            push,
            stats.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(engine.clone()));

        Self {
            ctx: ConnectionContext {
                registry,
                engine,
                dispatcher,
                stats,
                ws_path: config.ws_path.clone(),
                write_timeout: config.write_timeout,
            },
            config,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<PresenceRegistry> {
        &self.ctx.registry
    }

    pub fn engine(&self) -> &Arc<DeliveryEngine> {
        &self.ctx.engine
    }

    pub fn stats(&self) -> ServerStats {
        self.ctx.stats.snapshot()
    }

    /// Start listening for WebSocket connections.
    ///
    /// Runs until the listener fails. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Like [`run`](Self::run), but stops accepting once `shutdown` resolves.
    ///
    /// Connections already open keep running on their own tasks.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: Future<Output = ()>,
    {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        tokio::select! {
            result = self.serve(listener) => result,
            _ = shutdown => {
                log::info!("Relay server stopped accepting connections");
                Ok(())
            }
        }
    }

    async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        log::info!(
            "Relay server listening on {}{}",
            listener.local_addr()?,
            self.config.ws_path
        );

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    log::warn!("Accept failed: {e}");
                    continue;
                }
            };
            log::debug!("New TCP connection from {addr}");

            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, ctx).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        ctx: ConnectionContext,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut user_id: Option<String> = None;
        let ws_stream = tokio_tungstenite::accept_hdr_async(
            stream,
            |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
                if req.uri().path() != ctx.ws_path {
                    return Err(reject(StatusCode::NOT_FOUND, "Unknown path"));
                }
                match query_param(req.uri().query(), "userId") {
                    Some(id) => {
                        user_id = Some(id);
                        Ok(response)
                    }
                    None => Err(reject(
                        StatusCode::BAD_REQUEST,
                        "Missing userId in query parameters",
                    )),
                }
            },
        )
        .await;

        let (ws_stream, user_id) = match (ws_stream, user_id) {
            (Ok(ws), Some(user_id)) => (ws, user_id),
            (Err(e), _) => {
                log::warn!("Upgrade from {addr} refused: {e}");
                return Ok(());
            }
            (Ok(_), None) => return Ok(()),
        };

        let (ws_sender, mut ws_receiver) = ws_stream.split();
        let sink = Arc::new(WsSink::new(ws_sender, ctx.write_timeout));
        let session = SessionHandle::new(user_id.clone(), sink.clone());

        if let Some(previous) = ctx.registry.register(session.clone()).await? {
            log::info!(
                "User {user_id} reconnected from {addr}; session {} superseded",
                previous.id()
            );
        } else {
            log::info!("User {user_id} connected from {addr}");
        }
        ctx.stats.connection_opened();

        match ctx.engine.drain_offline(&session).await {
            Ok(0) => {}
            Ok(n) => log::info!("Replayed {n} queued envelopes to {user_id}"),
            Err(e) => log::warn!("Offline replay to {user_id} failed: {e}"),
        }

        loop {
            match ws_receiver.next().await {
                Some(Ok(Message::Text(text))) => {
                    Self::process_frame(&ctx, &session, text.as_str()).await;
                }
                Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                    Ok(text) => Self::process_frame(&ctx, &session, text).await,
                    Err(_) => {
                        ctx.stats.frame_received();
                        ctx.stats.frame_dropped();
                        log::warn!("Dropping non UTF-8 binary frame from {user_id}");
                    }
                },
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = sink.send_message(Message::Pong(data)).await {
                        log::debug!("Pong to {user_id} failed: {e}");
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    log::debug!("User {user_id} closed the connection");
                    break;
                }
                Some(Err(e)) => {
                    log::warn!("WebSocket error from {user_id}: {e}");
                    break;
                }
                Some(Ok(_)) => {}
            }
        }

        if !ctx.registry.unregister(&user_id, session.id()).await {
            log::debug!("Session {} of {user_id} was already superseded", session.id());
        }
        ctx.stats.connection_closed();
        sink.close().await;
        log::info!("User {user_id} disconnected ({:?} online)", session.age());

        Ok(())
    }

    /// One inbound frame. Failures drop the frame, never the connection.
    async fn process_frame(ctx: &ConnectionContext, session: &SessionHandle, text: &str) {
        ctx.stats.frame_received();
        if let Err(e) = ctx.dispatcher.handle_frame(session, text).await {
            ctx.stats.frame_dropped();
            match e {
                DispatchError::Delivery(DeliveryError::Store(_)) => {
                    log::error!("Frame from {} lost: {e}", session.user_id());
                }
                _ => log::warn!("Dropping frame from {}: {e}", session.user_id()),
            }
        }
    }
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

/// First non-empty value of `key` in a query string, percent-decoded.
fn query_param(query: Option<&str>, key: &str) -> Option<String> {
    url::form_urlencoded::parse(query?.as_bytes())
        .find(|(k, v)| k == key && !v.is_empty())
        .map(|(_, v)| v.into_owned())
}
