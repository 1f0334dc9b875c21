//! # courier-relay — Real-time message relay
//!
//! Routes chat messages, acknowledgments and WebRTC call signaling between
//! users connected over WebSocket. Envelopes for offline users are queued in
//! RocksDB, replayed on reconnect, and released by a delivered
//! acknowledgment. A push wake-up is requested for every queued envelope.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ RelayClient │ ◄─────────────────► │ RelayServer │
//! │ (per user)  │     JSON envelopes  │ (central)   │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                    ┌───────┴───────┐
//!                                    │  Dispatcher   │
//!                                    └───────┬───────┘
//!                                            ▼
//!                                    ┌───────────────┐     ┌──────────────────┐
//!                                    │DeliveryEngine │ ──► │ PresenceRegistry │
//!                                    └───┬───────┬───┘     └──────────────────┘
//!                                        ▼       ▼
//!                               ┌────────────┐ ┌────────────────┐
//!                               │ RelayStore │ │ PushDispatcher │
//!                               └────────────┘ └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON envelope codec and record types
//! - [`presence`] — user → live session registry
//! - [`dispatch`] — envelope kind → handler routing
//! - [`delivery`] — live-or-queue delivery, offline replay
//! - [`push`] — wake-up notifications (FCM) behind a bounded worker pool
//! - [`oauth`] — service-account access tokens for FCM
//! - [`server`] — WebSocket relay server
//! - [`client`] — WebSocket relay client
//! - [`storage`] — RocksDB offline queue and push tokens

pub mod protocol;
pub mod presence;
pub mod dispatch;
pub mod delivery;
pub mod push;
pub mod oauth;
pub mod server;
pub mod client;
pub mod stats;
pub mod storage;

mod ack;

// Re-exports for convenience
pub use protocol::{
    BindError, ChatMessage, DeleteForEveryone, DeliveredAck, Envelope, EnvelopeKind, ErrorAck,
    ProtocolError, ReadAck, SentAck,
};
pub use presence::{FrameSink, PresenceError, PresenceRegistry, SessionHandle, SinkError};
pub use dispatch::{DispatchError, Dispatcher};
pub use delivery::{Delivery, DeliveryEngine, DeliveryError};
pub use push::{
    FcmConfig, FcmNotifier, LogNotifier, PushConfig, PushDispatcher, PushError, PushHandle,
    PushNotifier, PushStats,
};
pub use oauth::{AuthError, ServiceAccountKey, ServiceAccountTokens, TokenSource};
pub use server::{RelayServer, ServerConfig};
pub use client::RelayClient;
pub use stats::{RelayStats, ServerStats};
pub use storage::{OfflineEntry, RelayStore, StoreConfig, StoreError};
