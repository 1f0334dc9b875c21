//! Live-or-queue delivery of envelopes to a user.
//!
//! ```text
//! deliver(receiver, envelope)
//!   ├─ online  ──► write to session ──ok──► Live
//!   │                     └─err──► evict session ─┐
//!   └─ offline ───────────────────────────────────┴─► store + push ──► Queued
//! ```
//!
//! Queued entries are replayed on every reconnect until the receiver
//! acknowledges delivery, so replay is at-least-once.

use crate::presence::{PresenceRegistry, SessionHandle, SinkError};
use crate::protocol::{Envelope, ProtocolError};
use crate::push::PushHandle;
use crate::stats::RelayStats;
use crate::storage::{RelayStore, StoreError};
use std::fmt;
use std::sync::Arc;

/// Where an envelope ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Written to the receiver's live session
    Live,
    /// Persisted for replay, push requested
    Queued,
}

#[derive(Debug, Clone)]
pub enum DeliveryError {
    MissingReceiver,
    Encode(ProtocolError),
    Store(StoreError),
    /// Replay to a reconnecting session failed
    Write(SinkError),
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryError::MissingReceiver => write!(f, "Envelope has no receiver"),
            DeliveryError::Encode(e) => write!(f, "{e}"),
            DeliveryError::Store(e) => write!(f, "Offline queue: {e}"),
            DeliveryError::Write(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for DeliveryError {}

impl From<StoreError> for DeliveryError {
    fn from(e: StoreError) -> Self {
        DeliveryError::Store(e)
    }
}

pub struct DeliveryEngine {
    registry: Arc<PresenceRegistry>,
    store: Arc<RelayStore>,
    push: PushHandle,
    stats: Arc<RelayStats>,
}

impl DeliveryEngine {
    pub fn new(
        registry: Arc<PresenceRegistry>,
        store: Arc<RelayStore>,
        push: PushHandle,
        stats: Arc<RelayStats>,
    ) -> Self {
        Self {
            registry,
            store,
            push,
            stats,
        }
    }

    pub fn registry(&self) -> &Arc<PresenceRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<RelayStore> {
        &self.store
    }

    /// Deliver `envelope` to `receiver_id`, live if possible.
    pub async fn deliver(
        &self,
        receiver_id: &str,
        envelope: &Envelope,
    ) -> Result<Delivery, DeliveryError> {
        if receiver_id.is_empty() {
            return Err(DeliveryError::MissingReceiver);
        }
        let frame = envelope.encode().map_err(DeliveryError::Encode)?;

        if let Some(session) = self.registry.lookup(receiver_id).await {
            match session.send_frame(frame.clone()).await {
                Ok(()) => {
                    self.stats.live_delivery();
                    log::debug!("{} delivered live to {receiver_id}", envelope.kind);
                    return Ok(Delivery::Live);
                }
                Err(e) => {
                    log::warn!(
                        "{} to {receiver_id} (session {}) failed, queueing: {e}",
                        envelope.kind,
                        session.id()
                    );
                    self.registry.unregister(receiver_id, session.id()).await;
                }
            }
        }

        self.store
            .enqueue(receiver_id, envelope.message_id(), &frame)?;
        self.stats.queued_delivery();
        self.push.dispatch(receiver_id);
        log::debug!("{} queued for offline {receiver_id}", envelope.kind);
        Ok(Delivery::Queued)
    }

    /// Replay everything queued for the session's user, oldest first.
    ///
    /// Entries stay in the queue. Stops at the first failed write.
    pub async fn drain_offline(&self, session: &SessionHandle) -> Result<usize, DeliveryError> {
        let pending = self.store.pending_for(session.user_id())?;
        let total = pending.len();

        for (sent, entry) in pending.into_iter().enumerate() {
            if let Err(e) = session.send_frame(entry.payload).await {
                log::warn!(
                    "Replay to {} stopped after {sent}/{total} entries: {e}",
                    session.user_id()
                );
                return Err(DeliveryError::Write(e));
            }
        }

        Ok(total)
    }

    /// Remove queued copies of `message_id` addressed to `receiver_id`.
    pub fn acknowledge_delivered(
        &self,
        receiver_id: &str,
        message_id: &str,
    ) -> Result<usize, StoreError> {
        let removed = self.store.delete_by_message_id(receiver_id, message_id)?;
        if removed > 0 {
            log::debug!("Released {removed} queued entries of {message_id} for {receiver_id}");
        }
        Ok(removed)
    }
}
