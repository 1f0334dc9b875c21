//! Routes decoded envelopes to their handlers.

use crate::ack;
use crate::delivery::{DeliveryEngine, DeliveryError};
use crate::presence::SessionHandle;
use crate::protocol::{BindError, Envelope, EnvelopeKind, ProtocolError};
use std::fmt;
use std::sync::Arc;

/// Why an inbound envelope was not relayed.
#[derive(Debug, Clone)]
pub enum DispatchError {
    Protocol(ProtocolError),
    Bind(BindError),
    MissingReceiver(EnvelopeKind),
    /// Kind the relay emits but never accepts from clients
    OutboundOnly(EnvelopeKind),
    Delivery(DeliveryError),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::Protocol(e) => write!(f, "{e}"),
            DispatchError::Bind(e) => write!(f, "{e}"),
            DispatchError::MissingReceiver(kind) => write!(f, "{kind} has no receiver_id"),
            DispatchError::OutboundOnly(kind) => write!(f, "{kind} is not accepted from clients"),
            DispatchError::Delivery(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for DispatchError {}

impl From<ProtocolError> for DispatchError {
    fn from(e: ProtocolError) -> Self {
        DispatchError::Protocol(e)
    }
}

impl From<BindError> for DispatchError {
    fn from(e: BindError) -> Self {
        DispatchError::Bind(e)
    }
}

impl From<DeliveryError> for DispatchError {
    fn from(e: DeliveryError) -> Self {
        DispatchError::Delivery(e)
    }
}

pub struct Dispatcher {
    engine: Arc<DeliveryEngine>,
}

impl Dispatcher {
    pub fn new(engine: Arc<DeliveryEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<DeliveryEngine> {
        &self.engine
    }

    /// Decode one text frame from `session` and dispatch it.
    pub async fn handle_frame(
        &self,
        session: &SessionHandle,
        frame: &str,
    ) -> Result<(), DispatchError> {
        let envelope = Envelope::decode(frame)?;
        self.dispatch(session, envelope).await
    }

    pub async fn dispatch(
        &self,
        session: &SessionHandle,
        envelope: Envelope,
    ) -> Result<(), DispatchError> {
        log::trace!("{} from {}", envelope.kind, session.user_id());
        let engine = self.engine.as_ref();

        match envelope.kind {
            EnvelopeKind::Message | EnvelopeKind::EditMessage => {
                ack::on_message(engine, session, &envelope).await
            }
            EnvelopeKind::DeleteMessage => ack::on_delete(engine, session, &envelope).await,
            EnvelopeKind::AckRead => ack::on_read(engine, &envelope).await,
            EnvelopeKind::AckSent => ack::on_sent(engine, &envelope).await,
            EnvelopeKind::AckDelivered => ack::on_delivered(engine, session, &envelope).await,
            EnvelopeKind::AckError => Err(DispatchError::OutboundOnly(envelope.kind)),
            EnvelopeKind::WebrtcOffer
            | EnvelopeKind::WebrtcAnswer
            | EnvelopeKind::WebrtcCandidate
            | EnvelopeKind::WebrtcDelivered
            | EnvelopeKind::WebrtcHangup
            | EnvelopeKind::WebrtcDecline => relay_signal(engine, &envelope).await,
        }
    }
}

/// Call signaling is opaque: route on `receiver_id`, forward unchanged.
async fn relay_signal(engine: &DeliveryEngine, envelope: &Envelope) -> Result<(), DispatchError> {
    let receiver_id = envelope
        .receiver_id()
        .ok_or(DispatchError::MissingReceiver(envelope.kind))?;
    engine.deliver(receiver_id, envelope).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::PresenceRegistry;
    use crate::push::{LogNotifier, PushConfig, PushDispatcher};
    use crate::stats::RelayStats;
    use crate::storage::{RelayStore, StoreConfig};
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    struct Fixture {
        _dir: TempDir,
        _push: PushDispatcher,
        dispatcher: Dispatcher,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RelayStore::open(StoreConfig::for_testing(dir.path())).unwrap());
        let push = PushDispatcher::start(Arc::new(LogNotifier), PushConfig::for_testing());
        let engine = DeliveryEngine::new(
            Arc::new(PresenceRegistry::new()),
            store,
            push.handle(),
            Arc::new(RelayStats::new()),
        );
        Fixture {
            _dir: dir,
            _push: push,
            dispatcher: Dispatcher::new(Arc::new(engine)),
        }
    }

    async fn connect(d: &Dispatcher, user: &str) -> (SessionHandle, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = SessionHandle::new(user, Arc::new(tx));
        d.engine().registry().register(session.clone()).await.unwrap();
        (session, rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<String>) -> Envelope {
        let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        Envelope::decode(&frame).unwrap()
    }

    #[tokio::test]
    async fn test_signaling_forwarded_unchanged() {
        let f = fixture();
        let (alice, _alice_rx) = connect(&f.dispatcher, "alice").await;
        let (_bob, mut bob_rx) = connect(&f.dispatcher, "bob").await;

        for kind in EnvelopeKind::ALL.into_iter().filter(EnvelopeKind::is_signaling) {
            let env = Envelope::new(kind, json!({"receiver_id": "bob", "sdp": "v=0", "extra": [1, 2]}));
            f.dispatcher.dispatch(&alice, env.clone()).await.unwrap();
            assert_eq!(next(&mut bob_rx).await, env);
        }
    }

    #[tokio::test]
    async fn test_signaling_without_receiver() {
        let f = fixture();
        let (alice, _rx) = connect(&f.dispatcher, "alice").await;

        let env = Envelope::new(EnvelopeKind::WebrtcOffer, json!({"sdp": "v=0"}));
        let err = f.dispatcher.dispatch(&alice, env).await.unwrap_err();
        assert!(matches!(err, DispatchError::MissingReceiver(EnvelopeKind::WebrtcOffer)));
    }

    #[tokio::test]
    async fn test_signaling_to_offline_user_is_queued() {
        let f = fixture();
        let (alice, _rx) = connect(&f.dispatcher, "alice").await;

        let env = Envelope::new(EnvelopeKind::WebrtcHangup, json!({"receiver_id": "carol"}));
        f.dispatcher.dispatch(&alice, env).await.unwrap();

        let store = f.dispatcher.engine().store();
        let pending = store.pending_for("carol").unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].message_id, None);
    }

    #[tokio::test]
    async fn test_inbound_ack_error_dropped() {
        let f = fixture();
        let (alice, _rx) = connect(&f.dispatcher, "alice").await;

        let env = Envelope::new(EnvelopeKind::AckError, json!({"receiver_id": "bob"}));
        let err = f.dispatcher.dispatch(&alice, env).await.unwrap_err();
        assert!(matches!(err, DispatchError::OutboundOnly(EnvelopeKind::AckError)));
        assert_eq!(f.dispatcher.engine().store().pending_count("bob").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_handle_frame_rejects_garbage() {
        let f = fixture();
        let (alice, _rx) = connect(&f.dispatcher, "alice").await;

        assert!(matches!(
            f.dispatcher.handle_frame(&alice, "not json").await,
            Err(DispatchError::Protocol(ProtocolError::Decode(_)))
        ));
        assert!(matches!(
            f.dispatcher.handle_frame(&alice, r#"{"type":"presence","data":{}}"#).await,
            Err(DispatchError::Protocol(ProtocolError::UnknownType(_)))
        ));
    }

    #[tokio::test]
    async fn test_handle_frame_routes_message() {
        let f = fixture();
        let (alice, mut alice_rx) = connect(&f.dispatcher, "alice").await;
        let (_bob, mut bob_rx) = connect(&f.dispatcher, "bob").await;

        let frame = r#"{"type":"message","data":{"_id":"m1","sender_id":"alice","receiver_id":"bob","content":"hi"}}"#;
        f.dispatcher.handle_frame(&alice, frame).await.unwrap();

        assert_eq!(next(&mut alice_rx).await.kind, EnvelopeKind::AckSent);
        assert_eq!(next(&mut bob_rx).await.data["content"], "hi");
    }
}
