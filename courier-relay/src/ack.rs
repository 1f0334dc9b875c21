//! Message and acknowledgment handlers.
//!
//! ```text
//! sender ──message──► relay ──ack_sent──► sender
//!                       └────message────► receiver ──ack_delivered──► relay
//!                                                                      ├─► sender
//!                                                                      └─► release queued copies
//! ```

use crate::delivery::{DeliveryEngine, DeliveryError};
use crate::dispatch::DispatchError;
use crate::presence::SessionHandle;
use crate::protocol::{
    server_timestamp, ChatMessage, DeleteForEveryone, DeliveredAck, Envelope, ErrorAck, ReadAck,
    SentAck, STATUS_SENT,
};

/// `message` and `edit_message`: confirm to the sender, forward to the receiver.
pub(crate) async fn on_message(
    engine: &DeliveryEngine,
    session: &SessionHandle,
    envelope: &Envelope,
) -> Result<(), DispatchError> {
    let mut message: ChatMessage = envelope.bind()?;
    if message.receiver_id.is_empty() {
        let ack = ErrorAck {
            message_id: message.id.clone(),
            sender_id: message.sender_id.clone(),
            chat_id: message.chat_id.clone(),
            group_id: message.group_id.clone(),
            timestamp: server_timestamp(),
            reason: "missing receiver_id".to_string(),
            ..Default::default()
        };
        reject(engine, session, &ack).await;
        return Err(DispatchError::MissingReceiver(envelope.kind));
    }

    message.server_ts = server_timestamp();
    message.status = STATUS_SENT.to_string();
    if message.sender_id.is_empty() {
        message.sender_id = session.user_id().to_string();
    }

    confirm(engine, &message.sender_id, &SentAck::for_message(&message)).await;
    engine.deliver(&message.receiver_id, envelope).await?;
    Ok(())
}

/// `delete_message`: same confirmation, forwarded with its original data.
pub(crate) async fn on_delete(
    engine: &DeliveryEngine,
    session: &SessionHandle,
    envelope: &Envelope,
) -> Result<(), DispatchError> {
    let mut deletion: DeleteForEveryone = envelope.bind()?;
    if deletion.receiver_id.is_empty() {
        let ack = ErrorAck {
            message_id: deletion.id.clone(),
            sender_id: deletion.sender_id.clone(),
            chat_id: deletion.chat_id.clone(),
            group_id: deletion.group_id.clone(),
            timestamp: server_timestamp(),
            reason: "missing receiver_id".to_string(),
            ..Default::default()
        };
        reject(engine, session, &ack).await;
        return Err(DispatchError::MissingReceiver(envelope.kind));
    }

    deletion.server_ts = server_timestamp();
    if deletion.sender_id.is_empty() {
        deletion.sender_id = session.user_id().to_string();
    }

    confirm(engine, &deletion.sender_id, &SentAck::for_deletion(&deletion)).await;
    engine.deliver(&deletion.receiver_id, envelope).await?;
    Ok(())
}

/// `ack_read` goes back to the original sender.
pub(crate) async fn on_read(engine: &DeliveryEngine, envelope: &Envelope) -> Result<(), DispatchError> {
    let ack: ReadAck = envelope.bind()?;
    engine.deliver(&ack.sender_id, envelope).await?;
    Ok(())
}

/// `ack_sent` relayed by a client is passed to its receiver.
pub(crate) async fn on_sent(engine: &DeliveryEngine, envelope: &Envelope) -> Result<(), DispatchError> {
    let ack: SentAck = envelope.bind()?;
    engine.deliver(&ack.receiver_id, envelope).await?;
    Ok(())
}

/// `ack_delivered`: tell the sender, then release queued copies.
///
/// Only entries queued for the acknowledging user are removed, so a copy of
/// the same message id queued for someone else is untouched.
pub(crate) async fn on_delivered(
    engine: &DeliveryEngine,
    session: &SessionHandle,
    envelope: &Envelope,
) -> Result<(), DispatchError> {
    let ack: DeliveredAck = envelope.bind()?;

    let forwarded = engine.deliver(&ack.sender_id, envelope).await;

    if !ack.message_id.is_empty() {
        engine
            .acknowledge_delivered(session.user_id(), &ack.message_id)
            .map_err(DeliveryError::from)?;
    }

    forwarded?;
    Ok(())
}

/// Sent-acks are best effort; a failure never blocks the forward.
async fn confirm(engine: &DeliveryEngine, sender_id: &str, ack: &SentAck) {
    let result = match Envelope::sent_ack(ack) {
        Ok(env) => engine.deliver(sender_id, &env).await.map(|_| ()),
        Err(e) => Err(DeliveryError::Encode(e)),
    };
    if let Err(e) = result {
        log::warn!("ack_sent for {} to {sender_id} failed: {e}", ack.message_id);
    }
}

async fn reject(engine: &DeliveryEngine, session: &SessionHandle, ack: &ErrorAck) {
    log::warn!(
        "Rejecting {} from {}: {}",
        ack.message_id,
        session.user_id(),
        ack.reason
    );
    let result = match Envelope::error_ack(ack) {
        Ok(env) => engine.deliver(session.user_id(), &env).await.map(|_| ()),
        Err(e) => Err(DeliveryError::Encode(e)),
    };
    if let Err(e) = result {
        log::warn!("ack_error to {} failed: {e}", session.user_id());
    }
}
