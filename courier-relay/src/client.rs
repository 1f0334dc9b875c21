//! WebSocket relay client.
//!
//! A thin async client used by integration tests, load tools and bots:
//! connect as a user, send envelopes, and await the next inbound one.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::protocol::{Envelope, ProtocolError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct RelayClient {
    user_id: String,
    writer: SplitSink<WsStream, Message>,
    reader: SplitStream<WsStream>,
}

impl RelayClient {
    /// Connect to `base_url` (e.g. `ws://127.0.0.1:8080/ws`) as `user_id`.
    pub async fn connect(base_url: &str, user_id: &str) -> Result<Self, ProtocolError> {
        let url = session_url(base_url, user_id)?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| ProtocolError::Connection(e.to_string()))?;
        let (writer, reader) = ws_stream.split();

        log::debug!("Connected to {base_url} as {user_id}");

        Ok(Self {
            user_id: user_id.to_string(),
            writer,
            reader,
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub async fn send(&mut self, envelope: &Envelope) -> Result<(), ProtocolError> {
        let frame = envelope.encode()?;
        self.send_raw(&frame).await
    }

    /// Send a text frame as-is, valid envelope or not.
    pub async fn send_raw(&mut self, frame: &str) -> Result<(), ProtocolError> {
        self.writer
            .send(Message::Text(frame.into()))
            .await
            .map_err(|e| ProtocolError::Connection(e.to_string()))
    }

    /// Next envelope, or `None` if nothing arrives within `wait`.
    pub async fn recv(&mut self, wait: Duration) -> Result<Option<Envelope>, ProtocolError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let next = match tokio::time::timeout_at(deadline, self.reader.next()).await {
                Ok(next) => next,
                Err(_) => return Ok(None),
            };
            match next {
                Some(Ok(Message::Text(text))) => return Envelope::decode(text.as_str()).map(Some),
                Some(Ok(Message::Binary(data))) => return Envelope::decode_bytes(&data).map(Some),
                Some(Ok(Message::Close(_))) | None => return Err(ProtocolError::ConnectionClosed),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(ProtocolError::Connection(e.to_string())),
            }
        }
    }

    pub async fn close(mut self) -> Result<(), ProtocolError> {
        self.writer
            .close()
            .await
            .map_err(|e| ProtocolError::Connection(e.to_string()))
    }
}

/// `base_url` with `userId` appended as an encoded query pair.
fn session_url(base_url: &str, user_id: &str) -> Result<Url, ProtocolError> {
    let mut url = Url::parse(base_url.trim_end_matches('/'))
        .map_err(|e| ProtocolError::Connection(format!("{base_url}: {e}")))?;
    url.query_pairs_mut().append_pair("userId", user_id);
    Ok(url)
}
