use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt, future};
use std::io;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::debug;

use super::{ConnError, Transport, TransportConn};
use crate::config::BrokerUrl;

/// Transport carrying STOMP frames in WebSocket messages.
///
/// Outbound payloads that are valid UTF-8 go out as text messages (what
/// browser-oriented brokers expect), anything else as binary. Ping, pong and
/// close control messages are not surfaced to the session.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }
}

pub(crate) fn to_message(payload: Bytes) -> Message {
    match String::from_utf8(payload.to_vec()) {
        Ok(text) => Message::text(text),
        Err(e) => Message::binary(e.into_bytes()),
    }
}

/// Payload of a data message, `None` for control messages.
pub(crate) fn from_message(msg: Message) -> Option<Bytes> {
    match msg {
        Message::Text(_) | Message::Binary(_) => Some(Bytes::from(msg.into_data())),
        _ => None,
    }
}

pub(crate) fn ws_to_io(e: tungstenite::Error) -> io::Error {
    match e {
        tungstenite::Error::Io(e) => e,
        other => io::Error::other(other),
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, url: &BrokerUrl) -> Result<TransportConn, ConnError> {
        debug!(url = %url, "opening websocket");
        let (ws, response) = connect_async(url.as_str()).await.map_err(|e| match e {
            tungstenite::Error::Io(e) => ConnError::Io(e),
            other => ConnError::Transport(other.to_string()),
        })?;
        debug!(status = %response.status(), "websocket handshake complete");

        let (sink, stream) = ws.split();
        let sink = sink
            .with(|payload: Bytes| future::ready(Ok::<_, tungstenite::Error>(to_message(payload))))
            .sink_map_err(ws_to_io);
        let stream = stream.filter_map(|item| {
            future::ready(match item {
                Ok(msg) => from_message(msg).map(Ok),
                Err(e) => Some(Err(ws_to_io(e))),
            })
        });
        Ok(TransportConn::new(sink, stream))
    }
}
