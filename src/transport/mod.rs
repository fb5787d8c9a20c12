//! Byte-message transports the session runs STOMP over.
//!
//! A [`Transport`] opens a connection to a [`BrokerUrl`] and hands back a
//! [`TransportConn`]: a sink accepting one encoded STOMP item per message and
//! a stream yielding inbound payloads. End of stream means the peer closed
//! the connection; a stream error means it failed.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Sink, Stream};
use std::io;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

use crate::config::BrokerUrl;
use crate::frame::ServerError;

#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod websocket;

#[cfg(any(test, feature = "test-util"))]
pub use memory::{MemoryAcceptor, MemoryPeer, MemoryTransport};
pub use websocket::WebSocketTransport;

/// Errors raised while establishing or running a broker connection.
#[derive(Error, Debug)]
pub enum ConnError {
    /// I/O-level error
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// Protocol-level error
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The broker answered with an ERROR frame
    #[error("broker rejected connection: {0}")]
    ServerRejected(ServerError),
    /// Transport-specific failure (e.g. WebSocket handshake)
    #[error("transport error: {0}")]
    Transport(String),
    /// The connect handshake did not finish in time
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),
}

pub type BoxSink = Pin<Box<dyn Sink<Bytes, Error = io::Error> + Send>>;
pub type BoxStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// An open, bidirectional message connection.
pub struct TransportConn {
    pub sink: BoxSink,
    pub stream: BoxStream,
}

impl TransportConn {
    pub fn new<S, R>(sink: S, stream: R) -> Self
    where
        S: Sink<Bytes, Error = io::Error> + Send + 'static,
        R: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }
}

/// Opens connections to a broker. Injected into the session at
/// construction.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn open(&self, url: &BrokerUrl) -> Result<TransportConn, ConnError>;
}
