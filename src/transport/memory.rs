//! In-process transport for tests (`test-util` feature).
//!
//! [`MemoryTransport::new`] returns the transport together with a
//! [`MemoryAcceptor`]; every successful `open` hands the broker end of the new
//! connection to the acceptor as a [`MemoryPeer`], which speaks STOMP frames
//! through the same codec the session uses.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::channel::mpsc as fmpsc;
use futures::{SinkExt, StreamExt};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tokio_util::codec::Decoder;

use super::{ConnError, Transport, TransportConn};
use crate::codec::{StompCodec, StompItem};
use crate::config::BrokerUrl;
use crate::frame::Frame;

pub struct MemoryTransport {
    peers: mpsc::UnboundedSender<MemoryPeer>,
    refuse: AtomicUsize,
    opened: AtomicUsize,
}

impl MemoryTransport {
    pub fn new() -> (Self, MemoryAcceptor) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                peers: tx,
                refuse: AtomicUsize::new(0),
                opened: AtomicUsize::new(0),
            },
            MemoryAcceptor { peers: rx },
        )
    }

    /// Make the next `n` calls to `open` fail with `ConnectionRefused`.
    pub fn refuse_next(&self, n: usize) {
        self.refuse.store(n, Ordering::SeqCst);
    }

    /// Number of `open` attempts so far, failed ones included.
    pub fn open_attempts(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

fn refused() -> ConnError {
    ConnError::Io(io::Error::new(
        io::ErrorKind::ConnectionRefused,
        "memory transport refused connection",
    ))
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, _url: &BrokerUrl) -> Result<TransportConn, ConnError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let refused_now = self
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused_now {
            return Err(refused());
        }

        let (client_tx, peer_rx) = fmpsc::unbounded::<Bytes>();
        let (peer_tx, client_rx) = fmpsc::unbounded::<io::Result<Bytes>>();
        let peer = MemoryPeer {
            outbound: peer_tx,
            inbound: peer_rx,
            codec: StompCodec::new(),
            buf: BytesMut::new(),
        };
        self.peers.send(peer).map_err(|_| refused())?;

        let sink = client_tx.sink_map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe));
        Ok(TransportConn::new(sink, client_rx))
    }
}

/// Receives the broker ends of connections opened through a
/// [`MemoryTransport`]. Dropping it makes further opens fail.
pub struct MemoryAcceptor {
    peers: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl MemoryAcceptor {
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.peers.recv().await
    }
}

/// Broker end of an in-memory connection.
pub struct MemoryPeer {
    outbound: fmpsc::UnboundedSender<io::Result<Bytes>>,
    inbound: fmpsc::UnboundedReceiver<Bytes>,
    codec: StompCodec,
    buf: BytesMut,
}

impl MemoryPeer {
    /// Next item sent by the client, heart-beats included. `None` once the
    /// client closed its side.
    pub async fn recv_item(&mut self) -> io::Result<Option<StompItem>> {
        loop {
            if let Some(item) = self.codec.decode(&mut self.buf)? {
                return Ok(Some(item));
            }
            match self.inbound.next().await {
                Some(payload) => self.buf.extend_from_slice(&payload),
                None => return Ok(None),
            }
        }
    }

    /// Next frame sent by the client, skipping heart-beats.
    pub async fn recv_frame(&mut self) -> io::Result<Option<Frame>> {
        loop {
            match self.recv_item().await? {
                Some(StompItem::Frame(f)) => return Ok(Some(f)),
                Some(StompItem::Heartbeat) => continue,
                None => return Ok(None),
            }
        }
    }

    /// Wait for CONNECT and answer CONNECTED with heart-beating disabled.
    pub async fn accept_connect(&mut self) -> io::Result<Frame> {
        self.accept_connect_with_heartbeat("0,0").await
    }

    pub async fn accept_connect_with_heartbeat(&mut self, heartbeat: &str) -> io::Result<Frame> {
        let connect = self.recv_frame().await?.ok_or_else(|| {
            io::Error::new(io::ErrorKind::UnexpectedEof, "closed before CONNECT")
        })?;
        if connect.command != "CONNECT" && connect.command != "STOMP" {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("expected CONNECT, got {}", connect.command),
            ));
        }
        self.send_frame(
            Frame::new("CONNECTED")
                .header("version", "1.2")
                .header("heart-beat", heartbeat),
        )?;
        Ok(connect)
    }

    pub fn send_frame(&self, frame: Frame) -> io::Result<()> {
        let bytes = StompCodec::new().encode_item(StompItem::Frame(frame))?;
        self.send_raw(bytes.freeze())
    }

    /// Send an arbitrary payload as one message.
    pub fn send_raw(&self, payload: Bytes) -> io::Result<()> {
        self.outbound
            .unbounded_send(Ok(payload))
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
    }

    /// Make the client's read side fail with `err`.
    pub fn fail(&self, err: io::Error) {
        let _ = self.outbound.unbounded_send(Err(err));
    }

    /// Close the broker side; the client sees end of stream.
    pub fn close(self) {
        self.outbound.close_channel();
    }
}
