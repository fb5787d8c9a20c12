//! A small STOMP-over-WebSocket topic broker.
//!
//! Serves WebSocket upgrades on one path, accepts any credentials, and fans
//! every SEND out to the current subscribers of its destination. Nothing is
//! stored: a message sent to a destination without subscribers is dropped.

use bytes::BytesMut;
use futures::{FutureExt, SinkExt, StreamExt};
use std::io;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_util::codec::Decoder;
use tracing::{debug, info, warn};

use crate::codec::{StompCodec, StompItem};
use crate::frame::Frame;
use crate::heartbeat::{negotiate_heartbeats, parse_heartbeat_header};
use crate::transport::websocket::{from_message, to_message, ws_to_io};

mod topic;

pub use topic::TopicManager;
use topic::TopicSubscriber;

/// Heart-beat interval the broker offers in both directions (ms).
pub const DEFAULT_BROKER_HEARTBEAT: u64 = 5000;

pub struct Broker {
    listener: TcpListener,
    path: String,
    heartbeat_ms: u64,
    topics: Arc<TopicManager>,
    conn_counter: Arc<AtomicU64>,
}

impl Broker {
    /// Bind `addr` and serve WebSocket upgrades on `path` (e.g. `/ws`).
    pub async fn bind(addr: &str, path: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            path: path.to_string(),
            heartbeat_ms: DEFAULT_BROKER_HEARTBEAT,
            topics: Arc::new(TopicManager::new()),
            conn_counter: Arc::new(AtomicU64::new(1)),
        })
    }

    /// Heart-beat the broker offers in CONNECTED; `0` disables it.
    pub fn with_heartbeat(mut self, millis: u64) -> Self {
        self.heartbeat_ms = millis;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn topics(&self) -> Arc<TopicManager> {
        self.topics.clone()
    }

    /// Accept connections until the listener fails.
    pub async fn run(self) -> io::Result<()> {
        info!(addr = ?self.listener.local_addr().ok(), path = %self.path, "broker listening");
        loop {
            let (stream, peer) = self.listener.accept().await?;
            let conn_id = self.conn_counter.fetch_add(1, Ordering::SeqCst);
            let ctx = ConnContext {
                conn_id,
                path: self.path.clone(),
                heartbeat_ms: self.heartbeat_ms,
                topics: self.topics.clone(),
            };
            tokio::spawn(async move {
                debug!(conn_id, %peer, "accepted");
                match AssertUnwindSafe(ctx.serve(stream)).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!(conn_id, error = %e, "connection ended with error"),
                    Err(_) => warn!(conn_id, "connection task panicked"),
                }
                ctx.topics.remove_connection(conn_id).await;
                debug!(conn_id, "connection closed");
            });
        }
    }

    /// Run on a background task.
    pub fn spawn(self) -> io::Result<BrokerHandle> {
        let addr = self.local_addr()?;
        let path = self.path.clone();
        let topics = self.topics.clone();
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = shutdown_rx.recv() => {}
                res = self.run() => {
                    if let Err(e) = res {
                        warn!(error = %e, "broker stopped");
                    }
                }
            }
        });
        Ok(BrokerHandle {
            addr,
            path,
            topics,
            shutdown_tx,
            task,
        })
    }
}

/// Handle to a broker started with [`Broker::spawn`].
pub struct BrokerHandle {
    addr: SocketAddr,
    path: String,
    topics: Arc<TopicManager>,
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl BrokerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// `ws://` URL clients can connect to.
    pub fn url(&self) -> String {
        format!("ws://{}{}", self.addr, self.path)
    }

    pub fn topics(&self) -> Arc<TopicManager> {
        self.topics.clone()
    }

    /// Stop accepting connections. Connections already open keep running
    /// until their clients leave.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.task.await;
    }
}

struct ConnContext {
    conn_id: u64,
    path: String,
    heartbeat_ms: u64,
    topics: Arc<TopicManager>,
}

/// What the connection loop should do after a client frame.
enum Next {
    Continue,
    /// Orderly end after DISCONNECT.
    Close,
    /// End after an ERROR frame; a pending receipt is not honoured.
    Reject,
}

fn error_frame(message: &str, detail: &str) -> Frame {
    Frame::new("ERROR")
        .header("message", message)
        .set_body(detail.as_bytes().to_vec())
}

impl ConnContext {
    async fn serve(&self, stream: TcpStream) -> io::Result<()> {
        let path = self.path.as_str();
        let check_path = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            if req.uri().path() == path {
                Ok(resp)
            } else {
                let mut err = ErrorResponse::new(Some("not found".to_string()));
                *err.status_mut() = StatusCode::NOT_FOUND;
                Err(err)
            }
        };
        let ws = accept_hdr_async(stream, check_path)
            .await
            .map_err(ws_to_io)?;
        let (mut sink, mut stream) = ws.split();

        let (deliver_tx, mut deliver_rx) = mpsc::unbounded_channel::<Frame>();
        let mut codec = StompCodec::new();
        let mut buf = BytesMut::new();
        let mut connected = false;
        let mut send_interval: Option<Duration> = None;
        let mut hb_tick = tokio::time::interval(Duration::from_secs(86400));

        loop {
            let mut replies: Vec<StompItem> = Vec::new();
            let mut next = Next::Continue;
            tokio::select! {
                msg = stream.next() => {
                    let payload = match msg {
                        Some(Ok(m)) => match from_message(m) {
                            Some(p) => p,
                            None => continue,
                        },
                        Some(Err(e)) => return Err(ws_to_io(e)),
                        None => return Ok(()),
                    };
                    buf.extend_from_slice(&payload);
                    loop {
                        let item = match codec.decode(&mut buf) {
                            Ok(Some(item)) => item,
                            Ok(None) => break,
                            Err(e) => {
                                replies.push(StompItem::Frame(error_frame("malformed frame", &e.to_string())));
                                next = Next::Reject;
                                break;
                            }
                        };
                        let StompItem::Frame(frame) = item else { continue };
                        if !connected {
                            if frame.command == "CONNECT" || frame.command == "STOMP" {
                                let (cx, cy) = parse_heartbeat_header(frame.get_header("heart-beat").unwrap_or("0,0"));
                                let (out, _) = negotiate_heartbeats(self.heartbeat_ms, self.heartbeat_ms, cx, cy);
                                send_interval = out;
                                if let Some(d) = out {
                                    hb_tick = tokio::time::interval_at(Instant::now() + d, d);
                                }
                                connected = true;
                                info!(conn_id = self.conn_id, "client connected");
                                let hb = format!("{},{}", self.heartbeat_ms, self.heartbeat_ms);
                                replies.push(StompItem::Frame(
                                    Frame::new("CONNECTED")
                                        .header("version", "1.2")
                                        .header("heart-beat", hb)
                                        .header("server", concat!("wsstomp/", env!("CARGO_PKG_VERSION"))),
                                ));
                                continue;
                            }
                            replies.push(StompItem::Frame(error_frame("not connected", &format!("expected CONNECT, got {}", frame.command))));
                            next = Next::Reject;
                            break;
                        }
                        let receipt = frame.get_header("receipt").map(str::to_string);
                        next = self.handle_frame(&frame, &deliver_tx, &mut replies).await;
                        if let (Some(id), Next::Continue | Next::Close) = (receipt, &next) {
                            replies.push(StompItem::Frame(Frame::new("RECEIPT").header("receipt-id", id)));
                        }
                        if !matches!(next, Next::Continue) {
                            break;
                        }
                    }
                }
                Some(frame) = deliver_rx.recv() => {
                    replies.push(StompItem::Frame(frame));
                }
                _ = hb_tick.tick(), if send_interval.is_some() => {
                    replies.push(StompItem::Heartbeat);
                }
            }

            for item in replies {
                let bytes = codec.encode_item(item)?;
                sink.send(to_message(bytes.freeze()))
                    .await
                    .map_err(ws_to_io)?;
            }
            if !matches!(next, Next::Continue) {
                let _ = sink.close().await;
                return Ok(());
            }
        }
    }

    async fn handle_frame(
        &self,
        frame: &Frame,
        deliver_tx: &mpsc::UnboundedSender<Frame>,
        replies: &mut Vec<StompItem>,
    ) -> Next {
        match frame.command.as_str() {
            "SUBSCRIBE" => {
                let (Some(id), Some(dest)) = (frame.get_header("id"), frame.destination()) else {
                    replies.push(StompItem::Frame(error_frame(
                        "invalid SUBSCRIBE",
                        "id and destination headers are required",
                    )));
                    return Next::Reject;
                };
                debug!(conn_id = self.conn_id, id, destination = dest, "subscribe");
                self.topics
                    .subscribe(
                        dest,
                        TopicSubscriber {
                            conn_id: self.conn_id,
                            sub_id: id.to_string(),
                            sender: deliver_tx.clone(),
                        },
                    )
                    .await;
                Next::Continue
            }
            "UNSUBSCRIBE" => {
                let Some(id) = frame.get_header("id") else {
                    replies.push(StompItem::Frame(error_frame(
                        "invalid UNSUBSCRIBE",
                        "id header is required",
                    )));
                    return Next::Reject;
                };
                if !self.topics.unsubscribe(self.conn_id, id).await {
                    debug!(conn_id = self.conn_id, id, "unsubscribe of unknown id");
                }
                Next::Continue
            }
            "SEND" => {
                if frame.destination().is_none() {
                    replies.push(StompItem::Frame(error_frame(
                        "invalid SEND",
                        "destination header is required",
                    )));
                    return Next::Reject;
                }
                let delivered = self.topics.publish(frame).await;
                debug!(conn_id = self.conn_id, destination = ?frame.destination(), delivered, "send");
                Next::Continue
            }
            // Subscriptions are always ack:auto, so acknowledgements carry no
            // information.
            "ACK" | "NACK" => Next::Continue,
            "DISCONNECT" => {
                info!(conn_id = self.conn_id, "client disconnected");
                Next::Close
            }
            other => {
                replies.push(StompItem::Frame(error_frame(
                    "unsupported command",
                    other,
                )));
                Next::Reject
            }
        }
    }
}
