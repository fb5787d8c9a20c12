use bytes::{Bytes, BytesMut};
use futures::{SinkExt, Stream, StreamExt};
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::Decoder;
use tracing::{debug, info, warn};

use crate::codec::{StompCodec, StompItem};
use crate::config::{BrokerUrl, SessionConfig};
use crate::frame::{Frame, ServerError};
use crate::heartbeat::{negotiate_heartbeats, parse_heartbeat_header};
use crate::subscription::{
    HandlerError, HandlerResult, Message, MessageStream, Registry, SubscriptionEntry,
    SubscriptionHandle,
};
use crate::transport::{ConnError, Transport, TransportConn, WebSocketTransport};

/// Lifecycle of a [`StompSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

/// Errors surfaced by a session, either returned to the caller or reported
/// as [`SessionEvent::Error`].
#[derive(Error, Debug)]
pub enum SessionError {
    /// The transport failed to establish or dropped.
    #[error("connection error: {0}")]
    Connection(#[from] ConnError),
    /// `publish` was called while the session was not connected.
    #[error("not connected")]
    NotConnected,
    /// A subscription handler failed while processing a message.
    #[error("handler for {subscription} on '{destination}' failed: {reason}")]
    Handler {
        subscription: String,
        destination: String,
        reason: String,
    },
}

/// Lifecycle notifications, delivered through [`SessionEvents`].
#[derive(Debug)]
pub enum SessionEvent {
    /// CONNECTED received; buffered subscriptions are being applied.
    Connected,
    /// Something failed. Connection errors leave the session disconnected;
    /// handler errors do not change its state.
    Error(SessionError),
    /// The connection is gone, either closed or lost.
    Disconnected,
}

/// Receiving side of a session's events. Implements `Stream`.
pub struct SessionEvents {
    receiver: mpsc::UnboundedReceiver<SessionEvent>,
}

impl SessionEvents {
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.receiver.recv().await
    }
}

impl Stream for SessionEvents {
    type Item = SessionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

/// The running connection of one activation.
struct Link {
    outbound: mpsc::UnboundedSender<StompItem>,
    shutdown: broadcast::Sender<()>,
    task: Option<JoinHandle<()>>,
}

struct Shared {
    state: SessionState,
    registry: Registry,
    link: Option<Link>,
    /// Bumped on every activation so a finishing connection task can tell
    /// whether it still owns the session.
    generation: u64,
}

struct Inner {
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    shared: Mutex<Shared>,
    events: mpsc::UnboundedSender<SessionEvent>,
    sub_id_counter: AtomicU64,
}

/// A pub/sub session with a single STOMP broker.
///
/// The session owns one logical connection, a registry of subscriptions and
/// the lifecycle state. Handles are cheap to clone and share the same
/// session.
///
/// ```no_run
/// use wsstomp::{SessionConfig, SessionEvent, StompSession};
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let config = SessionConfig::new("ws://localhost:8765/ws")?;
/// let (session, mut events) = StompSession::websocket(config);
/// session.activate().await;
///
/// while let Some(event) = events.recv().await {
///     if let SessionEvent::Connected = event {
///         session
///             .subscribe("/topic/notifications", |m| {
///                 println!("Received: {}", m.body);
///                 Ok(())
///             })
///             .await;
///         session.publish("/topic/notifications", "First Message").await?;
///     }
/// }
/// # Ok(())
/// # }
/// ```
///
/// Handlers run on the connection task. They must not block; to call back
/// into the session from a handler, spawn a task.
#[derive(Clone)]
pub struct StompSession {
    inner: Arc<Inner>,
}

impl StompSession {
    /// Create a disconnected session using `transport` for every activation.
    pub fn new(config: SessionConfig, transport: Arc<dyn Transport>) -> (Self, SessionEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Inner {
            config,
            transport,
            shared: Mutex::new(Shared {
                state: SessionState::Disconnected,
                registry: Registry::default(),
                link: None,
                generation: 0,
            }),
            events: tx,
            sub_id_counter: AtomicU64::new(1),
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            SessionEvents { receiver: rx },
        )
    }

    /// Create a session over [`WebSocketTransport`].
    pub fn websocket(config: SessionConfig) -> (Self, SessionEvents) {
        Self::new(config, Arc::new(WebSocketTransport::new()))
    }

    pub fn broker_url(&self) -> &BrokerUrl {
        &self.inner.config.broker_url
    }

    pub async fn state(&self) -> SessionState {
        self.inner.shared.lock().await.state
    }

    pub async fn subscription_count(&self) -> usize {
        self.inner.shared.lock().await.registry.len()
    }

    /// Start connecting in the background.
    ///
    /// Only acts on a disconnected session. The outcome is reported as
    /// [`SessionEvent::Connected`] or [`SessionEvent::Error`]; a failed
    /// attempt is not retried.
    pub async fn activate(&self) {
        let mut shared = self.inner.shared.lock().await;
        if shared.state != SessionState::Disconnected {
            debug!(state = ?shared.state, "activate ignored");
            return;
        }
        shared.generation += 1;
        shared.state = SessionState::Connecting;
        let generation = shared.generation;
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        debug!(url = %self.inner.config.broker_url, generation, "activating");
        let task = tokio::spawn(supervise_connection(
            self.inner.clone(),
            generation,
            out_rx,
            shutdown_rx,
        ));
        shared.link = Some(Link {
            outbound: out_tx,
            shutdown: shutdown_tx,
            task: Some(task),
        });
    }

    /// Register `handler` for messages on `destination`.
    ///
    /// While connected the SUBSCRIBE goes out immediately; otherwise it is
    /// applied on the next successful connect. Registering the same
    /// destination several times is allowed and each handler sees every
    /// message once.
    pub async fn subscribe<F>(&self, destination: &str, handler: F) -> SubscriptionHandle
    where
        F: Fn(&Message) -> HandlerResult + Send + Sync + 'static,
    {
        self.subscribe_with_headers(destination, Vec::new(), handler)
            .await
    }

    /// Like [`subscribe`](Self::subscribe) with extra SUBSCRIBE headers,
    /// re-sent every time the subscription is applied.
    pub async fn subscribe_with_headers<F>(
        &self,
        destination: &str,
        headers: Vec<(String, String)>,
        handler: F,
    ) -> SubscriptionHandle
    where
        F: Fn(&Message) -> HandlerResult + Send + Sync + 'static,
    {
        let id = format!(
            "sub-{}",
            self.inner.sub_id_counter.fetch_add(1, Ordering::SeqCst)
        );
        let entry = SubscriptionEntry {
            id: id.clone(),
            destination: destination.to_string(),
            headers,
            handler: Arc::new(handler),
        };

        let mut shared = self.inner.shared.lock().await;
        match (&shared.link, shared.state) {
            (Some(link), SessionState::Connected) => {
                debug!(id = %id, destination, "subscribing");
                let _ = link.outbound.send(StompItem::Frame(entry.subscribe_frame()));
            }
            _ => debug!(id = %id, destination, "subscription buffered until connected"),
        }
        shared.registry.insert(entry);
        SubscriptionHandle::new(id, destination.to_string())
    }

    /// Subscribe and receive messages as a `Stream`.
    ///
    /// `capacity` bounds the number of undelivered messages; a message that
    /// does not fit is dropped and reported as a handler error.
    pub async fn subscribe_stream(
        &self,
        destination: &str,
        capacity: usize,
    ) -> (SubscriptionHandle, MessageStream) {
        let (tx, stream) = MessageStream::channel(capacity);
        let handle = self
            .subscribe(destination, move |m| {
                tx.try_send(m.clone()).map_err(|e| -> HandlerError {
                    match e {
                        mpsc::error::TrySendError::Full(_) => "message stream is full".into(),
                        mpsc::error::TrySendError::Closed(_) => "message stream was dropped".into(),
                    }
                })
            })
            .await;
        (handle, stream)
    }

    /// Remove a subscription. Sends UNSUBSCRIBE when connected; no-op for an
    /// already removed handle.
    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) {
        let mut shared = self.inner.shared.lock().await;
        if shared.registry.remove(handle.id()).is_none() {
            debug!(id = handle.id(), "unsubscribe of unknown subscription ignored");
            return;
        }
        if let (Some(link), SessionState::Connected) = (&shared.link, shared.state) {
            debug!(id = handle.id(), "unsubscribing");
            let _ = link
                .outbound
                .send(StompItem::Frame(Frame::unsubscribe(handle.id())));
        }
    }

    /// Send `body` to `destination`.
    ///
    /// Fails with [`SessionError::NotConnected`] unless connected; nothing is
    /// queued in that case.
    pub async fn publish(
        &self,
        destination: &str,
        body: impl Into<String>,
    ) -> Result<(), SessionError> {
        self.publish_with_headers(destination, body, &[]).await
    }

    pub async fn publish_with_headers(
        &self,
        destination: &str,
        body: impl Into<String>,
        headers: &[(String, String)],
    ) -> Result<(), SessionError> {
        let shared = self.inner.shared.lock().await;
        let link = match (&shared.link, shared.state) {
            (Some(link), SessionState::Connected) => link,
            _ => return Err(SessionError::NotConnected),
        };
        let body: String = body.into();
        let frame = Frame::send(destination, body.into_bytes(), headers);
        link.outbound
            .send(StompItem::Frame(frame))
            .map_err(|_| SessionError::NotConnected)?;
        debug!(destination, "published");
        Ok(())
    }

    /// Release the connection and return to `Disconnected`.
    ///
    /// Sends DISCONNECT when connected and waits for the connection task to
    /// finish. Calling it on a disconnected (or already closing) session does
    /// nothing.
    pub async fn close(&self) {
        let link = {
            let mut shared = self.inner.shared.lock().await;
            if matches!(
                shared.state,
                SessionState::Disconnected | SessionState::Closing
            ) {
                return;
            }
            shared.state = SessionState::Closing;
            shared.link.take()
        };

        if let Some(mut link) = link {
            let _ = link.shutdown.send(());
            if let Some(task) = link.task.take() {
                if let Err(e) = task.await {
                    warn!(error = %e, "connection task ended abnormally");
                }
            }
        }

        self.inner.shared.lock().await.state = SessionState::Disconnected;
        info!(url = %self.inner.config.broker_url, "session closed");
        self.inner.emit(SessionEvent::Disconnected);
    }
}

impl Inner {
    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Promote a finished handshake to `Connected`, then queue SUBSCRIBE for
    /// every registered subscription in registration order. Returns `false`
    /// if the session moved on (closed or re-activated) in the meantime.
    async fn promote(&self, generation: u64) -> bool {
        let mut shared = self.shared.lock().await;
        if shared.generation != generation || shared.state != SessionState::Connecting {
            return false;
        }
        shared.state = SessionState::Connected;
        info!(url = %self.config.broker_url, "connected");
        self.emit(SessionEvent::Connected);
        if let Some(link) = &shared.link {
            for entry in shared.registry.iter() {
                debug!(id = %entry.id, destination = %entry.destination, "applying subscription");
                let _ = link
                    .outbound
                    .send(StompItem::Frame(entry.subscribe_frame()));
            }
        }
        true
    }

    /// Record a failed or lost connection. Stale generations and sessions
    /// already closing are left alone.
    async fn connection_failed(&self, generation: u64, err: ConnError) {
        let mut shared = self.shared.lock().await;
        if shared.generation != generation
            || !matches!(
                shared.state,
                SessionState::Connecting | SessionState::Connected
            )
        {
            debug!(error = %err, "ignoring failure of a superseded connection");
            return;
        }
        let was_connected = shared.state == SessionState::Connected;
        shared.state = SessionState::Disconnected;
        shared.link = None;
        drop(shared);

        warn!(url = %self.config.broker_url, error = %err, "connection failed");
        self.emit(SessionEvent::Error(SessionError::Connection(err)));
        if was_connected {
            self.emit(SessionEvent::Disconnected);
        }
    }

    /// Deliver a MESSAGE frame to every matching handler, isolating
    /// failures.
    async fn dispatch(&self, frame: &Frame) {
        let entries = self.shared.lock().await.registry.matching(frame);
        let message = Message::from_frame(frame);
        info!("Received: {}", message.body);
        if entries.is_empty() {
            debug!(destination = %message.destination, "no handler for message");
        }
        for entry in entries {
            let reason = match catch_unwind(AssertUnwindSafe(|| (entry.handler)(&message))) {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(panic) => format!("handler panicked: {}", panic_message(panic.as_ref())),
            };
            warn!(id = %entry.id, destination = %entry.destination, %reason, "handler failed");
            self.emit(SessionEvent::Error(SessionError::Handler {
                subscription: entry.id.clone(),
                destination: entry.destination.clone(),
                reason,
            }));
        }
    }

    /// Decode everything buffered and act on it.
    async fn process_inbound(
        &self,
        codec: &mut StompCodec,
        buf: &mut BytesMut,
    ) -> Result<(), ConnError> {
        while let Some(item) = codec.decode(buf)? {
            let StompItem::Frame(frame) = item else {
                continue;
            };
            match frame.command.as_str() {
                "MESSAGE" => self.dispatch(&frame).await,
                "ERROR" => return Err(ConnError::ServerRejected(ServerError::from_frame(&frame))),
                other => debug!(command = other, "ignoring frame"),
            }
        }
        Ok(())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Open the transport, send CONNECT and wait for CONNECTED.
///
/// Returns the connection and the server's `heart-beat` header. Frames that
/// arrive after CONNECTED in the same message stay in `buf`.
async fn handshake(
    transport: &dyn Transport,
    config: &SessionConfig,
    codec: &mut StompCodec,
    buf: &mut BytesMut,
) -> Result<(TransportConn, String), ConnError> {
    let mut conn = transport.open(&config.broker_url).await?;
    let credentials = config
        .credentials
        .as_ref()
        .map(|(l, p)| (l.as_str(), p.as_str()));
    let connect = Frame::connect(&config.virtual_host, &config.heartbeat, credentials);
    let bytes = codec.encode_item(StompItem::Frame(connect))?;
    conn.sink.send(bytes.freeze()).await?;

    loop {
        while let Some(item) = codec.decode(buf)? {
            let StompItem::Frame(frame) = item else {
                continue;
            };
            match frame.command.as_str() {
                "CONNECTED" => {
                    let hb = frame.get_header("heart-beat").unwrap_or("0,0").to_string();
                    debug!(server_heartbeat = %hb, version = ?frame.get_header("version"), "CONNECTED");
                    return Ok((conn, hb));
                }
                "ERROR" => return Err(ConnError::ServerRejected(ServerError::from_frame(&frame))),
                other => debug!(command = other, "ignoring frame before CONNECTED"),
            }
        }
        match conn.stream.next().await {
            Some(Ok(payload)) => buf.extend_from_slice(&payload),
            Some(Err(e)) => return Err(e.into()),
            None => {
                return Err(ConnError::Protocol(
                    "connection closed before CONNECTED".into(),
                ));
            }
        }
    }
}

/// Run the connection task, turning a panic inside it into an ordinary
/// connection failure so the session does not stay `Connected`.
async fn supervise_connection(
    inner: Arc<Inner>,
    generation: u64,
    outbound: mpsc::UnboundedReceiver<StompItem>,
    shutdown: broadcast::Receiver<()>,
) {
    let run = AssertUnwindSafe(run_connection(inner.clone(), generation, outbound, shutdown));
    if let Err(panic) = futures::FutureExt::catch_unwind(run).await {
        let reason = panic_message(panic.as_ref());
        inner
            .connection_failed(
                generation,
                ConnError::Protocol(format!("connection task panicked: {}", reason)),
            )
            .await;
    }
}

/// How long to wait for a tick that never matters when a heart-beat
/// direction is disabled.
const IDLE_TICK: Duration = Duration::from_secs(86400);

async fn run_connection(
    inner: Arc<Inner>,
    generation: u64,
    mut outbound: mpsc::UnboundedReceiver<StompItem>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut codec = StompCodec::new();
    let mut buf = BytesMut::new();

    let attempt = handshake(&*inner.transport, &inner.config, &mut codec, &mut buf);
    let attempt = async {
        match inner.config.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, attempt)
                .await
                .unwrap_or(Err(ConnError::Timeout(limit))),
            None => attempt.await,
        }
    };
    let result = tokio::select! {
        _ = shutdown.recv() => return,
        r = attempt => r,
    };
    let (mut conn, server_heartbeat) = match result {
        Ok(v) => v,
        Err(e) => {
            inner.connection_failed(generation, e).await;
            return;
        }
    };

    if !inner.promote(generation).await {
        let _ = conn.sink.close().await;
        return;
    }

    let (cx, cy) = parse_heartbeat_header(&inner.config.heartbeat);
    let (sx, sy) = parse_heartbeat_header(&server_heartbeat);
    let (send_interval, recv_interval) = negotiate_heartbeats(cx, cy, sx, sy);
    debug!(?send_interval, ?recv_interval, "heart-beats negotiated");

    let mut last_sent = Instant::now();
    let mut last_received = Instant::now();
    let mut hb_tick = tokio::time::interval(send_interval.unwrap_or(IDLE_TICK));
    let mut watchdog = tokio::time::interval(recv_interval.map(|d| d / 2).unwrap_or(IDLE_TICK));

    let mut outcome = inner.process_inbound(&mut codec, &mut buf).await;
    while outcome.is_ok() {
        tokio::select! {
            _ = shutdown.recv() => {
                // Frames published before close() still go out ahead of DISCONNECT.
                while let Ok(item) = outbound.try_recv() {
                    let Ok(bytes) = codec.encode_item(item) else { continue };
                    if conn.sink.send(bytes.freeze()).await.is_err() {
                        break;
                    }
                }
                debug!("sending DISCONNECT");
                if let Ok(bytes) = codec.encode_item(StompItem::Frame(Frame::disconnect(None))) {
                    let _ = conn.sink.send(bytes.freeze()).await;
                }
                let _ = conn.sink.close().await;
                return;
            }
            maybe = outbound.recv() => {
                let Some(item) = maybe else {
                    outcome = Err(ConnError::Protocol("session dropped its outbound channel".into()));
                    break;
                };
                if let StompItem::Frame(f) = &item {
                    debug!(command = %f.command, "-> frame");
                }
                outcome = match codec.encode_item(item) {
                    Ok(bytes) => conn.sink.send(bytes.freeze()).await.map_err(ConnError::from),
                    Err(e) => Err(e.into()),
                };
                last_sent = Instant::now();
            }
            item = conn.stream.next() => {
                outcome = match item {
                    Some(Ok(payload)) => {
                        last_received = Instant::now();
                        buf.extend_from_slice(&payload);
                        inner.process_inbound(&mut codec, &mut buf).await
                    }
                    Some(Err(e)) => Err(e.into()),
                    None => Err(ConnError::Protocol("connection closed by broker".into())),
                };
            }
            _ = hb_tick.tick(), if send_interval.is_some() => {
                if send_interval.is_some_and(|d| last_sent.elapsed() >= d) {
                    outcome = conn.sink.send(Bytes::from_static(b"\n")).await.map_err(ConnError::from);
                    last_sent = Instant::now();
                }
            }
            _ = watchdog.tick(), if recv_interval.is_some() => {
                if recv_interval.is_some_and(|d| last_received.elapsed() > d * 2) {
                    outcome = Err(ConnError::Protocol("no heart-beat from broker".into()));
                }
            }
        }
    }

    let _ = conn.sink.close().await;
    if let Err(e) = outcome {
        inner.connection_failed(generation, e).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryAcceptor, MemoryPeer, MemoryTransport};
    use std::sync::Mutex as StdMutex;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn session() -> (StompSession, SessionEvents, Arc<MemoryTransport>, MemoryAcceptor) {
        let (transport, acceptor) = MemoryTransport::new();
        let transport = Arc::new(transport);
        let config = SessionConfig::new("ws://localhost:8765/ws")
            .unwrap()
            .with_heartbeat("0,0")
            .unwrap();
        let (session, events) = StompSession::new(config, transport.clone());
        (session, events, transport, acceptor)
    }

    async fn next_event(events: &mut SessionEvents) -> SessionEvent {
        timeout(WAIT, events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event stream ended")
    }

    async fn connect(
        session: &StompSession,
        events: &mut SessionEvents,
        acceptor: &mut MemoryAcceptor,
    ) -> MemoryPeer {
        session.activate().await;
        let mut peer = timeout(WAIT, acceptor.accept()).await.unwrap().unwrap();
        peer.accept_connect().await.unwrap();
        assert!(matches!(next_event(events).await, SessionEvent::Connected));
        peer
    }

    async fn next_frame(peer: &mut MemoryPeer) -> Frame {
        timeout(WAIT, peer.recv_frame())
            .await
            .expect("timed out waiting for frame")
            .unwrap()
            .expect("client closed")
    }

    fn recorder() -> (Arc<StdMutex<Vec<String>>>, impl Fn(&Message) -> HandlerResult + Send + Sync + 'static) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |m: &Message| {
            sink.lock().unwrap().push(m.body.clone());
            Ok(())
        })
    }

    fn message(sub: &str, destination: &str, body: &str) -> Frame {
        Frame::new("MESSAGE")
            .header("subscription", sub)
            .header("destination", destination)
            .header("message-id", "1")
            .set_body(body.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn publish_before_activate_is_rejected() {
        let (session, _events, transport, _acceptor) = session();
        let err = session.publish("/topic/x", "m").await.unwrap_err();
        assert!(matches!(err, SessionError::NotConnected));
        assert_eq!(transport.open_attempts(), 0);
        assert_eq!(session.state().await, SessionState::Disconnected);
    }

    #[tokio::test]
    async fn connect_sends_connect_frame() {
        let (session, mut events, _transport, mut acceptor) = session();
        session.activate().await;
        assert_eq!(session.state().await, SessionState::Connecting);
        let mut peer = acceptor.accept().await.unwrap();
        let connect = peer.accept_connect().await.unwrap();
        assert_eq!(connect.get_header("accept-version"), Some("1.2"));
        assert_eq!(connect.get_header("host"), Some("localhost"));
        assert_eq!(connect.get_header("heart-beat"), Some("0,0"));
        assert!(matches!(next_event(&mut events).await, SessionEvent::Connected));
        assert_eq!(session.state().await, SessionState::Connected);
    }

    #[tokio::test]
    async fn activate_twice_opens_once() {
        let (session, mut events, transport, mut acceptor) = session();
        let _peer = connect(&session, &mut events, &mut acceptor).await;
        session.activate().await;
        assert_eq!(transport.open_attempts(), 1);
    }

    #[tokio::test]
    async fn buffered_subscriptions_applied_in_order() {
        let (session, mut events, _transport, mut acceptor) = session();
        let a = session.subscribe("/topic/a", |_| Ok(())).await;
        let b = session.subscribe("/topic/b", |_| Ok(())).await;
        let mut peer = connect(&session, &mut events, &mut acceptor).await;

        let first = next_frame(&mut peer).await;
        let second = next_frame(&mut peer).await;
        assert_eq!(first.command, "SUBSCRIBE");
        assert_eq!(first.get_header("id"), Some(a.id()));
        assert_eq!(first.destination(), Some("/topic/a"));
        assert_eq!(second.get_header("id"), Some(b.id()));
        assert_eq!(second.destination(), Some("/topic/b"));
    }

    #[tokio::test]
    async fn message_reaches_each_handler_once() {
        let (session, mut events, _transport, mut acceptor) = session();
        let mut peer = connect(&session, &mut events, &mut acceptor).await;
        let (seen_a, handler_a) = recorder();
        let (seen_b, handler_b) = recorder();
        let a = session.subscribe("/topic/n", handler_a).await;
        let b = session.subscribe("/topic/n", handler_b).await;
        next_frame(&mut peer).await;
        next_frame(&mut peer).await;

        peer.send_frame(message(a.id(), "/topic/n", "hello")).unwrap();
        peer.send_frame(message(b.id(), "/topic/n", "hello")).unwrap();

        // A publish round-trip orders us after the deliveries above.
        session.publish("/topic/sync", "x").await.unwrap();
        next_frame(&mut peer).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(*seen_a.lock().unwrap(), vec!["hello"]);
        assert_eq!(*seen_b.lock().unwrap(), vec!["hello"]);
    }

    #[tokio::test]
    async fn unsubscribe_sends_frame_and_stops_delivery() {
        let (session, mut events, _transport, mut acceptor) = session();
        let mut peer = connect(&session, &mut events, &mut acceptor).await;
        let (seen, handler) = recorder();
        let handle = session.subscribe("/topic/n", handler).await;
        next_frame(&mut peer).await;

        session.unsubscribe(&handle).await;
        let unsub = next_frame(&mut peer).await;
        assert_eq!(unsub.command, "UNSUBSCRIBE");
        assert_eq!(unsub.get_header("id"), Some(handle.id()));

        peer.send_frame(message(handle.id(), "/topic/n", "late")).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(seen.lock().unwrap().is_empty());

        // second unsubscribe is a no-op
        session.unsubscribe(&handle).await;
        assert_eq!(session.subscription_count().await, 0);
    }

    #[tokio::test]
    async fn failing_handler_is_isolated() {
        let (session, mut events, _transport, mut acceptor) = session();
        let mut peer = connect(&session, &mut events, &mut acceptor).await;
        let bad = session
            .subscribe("/topic/n", |_| Err("boom".into()))
            .await;
        let panicky = session
            .subscribe("/topic/n", |_| panic!("handler exploded"))
            .await;
        let (seen, handler) = recorder();
        let _good = session.subscribe("/topic/n", handler).await;
        for _ in 0..3 {
            next_frame(&mut peer).await;
        }

        // no subscription header: every handler on the destination matches
        peer.send_frame(
            Frame::new("MESSAGE")
                .header("destination", "/topic/n")
                .set_body(b"hi".to_vec()),
        )
        .unwrap();

        let mut failed = Vec::new();
        for _ in 0..2 {
            match next_event(&mut events).await {
                SessionEvent::Error(SessionError::Handler {
                    subscription,
                    reason,
                    ..
                }) => failed.push((subscription, reason)),
                other => panic!("unexpected event {:?}", other),
            }
        }
        failed.sort();
        assert_eq!(failed[0].0, bad.id());
        assert_eq!(failed[0].1, "boom");
        assert_eq!(failed[1].0, panicky.id());
        assert!(failed[1].1.contains("handler exploded"));
        assert_eq!(*seen.lock().unwrap(), vec!["hi"]);
        assert_eq!(session.state().await, SessionState::Connected);
    }

    #[tokio::test]
    async fn refused_open_reports_error_and_allows_retry() {
        let (session, mut events, transport, mut acceptor) = session();
        transport.refuse_next(1);
        session.activate().await;
        match next_event(&mut events).await {
            SessionEvent::Error(SessionError::Connection(ConnError::Io(e))) => {
                assert_eq!(e.kind(), std::io::ErrorKind::ConnectionRefused)
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(session.state().await, SessionState::Disconnected);

        let _peer = connect(&session, &mut events, &mut acceptor).await;
        assert_eq!(transport.open_attempts(), 2);
    }

    #[tokio::test]
    async fn error_frame_during_connect_is_rejection() {
        let (session, mut events, _transport, mut acceptor) = session();
        session.activate().await;
        let mut peer = acceptor.accept().await.unwrap();
        next_frame(&mut peer).await;
        peer.send_frame(
            Frame::new("ERROR")
                .header("message", "Authentication failed")
                .set_body(b"Invalid credentials".to_vec()),
        )
        .unwrap();
        match next_event(&mut events).await {
            SessionEvent::Error(SessionError::Connection(ConnError::ServerRejected(err))) => {
                assert_eq!(err.message, "Authentication failed");
                assert_eq!(err.body.as_deref(), Some("Invalid credentials"));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(session.state().await, SessionState::Disconnected);
    }

    #[tokio::test]
    async fn broker_close_disconnects_without_retry() {
        let (session, mut events, transport, mut acceptor) = session();
        let peer = connect(&session, &mut events, &mut acceptor).await;
        peer.close();
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::Error(SessionError::Connection(_))
        ));
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::Disconnected
        ));
        assert_eq!(session.state().await, SessionState::Disconnected);
        assert!(matches!(
            session.publish("/topic/x", "m").await,
            Err(SessionError::NotConnected)
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.open_attempts(), 1);
    }

    #[tokio::test]
    async fn close_sends_disconnect_and_is_idempotent() {
        let (session, mut events, _transport, mut acceptor) = session();
        let mut peer = connect(&session, &mut events, &mut acceptor).await;

        session.close().await;
        assert_eq!(next_frame(&mut peer).await.command, "DISCONNECT");
        assert!(peer.recv_frame().await.unwrap().is_none());
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::Disconnected
        ));

        session.close().await;
        assert_eq!(session.state().await, SessionState::Disconnected);
        assert!(events.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn close_flushes_pending_publishes() {
        let (session, mut events, _transport, mut acceptor) = session();
        let mut peer = connect(&session, &mut events, &mut acceptor).await;

        for i in 1..=3 {
            session.publish("/topic/x", format!("m {}", i)).await.unwrap();
        }
        session.close().await;

        for i in 1..=3 {
            let f = next_frame(&mut peer).await;
            assert_eq!(f.command, "SEND");
            assert_eq!(f.body, format!("m {}", i).into_bytes());
        }
        assert_eq!(next_frame(&mut peer).await.command, "DISCONNECT");
    }

    #[tokio::test]
    async fn close_while_connecting() {
        let (session, mut events, _transport, mut acceptor) = session();
        session.activate().await;
        let _peer = acceptor.accept().await.unwrap();
        session.close().await;
        assert_eq!(session.state().await, SessionState::Disconnected);
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::Disconnected
        ));
    }

    #[tokio::test]
    async fn subscriptions_reapplied_after_reactivation() {
        let (session, mut events, _transport, mut acceptor) = session();
        let mut peer = connect(&session, &mut events, &mut acceptor).await;
        let handle = session.subscribe("/topic/n", |_| Ok(())).await;
        assert_eq!(next_frame(&mut peer).await.command, "SUBSCRIBE");
        session.close().await;
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::Disconnected
        ));

        let mut peer = connect(&session, &mut events, &mut acceptor).await;
        let again = next_frame(&mut peer).await;
        assert_eq!(again.command, "SUBSCRIBE");
        assert_eq!(again.get_header("id"), Some(handle.id()));
    }

    #[tokio::test]
    async fn subscribe_stream_yields_messages() {
        let (session, mut events, _transport, mut acceptor) = session();
        let mut peer = connect(&session, &mut events, &mut acceptor).await;
        let (handle, mut stream) = session.subscribe_stream("/topic/s", 4).await;
        next_frame(&mut peer).await;
        peer.send_frame(message(handle.id(), "/topic/s", "streamed"))
            .unwrap();
        let m = timeout(WAIT, stream.next()).await.unwrap().unwrap();
        assert_eq!(m.body, "streamed");
        assert_eq!(m.subscription.as_deref(), Some(handle.id()));
    }

    #[tokio::test]
    async fn heartbeats_are_sent_when_idle() {
        let (transport, mut acceptor) = MemoryTransport::new();
        let config = SessionConfig::new("ws://localhost:8765/ws")
            .unwrap()
            .with_heartbeat("50,0")
            .unwrap();
        let (session, mut events) = StompSession::new(config, Arc::new(transport));
        session.activate().await;
        let mut peer = acceptor.accept().await.unwrap();
        peer.accept_connect_with_heartbeat("0,50").await.unwrap();
        assert!(matches!(next_event(&mut events).await, SessionEvent::Connected));
        let item = timeout(WAIT, peer.recv_item()).await.unwrap().unwrap();
        assert_eq!(item, Some(StompItem::Heartbeat));
    }

    #[tokio::test]
    async fn silent_broker_trips_watchdog() {
        let (transport, mut acceptor) = MemoryTransport::new();
        let config = SessionConfig::new("ws://localhost:8765/ws")
            .unwrap()
            .with_heartbeat("0,20")
            .unwrap();
        let (session, mut events) = StompSession::new(config, Arc::new(transport));
        session.activate().await;
        let mut peer = acceptor.accept().await.unwrap();
        peer.accept_connect_with_heartbeat("20,0").await.unwrap();
        assert!(matches!(next_event(&mut events).await, SessionEvent::Connected));
        match next_event(&mut events).await {
            SessionEvent::Error(SessionError::Connection(ConnError::Protocol(msg))) => {
                assert!(msg.contains("heart-beat"))
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(session.state().await, SessionState::Disconnected);
    }

    #[tokio::test]
    async fn connect_timeout_elapses() {
        let (transport, mut acceptor) = MemoryTransport::new();
        let config = SessionConfig::new("ws://localhost:8765/ws")
            .unwrap()
            .with_connect_timeout(Duration::from_millis(50));
        let (session, mut events) = StompSession::new(config, Arc::new(transport));
        session.activate().await;
        let _peer = acceptor.accept().await.unwrap();
        match next_event(&mut events).await {
            SessionEvent::Error(SessionError::Connection(ConnError::Timeout(d))) => {
                assert_eq!(d, Duration::from_millis(50))
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(session.state().await, SessionState::Disconnected);
    }

    #[tokio::test]
    async fn connect_carries_virtual_host_and_credentials() {
        let (transport, mut acceptor) = MemoryTransport::new();
        let config = SessionConfig::new("ws://localhost:8765/ws")
            .unwrap()
            .with_heartbeat("0,0")
            .unwrap()
            .with_virtual_host("/vhost")
            .with_credentials("guest", "secret");
        let (session, _events) = StompSession::new(config, Arc::new(transport));
        session.activate().await;
        let mut peer = acceptor.accept().await.unwrap();
        let connect = peer.accept_connect().await.unwrap();
        assert_eq!(connect.get_header("host"), Some("/vhost"));
        assert_eq!(connect.get_header("login"), Some("guest"));
        assert_eq!(connect.get_header("passcode"), Some("secret"));
    }

    #[tokio::test]
    async fn subscription_headers_resent_on_reconnect() {
        let (session, mut events, _transport, mut acceptor) = session();
        let mut peer = connect(&session, &mut events, &mut acceptor).await;
        let headers = vec![("selector".to_string(), "kind = 'a'".to_string())];
        session
            .subscribe_with_headers("/topic/h", headers, |_| Ok(()))
            .await;
        let first = next_frame(&mut peer).await;
        assert_eq!(first.get_header("selector"), Some("kind = 'a'"));

        peer.close();
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::Error(SessionError::Connection(_))
        ));
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::Disconnected
        ));

        let mut peer = connect(&session, &mut events, &mut acceptor).await;
        let again = next_frame(&mut peer).await;
        assert_eq!(again.command, "SUBSCRIBE");
        assert_eq!(again.destination(), Some("/topic/h"));
        assert_eq!(again.get_header("selector"), Some("kind = 'a'"));
        assert_eq!(again.get_header("id"), first.get_header("id"));
    }

    #[tokio::test]
    async fn publish_keeps_caller_content_type() {
        let (session, mut events, _transport, mut acceptor) = session();
        let mut peer = connect(&session, &mut events, &mut acceptor).await;
        session
            .publish_with_headers(
                "/topic/j",
                "{\"n\":1}",
                &[("content-type".to_string(), "application/json".to_string())],
            )
            .await
            .unwrap();

        let f = next_frame(&mut peer).await;
        assert_eq!(f.command, "SEND");
        let content_types: Vec<_> = f
            .headers
            .iter()
            .filter(|(k, _)| k == "content-type")
            .collect();
        assert_eq!(content_types.len(), 1);
        assert_eq!(f.get_header("content-type"), Some("application/json"));
        assert_eq!(f.body, b"{\"n\":1}");
    }

    #[tokio::test]
    async fn publish_while_connecting_is_rejected() {
        let (session, mut events, _transport, mut acceptor) = session();
        session.activate().await;
        let mut peer = timeout(WAIT, acceptor.accept()).await.unwrap().unwrap();
        assert_eq!(session.state().await, SessionState::Connecting);
        assert!(matches!(
            session.publish("/topic/x", "early").await,
            Err(SessionError::NotConnected)
        ));

        peer.accept_connect().await.unwrap();
        assert!(matches!(next_event(&mut events).await, SessionEvent::Connected));
        session.close().await;
        // Nothing was queued: the next frame after CONNECT is DISCONNECT.
        assert_eq!(next_frame(&mut peer).await.command, "DISCONNECT");
    }

    #[tokio::test]
    async fn handler_can_publish_from_spawned_task() {
        let (session, mut events, _transport, mut acceptor) = session();
        let mut peer = connect(&session, &mut events, &mut acceptor).await;
        let echo = session.clone();
        let handle = session
            .subscribe("/topic/ping", move |m: &Message| {
                let s = echo.clone();
                let body = format!("pong: {}", m.body);
                tokio::spawn(async move {
                    let _ = s.publish("/topic/pong", body).await;
                });
                Ok(())
            })
            .await;
        next_frame(&mut peer).await;

        peer.send_frame(message(handle.id(), "/topic/ping", "hello"))
            .unwrap();
        let reply = next_frame(&mut peer).await;
        assert_eq!(reply.command, "SEND");
        assert_eq!(reply.destination(), Some("/topic/pong"));
        assert_eq!(reply.body, b"pong: hello");
    }

    #[tokio::test]
    async fn message_stream_receiver_sees_messages() {
        let (session, mut events, _transport, mut acceptor) = session();
        let mut peer = connect(&session, &mut events, &mut acceptor).await;
        let (handle, stream) = session.subscribe_stream("/topic/r", 2).await;
        let mut rx = stream.into_receiver();
        next_frame(&mut peer).await;

        peer.send_frame(message(handle.id(), "/topic/r", "raw"))
            .unwrap();
        let m = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(m.body, "raw");
        assert_eq!(m.destination, "/topic/r");
    }

    #[tokio::test]
    async fn oversized_content_length_drops_connection() {
        let (session, mut events, _transport, mut acceptor) = session();
        let peer = connect(&session, &mut events, &mut acceptor).await;
        peer.send_raw(Bytes::from_static(
            b"MESSAGE\ncontent-length:18446744073709551615\n\nx\0",
        ))
        .unwrap();

        match next_event(&mut events).await {
            SessionEvent::Error(SessionError::Connection(ConnError::Io(e))) => {
                assert_eq!(e.kind(), std::io::ErrorKind::InvalidData)
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::Disconnected
        ));
        assert_eq!(session.state().await, SessionState::Disconnected);
    }

    /// Answers CONNECTED, then panics on the next read.
    struct ExplodingTransport;

    #[async_trait::async_trait]
    impl Transport for ExplodingTransport {
        async fn open(&self, _url: &BrokerUrl) -> Result<TransportConn, ConnError> {
            let connected = StompCodec::new()
                .encode_item(StompItem::Frame(
                    Frame::new("CONNECTED")
                        .header("version", "1.2")
                        .header("heart-beat", "0,0"),
                ))?
                .freeze();
            let stream = futures::stream::iter(vec![Ok(connected)]).chain(
                futures::stream::poll_fn(|_| -> Poll<Option<std::io::Result<Bytes>>> {
                    panic!("stream exploded")
                }),
            );
            let sink = futures::sink::drain::<Bytes>()
                .sink_map_err(|never: std::convert::Infallible| -> std::io::Error { match never {} });
            Ok(TransportConn::new(sink, stream))
        }
    }

    #[tokio::test]
    async fn panicking_connection_task_reports_failure() {
        let config = SessionConfig::new("ws://localhost:8765/ws")
            .unwrap()
            .with_heartbeat("0,0")
            .unwrap();
        let (session, mut events) = StompSession::new(config, Arc::new(ExplodingTransport));
        session.activate().await;

        assert!(matches!(next_event(&mut events).await, SessionEvent::Connected));
        match next_event(&mut events).await {
            SessionEvent::Error(SessionError::Connection(ConnError::Protocol(msg))) => {
                assert!(msg.contains("stream exploded"), "{}", msg)
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::Disconnected
        ));
        assert_eq!(session.state().await, SessionState::Disconnected);
        assert!(matches!(
            session.publish("/topic/x", "m").await,
            Err(SessionError::NotConnected)
        ));
    }
}
