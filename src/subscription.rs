use futures::Stream;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

use crate::frame::Frame;

/// Error type handlers may return; reported through the session's event
/// stream.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

pub type HandlerResult = Result<(), HandlerError>;

pub(crate) type Handler = Arc<dyn Fn(&Message) -> HandlerResult + Send + Sync>;

/// A message delivered to a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Destination the message was published to.
    pub destination: String,
    /// Body, decoded lossily as UTF-8.
    pub body: String,
    /// Id of the subscription it was delivered under, when the broker says.
    pub subscription: Option<String>,
    /// All headers of the MESSAGE frame.
    pub headers: Vec<(String, String)>,
}

impl Message {
    pub(crate) fn from_frame(frame: &Frame) -> Self {
        Self {
            destination: frame.destination().unwrap_or_default().to_string(),
            body: frame.body_lossy(),
            subscription: frame.get_header("subscription").map(str::to_string),
            headers: frame.headers.clone(),
        }
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Returned by `StompSession::subscribe`; pass it back to `unsubscribe`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: String,
    destination: String,
}

impl SubscriptionHandle {
    pub(crate) fn new(id: String, destination: String) -> Self {
        Self { id, destination }
    }

    /// Local subscription id, also used as the STOMP `id` header.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }
}

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.destination)
    }
}

/// One registered subscription.
#[derive(Clone)]
pub(crate) struct SubscriptionEntry {
    pub(crate) id: String,
    pub(crate) destination: String,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) handler: Handler,
}

impl SubscriptionEntry {
    pub(crate) fn subscribe_frame(&self) -> Frame {
        Frame::subscribe(&self.id, &self.destination, &self.headers)
    }
}

/// Subscriptions in registration order.
#[derive(Default)]
pub(crate) struct Registry {
    entries: Vec<SubscriptionEntry>,
}

impl Registry {
    pub(crate) fn insert(&mut self, entry: SubscriptionEntry) {
        self.entries.push(entry);
    }

    pub(crate) fn remove(&mut self, id: &str) -> Option<SubscriptionEntry> {
        let pos = self.entries.iter().position(|e| e.id == id)?;
        Some(self.entries.remove(pos))
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &SubscriptionEntry> {
        self.entries.iter()
    }

    /// Entries a MESSAGE frame should be delivered to.
    ///
    /// The `subscription` header selects exactly one registration. Without
    /// it every registration on the frame's destination matches.
    pub(crate) fn matching(&self, frame: &Frame) -> Vec<SubscriptionEntry> {
        if let Some(sub_id) = frame.get_header("subscription") {
            return self
                .entries
                .iter()
                .filter(|e| e.id == sub_id)
                .cloned()
                .collect();
        }
        match frame.destination() {
            Some(dest) => self
                .entries
                .iter()
                .filter(|e| e.destination == dest)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }
}

/// Messages of one subscription as a `Stream`.
///
/// Created by `StompSession::subscribe_stream`. The stream ends when the
/// subscription is removed and the session drops its handler.
pub struct MessageStream {
    receiver: mpsc::Receiver<Message>,
}

impl MessageStream {
    pub(crate) fn channel(capacity: usize) -> (mpsc::Sender<Message>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self { receiver: rx })
    }

    /// Consume the stream and return the underlying receiver.
    pub fn into_receiver(self) -> mpsc::Receiver<Message> {
        self.receiver
    }
}

impl Stream for MessageStream {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}
