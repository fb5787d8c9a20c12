use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use crate::frame::Frame;

/// One client subscription on a topic.
#[derive(Debug, Clone)]
pub(crate) struct TopicSubscriber {
    pub(crate) conn_id: u64,
    pub(crate) sub_id: String,
    pub(crate) sender: mpsc::UnboundedSender<Frame>,
}

/// Destination -> subscribers. Delivery is fan-out: every subscriber of a
/// destination receives every message sent to it.
#[derive(Debug, Default)]
pub struct TopicManager {
    topics: Mutex<HashMap<String, Vec<TopicSubscriber>>>,
    message_counter: AtomicU64,
}

impl TopicManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn subscribe(&self, destination: &str, subscriber: TopicSubscriber) {
        let mut topics = self.topics.lock().await;
        let subs = topics.entry(destination.to_string()).or_default();
        // A client reusing a subscription id replaces its earlier one.
        subs.retain(|s| !(s.conn_id == subscriber.conn_id && s.sub_id == subscriber.sub_id));
        subs.push(subscriber);
    }

    /// Remove one subscription of a connection. Returns whether it existed.
    pub(crate) async fn unsubscribe(&self, conn_id: u64, sub_id: &str) -> bool {
        let mut topics = self.topics.lock().await;
        let mut found = false;
        topics.retain(|_, subs| {
            let before = subs.len();
            subs.retain(|s| !(s.conn_id == conn_id && s.sub_id == sub_id));
            found |= subs.len() != before;
            !subs.is_empty()
        });
        found
    }

    /// Drop every subscription of a connection.
    pub(crate) async fn remove_connection(&self, conn_id: u64) {
        let mut topics = self.topics.lock().await;
        topics.retain(|_, subs| {
            subs.retain(|s| s.conn_id != conn_id);
            !subs.is_empty()
        });
    }

    /// Fan a SEND frame out as MESSAGE frames. Returns the number of
    /// subscribers it was handed to.
    pub(crate) async fn publish(&self, send: &Frame) -> usize {
        let Some(destination) = send.destination() else {
            return 0;
        };
        let message_id = self.message_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let mut topics = self.topics.lock().await;
        let Some(subs) = topics.get_mut(destination) else {
            debug!(destination, "no subscribers");
            return 0;
        };
        subs.retain(|s| {
            let mut msg = Frame::new("MESSAGE")
                .header("subscription", s.sub_id.as_str())
                .header("message-id", message_id.to_string())
                .header("destination", destination);
            if let Some(ct) = send.get_header("content-type") {
                msg = msg.header("content-type", ct);
            }
            s.sender.send(msg.set_body(send.body.clone())).is_ok()
        });
        subs.len()
    }

    /// Number of subscriptions on `destination`.
    pub async fn subscriber_count(&self, destination: &str) -> usize {
        self.topics
            .lock()
            .await
            .get(destination)
            .map_or(0, Vec::len)
    }
}
