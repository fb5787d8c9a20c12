//! Async STOMP-over-WebSocket pub/sub sessions.
//!
//! [`StompSession`] owns one broker connection, buffers subscriptions until
//! the connection is up, and fails publishes made while it is not. Frames are
//! carried by an injected [`Transport`]; [`WebSocketTransport`] is the usual
//! choice. [`broker::Broker`] is a small in-process topic broker speaking the
//! same protocol.

pub mod broker;
pub mod codec;
pub mod config;
pub mod frame;
pub mod heartbeat;
pub mod parser;
pub mod session;
pub mod subscription;
pub mod transport;

pub use codec::{StompCodec, StompItem};
pub use config::{BrokerUrl, ConfigError, SessionConfig};
pub use frame::{Frame, ServerError};
pub use heartbeat::{negotiate_heartbeats, parse_heartbeat_header};
pub use session::{SessionError, SessionEvent, SessionEvents, SessionState, StompSession};
pub use subscription::{HandlerError, HandlerResult, Message, MessageStream, SubscriptionHandle};
pub use transport::{ConnError, Transport, TransportConn, WebSocketTransport};
