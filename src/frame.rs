use std::fmt;

/// A STOMP frame as carried inside a WebSocket message.
///
/// `Frame` contains the command (e.g. "SEND", "MESSAGE"), an ordered list
/// of headers (key/value pairs) and the raw body bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// STOMP command (e.g. CONNECT, SEND, SUBSCRIBE)
    pub command: String,
    /// Ordered headers as (key, value) pairs
    pub headers: Vec<(String, String)>,
    /// Raw body bytes
    pub body: Vec<u8>,
}

impl Frame {
    /// Create a new frame with the given command and empty headers/body.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Add a header (builder style).
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Append every `(key, value)` pair from `extra` (builder style).
    pub fn headers<I, K, V>(mut self, extra: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.headers
            .extend(extra.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Set the frame body (builder style).
    pub fn set_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Get the value of a header by name.
    ///
    /// Returns the first header value matching the given key (case-sensitive),
    /// or `None` if no such header exists. STOMP 1.2 says the first
    /// occurrence of a repeated header wins.
    pub fn get_header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Whether a header with this name is present (case-insensitive).
    pub fn has_header(&self, key: &str) -> bool {
        self.headers.iter().any(|(k, _)| k.eq_ignore_ascii_case(key))
    }

    /// Shorthand for the `destination` header.
    pub fn destination(&self) -> Option<&str> {
        self.get_header("destination")
    }

    /// Body decoded as UTF-8, replacing invalid sequences.
    pub fn body_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Build a `CONNECT` frame.
    ///
    /// `credentials` is an optional `(login, passcode)` pair; brokers that
    /// accept anonymous clients do not need it.
    pub fn connect(host: &str, heartbeat: &str, credentials: Option<(&str, &str)>) -> Self {
        let mut f = Frame::new("CONNECT")
            .header("accept-version", "1.2")
            .header("host", host)
            .header("heart-beat", heartbeat);
        if let Some((login, passcode)) = credentials {
            f = f.header("login", login).header("passcode", passcode);
        }
        f
    }

    /// Build a `SUBSCRIBE` frame with `ack:auto` and any extra headers.
    pub fn subscribe(id: &str, destination: &str, extra: &[(String, String)]) -> Self {
        Frame::new("SUBSCRIBE")
            .header("id", id)
            .header("destination", destination)
            .header("ack", "auto")
            .headers(extra.iter().cloned())
    }

    /// Build an `UNSUBSCRIBE` frame for a subscription id.
    pub fn unsubscribe(id: &str) -> Self {
        Frame::new("UNSUBSCRIBE").header("id", id)
    }

    /// Build a `SEND` frame.
    ///
    /// A `content-type` of `text/plain;charset=utf-8` is added unless
    /// `extra` already names one.
    pub fn send(destination: &str, body: impl Into<Vec<u8>>, extra: &[(String, String)]) -> Self {
        let mut f = Frame::new("SEND")
            .header("destination", destination)
            .headers(extra.iter().cloned());
        if !f.has_header("content-type") {
            f = f.header("content-type", "text/plain;charset=utf-8");
        }
        f.set_body(body)
    }

    /// Build a `DISCONNECT` frame, optionally requesting a receipt.
    pub fn disconnect(receipt: Option<&str>) -> Self {
        let f = Frame::new("DISCONNECT");
        match receipt {
            Some(id) => f.header("receipt", id),
            None => f,
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Command: {}", self.command)?;
        for (k, v) in &self.headers {
            writeln!(f, "{}: {}", k, v)?;
        }
        writeln!(f, "Body ({} bytes)", self.body.len())
    }
}

/// Details of an `ERROR` frame sent by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    /// Value of the `message` header, or a placeholder when absent.
    pub message: String,
    /// Frame body, if any.
    pub body: Option<String>,
}

impl ServerError {
    pub fn from_frame(frame: &Frame) -> Self {
        let message = frame
            .get_header("message")
            .unwrap_or("unspecified broker error")
            .to_string();
        let body = if frame.body.is_empty() {
            None
        } else {
            Some(frame.body_lossy())
        };
        Self { message, body }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.body {
            Some(body) => write!(f, "{}: {}", self.message, body),
            None => write!(f, "{}", self.message),
        }
    }
}
