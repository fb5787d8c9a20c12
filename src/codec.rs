use bytes::{Buf, BufMut, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

use crate::frame::Frame;
use crate::parser::{escape_header_value, parse_frame_slice, unescape_header_value};

/// Items produced or consumed by the codec.
///
/// A `StompItem` is either a decoded `Frame` or a `Heartbeat` marker
/// representing a single LF received on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StompItem {
    /// A decoded STOMP frame (command + headers + body)
    Frame(Frame),
    /// A single heartbeat pulse (LF)
    Heartbeat,
}

/// `StompCodec` implements `tokio_util::codec::{Decoder, Encoder}` for the
/// STOMP wire format.
///
/// The session does not run it over a byte stream directly: each WebSocket
/// message payload is appended to a `BytesMut` and drained with `decode`,
/// which handles frames split across messages as well as several frames in
/// one message. Encoding writes one item per call so the caller can emit it
/// as a single WebSocket message.
#[derive(Debug, Default)]
pub struct StompCodec {}

impl StompCodec {
    pub fn new() -> Self {
        Self {}
    }

    /// Encode a single item into a fresh buffer.
    pub fn encode_item(&mut self, item: StompItem) -> io::Result<BytesMut> {
        let mut dst = BytesMut::new();
        self.encode(item, &mut dst)?;
        Ok(dst)
    }
}

fn invalid_data(what: &str, e: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("{}: {}", what, e))
}

fn header_string(raw: &[u8], what: &str) -> Result<String, io::Error> {
    let unescaped =
        unescape_header_value(raw).map_err(|e| invalid_data(&format!("invalid escape in {}", what), e))?;
    String::from_utf8(unescaped).map_err(|e| invalid_data(&format!("invalid utf8 in {}", what), e))
}

impl Decoder for StompCodec {
    type Item = StompItem;
    type Error = io::Error;

    /// Decode bytes from `src` into a `StompItem`.
    ///
    /// Returns `Ok(None)` and leaves `src` untouched when more bytes are
    /// required; `Err` on malformed frames, bad escapes or invalid UTF-8 in
    /// the command or headers.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(&b'\n') = src.chunk().first() {
            src.advance(1);
            return Ok(Some(StompItem::Heartbeat));
        }
        // A CRLF heart-beat is also legal on the wire.
        if src.chunk().starts_with(b"\r\n") {
            src.advance(2);
            return Ok(Some(StompItem::Heartbeat));
        }

        let raw = match parse_frame_slice(src.chunk()) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Ok(None),
            Err(e) => return Err(invalid_data("parse error", e)),
        };
        src.advance(raw.consumed);

        let command =
            String::from_utf8(raw.command).map_err(|e| invalid_data("invalid utf8 in command", e))?;
        let mut headers = Vec::with_capacity(raw.headers.len());
        for (k, v) in &raw.headers {
            headers.push((
                header_string(k, "header key")?,
                header_string(v, "header value")?,
            ));
        }

        Ok(Some(StompItem::Frame(Frame {
            command,
            headers,
            body: raw.body,
        })))
    }
}

impl Encoder<StompItem> for StompCodec {
    type Error = io::Error;

    /// Encode a `StompItem` into `dst`.
    ///
    /// Header names and values are escaped. A `content-length` header is
    /// added when the body contains NUL or is not valid UTF-8 and the caller
    /// did not provide one.
    fn encode(&mut self, item: StompItem, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            StompItem::Heartbeat => {
                dst.put_u8(b'\n');
            }
            StompItem::Frame(frame) => {
                dst.extend_from_slice(frame.command.as_bytes());
                dst.put_u8(b'\n');

                let mut headers = frame.headers;
                if !headers
                    .iter()
                    .any(|(k, _)| k.eq_ignore_ascii_case("content-length"))
                    && (frame.body.contains(&0) || std::str::from_utf8(&frame.body).is_err())
                {
                    headers.push(("content-length".to_string(), frame.body.len().to_string()));
                }

                for (k, v) in headers {
                    dst.extend_from_slice(escape_header_value(&k).as_bytes());
                    dst.put_u8(b':');
                    dst.extend_from_slice(escape_header_value(&v).as_bytes());
                    dst.put_u8(b'\n');
                }

                dst.put_u8(b'\n');
                dst.extend_from_slice(&frame.body);
                dst.put_u8(0);
            }
        }

        Ok(())
    }
}
