use std::time::Duration;

/// Parse the STOMP `heart-beat` header value (format: "cx,cy").
///
/// Returns `(cx, cy)` in milliseconds. Missing or invalid fields default to
/// `0`.
pub fn parse_heartbeat_header(header: &str) -> (u64, u64) {
    let mut parts = header.split(',');
    let mut next = || {
        parts
            .next()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .unwrap_or(0)
    };
    let cx = next();
    let cy = next();
    (cx, cy)
}

/// Strict variant of [`parse_heartbeat_header`] used to validate
/// configuration: both fields must be present and numeric.
pub fn validate_heartbeat_header(header: &str) -> Option<(u64, u64)> {
    let (cx, cy) = header.split_once(',')?;
    Some((cx.trim().parse().ok()?, cy.trim().parse().ok()?))
}

/// Negotiate heartbeat intervals between client and server.
///
/// - `client_out`: how often the client can send heartbeats (ms).
/// - `client_in`: how often the client wants to receive heartbeats (ms).
/// - `server_out` / `server_in`: the server's advertised values.
///
/// Returns `(outgoing, incoming)`, each `None` when disabled. A direction is
/// disabled when either side advertises `0`; otherwise the larger of the two
/// values is used.
pub fn negotiate_heartbeats(
    client_out: u64,
    client_in: u64,
    server_out: u64,
    server_in: u64,
) -> (Option<Duration>, Option<Duration>) {
    let pick = |ours: u64, theirs: u64| {
        if ours == 0 || theirs == 0 {
            None
        } else {
            Some(Duration::from_millis(ours.max(theirs)))
        }
    };
    (pick(client_out, server_in), pick(client_in, server_out))
}
