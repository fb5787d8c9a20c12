use std::time::Duration;
use tracing::{info, warn};
use wsstomp::broker::Broker;
use wsstomp::{
    ConfigError, ConnError, Message, SessionConfig, SessionError, SessionEvent, SessionEvents,
    StompSession,
};

use super::args::ConnArgs;
use super::exit_codes;

/// Error reported to `main`: message for stderr plus process exit code.
pub type CliError = (String, u8);

/// Run the broker until Ctrl-C.
pub async fn broker(addr: &str, path: &str, heartbeat: u64) -> Result<(), CliError> {
    let broker = Broker::bind(addr, path)
        .await
        .map_err(|e| (format!("Failed to bind {}: {}", addr, e), exit_codes::NETWORK_ERROR))?
        .with_heartbeat(heartbeat);
    let local = broker
        .local_addr()
        .map_err(|e| (format!("Failed to bind {}: {}", addr, e), exit_codes::NETWORK_ERROR))?;
    println!("Broker listening on ws://{}{}", local, path);

    tokio::select! {
        res = broker.run() => res.map_err(|e| (format!("Broker failed: {}", e), exit_codes::NETWORK_ERROR)),
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down broker");
            Ok(())
        }
    }
}

/// Connect, subscribe to `topic` once connected, publish `message` to it and
/// print deliveries until Ctrl-C.
pub async fn demo(conn: &ConnArgs, topic: &str, message: &str) -> Result<(), CliError> {
    let (session, mut events) = connect(conn).await?;

    session.subscribe(topic, print_message).await;
    session
        .publish(topic, message)
        .await
        .map_err(|e| format_session_error(&e, &conn.broker_url))?;
    println!("Published to {}: {}", topic, message);

    let result = watch(&mut events, &conn.broker_url).await;
    session.close().await;
    result
}

/// Subscribe to every topic and print deliveries until Ctrl-C.
pub async fn listen(conn: &ConnArgs, topics: &[String]) -> Result<(), CliError> {
    let (session, mut events) = build_session(conn)?;
    // Registered while disconnected; applied once the broker accepts us.
    for topic in topics {
        session.subscribe(topic, print_message).await;
    }
    session.activate().await;
    wait_connected(&mut events, &conn.broker_url).await?;
    for topic in topics {
        println!("Subscribed to: {}", topic);
    }

    let result = watch(&mut events, &conn.broker_url).await;
    session.close().await;
    result
}

/// Publish `"<message> <i>"` for i in `0..count`, then disconnect.
pub async fn send(conn: &ConnArgs, topic: &str, count: u32, message: &str) -> Result<(), CliError> {
    let (session, _events) = connect(conn).await?;
    for i in 0..count {
        let body = format!("{} {}", message, i);
        session
            .publish(topic, body.as_str())
            .await
            .map_err(|e| format_session_error(&e, &conn.broker_url))?;
        println!("Sent to {}: {}", topic, body);
    }
    session.close().await;
    Ok(())
}

fn build_session(conn: &ConnArgs) -> Result<(StompSession, SessionEvents), CliError> {
    let mut config = SessionConfig::new(&conn.broker_url)
        .and_then(|c| c.with_heartbeat(&conn.heartbeat))
        .map_err(|e| format_config_error(&e))?
        .with_connect_timeout(Duration::from_secs(conn.connect_timeout));
    if let (Some(login), Some(passcode)) = (&conn.login, &conn.passcode) {
        config = config.with_credentials(login.clone(), passcode.clone());
    }
    Ok(StompSession::websocket(config))
}

async fn connect(conn: &ConnArgs) -> Result<(StompSession, SessionEvents), CliError> {
    let (session, mut events) = build_session(conn)?;
    println!("Connecting to {}...", conn.broker_url);
    session.activate().await;
    wait_connected(&mut events, &conn.broker_url).await?;
    Ok((session, events))
}

async fn wait_connected(events: &mut SessionEvents, url: &str) -> Result<(), CliError> {
    loop {
        match events.recv().await {
            Some(SessionEvent::Connected) => {
                println!("Connected.");
                return Ok(());
            }
            Some(SessionEvent::Error(e @ SessionError::Handler { .. })) => warn!("{}", e),
            Some(SessionEvent::Error(e)) => return Err(format_session_error(&e, url)),
            Some(SessionEvent::Disconnected) | None => {
                return Err((
                    format!("Connection closed: {}", url),
                    exit_codes::NETWORK_ERROR,
                ));
            }
        }
    }
}

/// Follow session events until Ctrl-C or the connection is lost.
async fn watch(events: &mut SessionEvents, url: &str) -> Result<(), CliError> {
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("Disconnecting...");
                return Ok(());
            }
            event = events.recv() => match event {
                Some(SessionEvent::Error(e @ SessionError::Handler { .. })) => warn!("{}", e),
                Some(SessionEvent::Error(e)) => return Err(format_session_error(&e, url)),
                Some(SessionEvent::Connected) => {}
                Some(SessionEvent::Disconnected) | None => {
                    return Err((
                        format!("Connection lost: {}", url),
                        exit_codes::NETWORK_ERROR,
                    ));
                }
            }
        }
    }
}

fn print_message(m: &Message) -> wsstomp::HandlerResult {
    println!("[{}] {}", m.destination, m.body);
    Ok(())
}

fn format_config_error(err: &ConfigError) -> CliError {
    (format!("Invalid configuration: {}", err), exit_codes::CONFIG_ERROR)
}

/// Format a session error with user-friendly messaging
pub fn format_session_error(err: &SessionError, url: &str) -> CliError {
    match err {
        SessionError::Connection(conn_err) => format_connection_error(conn_err, url),
        SessionError::NotConnected => (
            format!("Not connected to {}", url),
            exit_codes::NETWORK_ERROR,
        ),
        SessionError::Handler { .. } => (err.to_string(), exit_codes::PROTOCOL_ERROR),
    }
}

fn format_connection_error(err: &ConnError, url: &str) -> CliError {
    match err {
        ConnError::Io(io_err) => {
            let message = match io_err.kind() {
                std::io::ErrorKind::ConnectionRefused => {
                    format!("Connection refused: {}", url)
                }
                std::io::ErrorKind::TimedOut => {
                    format!("Connection timed out: {}", url)
                }
                _ => {
                    format!("Connection failed: {}", io_err)
                }
            };
            (message, exit_codes::NETWORK_ERROR)
        }
        ConnError::Transport(msg) => (
            format!("Connection failed: {}", msg),
            exit_codes::NETWORK_ERROR,
        ),
        ConnError::Timeout(limit) => (
            format!("Connection timed out after {:?}: {}", limit, url),
            exit_codes::NETWORK_ERROR,
        ),
        ConnError::ServerRejected(server_err) => (
            format!("Broker rejected connection: {}", server_err),
            exit_codes::PROTOCOL_ERROR,
        ),
        ConnError::Protocol(msg) => (
            format!("Protocol error: {}", msg),
            exit_codes::PROTOCOL_ERROR,
        ),
    }
}
