use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "wsstomp")]
#[command(version)]
#[command(about = "STOMP over WebSocket: topic broker and pub/sub client")]
pub struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run a topic broker serving STOMP over WebSocket
    Broker {
        /// Listen address (host:port)
        #[arg(short, long, default_value = "0.0.0.0:8765")]
        addr: String,

        /// WebSocket path
        #[arg(long, default_value = "/ws")]
        path: String,

        /// Heartbeat offered to clients in ms (0 disables)
        #[arg(long, default_value_t = 5000)]
        heartbeat: u64,
    },

    /// Subscribe to a topic, publish one message to it and print what arrives
    Demo {
        #[command(flatten)]
        conn: ConnArgs,

        /// Topic to subscribe and publish to
        #[arg(short, long, default_value = "/topic/notifications")]
        topic: String,

        /// Message published once connected
        #[arg(short, long, default_value = "First Message")]
        message: String,
    },

    /// Subscribe to topics and print messages until interrupted
    Listen {
        #[command(flatten)]
        conn: ConnArgs,

        /// Topics to subscribe to (can be specified multiple times)
        #[arg(short, long, required = true)]
        topic: Vec<String>,
    },

    /// Publish numbered messages to a topic
    Send {
        #[command(flatten)]
        conn: ConnArgs,

        /// Destination topic
        #[arg(short, long)]
        topic: String,

        /// Number of messages to publish
        #[arg(short, long, default_value_t = 1)]
        count: u32,

        /// Message text; each copy is suffixed with its number
        #[arg(short, long, default_value = "Message")]
        message: String,
    },
}

/// Options shared by the client commands.
#[derive(Args, Clone)]
pub struct ConnArgs {
    /// Broker WebSocket URL
    #[arg(
        short,
        long,
        env = "WSSTOMP_BROKER_URL",
        default_value = "ws://localhost:8765/ws"
    )]
    pub broker_url: String,

    /// Login username
    #[arg(short, long, env = "WSSTOMP_LOGIN")]
    pub login: Option<String>,

    /// Passcode
    #[arg(short, long, env = "WSSTOMP_PASSCODE")]
    pub passcode: Option<String>,

    /// Heartbeat settings (client-send,client-receive in ms)
    #[arg(long, default_value = "10000,10000")]
    pub heartbeat: String,

    /// Give up connecting after this many seconds
    #[arg(long, default_value_t = 10)]
    pub connect_timeout: u64,
}
