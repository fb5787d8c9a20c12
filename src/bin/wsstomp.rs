use clap::Parser;
use std::process::ExitCode;

mod cli;

use cli::args::{Cli, Command};
use cli::exit_codes;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    cli::init_logging(cli.verbose);

    let result = match cli.command {
        Command::Broker {
            addr,
            path,
            heartbeat,
        } => cli::commands::broker(&addr, &path, heartbeat).await,
        Command::Demo {
            conn,
            topic,
            message,
        } => cli::commands::demo(&conn, &topic, &message).await,
        Command::Listen { conn, topic } => cli::commands::listen(&conn, &topic).await,
        Command::Send {
            conn,
            topic,
            count,
            message,
        } => cli::commands::send(&conn, &topic, count, &message).await,
    };

    match result {
        Ok(()) => ExitCode::from(exit_codes::SUCCESS),
        Err((message, code)) => {
            eprintln!("{}", message);
            ExitCode::from(code)
        }
    }
}
