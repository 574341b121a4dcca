use std::{net::SocketAddr, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::server::ServerConfig;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chat server, relaying every line to all connected users.
    Server(ServerArgs),
    /// Connect to a server and chat from this terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address the server should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:8000")]
    pub listen: SocketAddr,

    /// Seconds a connected user may stay silent before being disconnected.
    #[arg(long, default_value_t = 60)]
    pub idle_timeout_secs: u64,

    /// Seconds allowed for delivering one line to one user.
    #[arg(long, default_value_t = 5)]
    pub write_timeout_secs: u64,
}

impl ServerArgs {
    pub fn config(&self) -> ServerConfig {
        ServerConfig {
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            write_timeout: Duration::from_secs(self.write_timeout_secs),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the server to connect to.
    #[arg(long, default_value = "127.0.0.1:8000")]
    pub server: SocketAddr,

    /// Name to join with. Prompted for when omitted.
    #[arg(long)]
    pub username: Option<String>,
}
