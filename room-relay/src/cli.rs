use std::{net::SocketAddr, path::PathBuf};

use clap::{Args, Parser, Subcommand};

use crate::{config::DEV_JWT_SECRET, relay::DEFAULT_HISTORY_LIMIT};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay, accepting TCP connections that speak the JSON line protocol.
    Serve(ServeArgs),
    /// Connect to a relay and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address to bind. Use port 0 for an ephemeral port.
    #[arg(long, env = "RELAY_LISTEN", default_value = "127.0.0.1:3030")]
    pub listen: SocketAddr,

    /// Shared secret used to verify bearer tokens.
    #[arg(long, env = "JWT_SECRET", default_value = DEV_JWT_SECRET, hide_env_values = true, hide_default_value = true)]
    pub jwt_secret: String,

    /// How many recent messages a joining client receives.
    #[arg(long, env = "RELAY_HISTORY_LIMIT", default_value_t = DEFAULT_HISTORY_LIMIT)]
    pub history_limit: usize,

    /// Append messages to this JSON lines file instead of keeping them in memory.
    #[arg(long, env = "RELAY_STORE")]
    pub store: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Bearer token issued by the credential service.
    #[arg(long, env = "RELAY_TOKEN", hide_env_values = true)]
    pub token: String,

    /// Address of the relay to connect to.
    #[arg(long, default_value = "127.0.0.1:3030")]
    pub server: SocketAddr,

    /// Room to join right after authenticating.
    #[arg(long)]
    pub room: Option<String>,
}
