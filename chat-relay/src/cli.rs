use std::{net::SocketAddr, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::{relay::RelayConfig, session::SessionConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay, tracking membership and broadcasting news.
    Relay(RelayArgs),
    /// Connect to a relay and participate in the chat.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RelayArgs {
    /// Bind address for the control endpoint. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:5750")]
    pub control: SocketAddr,

    /// Bind address for the broadcast endpoint.
    #[arg(long, default_value = "127.0.0.1:5751")]
    pub broadcast: SocketAddr,

    /// Seconds a client stays in the roster without a fresh heartbeat.
    #[arg(long, default_value_t = 10)]
    pub lease_seconds: u64,

    /// Milliseconds the relay waits for traffic before re-checking leases.
    #[arg(long, default_value_t = 500)]
    pub idle_ms: u64,
}

impl RelayArgs {
    pub fn config(&self) -> RelayConfig {
        RelayConfig {
            control: self.control,
            broadcast: self.broadcast,
            lease: Duration::from_secs(self.lease_seconds),
            idle_timeout: Duration::from_millis(self.idle_ms),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Handle used when joining the chat.
    #[arg(long)]
    pub handle: String,

    /// Address of the relay control endpoint.
    #[arg(long, default_value = "127.0.0.1:5750")]
    pub control: SocketAddr,

    /// Address of the relay broadcast endpoint.
    #[arg(long, default_value = "127.0.0.1:5751")]
    pub broadcast: SocketAddr,

    /// Milliseconds allowed for any single socket operation; heartbeats go
    /// out at half this pace when idle.
    #[arg(long, default_value_t = 1000)]
    pub timeout_ms: u64,
}

impl ClientArgs {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            control: self.control,
            broadcast: self.broadcast,
            handle: self.handle.clone(),
            timeout: Duration::from_millis(self.timeout_ms),
        }
    }
}
