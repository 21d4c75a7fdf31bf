use clap::{Args, Parser, Subcommand};

use crate::registry::PairingMode;

#[derive(Debug, Parser)]
#[command(
    name = "beach-pier",
    author,
    version,
    about = "Rendezvous relay pairing remote-control agents with controllers",
    args_conflicts_with_subcommands = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Server options, used when no subcommand is given.
    #[command(flatten)]
    pub serve: ServeArgs,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the relay server (default).
    Serve(ServeArgs),
    /// Connect to a running relay and print everything it sends.
    Probe(ProbeArgs),
}

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "BEACH_PIER_LISTEN_ADDR", default_value = "0.0.0.0:8090")]
    pub listen_addr: String,

    /// How agents are matched with controllers.
    #[arg(long, env = "BEACH_PIER_MODE", value_enum, default_value_t = PairingMode::CodePairing)]
    pub mode: PairingMode,

    /// Lifetime of an issued pairing code.
    #[arg(long, env = "BEACH_PIER_PAIRING_CODE_TTL_SECS", default_value_t = 3600)]
    pub pairing_code_ttl_secs: u64,

    /// How often expired pairing codes are swept.
    #[arg(long, env = "BEACH_PIER_SWEEP_INTERVAL_SECS", default_value_t = 3600)]
    pub sweep_interval_secs: u64,

    /// Answer unroutable messages with `relay-error` instead of dropping them silently.
    #[arg(long, env = "BEACH_PIER_NACK_UNROUTABLE", default_value_t = false)]
    pub nack_unroutable: bool,

    /// Grace period applied during shutdown.
    #[arg(long, env = "BEACH_PIER_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, Args)]
pub struct ProbeArgs {
    /// Relay WebSocket endpoint.
    #[arg(short, long, default_value = "ws://localhost:8090/ws")]
    pub url: String,

    /// Register as an agent instead of a controller.
    #[arg(long)]
    pub agent: bool,

    /// Pairing code presented when registering as an agent.
    #[arg(long, requires = "agent")]
    pub code: Option<String>,

    /// Hostname reported when registering as an agent.
    #[arg(long, default_value = "beach-pier-probe")]
    pub hostname: String,

    /// How long to listen before exiting.
    #[arg(long, default_value_t = 10)]
    pub duration_secs: u64,
}
