//! securechat - certificate-authenticated chat relay
//!
//! Runs the chat server and provisions the keys and certificates it needs.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use commands::{CommandExecutor, InitPkiCommand, IssueCertCommand, KeygenCommand, ServeCommand};

/// securechat - certificate-authenticated chat relay
///
/// Clients authenticate with Ed25519 keys, the server with a CA-signed
/// certificate. All traffic after the handshake is AEAD-sealed and sequenced.
#[derive(Parser)]
#[command(name = "securechat")]
#[command(version)]
#[command(about = "Certificate-authenticated chat relay")]
#[command(long_about = None)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace). RUST_LOG takes precedence.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the chat server
    Serve(ServeCommand),

    /// Generate an identity key pair
    Keygen(KeygenCommand),

    /// Issue a CA-signed certificate
    IssueCert(IssueCertCommand),

    /// Create a CA, server certificate and roster keys in one go
    InitPki(InitPkiCommand),
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let executor: &dyn CommandExecutor = match &cli.command {
        Commands::Serve(cmd) => cmd,
        Commands::Keygen(cmd) => cmd,
        Commands::IssueCert(cmd) => cmd,
        Commands::InitPki(cmd) => cmd,
    };
    executor.execute()
}
