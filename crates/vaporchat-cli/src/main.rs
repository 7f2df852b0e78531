//! vaporchat command-line client.
//!
//! A thin terminal front end over `vaporchat-core`: generate an identity,
//! swap bundles out of band, join a room, type messages.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

/// vaporchat - ephemeral encrypted room chat
#[derive(Parser)]
#[command(name = "vaporchat")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate an identity and print its public bundle
    Keygen {
        /// Where to store the identity secrets
        #[arg(short, long, default_value = "vaporchat.id")]
        out: PathBuf,
    },

    /// Join a room and chat until interrupted
    Join {
        /// Room identifier shared with your peers
        room: String,

        /// Identity file created by `keygen`
        #[arg(short, long, default_value = "vaporchat.id")]
        identity: PathBuf,

        /// Peer's public bundle (base64, from their `keygen`)
        #[arg(short, long)]
        bundle: String,

        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:0")]
        bind: String,

        /// Peer addresses to dial
        #[arg(short, long)]
        peer: Vec<String>,

        /// Directory for received files
        #[arg(long, default_value = ".")]
        downloads: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("vaporchat_core=debug,vaporchat=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Keygen { out } => commands::keygen(&out),
        Commands::Join {
            room,
            identity,
            bundle,
            bind,
            peer,
            downloads,
        } => commands::join(&room, &identity, &bundle, &bind, peer, downloads).await,
    }
}
