//! # troupe CLI
//!
//! Host binary for the troupe agent runtime: validates a runtime
//! configuration and runs the bundled sample topologies.

mod commands;
mod samples;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "troupe")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(long, default_value = "troupe.yml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that every sample agent type can be placed
    Check {
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Run a sample topology
    Demo {
        #[command(subcommand)]
        command: DemoCommands,
    },
}

#[derive(Subcommand)]
enum DemoCommands {
    /// One scheduler broadcasting beats to many listeners
    Broadcast {
        /// Number of subscribed listeners
        #[arg(long, default_value_t = 5)]
        listeners: usize,

        /// Beats to publish
        #[arg(long, default_value_t = 3)]
        rounds: u64,

        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// A pulse relayed down a parent/child tree
    Hierarchy {
        /// Children per layer
        #[arg(long, default_value_t = 3)]
        fanout: usize,

        /// Levels below the root
        #[arg(long, default_value_t = 2)]
        depth: usize,

        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(if cli.verbose {
                tracing::Level::DEBUG.into()
            } else {
                tracing::Level::INFO.into()
            }),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Check { json } => commands::check_config(&cli.config, json),
        Commands::Demo { command } => match command {
            DemoCommands::Broadcast {
                listeners,
                rounds,
                json,
            } => commands::demo_broadcast(&cli.config, listeners, rounds, json).await,
            DemoCommands::Hierarchy {
                fanout,
                depth,
                json,
            } => commands::demo_hierarchy(&cli.config, fanout, depth, json).await,
        },
    }
}
