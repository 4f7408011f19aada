//! repowatch CLI
//!
//! Runs the lifecycle coordinator behind its HTTP surface.
//!
//! # Commands
//!
//! - `serve` - Serve the coordinator, seeding entities from discovery
//! - `transitions` - Print the transition graph
//! - `version` - Show version information

mod commands;
mod executor;

use clap::{Parser, Subcommand};
use commands::serve::ServeArgs;
use tracing_subscriber::EnvFilter;

/// Plugin lifecycle coordinator.
#[derive(Parser)]
#[command(name = "repowatch")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the coordinator over HTTP
    Serve(ServeArgs),

    /// Print the transition graph
    Transitions {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // RUST_LOG wins unless --verbose asks for everything.
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Serve(args) => commands::serve::run(args).await?,
        Commands::Transitions { format } => commands::transitions::run(&format)?,
        Commands::Version => {
            println!("repowatch v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
