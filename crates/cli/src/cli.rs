use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "wagate", author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Config file path
    #[arg(short, long, value_name = "FILE")]
    pub config_path: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the gateway (default)
    Serve {
        /// Listen address, overrides the config file
        #[arg(short, long)]
        listen: Option<String>,

        /// Development mode (verbose logging, relaxed TLS)
        #[arg(short, long)]
        dev: bool,
    },

    /// Generate sample configuration
    ConfigSample {
        /// Output path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List stored sessions
    ListSessions,

    /// Delete a stored session
    DeleteSession {
        /// Session ID
        session_id: String,
    },
}

impl Cli {
    pub fn is_dev(&self) -> bool {
        matches!(self.command, Some(Commands::Serve { dev: true, .. }))
    }
}
