use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "framecast")]
#[command(about = "📺 Real-time screen streaming: capture, encode, fan out to viewers", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the capture agent against a relay
    Agent {
        /// Relay WebSocket URL (overrides the config file)
        #[arg(short, long)]
        relay: Option<String>,

        /// Config file path
        #[arg(short, long, default_value = "framecast.toml")]
        config: PathBuf,
    },

    /// Serve one display as an MJPEG stream over HTTP
    Serve {
        /// Address to bind to
        #[arg(short, long)]
        addr: Option<String>,

        /// Display to stream
        #[arg(short, long)]
        display: Option<usize>,

        /// Basic auth user
        #[arg(long, requires = "password")]
        user: Option<String>,

        /// Basic auth password
        #[arg(long, requires = "user")]
        password: Option<String>,

        /// Config file path
        #[arg(short, long, default_value = "framecast.toml")]
        config: PathBuf,
    },

    /// Run a relay server
    Relay {
        /// Address to bind to
        #[arg(short, long)]
        addr: Option<String>,

        /// Config file path
        #[arg(short, long, default_value = "framecast.toml")]
        config: PathBuf,
    },

    /// Print the default configuration as TOML
    GenConfig,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Config file named by the subcommand, if it takes one.
    pub fn config_path(&self) -> Option<&PathBuf> {
        match &self.command {
            Commands::Agent { config, .. }
            | Commands::Serve { config, .. }
            | Commands::Relay { config, .. } => Some(config),
            Commands::GenConfig => None,
        }
    }
}
