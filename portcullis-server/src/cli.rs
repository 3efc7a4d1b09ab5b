use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "portcullis",
    about = "Portcullis - programmable reverse proxy and API gateway",
    version = env!("CARGO_PKG_VERSION"),
    author,
    propagate_version = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[arg(short, long, env = "PORTCULLIS_PORT", default_value = "8080")]
    pub port: u16,

    #[arg(short, long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,

    #[arg(short, long, env = "PORTCULLIS_CONFIG", help = "Instance configuration file (JSON)")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Seed the datastore from a JSON export before serving")]
    pub import: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Start the gateway (default if no command specified)")]
    Serve {
        #[arg(short, long, env = "PORTCULLIS_PORT", default_value = "8080")]
        port: u16,
    },

    #[command(about = "Validate a JSON export without serving")]
    CheckImport {
        #[arg(help = "Path to the export file")]
        file: PathBuf,
    },
}
