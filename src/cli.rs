//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Protected video catalog and DRM key delivery gateway
#[derive(Parser, Debug)]
#[command(name = "vidgate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "VIDGATE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "VIDGATE_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "VIDGATE_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "VIDGATE_LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "VIDGATE_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the server (default)
    Serve,

    /// Catalog index management commands
    #[command(subcommand)]
    Catalog(CatalogCommand),
}

/// Catalog subcommands
#[derive(Subcommand, Debug)]
pub enum CatalogCommand {
    /// Validate a catalog index file
    Validate {
        /// Path to the index file
        #[arg(default_value = "index.json")]
        file: PathBuf,
    },

    /// Append a video to a catalog index file
    Add {
        /// Path to the index file (created if absent)
        #[arg(long, default_value = "index.json")]
        file: PathBuf,

        /// Video id (generated if omitted)
        #[arg(long)]
        id: Option<String>,

        /// Display title
        #[arg(long, required = true)]
        title: String,

        /// Streaming manifest URI
        #[arg(long, required = true)]
        locator: String,

        /// Thumbnail image URI
        #[arg(long)]
        thumbnail: Option<String>,

        /// Identity tokens permitted to view (defaults to the public
        /// wildcard "all")
        #[arg(long = "viewer")]
        viewers: Vec<String>,

        /// Content key ids associated with the video's protected streams
        #[arg(long = "content-key-id")]
        content_key_ids: Vec<String>,
    },
}
