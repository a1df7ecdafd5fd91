//! vidgate - protected video catalog and DRM key delivery gateway

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use uuid::Uuid;

use vidgate::{
    authz::PUBLIC_VIEWER,
    catalog::{self, Catalog, Video},
    cli::{CatalogCommand, Cli, Command},
    config::Config,
    server::Server,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::Catalog(catalog_cmd)) => run_catalog_command(catalog_cmd),
        Some(Command::Serve) | None => run_server(cli).await,
    }
}

/// Run the server
async fn run_server(cli: Cli) -> ExitCode {
    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    // CLI flags override file and environment values
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(host) = cli.host {
        config.server.host = host;
    }

    let server = match Server::new(config) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to start: {e}");
            return ExitCode::FAILURE;
        }
    };

    match server.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Server error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Run catalog index management commands
fn run_catalog_command(cmd: CatalogCommand) -> ExitCode {
    match cmd {
        CatalogCommand::Validate { file } => match Catalog::load(&file) {
            Ok(catalog) => {
                println!("{}: {} video(s), ids unique", file.display(), catalog.len());
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Validation failed: {e}");
                ExitCode::FAILURE
            }
        },
        CatalogCommand::Add {
            file,
            id,
            title,
            locator,
            thumbnail,
            viewers,
            content_key_ids,
        } => {
            let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
            let viewers = if viewers.is_empty() {
                [PUBLIC_VIEWER.to_string()].into_iter().collect()
            } else {
                viewers.into_iter().collect()
            };

            let video = Video {
                id: id.clone(),
                title,
                locator,
                thumbnail,
                viewers,
                content_key_ids: content_key_ids.into_iter().collect(),
            };

            match catalog::append_to_index(&file, video) {
                Ok(()) => {
                    info!(id = %id, index = %file.display(), "Video added");
                    println!("Added video '{id}' to {}", file.display());
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("Failed to add video: {e}");
                    ExitCode::FAILURE
                }
            }
        }
    }
}
