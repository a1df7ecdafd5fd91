//! Server assembly and lifecycle

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use super::router::{AppState, create_router};
use crate::auth::{AuthGate, OidcVerifier};
use crate::catalog::Catalog;
use crate::config::Config;
use crate::credentials::{ClientCredentialsProvider, TokenCache, TokenProvider};
use crate::directory::{DirectoryClient, GraphDirectory};
use crate::keydelivery::{HttpKeyEndpoint, KeyDeliveryBroker, KeyEndpoint};
use crate::{Error, Result};

/// The vidgate server
pub struct Server {
    config: Config,
    state: Arc<AppState>,
}

impl Server {
    /// Assemble the server: validate the configuration, load the catalog
    /// once, and wire the variant-dependent components.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid configuration or an unloadable
    /// catalog.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let catalog = Arc::new(Catalog::load(&config.catalog.index_file)?);
        info!(
            index = %config.catalog.index_file.display(),
            videos = catalog.len(),
            "Catalog loaded"
        );

        let http = reqwest::Client::builder()
            .timeout(config.server.request_timeout)
            .build()?;

        let auth_gate = if config.auth.enabled {
            let verifier = Arc::new(OidcVerifier::new(&config.auth));
            Arc::new(AuthGate::enabled(&config.auth, verifier))
        } else {
            Arc::new(AuthGate::disabled())
        };

        let directory: Option<Arc<dyn DirectoryClient>> = if config.authorization.per_video {
            let provider = Arc::new(ClientCredentialsProvider::new(
                http.clone(),
                &config.directory.credentials,
            )) as Arc<dyn TokenProvider>;
            let credentials = Arc::new(TokenCache::new(provider));
            Some(Arc::new(GraphDirectory::new(
                http.clone(),
                &config.directory,
                credentials,
            )))
        } else {
            None
        };

        let broker = if config.key_delivery.enabled {
            let provider = Arc::new(ClientCredentialsProvider::new(
                http.clone(),
                &config.key_delivery.credentials,
            )) as Arc<dyn TokenProvider>;
            let credentials = Arc::new(TokenCache::new(provider));
            let endpoint =
                Arc::new(HttpKeyEndpoint::new(http, &config.key_delivery)) as Arc<dyn KeyEndpoint>;
            Some(Arc::new(KeyDeliveryBroker::new(
                Arc::clone(&catalog),
                credentials,
                endpoint,
            )))
        } else {
            None
        };

        let state = Arc::new(AppState {
            catalog,
            auth_gate,
            directory,
            broker,
            server: config.server.clone(),
        });

        Ok(Self { config, state })
    }

    /// Run the server until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot bind or the server fails.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let app = create_router(Arc::clone(&self.state));
        let listener = TcpListener::bind(addr).await?;

        info!("============================================================");
        info!("VIDGATE v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %self.config.server.host, port = %self.config.server.port, "Listening");
        info!(videos = self.state.catalog.len(), "Catalog entries");

        if self.config.auth.enabled {
            info!(
                issuer = %self.config.auth.issuer,
                per_video = self.config.authorization.per_video,
                "AUTHENTICATION enabled"
            );
        } else {
            warn!("AUTHENTICATION disabled - the catalog is public");
        }

        if self.config.key_delivery.enabled {
            info!(host = %self.config.key_delivery.host, "KEY DELIVERY enabled:");
            info!("  POST /envelopeKey?videoId=&contentKeyId=");
            info!("  POST /playReadyKey?videoId=");
            info!("  POST /widevineKey?videoId=&contentKeyId=");
        }

        if let Some(ref dir) = self.config.server.static_dir {
            info!(directory = %dir.display(), "Serving browsing UI");
        }
        info!("============================================================");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        info!("Server stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    if signal::ctrl_c().await.is_ok() {
        info!("Shutdown signal received");
    }
}
