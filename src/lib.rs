//! Vidgate Library
//!
//! Protected video catalog and DRM key delivery gateway.
//!
//! # Features
//!
//! - **Catalog**: immutable JSON-backed video index, loaded once at startup
//! - **Authentication**: OIDC bearer tokens with JWKS verification
//! - **Per-Video Authorization**: viewer sets matched against the caller's
//!   transitive directory group memberships
//! - **Key Delivery Brokering**: AES envelope, PlayReady, and Widevine
//!   content key requests re-authorized and proxied to the key delivery
//!   endpoint
//!
//! The progressive sample layering (public catalog → bearer auth → per-video
//! authorization → key brokering) is selected through configuration; see
//! [`config::Config`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod authz;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod credentials;
pub mod directory;
pub mod error;
pub mod keydelivery;
pub mod retry;
pub mod server;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
