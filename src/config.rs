//! Configuration management

use std::{env, path::Path, path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Loaded in order, later files override earlier. Variables are set into
    /// the process environment for `env:VAR` resolution.
    #[serde(default)]
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Catalog configuration
    pub catalog: CatalogConfig,
    /// Viewer authentication configuration
    pub auth: AuthConfig,
    /// Per-video authorization configuration
    pub authorization: AuthorizationConfig,
    /// Directory (group membership) configuration
    pub directory: DirectoryConfig,
    /// Key delivery configuration
    pub key_delivery: KeyDeliveryConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Maximum request body size in bytes (license challenges are small)
    pub max_body_size: usize,
    /// Directory with the browsing UI, served as static files.
    /// `browse.html` is the default document. Not served when unset.
    pub static_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8400,
            request_timeout: Duration::from_secs(30),
            max_body_size: 64 * 1024,
            static_dir: None,
        }
    }
}

/// Catalog configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Path to the JSON index file, loaded once at startup
    pub index_file: PathBuf,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            index_file: PathBuf::from("index.json"),
        }
    }
}

/// Viewer authentication configuration.
///
/// When disabled the catalog is public: every route answers without a
/// bearer token and per-video authorization cannot be enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Enable bearer token authentication
    pub enabled: bool,

    /// OIDC issuer URL (`iss` claim of viewer tokens)
    pub issuer: String,

    /// Accepted audiences (`aud` claim); empty = not checked
    #[serde(default)]
    pub audiences: Vec<String>,

    /// JWKS URI override. Defaults to `{issuer}/.well-known/jwks.json`.
    #[serde(default)]
    pub jwks_uri: Option<String>,

    /// Scope a viewer token must carry. `None` disables the check.
    #[serde(default = "default_required_scope")]
    pub required_scope: Option<String>,

    /// Paths that bypass authentication (default: `["/health"]`)
    #[serde(default = "default_public_paths")]
    pub public_paths: Vec<String>,
}

fn default_required_scope() -> Option<String> {
    Some("Videos.Watch".to_string())
}

fn default_public_paths() -> Vec<String> {
    vec!["/health".to_string()]
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            issuer: String::new(),
            audiences: Vec::new(),
            jwks_uri: None,
            required_scope: default_required_scope(),
            public_paths: default_public_paths(),
        }
    }
}

/// Per-video authorization configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AuthorizationConfig {
    /// Restrict each video to its configured viewer set.
    /// When false, any authenticated caller may view the full catalog.
    pub per_video: bool,
}

/// Directory (group membership) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Base URL of the directory service
    pub endpoint: String,
    /// Service credential used to query the directory
    pub credentials: ClientCredentialsConfig,
    /// Retry policy for membership lookups (idempotent reads)
    pub retry: RetryConfig,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://graph.microsoft.com".to_string(),
            credentials: ClientCredentialsConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

/// Key delivery configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct KeyDeliveryConfig {
    /// Enable the content key endpoints
    pub enabled: bool,
    /// Host name of the key delivery endpoint (no scheme; always HTTPS)
    pub host: String,
    /// Service credential presented to the key delivery endpoint
    pub credentials: ClientCredentialsConfig,
}

/// OAuth2 client-credentials grant configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ClientCredentialsConfig {
    /// Token endpoint URL
    pub token_url: String,
    /// Client id (supports `env:VAR_NAME`)
    pub client_id: String,
    /// Client secret (supports `env:VAR_NAME`)
    pub client_secret: String,
    /// Requested scope, e.g. `https://example.invalid/.default`
    pub scope: String,
}

impl ClientCredentialsConfig {
    /// Resolve the client id (expand env vars)
    #[must_use]
    pub fn resolve_client_id(&self) -> String {
        resolve_env_ref(&self.client_id)
    }

    /// Resolve the client secret (expand env vars)
    #[must_use]
    pub fn resolve_client_secret(&self) -> String {
        resolve_env_ref(&self.client_secret)
    }

    fn is_configured(&self) -> bool {
        !self.token_url.is_empty() && !self.client_id.is_empty()
    }
}

/// Expand an `env:VAR_NAME` reference; other values pass through unchanged.
fn resolve_env_ref(value: &str) -> String {
    if let Some(var_name) = value.strip_prefix("env:") {
        env::var(var_name).unwrap_or_else(|_| value.to_string())
    } else {
        value.to_string()
    }
}

/// Retry policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Whether retries are enabled
    pub enabled: bool,
    /// Maximum attempts
    pub max_attempts: u32,
    /// Initial backoff
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    /// Maximum backoff
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        // Load from file if provided
        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (VIDGATE_ prefix)
        figment = figment.merge(Env::prefixed("VIDGATE_").split("__"));

        let config: Self = figment.extract().map_err(|e| Error::Config(e.to_string()))?;

        // Load env files into process environment (before env var expansion)
        config.load_env_files();

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let path = Path::new(path_str);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => {
                        tracing::info!("Loaded env file: {path_str}");
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load env file {path_str}: {e}");
                    }
                }
            } else {
                tracing::debug!("Env file not found (skipped): {path_str}");
            }
        }
    }

    /// Reject incoherent variant combinations instead of degrading silently.
    ///
    /// # Errors
    ///
    /// Returns a [`Error::Config`] naming the first violated rule.
    pub fn validate(&self) -> Result<()> {
        if self.auth.enabled && self.auth.issuer.is_empty() {
            return Err(Error::Config(
                "auth.issuer is required when auth is enabled".to_string(),
            ));
        }

        if self.authorization.per_video {
            if !self.auth.enabled {
                return Err(Error::Config(
                    "authorization.per_video requires auth.enabled".to_string(),
                ));
            }
            if !self.directory.credentials.is_configured() {
                return Err(Error::Config(
                    "authorization.per_video requires directory.credentials".to_string(),
                ));
            }
        }

        if self.key_delivery.enabled {
            if !self.authorization.per_video {
                return Err(Error::Config(
                    "key_delivery requires authorization.per_video".to_string(),
                ));
            }
            if self.key_delivery.host.is_empty() {
                return Err(Error::Config(
                    "key_delivery.host is required when key delivery is enabled".to_string(),
                ));
            }
            if !self.key_delivery.credentials.is_configured() {
                return Err(Error::Config(
                    "key_delivery.credentials is required when key delivery is enabled"
                        .to_string(),
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> ClientCredentialsConfig {
        ClientCredentialsConfig {
            token_url: "https://login.example.invalid/tenant/oauth2/v2.0/token".to_string(),
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
            scope: "https://keys.example.invalid/.default".to_string(),
        }
    }

    #[test]
    fn default_config_is_public_variant_and_valid() {
        let config = Config::default();

        assert!(!config.auth.enabled);
        assert!(!config.authorization.per_video);
        assert!(!config.key_delivery.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn per_video_requires_auth() {
        let config = Config {
            authorization: AuthorizationConfig { per_video: true },
            directory: DirectoryConfig {
                credentials: credentials(),
                ..DirectoryConfig::default()
            },
            ..Config::default()
        };

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("auth.enabled"));
    }

    #[test]
    fn key_delivery_requires_per_video_authorization() {
        let config = Config {
            auth: AuthConfig {
                enabled: true,
                issuer: "https://login.example.invalid/tenant/v2.0".to_string(),
                ..AuthConfig::default()
            },
            key_delivery: KeyDeliveryConfig {
                enabled: true,
                host: "keys.example.invalid".to_string(),
                credentials: credentials(),
            },
            ..Config::default()
        };

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("per_video"));
    }

    #[test]
    fn fully_layered_config_validates() {
        let config = Config {
            auth: AuthConfig {
                enabled: true,
                issuer: "https://login.example.invalid/tenant/v2.0".to_string(),
                ..AuthConfig::default()
            },
            authorization: AuthorizationConfig { per_video: true },
            directory: DirectoryConfig {
                credentials: credentials(),
                ..DirectoryConfig::default()
            },
            key_delivery: KeyDeliveryConfig {
                enabled: true,
                host: "keys.example.invalid".to_string(),
                credentials: credentials(),
            },
            ..Config::default()
        };

        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_refs_resolve_from_process_environment() {
        // PATH is present in any test environment
        let expected = env::var("PATH").unwrap();
        assert_eq!(resolve_env_ref("env:PATH"), expected);

        // Literal values pass through unchanged
        assert_eq!(resolve_env_ref("plain-secret"), "plain-secret");

        // Unset vars fall back to the reference itself
        assert_eq!(
            resolve_env_ref("env:VIDGATE_DEFINITELY_NOT_SET"),
            "env:VIDGATE_DEFINITELY_NOT_SET"
        );
    }

    #[test]
    fn required_scope_defaults_to_videos_watch() {
        let config = AuthConfig::default();
        assert_eq!(config.required_scope.as_deref(), Some("Videos.Watch"));
    }
}
