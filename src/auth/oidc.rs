//! OIDC bearer verification — JWT signature validation and JWKS caching.
//!
//! # Verification flow
//!
//! 1. Decode the JWT header (no verification) to extract `kid` and `alg`.
//! 2. Fetch the configured issuer's JWKS (cached for 1 hour; refreshed once
//!    on an unknown `kid`).
//! 3. Verify the JWT signature and standard claims (`exp`, `iss`, `aud`).
//! 4. Extract the caller principal: the `oid` claim (the directory object id
//!    viewer sets are written against) with `sub` as fallback, plus the
//!    space-separated `scp` scopes claim.
//!
//! # Security properties
//!
//! - JWKS fetched only over HTTPS (enforced by the `reqwest` client).
//! - Unknown `kid` triggers a single cache refresh before failing; prevents
//!   indefinite re-fetching if the key truly does not exist.
//! - Clock leeway of 60 seconds tolerates minor clock skew between the
//!   identity provider and this host.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use jsonwebtoken::{
    Algorithm, DecodingKey, Header, TokenData, Validation,
    jwk::{AlgorithmParameters, JwkSet},
};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::AuthConfig;

/// Error variants for bearer verification failures.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// No `Authorization: Bearer` header on the request.
    #[error("Missing Authorization header")]
    MissingBearer,

    /// JWT decode / signature verification failed.
    #[error("JWT verification failed: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    /// The JWT header contains no `kid` field.
    #[error("JWT missing 'kid' field in header")]
    MissingKeyId,

    /// The `kid` in the JWT header is not in the issuer's JWKS.
    #[error("Unknown key ID: {0}")]
    UnknownKeyId(String),

    /// The token carries neither an `oid` nor a `sub` claim.
    #[error("Token has no principal claim")]
    MissingPrincipal,

    /// The token lacks the required scope.
    #[error("Token missing required scope: {0}")]
    MissingScope(String),

    /// Network or HTTP error while fetching the JWKS.
    #[error("JWKS fetch error: {0}")]
    Http(#[from] reqwest::Error),
}

/// The authenticated caller extracted from a valid bearer token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    /// Directory object id of the caller (`oid` claim, `sub` fallback).
    pub object_id: String,
    /// Scopes granted to the token (`scp` claim, space-separated).
    pub scopes: Vec<String>,
}

impl Principal {
    /// Whether the token carries `scope`.
    #[must_use]
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }
}

/// Verification seam for the auth middleware.
///
/// The production implementation is [`OidcVerifier`]; tests substitute an
/// in-memory map from token strings to principals.
#[async_trait]
pub trait BearerVerifier: Send + Sync {
    /// Verify a bearer token and return the caller principal.
    async fn verify(&self, token: &str) -> Result<Principal, AuthError>;
}

/// Raw claims extracted from a viewer token.
#[derive(Debug, Deserialize)]
struct ViewerClaims {
    /// Subject
    sub: String,
    /// Directory object id (AAD-style)
    #[serde(default)]
    oid: Option<String>,
    /// Space-separated delegated scopes
    #[serde(default)]
    scp: Option<String>,
    /// Audience (may be a single string or an array)
    #[serde(default)]
    #[allow(dead_code)]
    aud: serde_json::Value,
    /// Expiry (Unix timestamp); validated by jsonwebtoken internally
    #[allow(dead_code)]
    exp: u64,
}

/// Cached JWKS entry.
struct CachedJwks {
    keys: JwkSet,
    fetched_at: Instant,
    ttl: Duration,
}

impl CachedJwks {
    fn is_stale(&self) -> bool {
        self.fetched_at.elapsed() >= self.ttl
    }
}

/// JWKS cache — one entry per issuer.
pub struct JwksCache {
    inner: DashMap<String, CachedJwks>,
    http: reqwest::Client,
    /// How long to cache a fetched JWKS (default 1 hour).
    ttl: Duration,
}

impl JwksCache {
    /// Create with default 1-hour TTL.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: DashMap::new(),
            http: reqwest::Client::builder()
                .https_only(true)
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            ttl: Duration::from_secs(3600),
        }
    }

    /// Return the cached JWKS for `issuer`, or fetch from `jwks_uri` if stale.
    ///
    /// If `force_refresh` is `true`, the cache is bypassed regardless of TTL.
    pub async fn get_or_fetch(
        &self,
        issuer: &str,
        jwks_uri: &str,
        force_refresh: bool,
    ) -> Result<JwkSet, AuthError> {
        if !force_refresh {
            if let Some(cached) = self.inner.get(issuer) {
                if !cached.is_stale() {
                    return Ok(cached.keys.clone());
                }
            }
        }

        debug!(issuer = %issuer, "Fetching JWKS from {jwks_uri}");
        let jwks: JwkSet = self.http.get(jwks_uri).send().await?.json().await?;

        self.inner.insert(
            issuer.to_string(),
            CachedJwks {
                keys: jwks.clone(),
                fetched_at: Instant::now(),
                ttl: self.ttl,
            },
        );

        Ok(jwks)
    }
}

impl Default for JwksCache {
    fn default() -> Self {
        Self::new()
    }
}

/// OIDC bearer verifier for viewer tokens.
pub struct OidcVerifier {
    issuer: String,
    audiences: Vec<String>,
    jwks_uri: String,
    jwks_cache: JwksCache,
}

impl OidcVerifier {
    /// Create a verifier from the auth configuration.
    #[must_use]
    pub fn new(config: &AuthConfig) -> Self {
        let jwks_uri = config
            .jwks_uri
            .clone()
            .unwrap_or_else(|| default_jwks_uri(&config.issuer));

        if !config.issuer.starts_with("https://") {
            warn!(issuer = %config.issuer, "OIDC issuer is not HTTPS");
        }

        Self {
            issuer: config.issuer.clone(),
            audiences: config.audiences.clone(),
            jwks_uri,
            jwks_cache: JwksCache::new(),
        }
    }

    /// Find a decoding key by `kid`, refreshing the JWKS cache if not found.
    async fn find_decoding_key(&self, kid: &str) -> Result<DecodingKey, AuthError> {
        // Try cached JWKS first
        let jwks = self
            .jwks_cache
            .get_or_fetch(&self.issuer, &self.jwks_uri, false)
            .await?;
        if let Some(key) = find_key_in_jwks(&jwks, kid) {
            return Ok(key);
        }

        // Unknown kid: refresh once and retry
        debug!(kid = %kid, "Key not found in cached JWKS, refreshing");
        let jwks = self
            .jwks_cache
            .get_or_fetch(&self.issuer, &self.jwks_uri, true)
            .await?;
        find_key_in_jwks(&jwks, kid).ok_or_else(|| AuthError::UnknownKeyId(kid.to_string()))
    }
}

#[async_trait]
impl BearerVerifier for OidcVerifier {
    async fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        // Decode header without verification to extract the signing key id
        let header = jsonwebtoken::decode_header(token)?;
        let kid = header.kid.clone().ok_or(AuthError::MissingKeyId)?;

        let decoding_key = self.find_decoding_key(&kid).await?;

        let validation = build_validation(&header, &self.issuer, &self.audiences);

        // Verify signature + exp/iss/aud claims
        let token_data: TokenData<ViewerClaims> =
            jsonwebtoken::decode(token, &decoding_key, &validation)?;
        let claims = token_data.claims;

        let object_id = match claims.oid {
            Some(oid) if !oid.is_empty() => oid,
            _ if !claims.sub.is_empty() => claims.sub,
            _ => return Err(AuthError::MissingPrincipal),
        };

        let scopes = claims
            .scp
            .as_deref()
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_string)
            .collect();

        Ok(Principal { object_id, scopes })
    }
}

/// Find a JWK by `kid` in a `JwkSet` and convert it to a `DecodingKey`.
fn find_key_in_jwks(jwks: &JwkSet, kid: &str) -> Option<DecodingKey> {
    for jwk in &jwks.keys {
        let jwk_kid = jwk.common.key_id.as_deref().unwrap_or("");
        if jwk_kid != kid {
            continue;
        }

        return match &jwk.algorithm {
            AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e).ok(),
            AlgorithmParameters::EllipticCurve(ec) => {
                DecodingKey::from_ec_components(&ec.x, &ec.y).ok()
            }
            AlgorithmParameters::OctetKey(_) | AlgorithmParameters::OctetKeyPair(_) => None,
        };
    }
    None
}

/// Build a [`Validation`] from the JWT header algorithm plus issuer/audience
/// expectations.
fn build_validation(header: &Header, issuer: &str, audiences: &[String]) -> Validation {
    let alg = match header.alg {
        Algorithm::RS256 => Algorithm::RS256,
        Algorithm::RS384 => Algorithm::RS384,
        Algorithm::RS512 => Algorithm::RS512,
        Algorithm::ES256 => Algorithm::ES256,
        Algorithm::ES384 => Algorithm::ES384,
        other => {
            warn!(alg = ?other, "Unsupported JWT algorithm, defaulting to RS256");
            Algorithm::RS256
        }
    };

    let mut v = Validation::new(alg);
    v.leeway = 60; // 60-second clock skew tolerance
    v.set_issuer(&[issuer]);
    if audiences.is_empty() {
        v.validate_aud = false;
    } else {
        v.set_audience(audiences);
    }
    v
}

/// Derive the default JWKS URI from the issuer URL using OIDC discovery
/// conventions.
fn default_jwks_uri(issuer: &str) -> String {
    let base = issuer.trim_end_matches('/');
    format!("{base}/.well-known/jwks.json")
}
