//! Service credentials — client-credentials grant and the shared token cache.
//!
//! The cache holds at most one `(token, expiry)` pair for the process
//! lifetime. Reads take a lock-free fast path while more than the safety
//! margin remains; refreshes go through an exclusive critical section with a
//! re-check, so concurrent refreshers collapse into a single upstream fetch
//! and every waiter observes the same new token.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::debug;

use crate::config::ClientCredentialsConfig;
use crate::{Error, Result};

/// Refresh a token once it has less than this long to live.
pub const EXPIRY_MARGIN: Duration = Duration::from_secs(5 * 60);

/// A service-to-service bearer token with its expiry.
#[derive(Debug, Clone)]
pub struct ServiceToken {
    /// The bearer token value
    pub access_token: String,
    /// Expiry as a Unix timestamp in seconds
    pub expires_at: u64,
}

impl ServiceToken {
    /// Build from an `expires_in` lifetime relative to now.
    #[must_use]
    pub fn with_lifetime(access_token: String, expires_in: Duration) -> Self {
        Self {
            access_token,
            expires_at: unix_now() + expires_in.as_secs(),
        }
    }

    /// Whether more than [`EXPIRY_MARGIN`] remains before expiry.
    #[must_use]
    pub fn is_fresh(&self) -> bool {
        unix_now() + EXPIRY_MARGIN.as_secs() < self.expires_at
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Source of fresh service tokens.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Fetch a new token from the identity provider.
    async fn fetch(&self) -> Result<ServiceToken>;
}

/// OAuth2 client-credentials grant against a configured token endpoint.
pub struct ClientCredentialsProvider {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    scope: String,
}

/// Token endpoint response
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

impl ClientCredentialsProvider {
    /// Create a provider from configuration; `env:VAR` credential references
    /// are resolved once, here.
    #[must_use]
    pub fn new(http: reqwest::Client, config: &ClientCredentialsConfig) -> Self {
        Self {
            http,
            token_url: config.token_url.clone(),
            client_id: config.resolve_client_id(),
            client_secret: config.resolve_client_secret(),
            scope: config.scope.clone(),
        }
    }
}

#[async_trait]
impl TokenProvider for ClientCredentialsProvider {
    async fn fetch(&self) -> Result<ServiceToken> {
        let params = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("grant_type", "client_credentials"),
            ("scope", self.scope.as_str()),
        ];

        let response = self
            .http
            .post(&self.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| Error::Credential(format!("token request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Credential(format!(
                "token endpoint returned HTTP {status}: {body}"
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::Credential(format!("cannot parse token response: {e}")))?;

        Ok(ServiceToken::with_lifetime(
            token.access_token,
            Duration::from_secs(token.expires_in),
        ))
    }
}

/// Single-entry token cache with double-checked refresh.
pub struct TokenCache {
    provider: Arc<dyn TokenProvider>,
    cached: RwLock<Option<ServiceToken>>,
    refresh: tokio::sync::Mutex<()>,
}

impl TokenCache {
    /// Wrap a provider in a cache.
    #[must_use]
    pub fn new(provider: Arc<dyn TokenProvider>) -> Self {
        Self {
            provider,
            cached: RwLock::new(None),
            refresh: tokio::sync::Mutex::new(()),
        }
    }

    /// Return a token with more than [`EXPIRY_MARGIN`] remaining, fetching a
    /// new one if needed.
    ///
    /// # Errors
    ///
    /// Propagates the provider's [`Error::Credential`] to every caller
    /// waiting on the refresh. The request fails; the process does not.
    pub async fn token(&self) -> Result<String> {
        // Fast path: no critical section while the cached token is fresh.
        if let Some(token) = self.fresh_token() {
            return Ok(token);
        }

        let _refresh = self.refresh.lock().await;

        // Re-check: another caller may have refreshed while we waited.
        if let Some(token) = self.fresh_token() {
            return Ok(token);
        }

        debug!("Refreshing service token");
        let token = self.provider.fetch().await?;
        let access_token = token.access_token.clone();
        *self.cached.write() = Some(token);
        Ok(access_token)
    }

    fn fresh_token(&self) -> Option<String> {
        self.cached
            .read()
            .as_ref()
            .filter(|token| token.is_fresh())
            .map(|token| token.access_token.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    struct CountingProvider {
        fetches: AtomicU32,
        lifetime: Duration,
        fail: bool,
    }

    impl CountingProvider {
        fn new(lifetime: Duration) -> Self {
            Self {
                fetches: AtomicU32::new(0),
                lifetime,
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                fetches: AtomicU32::new(0),
                lifetime: Duration::from_secs(3600),
                fail: true,
            }
        }

        fn fetch_count(&self) -> u32 {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TokenProvider for CountingProvider {
        async fn fetch(&self) -> Result<ServiceToken> {
            let n = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail {
                return Err(Error::Credential("issuer unreachable".to_string()));
            }
            // Yield so concurrent callers pile up on the critical section.
            tokio::task::yield_now().await;
            Ok(ServiceToken::with_lifetime(format!("token-{n}"), self.lifetime))
        }
    }

    #[tokio::test]
    async fn concurrent_callers_trigger_exactly_one_fetch() {
        let provider = Arc::new(CountingProvider::new(Duration::from_secs(3600)));
        let cache = Arc::new(TokenCache::new(provider.clone() as Arc<dyn TokenProvider>));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move { cache.token().await }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "token-1");
        }
        assert_eq!(provider.fetch_count(), 1);
    }

    #[tokio::test]
    async fn fresh_token_is_never_refetched() {
        let provider = Arc::new(CountingProvider::new(Duration::from_secs(3600)));
        let cache = TokenCache::new(provider.clone() as Arc<dyn TokenProvider>);

        for _ in 0..5 {
            assert_eq!(cache.token().await.unwrap(), "token-1");
        }
        assert_eq!(provider.fetch_count(), 1);
    }

    #[tokio::test]
    async fn token_inside_expiry_margin_is_refreshed() {
        // GIVEN: tokens that expire within the 5-minute safety margin
        let provider = Arc::new(CountingProvider::new(Duration::from_secs(60)));
        let cache = TokenCache::new(provider.clone() as Arc<dyn TokenProvider>);

        // WHEN: two sequential requests
        assert_eq!(cache.token().await.unwrap(), "token-1");
        assert_eq!(cache.token().await.unwrap(), "token-2");

        // THEN: each triggered its own fetch
        assert_eq!(provider.fetch_count(), 2);
    }

    #[tokio::test]
    async fn provider_failure_surfaces_and_later_calls_retry() {
        let provider = Arc::new(CountingProvider::failing());
        let cache = TokenCache::new(provider.clone() as Arc<dyn TokenProvider>);

        assert!(matches!(cache.token().await, Err(Error::Credential(_))));
        assert!(matches!(cache.token().await, Err(Error::Credential(_))));
        // Nothing was cached; each call reached the provider.
        assert_eq!(provider.fetch_count(), 2);
    }

    #[test]
    fn freshness_respects_the_margin() {
        let fresh = ServiceToken::with_lifetime("t".to_string(), Duration::from_secs(3600));
        assert!(fresh.is_fresh());

        let stale = ServiceToken::with_lifetime("t".to_string(), Duration::from_secs(60));
        assert!(!stale.is_fresh());

        let expired = ServiceToken {
            access_token: "t".to_string(),
            expires_at: 0,
        };
        assert!(!expired.is_fresh());
    }
}
