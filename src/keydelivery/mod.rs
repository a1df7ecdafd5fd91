//! Key delivery brokering.
//!
//! The broker never stores keys. It gates three DRM protocols behind one
//! authorization pipeline, then proxies the request to the external key
//! delivery endpoint with a service bearer token attached:
//!
//! 1. resolve the video; an unknown id is answered exactly like a forbidden
//!    one, so callers cannot probe the catalog,
//! 2. check the caller may view the video,
//! 3. check the requested content key belongs to that video (for PlayReady
//!    the key id is extracted from the license challenge itself),
//! 4. only then obtain a service token and call upstream.
//!
//! Key delivery POSTs are not idempotent and are never retried; the upstream
//! status passes through verbatim on failure.

pub mod playready;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, warn};

use crate::authz::{self, IdentityTokens};
use crate::catalog::Catalog;
use crate::config::KeyDeliveryConfig;
use crate::credentials::TokenCache;
use crate::{Error, Result};

/// A content key request, tagged by DRM protocol.
#[derive(Debug, Clone)]
pub enum KeyRequest {
    /// AES envelope key request; the key id comes as a query parameter.
    Envelope {
        /// Requested content key id
        content_key_id: String,
    },
    /// PlayReady license request; the key id is embedded in the SOAP
    /// challenge.
    PlayReady {
        /// The license challenge XML
        challenge: String,
    },
    /// Widevine license request; key id as a query parameter plus an opaque
    /// binary challenge.
    Widevine {
        /// Requested content key id
        content_key_id: String,
        /// The license challenge bytes
        challenge: Bytes,
    },
}

impl KeyRequest {
    /// Protocol label for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Envelope { .. } => "envelope",
            Self::PlayReady { .. } => "playready",
            Self::Widevine { .. } => "widevine",
        }
    }

    /// The content key id this request is for.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadChallenge`] when a PlayReady challenge does not
    /// yield a key id.
    fn content_key_id(&self) -> Result<String> {
        match self {
            Self::Envelope { content_key_id } | Self::Widevine { content_key_id, .. } => {
                Ok(content_key_id.clone())
            }
            Self::PlayReady { challenge } => playready::content_key_id(challenge),
        }
    }
}

/// Transport to the external key delivery service.
#[async_trait]
pub trait KeyEndpoint: Send + Sync {
    /// Execute the proxied request with the given bearer token and return
    /// the raw response bytes.
    async fn fetch_key(&self, bearer: &str, request: &KeyRequest) -> Result<Bytes>;
}

/// HTTPS key delivery endpoint.
pub struct HttpKeyEndpoint {
    http: reqwest::Client,
    host: String,
}

impl HttpKeyEndpoint {
    /// Create an endpoint client for the configured host.
    #[must_use]
    pub fn new(http: reqwest::Client, config: &KeyDeliveryConfig) -> Self {
        Self {
            http,
            host: config.host.clone(),
        }
    }
}

#[async_trait]
impl KeyEndpoint for HttpKeyEndpoint {
    async fn fetch_key(&self, bearer: &str, request: &KeyRequest) -> Result<Bytes> {
        let host = &self.host;

        let builder = match request {
            KeyRequest::Envelope { content_key_id } => self
                .http
                .post(format!("https://{host}/"))
                .query(&[("kid", content_key_id)]),
            KeyRequest::PlayReady { challenge } => self
                .http
                .post(format!("https://{host}/PlayReady/"))
                .header(reqwest::header::CONTENT_TYPE, "text/xml")
                .body(challenge.clone()),
            KeyRequest::Widevine {
                content_key_id,
                challenge,
            } => self
                .http
                .post(format!("https://{host}/Widevine/"))
                .query(&[("kid", content_key_id)])
                .body(challenge.clone()),
        };

        let response = builder.bearer_auth(bearer).send().await?;

        if !response.status().is_success() {
            return Err(Error::Upstream {
                status: response.status().as_u16(),
            });
        }

        Ok(response.bytes().await?)
    }
}

/// The key delivery broker.
pub struct KeyDeliveryBroker {
    catalog: Arc<Catalog>,
    credentials: Arc<TokenCache>,
    endpoint: Arc<dyn KeyEndpoint>,
}

impl KeyDeliveryBroker {
    /// Assemble a broker over the shared catalog, token cache, and endpoint.
    #[must_use]
    pub fn new(
        catalog: Arc<Catalog>,
        credentials: Arc<TokenCache>,
        endpoint: Arc<dyn KeyEndpoint>,
    ) -> Self {
        Self {
            catalog,
            credentials,
            endpoint,
        }
    }

    /// Authorize and proxy one content key request.
    ///
    /// The pipeline order is load-bearing: no token is fetched and no
    /// upstream call is made until every check has passed.
    ///
    /// # Errors
    ///
    /// [`Error::Unauthorized`] for an unknown video, a video the caller may
    /// not view, or a content key the video does not own;
    /// [`Error::BadChallenge`] for an unparseable PlayReady challenge;
    /// [`Error::Credential`] / [`Error::Upstream`] from the proxied call.
    pub async fn deliver(
        &self,
        video_id: &str,
        tokens: &IdentityTokens,
        request: KeyRequest,
    ) -> Result<Bytes> {
        // Unknown ids take the same path as forbidden ones.
        let Some(video) = self.catalog.get(video_id) else {
            warn!(video = %video_id, kind = request.kind(), "Key request for unknown video");
            return Err(Error::Unauthorized);
        };

        if !authz::can_view(Some(video), tokens) {
            warn!(video = %video_id, kind = request.kind(), "Key request denied by viewer set");
            return Err(Error::Unauthorized);
        }

        let content_key_id = request.content_key_id()?;
        if !video.owns_content_key(&content_key_id) {
            warn!(
                video = %video_id,
                kind = request.kind(),
                content_key = %content_key_id,
                "Key request for a content key the video does not own"
            );
            return Err(Error::Unauthorized);
        }

        let bearer = self.credentials.token().await?;

        debug!(video = %video_id, kind = request.kind(), "Proxying key request");
        self.endpoint.fetch_key(&bearer, &request).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::playready::challenge_with_kid;
    use super::*;
    use crate::catalog::Video;
    use crate::credentials::{ServiceToken, TokenProvider};

    /// Records upstream calls instead of making them.
    struct RecordingEndpoint {
        calls: AtomicU32,
    }

    impl RecordingEndpoint {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
            })
        }

        fn call_count(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl KeyEndpoint for RecordingEndpoint {
        async fn fetch_key(&self, bearer: &str, _request: &KeyRequest) -> Result<Bytes> {
            assert_eq!(bearer, "service-token-1");
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Bytes::from_static(b"key-bytes"))
        }
    }

    struct CountingProvider {
        fetches: AtomicU32,
    }

    #[async_trait]
    impl TokenProvider for CountingProvider {
        async fn fetch(&self) -> Result<ServiceToken> {
            let n = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(ServiceToken::with_lifetime(
                format!("service-token-{n}"),
                std::time::Duration::from_secs(3600),
            ))
        }
    }

    struct Fixture {
        broker: KeyDeliveryBroker,
        endpoint: Arc<RecordingEndpoint>,
        provider: Arc<CountingProvider>,
    }

    // KID "10000000-2000-3000-4050-60708090a0b0" in challenge form.
    const KID_B64: &str = "AAAAEAAgADBAUGBwgJCgsA==";
    const KID_GUID: &str = "10000000-2000-3000-4050-60708090a0b0";

    fn fixture() -> Fixture {
        let videos = vec![
            Video {
                id: "v1".to_string(),
                title: "Restricted".to_string(),
                locator: "//streaming.example.invalid/v1/manifest".to_string(),
                thumbnail: None,
                viewers: ["g1".to_string()].into_iter().collect(),
                content_key_ids: ["k1".to_string(), KID_GUID.to_string()]
                    .into_iter()
                    .collect(),
            },
            Video {
                id: "v2".to_string(),
                title: "Other".to_string(),
                locator: "//streaming.example.invalid/v2/manifest".to_string(),
                thumbnail: None,
                viewers: ["g2".to_string()].into_iter().collect(),
                content_key_ids: ["k2".to_string()].into_iter().collect(),
            },
        ];
        let catalog = Arc::new(Catalog::from_videos(videos).unwrap());
        let provider = Arc::new(CountingProvider {
            fetches: AtomicU32::new(0),
        });
        let credentials = Arc::new(TokenCache::new(
            provider.clone() as Arc<dyn TokenProvider>
        ));
        let endpoint = RecordingEndpoint::new();
        let broker = KeyDeliveryBroker::new(
            catalog,
            credentials,
            endpoint.clone() as Arc<dyn KeyEndpoint>,
        );
        Fixture {
            broker,
            endpoint,
            provider,
        }
    }

    fn viewer_tokens() -> IdentityTokens {
        ["u1".to_string(), "g1".to_string()].into_iter().collect()
    }

    #[tokio::test]
    async fn authorized_envelope_request_returns_key_bytes() {
        let f = fixture();

        let bytes = f
            .broker
            .deliver(
                "v1",
                &viewer_tokens(),
                KeyRequest::Envelope {
                    content_key_id: "k1".to_string(),
                },
            )
            .await
            .unwrap();

        assert_eq!(bytes.as_ref(), b"key-bytes");
        assert_eq!(f.endpoint.call_count(), 1);
    }

    #[tokio::test]
    async fn unknown_video_is_unauthorized_with_no_upstream_call() {
        let f = fixture();

        let result = f
            .broker
            .deliver(
                "missing",
                &viewer_tokens(),
                KeyRequest::Envelope {
                    content_key_id: "k1".to_string(),
                },
            )
            .await;

        assert!(matches!(result, Err(Error::Unauthorized)));
        assert_eq!(f.endpoint.call_count(), 0);
        assert_eq!(f.provider.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn non_viewable_video_is_unauthorized_before_any_network() {
        let f = fixture();
        // Caller's tokens do not intersect v2's viewer set.
        let result = f
            .broker
            .deliver(
                "v2",
                &viewer_tokens(),
                KeyRequest::Envelope {
                    content_key_id: "k2".to_string(),
                },
            )
            .await;

        assert!(matches!(result, Err(Error::Unauthorized)));
        assert_eq!(f.endpoint.call_count(), 0);
        assert_eq!(f.provider.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn foreign_content_key_is_unauthorized_even_when_viewable() {
        let f = fixture();
        // Caller may view v1, but k2 belongs to v2.
        let result = f
            .broker
            .deliver(
                "v1",
                &viewer_tokens(),
                KeyRequest::Envelope {
                    content_key_id: "k2".to_string(),
                },
            )
            .await;

        assert!(matches!(result, Err(Error::Unauthorized)));
        assert_eq!(f.endpoint.call_count(), 0);
    }

    #[tokio::test]
    async fn playready_ownership_is_enforced_via_the_parsed_kid() {
        let f = fixture();

        // v1 owns the embedded KID: request succeeds.
        let ok = f
            .broker
            .deliver(
                "v1",
                &viewer_tokens(),
                KeyRequest::PlayReady {
                    challenge: challenge_with_kid(KID_B64),
                },
            )
            .await;
        assert!(ok.is_ok());

        // A challenge for a key v1 does not own: unauthorized.
        // 16 zero bytes => 00000000-0000-0000-0000-000000000000
        let foreign = f
            .broker
            .deliver(
                "v1",
                &viewer_tokens(),
                KeyRequest::PlayReady {
                    challenge: challenge_with_kid("AAAAAAAAAAAAAAAAAAAAAA=="),
                },
            )
            .await;
        assert!(matches!(foreign, Err(Error::Unauthorized)));
    }

    #[tokio::test]
    async fn malformed_playready_challenge_is_bad_request_not_unauthorized() {
        let f = fixture();

        let result = f
            .broker
            .deliver(
                "v1",
                &viewer_tokens(),
                KeyRequest::PlayReady {
                    challenge: "<not-a-challenge/>".to_string(),
                },
            )
            .await;

        assert!(matches!(result, Err(Error::BadChallenge(_))));
        assert_eq!(f.endpoint.call_count(), 0);
    }

    #[tokio::test]
    async fn widevine_requests_share_the_same_pipeline() {
        let f = fixture();

        let bytes = f
            .broker
            .deliver(
                "v1",
                &viewer_tokens(),
                KeyRequest::Widevine {
                    content_key_id: "k1".to_string(),
                    challenge: Bytes::from_static(b"\x08\x01"),
                },
            )
            .await
            .unwrap();

        assert_eq!(bytes.as_ref(), b"key-bytes");
    }

    #[tokio::test]
    async fn service_token_is_cached_across_requests() {
        let f = fixture();

        for _ in 0..3 {
            f.broker
                .deliver(
                    "v1",
                    &viewer_tokens(),
                    KeyRequest::Envelope {
                        content_key_id: "k1".to_string(),
                    },
                )
                .await
                .unwrap();
        }

        assert_eq!(f.provider.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(f.endpoint.call_count(), 3);
    }
}
