//! HTTP router and handlers

use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::header,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;
use tower_http::{
    catch_panic::CatchPanicLayer,
    compression::CompressionLayer,
    services::{ServeDir, ServeFile},
    trace::TraceLayer,
};

use crate::auth::{AuthGate, Caller, auth_middleware};
use crate::authz::{self, IdentityTokens};
use crate::catalog::{Catalog, Video};
use crate::config::ServerConfig;
use crate::directory::{DirectoryClient, resolve_identity_tokens};
use crate::keydelivery::{KeyDeliveryBroker, KeyRequest};
use crate::{Error, Result};

/// Shared application state
pub struct AppState {
    /// The immutable video catalog
    pub catalog: Arc<Catalog>,
    /// Authentication gate applied to every route
    pub auth_gate: Arc<AuthGate>,
    /// Directory client; present iff per-video authorization is enabled
    pub directory: Option<Arc<dyn DirectoryClient>>,
    /// Key delivery broker; present iff key delivery is enabled
    pub broker: Option<Arc<KeyDeliveryBroker>>,
    /// Server configuration (body limits, static UI directory)
    pub server: ServerConfig,
}

/// What the caller is allowed to see.
enum Visibility {
    /// Full catalog: public variant, or authenticated without per-video
    /// authorization.
    All,
    /// Restricted to videos whose viewer sets intersect these tokens.
    Tokens(IdentityTokens),
}

impl AppState {
    /// Resolve what `caller` may see. Per-video authorization resolves the
    /// caller's identity tokens fresh on every request.
    async fn visibility(&self, caller: &Caller) -> Result<Visibility> {
        match (caller.principal(), self.directory.as_ref()) {
            (Some(principal), Some(directory)) => {
                let tokens =
                    resolve_identity_tokens(directory.as_ref(), &principal.object_id).await?;
                Ok(Visibility::Tokens(tokens))
            }
            _ => Ok(Visibility::All),
        }
    }

    /// Identity tokens for the key endpoints, which always run with
    /// per-video authorization.
    async fn identity_tokens(&self, caller: &Caller) -> Result<IdentityTokens> {
        let principal = caller
            .principal()
            .ok_or_else(|| Error::Authentication("No authenticated principal".to_string()))?;
        let directory = self
            .directory
            .as_ref()
            .ok_or_else(|| Error::Internal("directory not configured".to_string()))?;
        resolve_identity_tokens(directory.as_ref(), &principal.object_id).await
    }

    fn broker(&self) -> Result<&KeyDeliveryBroker> {
        self.broker
            .as_deref()
            .ok_or_else(|| Error::Internal("key delivery not configured".to_string()))
    }
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    let auth_gate = Arc::clone(&state.auth_gate);

    let mut router = Router::new()
        .route("/videos", get(list_videos))
        .route("/videos/{id}", get(get_video))
        .route("/health", get(health_handler));

    if state.broker.is_some() {
        router = router
            .route("/envelopeKey", post(envelope_key))
            .route("/playReadyKey", post(playready_key))
            .route("/widevineKey", post(widevine_key));
    }

    let mut router = router
        // Authentication middleware (applied before other layers)
        .layer(middleware::from_fn_with_state(auth_gate, auth_middleware))
        .layer(DefaultBodyLimit::max(state.server.max_body_size))
        .layer(CatchPanicLayer::new())
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http());

    // The browsing UI loads before sign-in, so it sits outside the auth
    // middleware. browse.html is the default document.
    if let Some(ref dir) = state.server.static_dir {
        let ui = ServeDir::new(dir).fallback(ServeFile::new(dir.join("browse.html")));
        router = router.fallback_service(ui);
    }

    router.with_state(state)
}

/// `GET /health` — liveness
async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// `GET /videos` — every video the caller may view
async fn list_videos(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
) -> Result<Json<Vec<Video>>> {
    let videos = match state.visibility(&caller).await? {
        Visibility::All => state.catalog.all().to_vec(),
        Visibility::Tokens(tokens) => state.catalog.visible_for(&tokens).cloned().collect(),
    };
    Ok(Json(videos))
}

/// `GET /videos/{id}` — a single record.
///
/// With per-video authorization, an unknown id answers exactly like a
/// forbidden one. In the public variants the catalog is not secret and an
/// unknown id is a plain 404.
async fn get_video(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> Result<Json<Video>> {
    match state.visibility(&caller).await? {
        Visibility::All => state
            .catalog
            .get(&id)
            .cloned()
            .map(Json)
            .ok_or(Error::NotFound),
        Visibility::Tokens(tokens) => match state.catalog.get(&id) {
            Some(video) if authz::can_view(Some(video), &tokens) => Ok(Json(video.clone())),
            _ => Err(Error::Unauthorized),
        },
    }
}

/// Query parameters for envelope and Widevine key requests
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContentKeyQuery {
    video_id: String,
    content_key_id: String,
}

/// Query parameters for PlayReady key requests
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoQuery {
    video_id: String,
}

/// `POST /envelopeKey?videoId=&contentKeyId=` — AES envelope key
async fn envelope_key(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<ContentKeyQuery>,
) -> Result<Response> {
    let tokens = state.identity_tokens(&caller).await?;
    let key = state
        .broker()?
        .deliver(
            &query.video_id,
            &tokens,
            KeyRequest::Envelope {
                content_key_id: query.content_key_id,
            },
        )
        .await?;
    Ok(key_response(key))
}

/// `POST /playReadyKey?videoId=` — PlayReady license (SOAP challenge body)
async fn playready_key(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<VideoQuery>,
    challenge: String,
) -> Result<Response> {
    let tokens = state.identity_tokens(&caller).await?;
    let key = state
        .broker()?
        .deliver(&query.video_id, &tokens, KeyRequest::PlayReady { challenge })
        .await?;
    Ok(key_response(key))
}

/// `POST /widevineKey?videoId=&contentKeyId=` — Widevine license (binary
/// challenge body)
async fn widevine_key(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<ContentKeyQuery>,
    challenge: Bytes,
) -> Result<Response> {
    let tokens = state.identity_tokens(&caller).await?;
    let key = state
        .broker()?
        .deliver(
            &query.video_id,
            &tokens,
            KeyRequest::Widevine {
                content_key_id: query.content_key_id,
                challenge,
            },
        )
        .await?;
    Ok(key_response(key))
}

fn key_response(key: Bytes) -> Response {
    (
        [(header::CONTENT_TYPE, "application/octet-stream")],
        key,
    )
        .into_response()
}
