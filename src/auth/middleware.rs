//! Authentication middleware
//!
//! Extracts and verifies the viewer's bearer token, enforces the required
//! scope, and injects the resulting [`Caller`] into request extensions for
//! downstream handlers. Public paths and the public catalog variant bypass
//! verification and run as [`Caller::Anonymous`].

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{debug, warn};

use super::oidc::{BearerVerifier, Principal};
use crate::Error;
use crate::config::AuthConfig;

/// The caller identity attached to every request.
#[derive(Debug, Clone)]
pub enum Caller {
    /// No authentication configured (public catalog variant) or public path.
    Anonymous,
    /// Verified bearer token.
    Principal(Principal),
}

impl Caller {
    /// The principal, if the caller authenticated.
    #[must_use]
    pub fn principal(&self) -> Option<&Principal> {
        match self {
            Self::Anonymous => None,
            Self::Principal(p) => Some(p),
        }
    }
}

/// Resolved authentication state shared by the middleware.
pub struct AuthGate {
    /// Whether bearer authentication is enforced
    enabled: bool,
    /// Token verifier; present iff `enabled`
    verifier: Option<Arc<dyn BearerVerifier>>,
    /// Scope every viewer token must carry
    required_scope: Option<String>,
    /// Path prefixes that bypass authentication
    public_paths: Vec<String>,
}

impl AuthGate {
    /// Gate enforcing bearer verification with `verifier`.
    #[must_use]
    pub fn enabled(config: &AuthConfig, verifier: Arc<dyn BearerVerifier>) -> Self {
        Self {
            enabled: true,
            verifier: Some(verifier),
            required_scope: config.required_scope.clone(),
            public_paths: config.public_paths.clone(),
        }
    }

    /// Gate for the public catalog variant: every caller is anonymous.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            verifier: None,
            required_scope: None,
            public_paths: Vec::new(),
        }
    }

    /// Check if a path is public (bypasses auth)
    #[must_use]
    pub fn is_public_path(&self, path: &str) -> bool {
        self.public_paths.iter().any(|p| path.starts_with(p))
    }
}

/// Authentication middleware
pub async fn auth_middleware(
    State(gate): State<Arc<AuthGate>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    // If auth is disabled, pass through with an anonymous caller
    if !gate.enabled {
        request.extensions_mut().insert(Caller::Anonymous);
        return next.run(request).await;
    }

    let path = request.uri().path();

    // Check if path is public
    if gate.is_public_path(path) {
        debug!(path = %path, "Public path, skipping auth");
        request.extensions_mut().insert(Caller::Anonymous);
        return next.run(request).await;
    }

    // Extract token from Authorization header
    let token = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            v.strip_prefix("Bearer ")
                .or_else(|| v.strip_prefix("bearer "))
        });

    let Some(token) = token else {
        warn!(path = %path, "Missing Authorization header");
        return Error::Authentication(
            "Missing Authorization header. Use: Authorization: Bearer <token>".to_string(),
        )
        .into_response();
    };

    let Some(verifier) = gate.verifier.as_ref() else {
        return Error::Internal("auth enabled without a verifier".to_string()).into_response();
    };

    let principal = match verifier.verify(token).await {
        Ok(principal) => principal,
        Err(e) => {
            warn!(path = %path, error = %e, "Bearer verification failed");
            return Error::Authentication("Invalid token".to_string()).into_response();
        }
    };

    if let Some(ref scope) = gate.required_scope {
        if !principal.has_scope(scope) {
            warn!(path = %path, scope = %scope, "Token missing required scope");
            return Error::Authentication(format!("Token missing required scope '{scope}'"))
                .into_response();
        }
    }

    debug!(path = %path, principal = %principal.object_id, "Authenticated request");
    request.extensions_mut().insert(Caller::Principal(principal));
    next.run(request).await
}
