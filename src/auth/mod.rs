//! Viewer authentication — bearer token verification and request identity.

pub mod middleware;
pub mod oidc;

pub use middleware::{AuthGate, Caller, auth_middleware};
pub use oidc::{AuthError, BearerVerifier, JwksCache, OidcVerifier, Principal};
