//! HTTP surface — route handlers composing catalog, authorization, and key
//! delivery.

mod router;
mod server;

pub use router::{AppState, create_router};
pub use server::Server;
