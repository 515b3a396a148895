//! HTTP API for the chest X-ray service.
//!
//! Routes are nested under `/api/` and share one `ApiContext`.
//! `api_router()` returns a composable `Router`; `start_api_server()`
//! binds it and serves it in the background.

pub mod endpoints;
pub mod error;
pub mod middleware;
pub mod router;
pub mod server;
pub mod types;

pub use router::api_router;
pub use server::{start_api_server, ApiServer, ApiSession, ServerError};
pub use types::ApiContext;
