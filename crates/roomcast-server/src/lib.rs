//! # roomcast-server
//!
//! HTTP surface for the roomcast hub: authenticated WebSocket upgrades,
//! a health endpoint, configuration and Prometheus metrics.

pub mod auth;
pub mod config;
pub mod handlers;
pub mod metrics;

pub use auth::{AuthChain, AuthError, Authenticator, JwtAuthenticator, StaticTokenAuthenticator};
pub use config::Config;
pub use handlers::{router, run_server, AppState};
