pub mod captcha;
pub mod config;
pub mod dirs;
pub mod error;
pub mod handlers;
pub mod ratelimit;
pub mod server;
pub mod service;
pub mod store;

use std::sync::Arc;

/// Shared application state threaded through axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<service::SecretService>,
}

pub use config::{Config, ValidatedConfig};
pub use error::ServiceError;
pub use server::{build_router, build_service, run, run_with_shutdown, sweep_once};
